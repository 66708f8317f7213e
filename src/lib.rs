pub mod annotate;
pub mod client;
pub mod config;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod request;
pub mod retry;
pub mod router;
pub mod source;
pub mod types;
pub mod validate;

// Re-export commonly used types for easier testing
pub use crate::annotate::{Annotator, ImageArtifact};
pub use crate::client::{InferenceClient, InferenceResponse};
pub use crate::config::{AnnotationConfig, Config, FewShotExample, PathsConfig};
pub use crate::driver::{BatchDriver, BatchSummary, DriverState, ExitPolicy, Stage};
pub use crate::error::{ErrorKind, InspectError, TransportError};
pub use crate::request::{InferenceRequest, RequestBuilder};
pub use crate::router::ResultRouter;
pub use crate::source::{ImageSource, SourceImage};
pub use crate::types::{BoundingBox, Detection, InspectionResult, InspectionTask, Outcome, OutputArtifact};
pub use crate::validate::ResponseValidator;
