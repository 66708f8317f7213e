//! Sequential batch orchestration.
//!
//! Every enumerated image yields exactly one routed result. Per-task failures
//! become failed results in the negative bucket; only startup problems abort
//! the run. Cancellation is observed between tasks, never inside one.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::annotate::{Annotator, ImageArtifact};
use crate::client::InferenceClient;
use crate::config::Config;
use crate::error::{InspectError, Result};
use crate::metrics;
use crate::request::RequestBuilder;
use crate::router::ResultRouter;
use crate::source::{self, ImageSource, SourceImage};
use crate::types::{InspectionResult, InspectionTask, Outcome};
use crate::validate::ResponseValidator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Enumerating,
    Processing,
    Completed,
    Cancelled,
}

/// Per-task pipeline step, reported when a task fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Building,
    Inferring,
    Validating,
    Annotating,
    Routing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Building => "building request",
            Stage::Inferring => "inferring",
            Stage::Validating => "validating response",
            Stage::Annotating => "annotating",
            Stage::Routing => "routing",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Images found by enumeration.
    pub discovered: usize,
    /// Images processed to a routed (or failed-to-route) outcome.
    pub total: usize,
    pub positive: usize,
    pub negative: usize,
    pub errored: usize,
    pub cancelled: bool,
}

impl BatchSummary {
    fn record(&mut self, outcome: Outcome) {
        self.total += 1;
        match outcome {
            Outcome::Positive => self.positive += 1,
            Outcome::Negative => self.negative += 1,
            Outcome::Errored => self.errored += 1,
        }
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total={} positive={} negative={} errored={}",
            self.total, self.positive, self.negative, self.errored
        )?;
        if self.cancelled {
            write!(f, " (cancelled, {} not processed)", self.discovered - self.total)?;
        }
        Ok(())
    }
}

/// When a finished batch should be reported as failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitPolicy {
    pub max_errors: Option<usize>,
    pub strict: bool,
}

impl ExitPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_errors: config.max_errors,
            strict: config.strict,
        }
    }

    pub fn tripped(&self, summary: &BatchSummary) -> bool {
        if self.strict && summary.errored > 0 {
            return true;
        }
        matches!(self.max_errors, Some(max) if summary.errored > max)
    }
}

pub struct BatchDriver {
    input_dir: PathBuf,
    extensions: Vec<String>,
    recursive: bool,
    builder: RequestBuilder,
    client: InferenceClient,
    validator: ResponseValidator,
    annotator: Annotator,
    router: ResultRouter,
    state: DriverState,
}

impl BatchDriver {
    pub fn new(config: &Config) -> Result<Self> {
        let client = InferenceClient::new(config)?;
        let annotator = Annotator::new(&config.annotation)?;
        if !annotator.has_font() {
            warn!("No font available; boxes will be drawn without label text");
        }
        info!("Inference endpoint: {} (model {})", client.url(), config.model);

        Ok(Self {
            input_dir: config.paths.input_dir.clone(),
            extensions: config.normalized_extensions(),
            recursive: config.recursive,
            builder: RequestBuilder::new(config),
            client,
            validator: ResponseValidator::new(config),
            annotator,
            router: ResultRouter::new(&config.paths),
            state: DriverState::Idle,
        })
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Process every enumerated image in order until done or `cancel` is set.
    pub async fn run(&mut self, cancel: &AtomicBool) -> Result<BatchSummary> {
        self.state = DriverState::Enumerating;
        self.router.prepare()?;
        let images = ImageSource::open(&self.input_dir, &self.extensions, self.recursive)?;

        let mut summary = BatchSummary {
            discovered: images.len(),
            ..Default::default()
        };
        if images.is_empty() {
            warn!(
                "No images with extension(s) {:?} in {}",
                self.extensions,
                self.input_dir.display()
            );
        } else {
            info!("Inspecting {} image(s) from {}", images.len(), self.input_dir.display());
        }

        self.state = DriverState::Processing;
        for (index, task) in images.tasks().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                warn!("Interrupted; stopping before {}", task.task_id);
                summary.cancelled = true;
                break;
            }

            let outcome = self.process(&task).await;
            metrics::TASKS_TOTAL.with_label_values(&[outcome.as_str()]).inc();
            info!("[{}/{}] {} -> {}", index + 1, summary.discovered, task.task_id, outcome.as_str());
            summary.record(outcome);
        }

        self.state = if summary.cancelled {
            DriverState::Cancelled
        } else {
            DriverState::Completed
        };
        info!("Batch finished: {}", summary);
        Ok(summary)
    }

    /// Run one task through every stage and route whatever it produced.
    async fn process(&self, task: &InspectionTask) -> Outcome {
        let (result, image) = match SourceImage::load(&task.source_image_path) {
            Ok(source) => {
                let (result, image) = self.inspect(task, source).await;
                (result, Some(image))
            }
            Err(err) => {
                // Undecodable files are still copied when their bytes are readable
                let original = source::read_bytes(&task.source_image_path)
                    .ok()
                    .map(ImageArtifact::Original);
                (self.failed(task, Stage::Building, &err), original)
            }
        };

        match self.router.route(task, &result, image.as_ref()) {
            Ok(artifact) => {
                debug!(
                    "Wrote {} and {:?}",
                    artifact.json_path.display(),
                    artifact.image_path
                );
                result.outcome()
            }
            Err(err) => {
                warn!("{} failed while {}: {}", task.task_id, Stage::Routing, err);
                metrics::TASK_ERRORS
                    .with_label_values(&[err.kind().as_str()])
                    .inc();
                Outcome::Errored
            }
        }
    }

    async fn inspect(&self, task: &InspectionTask, source: SourceImage) -> (InspectionResult, ImageArtifact) {
        let detected = self.detect(task, &source).await;
        let result = match detected {
            Ok(result) => result,
            Err((stage, err)) => {
                return (
                    self.failed(task, stage, &err),
                    ImageArtifact::Original(source.bytes),
                )
            }
        };

        match self.annotator.annotate(&source, &result.detections) {
            Ok(image) => (result, image),
            Err(err) => (
                self.failed(task, Stage::Annotating, &err),
                ImageArtifact::Original(source.bytes),
            ),
        }
    }

    async fn detect(
        &self,
        task: &InspectionTask,
        source: &SourceImage,
    ) -> std::result::Result<InspectionResult, (Stage, InspectError)> {
        let request = self.builder.build(source).map_err(|e| (Stage::Building, e))?;
        let response = self
            .client
            .submit(&request)
            .await
            .map_err(|e| (Stage::Inferring, e))?;
        self.validator
            .validate(task, &response.raw_text, (source.width(), source.height()))
            .map_err(|e| (Stage::Validating, e))
    }

    fn failed(&self, task: &InspectionTask, stage: Stage, err: &InspectError) -> InspectionResult {
        warn!("{} failed while {}: {}", task.task_id, stage, err);
        metrics::TASK_ERRORS
            .with_label_values(&[err.kind().as_str()])
            .inc();
        InspectionResult::failed(task, err)
    }
}
