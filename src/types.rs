//! Data model shared by the pipeline stages.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{ErrorKind, InspectError};

/// One discovered input image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectionTask {
    /// Path relative to the input directory, `/`-separated.
    pub task_id: String,
    pub source_image_path: PathBuf,
}

impl InspectionTask {
    pub fn file_name(&self) -> String {
        self.source_image_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.task_id.clone())
    }

    pub fn file_stem(&self) -> String {
        self.source_image_path
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.task_id.clone())
    }
}

/// Axis-aligned box in source-image pixel coordinates.
///
/// Always satisfies `x_min < x_max` and `y_min < y_max` and lies within
/// `[0, width-1] x [0, height-1]` of the image it was validated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x_min: u32,
    pub y_min: u32,
    pub x_max: u32,
    pub y_max: u32,
}

impl BoundingBox {
    pub fn width(&self) -> u32 {
        self.x_max - self.x_min
    }

    pub fn height(&self) -> u32 {
        self.y_max - self.y_min
    }
}

/// A labeled region that survived validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub bbox: BoundingBox,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&InspectError> for ErrorRecord {
    fn from(err: &InspectError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Terminal verdict for one image, persisted as `<stem>.json`.
///
/// Carries no timestamps so reruns over the same inputs produce identical
/// files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectionResult {
    pub task_id: String,
    pub source_image_path: PathBuf,
    pub detections: Vec<Detection>,
    pub is_positive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
}

impl InspectionResult {
    pub fn completed(task: &InspectionTask, detections: Vec<Detection>) -> Self {
        Self {
            task_id: task.task_id.clone(),
            source_image_path: task.source_image_path.clone(),
            is_positive: !detections.is_empty(),
            detections,
            error: None,
        }
    }

    pub fn failed(task: &InspectionTask, err: &InspectError) -> Self {
        Self {
            task_id: task.task_id.clone(),
            source_image_path: task.source_image_path.clone(),
            detections: Vec::new(),
            is_positive: false,
            error: Some(ErrorRecord::from(err)),
        }
    }

    pub fn outcome(&self) -> Outcome {
        if self.error.is_some() {
            Outcome::Errored
        } else if self.is_positive {
            Outcome::Positive
        } else {
            Outcome::Negative
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Positive,
    Negative,
    Errored,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Positive => "positive",
            Outcome::Negative => "negative",
            Outcome::Errored => "errored",
        }
    }
}

/// Files written for one completed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputArtifact {
    pub json_path: PathBuf,
    /// `None` only when the source bytes could not be read at all.
    pub image_path: Option<PathBuf>,
}
