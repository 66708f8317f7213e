//! Persists each task's JSON verdict and image into the output layout.
//!
//! Both files are staged as temporaries next to their destinations and only
//! renamed into place once both are fully written, so an interrupted write
//! never leaves one without the other. Existing files for the same source
//! name are overwritten.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::annotate::ImageArtifact;
use crate::config::PathsConfig;
use crate::error::{InspectError, Result};
use crate::types::{InspectionResult, InspectionTask, OutputArtifact};

pub struct ResultRouter {
    json_dir: PathBuf,
    positive_dir: PathBuf,
    negative_dir: PathBuf,
    jsonl: Option<PathBuf>,
}

impl ResultRouter {
    pub fn new(paths: &PathsConfig) -> Self {
        Self {
            json_dir: paths.json_dir.clone(),
            positive_dir: paths.positive_dir.clone(),
            negative_dir: paths.negative_dir.clone(),
            jsonl: paths.jsonl.clone(),
        }
    }

    /// Create output directories. Idempotent.
    pub fn prepare(&self) -> Result<()> {
        for dir in [&self.json_dir, &self.positive_dir, &self.negative_dir] {
            fs::create_dir_all(dir).map_err(|e| InspectError::output(dir, e))?;
        }
        if let Some(parent) = self.jsonl.as_deref().and_then(Path::parent) {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| InspectError::output(parent, e))?;
            }
        }
        Ok(())
    }

    pub fn json_path(&self, task: &InspectionTask) -> PathBuf {
        self.json_dir.join(format!("{}.json", task.file_stem()))
    }

    pub fn image_path(&self, task: &InspectionTask, positive: bool) -> PathBuf {
        let dir = if positive {
            &self.positive_dir
        } else {
            &self.negative_dir
        };
        dir.join(task.file_name())
    }

    /// Write `result` and `image` for `task`. `image` is `None` only when the
    /// source bytes could not be read; the JSON is still written.
    pub fn route(
        &self,
        task: &InspectionTask,
        result: &InspectionResult,
        image: Option<&ImageArtifact>,
    ) -> Result<OutputArtifact> {
        let json_path = self.json_path(task);
        let mut json = serde_json::to_vec_pretty(result)
            .map_err(|e| InspectError::output(&json_path, io::Error::other(e)))?;
        json.push(b'\n');

        let json_tmp = stage(&self.json_dir, &json).map_err(|e| InspectError::output(&json_path, e))?;

        let image_path = match image {
            Some(artifact) => {
                let image_path = self.image_path(task, result.is_positive);
                let image_dir = image_path.parent().unwrap_or(Path::new("."));
                let image_tmp = stage(image_dir, artifact.bytes())
                    .map_err(|e| InspectError::output(&image_path, e))?;

                image_tmp
                    .persist(&image_path)
                    .map_err(|e| InspectError::output(&image_path, e.error))?;
                if let Err(e) = json_tmp.persist(&json_path) {
                    let _ = fs::remove_file(&image_path);
                    return Err(InspectError::output(&json_path, e.error));
                }

                // Drop a copy left in the other bucket by an earlier run
                remove_stale(&self.image_path(task, !result.is_positive));
                Some(image_path)
            }
            None => {
                json_tmp
                    .persist(&json_path)
                    .map_err(|e| InspectError::output(&json_path, e.error))?;
                // Neither bucket reflects this run's verdict
                remove_stale(&self.image_path(task, true));
                remove_stale(&self.image_path(task, false));
                None
            }
        };

        if let Some(jsonl) = &self.jsonl {
            if let Err(e) = append_jsonl(jsonl, result) {
                warn!("Could not append to {}: {}", jsonl.display(), e);
            }
        }

        Ok(OutputArtifact {
            json_path,
            image_path,
        })
    }
}

fn stage(dir: &Path, bytes: &[u8]) -> io::Result<NamedTempFile> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    Ok(tmp)
}

fn remove_stale(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed stale {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove stale {}: {}", path.display(), e),
    }
}

fn append_jsonl(path: &Path, result: &InspectionResult) -> io::Result<()> {
    let line = serde_json::json!({
        "image": result.task_id,
        "result": result,
    });
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)
}
