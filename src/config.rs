use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{InspectError, Result};

pub const ENV_ENDPOINT: &str = "VLM_INSPECT_ENDPOINT";
pub const ENV_MODEL: &str = "VLM_INSPECT_MODEL";
pub const ENV_API_KEY: &str = "VLM_INSPECT_API_KEY";

/// Placeholder in `prompt` replaced by the comma-separated allowed labels.
pub const LABELS_PLACEHOLDER: &str = "{labels}";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub endpoint: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub labels: Vec<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub few_shot_examples: Vec<FewShotExample>,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub guided_json: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: f64,
    #[serde(default = "default_image_max_dim")]
    pub image_max_dim: u32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default)]
    pub min_confidence: Option<f64>,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub recursive: bool,
    pub paths: PathsConfig,
    #[serde(default)]
    pub annotation: AnnotationConfig,
    #[serde(default)]
    pub max_errors: Option<usize>,
    #[serde(default)]
    pub strict: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FewShotExample {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub assistant: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    pub input_dir: PathBuf,
    pub json_dir: PathBuf,
    pub positive_dir: PathBuf,
    pub negative_dir: PathBuf,
    #[serde(default)]
    pub jsonl: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnnotationConfig {
    /// Rectangle stroke in pixels; scales with the image when unset.
    #[serde(default)]
    pub line_width: Option<u32>,
    #[serde(default)]
    pub font_path: Option<PathBuf>,
    #[serde(default)]
    pub font_scale: Option<f32>,
}

/// Comparison key for labels: trimmed, Unicode-lowercased.
pub fn label_key(label: &str) -> String {
    label.trim().to_lowercase()
}

fn default_max_tokens() -> u32 {
    256
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_request_timeout_secs() -> f64 {
    60.0
}

fn default_image_max_dim() -> u32 {
    512
}

fn default_jpeg_quality() -> u8 {
    85
}

fn default_extensions() -> Vec<String> {
    vec!["jpg".to_string()]
}

impl Config {
    /// Load, resolve, override from the environment and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::read(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse `path` and resolve its relative paths against the file's
    /// directory. No overrides, no validation.
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            InspectError::config(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_yaml(&text)?;

        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        config.resolve_paths(base);
        Ok(config)
    }

    /// Parse without resolving paths or validating.
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| InspectError::config(e.to_string()))
    }

    /// Make relative paths relative to `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.paths.input_dir);
        resolve(&mut self.paths.json_dir);
        resolve(&mut self.paths.positive_dir);
        resolve(&mut self.paths.negative_dir);
        if let Some(jsonl) = self.paths.jsonl.as_mut() {
            resolve(jsonl);
        }
        if let Some(font) = self.annotation.font_path.as_mut() {
            resolve(font);
        }
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(endpoint) = env::var(ENV_ENDPOINT) {
            if !endpoint.trim().is_empty() {
                self.endpoint = endpoint.trim().to_string();
            }
        }
        if let Ok(model) = env::var(ENV_MODEL) {
            if !model.trim().is_empty() {
                self.model = model.trim().to_string();
            }
        }
        if let Ok(key) = env::var(ENV_API_KEY) {
            self.api_key = Some(key).filter(|k| !k.is_empty());
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.completions_url()?;

        if self.model.trim().is_empty() {
            return Err(InspectError::config("model must not be empty"));
        }

        if self.labels.is_empty() {
            return Err(InspectError::config("labels must contain at least one label"));
        }
        let mut seen = HashSet::new();
        for label in &self.labels {
            if label.trim().is_empty() {
                return Err(InspectError::config("labels must not contain blank entries"));
            }
            if !seen.insert(label_key(label)) {
                return Err(InspectError::config(format!("duplicate label: {}", label)));
            }
        }

        if self.prompt.trim().is_empty() {
            return Err(InspectError::config("prompt must not be empty"));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(InspectError::config(format!(
                "temperature must be within [0, 2], got {}",
                self.temperature
            )));
        }
        if self.max_tokens == 0 {
            return Err(InspectError::config("max_tokens must be positive"));
        }
        if self.max_attempts == 0 {
            return Err(InspectError::config("max_attempts must be at least 1"));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(InspectError::config(format!(
                "backoff_base_ms ({}) exceeds backoff_max_ms ({})",
                self.backoff_base_ms, self.backoff_max_ms
            )));
        }
        if !self.request_timeout_secs.is_finite() || self.request_timeout_secs <= 0.0 {
            return Err(InspectError::config("request_timeout_secs must be positive"));
        }
        self.request_timeout()?;
        if self.image_max_dim == 0 {
            return Err(InspectError::config("image_max_dim must be positive"));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(InspectError::config("jpeg_quality must be within 1..=100"));
        }
        if let Some(min) = self.min_confidence {
            if !(0.0..=1.0).contains(&min) {
                return Err(InspectError::config(format!(
                    "min_confidence must be within [0, 1], got {}",
                    min
                )));
            }
        }
        if self.extensions.iter().all(|e| e.trim_start_matches('.').is_empty()) {
            return Err(InspectError::config("extensions must name at least one file extension"));
        }
        if let Some(width) = self.annotation.line_width {
            if width == 0 {
                return Err(InspectError::config("annotation.line_width must be positive"));
            }
        }
        if let Some(scale) = self.annotation.font_scale {
            if !scale.is_finite() || scale <= 0.0 {
                return Err(InspectError::config("annotation.font_scale must be positive"));
            }
        }
        if !self.paths.input_dir.is_dir() {
            return Err(InspectError::config(format!(
                "input directory does not exist: {}",
                self.paths.input_dir.display()
            )));
        }

        Ok(())
    }

    /// Full chat-completions URL derived from `endpoint`.
    pub fn completions_url(&self) -> Result<Url> {
        let trimmed = self.endpoint.trim().trim_end_matches('/');
        let full = if trimmed.ends_with("/chat/completions") {
            trimmed.to_string()
        } else {
            format!("{}/chat/completions", trimmed)
        };

        let url = Url::parse(&full)
            .map_err(|e| InspectError::config(format!("invalid endpoint {:?}: {}", self.endpoint, e)))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(InspectError::config(format!(
                "endpoint must use http or https, got {}",
                other
            ))),
        }
    }

    pub fn request_timeout(&self) -> Result<Duration> {
        Duration::try_from_secs_f64(self.request_timeout_secs).map_err(|e| {
            InspectError::config(format!(
                "request_timeout_secs {} is not a usable duration: {}",
                self.request_timeout_secs, e
            ))
        })
    }

    /// Lowercased extensions without leading dots.
    pub fn normalized_extensions(&self) -> Vec<String> {
        self.extensions
            .iter()
            .map(|e| e.trim().trim_start_matches('.').to_lowercase())
            .filter(|e| !e.is_empty())
            .collect()
    }

    /// Prompt text with the allowed labels interpolated.
    pub fn render_prompt(&self) -> String {
        self.prompt.replace(LABELS_PLACEHOLDER, &self.labels.join(", "))
    }
}
