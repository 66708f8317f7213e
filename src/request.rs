//! Chat-completion payloads for the inference endpoint.
//!
//! The image travels inline as a `data:` URL holding a downscaled JPEG; the
//! prompt carries the allowed labels so the model answers within them.

use base64::{engine::general_purpose::STANDARD, Engine};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::config::Config;
use crate::error::{InspectError, Result};
use crate::source::SourceImage;

pub const IMAGE_MEDIA_TYPE: &str = "image/jpeg";

/// One request body, built fresh per task.
#[derive(Debug, Clone, Serialize)]
pub struct InferenceRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

impl InferenceRequest {
    /// Text of the final user turn.
    pub fn prompt_text(&self) -> Option<&str> {
        let last = self.messages.last()?;
        match &last.content {
            MessageContent::Text(text) => Some(text),
            MessageContent::Parts(parts) => parts.iter().find_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::ImageUrl { .. } => None,
            }),
        }
    }

    /// The inline image of the final user turn.
    pub fn image_url(&self) -> Option<&str> {
        let last = self.messages.last()?;
        match &last.content {
            MessageContent::Text(_) => None,
            MessageContent::Parts(parts) => parts.iter().find_map(|p| match p {
                ContentPart::ImageUrl { image_url } => Some(image_url.url.as_str()),
                ContentPart::Text { .. } => None,
            }),
        }
    }
}

/// Builds requests from the immutable run configuration.
pub struct RequestBuilder {
    model: String,
    system_prompt: Option<String>,
    prefix: Vec<ChatMessage>,
    prompt: String,
    temperature: f32,
    max_tokens: u32,
    response_format: Option<serde_json::Value>,
    max_dim: u32,
    jpeg_quality: u8,
}

impl RequestBuilder {
    pub fn new(config: &Config) -> Self {
        let prefix = config
            .few_shot_examples
            .iter()
            .flat_map(|example| {
                let user = example.user.as_ref().map(|text| ChatMessage {
                    role: Role::User,
                    content: MessageContent::Parts(vec![ContentPart::Text { text: text.clone() }]),
                });
                let assistant = example.assistant.as_ref().map(|text| ChatMessage {
                    role: Role::Assistant,
                    content: MessageContent::Text(text.clone()),
                });
                user.into_iter().chain(assistant)
            })
            .collect();

        Self {
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone().filter(|s| !s.trim().is_empty()),
            prefix,
            prompt: config.render_prompt(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            response_format: config
                .guided_json
                .then(|| detection_response_format(&config.labels)),
            max_dim: config.image_max_dim,
            jpeg_quality: config.jpeg_quality,
        }
    }

    pub fn build(&self, source: &SourceImage) -> Result<InferenceRequest> {
        let data_url = self.encode_data_url(source)?;

        let mut messages = Vec::with_capacity(self.prefix.len() + 2);
        if let Some(system) = &self.system_prompt {
            messages.push(ChatMessage {
                role: Role::System,
                content: MessageContent::Text(system.clone()),
            });
        }
        messages.extend(self.prefix.iter().cloned());
        messages.push(ChatMessage {
            role: Role::User,
            content: MessageContent::Parts(vec![
                ContentPart::ImageUrl {
                    image_url: ImageUrl { url: data_url },
                },
                ContentPart::Text {
                    text: self.prompt.clone(),
                },
            ]),
        });

        Ok(InferenceRequest {
            model: self.model.clone(),
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            response_format: self.response_format.clone(),
        })
    }

    fn encode_data_url(&self, source: &SourceImage) -> Result<String> {
        let resized = resize_if_needed(&source.image, self.max_dim);
        let jpeg = encode_to_jpeg(&resized, self.jpeg_quality)
            .map_err(|e| InspectError::image_read(&source.path, e))?;
        debug!(
            "Encoded {} as {}x{} JPEG ({} bytes)",
            source.path.display(),
            resized.width(),
            resized.height(),
            jpeg.len()
        );
        Ok(format!("data:{};base64,{}", IMAGE_MEDIA_TYPE, STANDARD.encode(&jpeg)))
    }
}

/// Downscale so the longest side is at most `max_dim`, keeping aspect ratio.
fn resize_if_needed(img: &DynamicImage, max_dim: u32) -> DynamicImage {
    if img.width() <= max_dim && img.height() <= max_dim {
        return img.clone();
    }
    img.resize(max_dim, max_dim, FilterType::Lanczos3)
}

fn encode_to_jpeg(img: &DynamicImage, quality: u8) -> image::ImageResult<Vec<u8>> {
    // JPEG has no alpha channel
    let flattened = match img {
        DynamicImage::ImageLuma8(_) | DynamicImage::ImageRgb8(_) => img.clone(),
        other => DynamicImage::ImageRgb8(other.to_rgb8()),
    };
    let mut buffer = Vec::new();
    flattened.write_with_encoder(JpegEncoder::new_with_quality(&mut buffer, quality))?;
    Ok(buffer)
}

/// OpenAI `response_format` constraining output to the detection-list shape.
pub fn detection_response_format(labels: &[String]) -> serde_json::Value {
    json!({
        "type": "json_schema",
        "json_schema": {
            "name": "inspection_detections",
            "strict": true,
            "schema": {
                "type": "object",
                "properties": {
                    "detections": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "label": { "type": "string", "enum": labels },
                                "bbox": {
                                    "type": "array",
                                    "items": { "type": "number" },
                                    "minItems": 4,
                                    "maxItems": 4
                                },
                                "confidence": { "type": "number", "minimum": 0, "maximum": 1 }
                            },
                            "required": ["label", "bbox"],
                            "additionalProperties": false
                        }
                    }
                },
                "required": ["detections"],
                "additionalProperties": false
            }
        }
    })
}
