//! Overlays detections on a copy of the source image.
//!
//! Boxes are drawn in solid red, stroked inward from the validated box so the
//! stroke never leaves the canvas. Each label sits on a red tab above the
//! box's top-left corner, or just inside the box when there is no room above.

use ab_glyph::{FontVec, PxScale};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageBuffer, ImageFormat, Luma, LumaA, Pixel, Rgb, Rgba};
use imageproc::definitions::Clamp;
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::io::Cursor;
use std::path::Path;
use tracing::{debug, info};

use crate::config::AnnotationConfig;
use crate::error::{InspectError, Result};
use crate::source::SourceImage;
use crate::types::Detection;

const LABEL_PADDING: u32 = 4;

/// Re-encode quality for annotated JPEG sources.
pub const ANNOTATED_JPEG_QUALITY: u8 = 95;

const SYSTEM_FONTS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "/Library/Fonts/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

/// Image bytes bound for an output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageArtifact {
    /// Byte-for-byte copy of the source file.
    Original(Vec<u8>),
    /// Source re-encoded in its own format with detections drawn on it.
    Annotated(Vec<u8>),
}

impl ImageArtifact {
    pub fn bytes(&self) -> &[u8] {
        match self {
            ImageArtifact::Original(bytes) | ImageArtifact::Annotated(bytes) => bytes,
        }
    }

    pub fn is_annotated(&self) -> bool {
        matches!(self, ImageArtifact::Annotated(_))
    }
}

pub struct Annotator {
    font: Option<FontVec>,
    line_width: Option<u32>,
    font_scale: Option<f32>,
}

impl Annotator {
    /// A configured font that cannot be loaded is a configuration error;
    /// otherwise common system fonts are tried and text is skipped if none
    /// is found.
    pub fn new(config: &AnnotationConfig) -> Result<Self> {
        let font = match &config.font_path {
            Some(path) => Some(load_font(path).map_err(InspectError::config)?),
            None => system_font(),
        };
        Ok(Self {
            font,
            line_width: config.line_width,
            font_scale: config.font_scale,
        })
    }

    /// Boxes only.
    pub fn without_font(line_width: Option<u32>) -> Self {
        Self {
            font: None,
            line_width,
            font_scale: None,
        }
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Annotated image when there are detections, otherwise the source bytes.
    pub fn annotate(&self, source: &SourceImage, detections: &[Detection]) -> Result<ImageArtifact> {
        if detections.is_empty() {
            return Ok(ImageArtifact::Original(source.bytes.clone()));
        }

        let mut canvas = source.image.clone();
        self.draw(&mut canvas, detections)?;

        let mut encoded = Cursor::new(Vec::new());
        let written = match source.format {
            ImageFormat::Jpeg => canvas.write_with_encoder(JpegEncoder::new_with_quality(
                &mut encoded,
                ANNOTATED_JPEG_QUALITY,
            )),
            format => canvas.write_to(&mut encoded, format),
        };
        written.map_err(|e| {
            InspectError::Render(format!(
                "cannot encode {} as {:?}: {}",
                source.path.display(),
                source.format,
                e
            ))
        })?;
        Ok(ImageArtifact::Annotated(encoded.into_inner()))
    }

    /// Draw onto `image` in place, keeping its dimensions and color type.
    pub fn draw(&self, image: &mut DynamicImage, detections: &[Detection]) -> Result<()> {
        let line_width = self.line_width_for(image.width(), image.height());
        let scale = self.font_scale_for(image.width(), image.height());

        match image {
            DynamicImage::ImageLuma8(buf) => {
                self.draw_on(buf, detections, line_width, scale, Luma([54]), Luma([255]))
            }
            DynamicImage::ImageLumaA8(buf) => {
                self.draw_on(buf, detections, line_width, scale, LumaA([54, 255]), LumaA([255, 255]))
            }
            DynamicImage::ImageRgb8(buf) => {
                self.draw_on(buf, detections, line_width, scale, Rgb([255, 0, 0]), Rgb([255, 255, 255]))
            }
            DynamicImage::ImageRgba8(buf) => self.draw_on(
                buf,
                detections,
                line_width,
                scale,
                Rgba([255, 0, 0, 255]),
                Rgba([255, 255, 255, 255]),
            ),
            DynamicImage::ImageLuma16(buf) => {
                self.draw_on(buf, detections, line_width, scale, Luma([13_878]), Luma([u16::MAX]))
            }
            DynamicImage::ImageLumaA16(buf) => self.draw_on(
                buf,
                detections,
                line_width,
                scale,
                LumaA([13_878, u16::MAX]),
                LumaA([u16::MAX, u16::MAX]),
            ),
            DynamicImage::ImageRgb16(buf) => self.draw_on(
                buf,
                detections,
                line_width,
                scale,
                Rgb([u16::MAX, 0, 0]),
                Rgb([u16::MAX; 3]),
            ),
            DynamicImage::ImageRgba16(buf) => self.draw_on(
                buf,
                detections,
                line_width,
                scale,
                Rgba([u16::MAX, 0, 0, u16::MAX]),
                Rgba([u16::MAX; 4]),
            ),
            DynamicImage::ImageRgb32F(buf) => {
                self.draw_on(buf, detections, line_width, scale, Rgb([1.0, 0.0, 0.0]), Rgb([1.0; 3]))
            }
            DynamicImage::ImageRgba32F(buf) => self.draw_on(
                buf,
                detections,
                line_width,
                scale,
                Rgba([1.0, 0.0, 0.0, 1.0]),
                Rgba([1.0; 4]),
            ),
            other => {
                return Err(InspectError::Render(format!(
                    "unsupported color type {:?}",
                    other.color()
                )))
            }
        }
        Ok(())
    }

    fn line_width_for(&self, width: u32, height: u32) -> u32 {
        self.line_width
            .unwrap_or_else(|| 2.max((width.min(height) as f32 * 0.004).round() as u32))
    }

    fn font_scale_for(&self, width: u32, height: u32) -> f32 {
        self.font_scale
            .unwrap_or_else(|| 12f32.max((width.min(height) as f32 * 0.03).round()))
    }

    fn draw_on<P>(
        &self,
        img: &mut ImageBuffer<P, Vec<P::Subpixel>>,
        detections: &[Detection],
        line_width: u32,
        scale: f32,
        box_color: P,
        text_color: P,
    ) where
        P: Pixel,
        P::Subpixel: Into<f32> + Clamp<f32>,
    {
        for detection in detections {
            draw_box(img, detection, line_width, box_color);
            if let Some(font) = &self.font {
                draw_label(img, detection, font, scale, box_color, text_color);
            }
        }
        if self.font.is_none() {
            debug!("No font available, drew {} box(es) without labels", detections.len());
        }
    }
}

fn draw_box<P>(
    img: &mut ImageBuffer<P, Vec<P::Subpixel>>,
    detection: &Detection,
    line_width: u32,
    color: P,
) where
    P: Pixel,
{
    let (img_w, img_h) = img.dimensions();
    let bbox = &detection.bbox;
    // Validated boxes are in bounds; re-clip anyway so a stray box cannot panic
    let x_max = bbox.x_max.min(img_w.saturating_sub(1));
    let y_max = bbox.y_max.min(img_h.saturating_sub(1));

    for t in 0..line_width {
        let left = bbox.x_min + t;
        let top = bbox.y_min + t;
        let (Some(right), Some(bottom)) = (x_max.checked_sub(t), y_max.checked_sub(t)) else {
            break;
        };
        if right < left || bottom < top {
            break;
        }
        let rect = Rect::at(left as i32, top as i32).of_size(right - left + 1, bottom - top + 1);
        draw_hollow_rect_mut(img, rect, color);
    }
}

fn draw_label<P>(
    img: &mut ImageBuffer<P, Vec<P::Subpixel>>,
    detection: &Detection,
    font: &FontVec,
    scale: f32,
    background: P,
    color: P,
) where
    P: Pixel,
    P::Subpixel: Into<f32> + Clamp<f32>,
{
    let text = detection.label.trim();
    if text.is_empty() {
        return;
    }
    let (img_w, img_h) = img.dimensions();
    let scale = PxScale::from(scale);
    let (text_w, text_h) = text_size(scale, font, text);

    let tab_w = text_w + LABEL_PADDING * 2;
    let tab_h = text_h + LABEL_PADDING * 2;
    let tab_x = detection.bbox.x_min;
    let tab_y = if detection.bbox.y_min >= tab_h {
        detection.bbox.y_min - tab_h
    } else {
        detection.bbox.y_min
    };
    if tab_x >= img_w || tab_y >= img_h {
        return;
    }

    let clipped_w = tab_w.min(img_w - tab_x);
    let clipped_h = tab_h.min(img_h - tab_y);
    if clipped_w == 0 || clipped_h == 0 {
        return;
    }
    draw_filled_rect_mut(
        img,
        Rect::at(tab_x as i32, tab_y as i32).of_size(clipped_w, clipped_h),
        background,
    );
    draw_text_mut(
        img,
        color,
        (tab_x + LABEL_PADDING) as i32,
        (tab_y + LABEL_PADDING) as i32,
        scale,
        font,
        text,
    );
}

fn load_font(path: &Path) -> std::result::Result<FontVec, String> {
    let data = std::fs::read(path)
        .map_err(|e| format!("cannot read font {}: {}", path.display(), e))?;
    FontVec::try_from_vec(data).map_err(|_| format!("cannot parse font file {}", path.display()))
}

fn system_font() -> Option<FontVec> {
    for path in SYSTEM_FONTS {
        if let Ok(font) = load_font(Path::new(path)) {
            info!("Loaded system font: {}", path);
            return Some(font);
        }
    }
    debug!("No system font found, labels will not be rendered");
    None
}
