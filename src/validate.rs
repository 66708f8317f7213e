//! Validation of untrusted model output.
//!
//! The assistant text is decoded against a closed set of shapes. Text that
//! matches none of them fails the whole task with `ResponseFormat`. Inside a
//! recognized shape each candidate detection is checked on its own and
//! dropped, never repaired into a different label, when it fails:
//!
//! * the label must match an allowed label (trimmed, case-insensitive); the
//!   configured spelling is what gets stored
//! * the box must have four numeric coordinates; when all four lie in
//!   `[0, 1]` they are fractions of `(width - 1, height - 1)`
//! * corners are reordered, then clamped into `[0, width-1] x [0, height-1]`;
//!   a box with zero width or height after clamping is dropped
//! * a confidence, when given, must lie in `[0, 1]` and reach the configured
//!   floor
//!
//! Accepted shapes:
//!
//! ```text
//! {"detections": [{"label": "...", "bbox": [x1, y1, x2, y2], "confidence": 0.9}], "notes": "..."}
//! [{"label": "...", "bbox": [x1, y1, x2, y2]}]
//! {"is_forbidden": true, "label": "...", "bbox": [x1, y1, x2, y2], "point": [x, y]}
//! ```

use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::config::{label_key, Config};
use crate::error::{InspectError, Result};
use crate::metrics;
use crate::types::{BoundingBox, Detection, InspectionResult, InspectionTask};

lazy_static! {
    static ref LEADING_FENCE: Regex = Regex::new(r"(?i)^```(?:json)?").unwrap();
    static ref TRAILING_FENCE: Regex = Regex::new(r"```$").unwrap();
    static ref OBJECT_SPAN: Regex = Regex::new(r"(?s)\{.*\}").unwrap();
    static ref ARRAY_SPAN: Regex = Regex::new(r"(?s)\[.*\]").unwrap();
}

/// Half-size floor of the box synthesized around a verdict's point.
const POINT_BOX_MIN_HALF: i64 = 20;

#[derive(Debug)]
enum ModelOutput {
    List(DetectionList),
    Verdict(Verdict),
    Bare(Vec<serde_json::Map<String, serde_json::Value>>),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DetectionList {
    detections: Vec<serde_json::Value>,
    #[serde(default)]
    #[allow(dead_code)]
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Verdict {
    is_forbidden: bool,
    #[serde(default, alias = "reason")]
    label: Option<String>,
    #[serde(default)]
    bbox: Option<Vec<Coord>>,
    #[serde(default)]
    point: Option<Vec<Coord>>,
    #[serde(default)]
    confidence: Option<Coord>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDetection {
    label: String,
    #[serde(alias = "bbox_2d")]
    bbox: Vec<Coord>,
    #[serde(default)]
    confidence: Option<Coord>,
}

/// Models emit numbers both bare and quoted.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Coord {
    Number(f64),
    Text(String),
}

impl Coord {
    fn value(&self) -> Option<f64> {
        let v = match self {
            Coord::Number(n) => *n,
            Coord::Text(s) => s.trim().parse::<f64>().ok()?,
        };
        v.is_finite().then_some(v)
    }
}

/// Why a candidate detection was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    UnknownLabel,
    Geometry,
    Confidence,
    BelowThreshold,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Malformed => "malformed",
            DropReason::UnknownLabel => "unknown_label",
            DropReason::Geometry => "geometry",
            DropReason::Confidence => "confidence",
            DropReason::BelowThreshold => "below_threshold",
        }
    }
}

/// Detections that survived, plus what was thrown away.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Validated {
    pub detections: Vec<Detection>,
    pub dropped: Vec<DropReason>,
}

pub struct ResponseValidator {
    labels: Vec<String>,
    min_confidence: Option<f64>,
}

impl ResponseValidator {
    pub fn new(config: &Config) -> Self {
        Self::with_labels(config.labels.clone(), config.min_confidence)
    }

    pub fn with_labels(labels: Vec<String>, min_confidence: Option<f64>) -> Self {
        Self {
            labels: labels.into_iter().map(|l| l.trim().to_string()).collect(),
            min_confidence,
        }
    }

    /// Turn raw assistant text into the terminal result for `task`.
    pub fn validate(
        &self,
        task: &InspectionTask,
        raw_text: &str,
        image_size: (u32, u32),
    ) -> Result<InspectionResult> {
        let validated = self.check(raw_text, image_size)?;
        Ok(InspectionResult::completed(task, validated.detections))
    }

    pub fn check(&self, raw_text: &str, (width, height): (u32, u32)) -> Result<Validated> {
        let output = decode(raw_text)?;
        let mut validated = Validated::default();

        let candidates = match output {
            ModelOutput::List(DetectionList { detections, .. }) => detections,
            ModelOutput::Bare(items) => items.into_iter().map(serde_json::Value::Object).collect(),
            ModelOutput::Verdict(verdict) => {
                if verdict.is_forbidden {
                    let outcome = self.accept_verdict(&verdict, width, height);
                    validated.record(outcome);
                }
                Vec::new()
            }
        };
        for candidate in candidates {
            let outcome = serde_json::from_value::<RawDetection>(candidate)
                .map_err(|_| DropReason::Malformed)
                .and_then(|raw| self.accept(&raw, width, height));
            validated.record(outcome);
        }

        metrics::DETECTIONS_ACCEPTED.inc_by(validated.detections.len() as u64);
        for reason in &validated.dropped {
            metrics::DETECTIONS_DROPPED
                .with_label_values(&[reason.as_str()])
                .inc();
        }
        if !validated.dropped.is_empty() {
            debug!(
                "Kept {} detection(s), dropped {}: {:?}",
                validated.detections.len(),
                validated.dropped.len(),
                validated.dropped
            );
        }
        Ok(validated)
    }

    fn accept(
        &self,
        raw: &RawDetection,
        width: u32,
        height: u32,
    ) -> std::result::Result<Detection, DropReason> {
        let label = self.canonical_label(&raw.label)?;
        let confidence = self.check_confidence(raw.confidence.as_ref())?;
        let values = four_values(&raw.bbox).ok_or(DropReason::Geometry)?;
        let bbox = normalize_bbox(values, width, height).ok_or(DropReason::Geometry)?;
        Ok(Detection {
            label,
            bbox,
            confidence,
        })
    }

    fn accept_verdict(
        &self,
        verdict: &Verdict,
        width: u32,
        height: u32,
    ) -> std::result::Result<Detection, DropReason> {
        let label = verdict
            .label
            .as_deref()
            .ok_or(DropReason::UnknownLabel)
            .and_then(|l| self.canonical_label(l))?;
        let confidence = self.check_confidence(verdict.confidence.as_ref())?;

        let from_box = verdict
            .bbox
            .as_deref()
            .and_then(four_values)
            .and_then(|values| normalize_bbox(values, width, height));
        let bbox = from_box
            .or_else(|| {
                verdict
                    .point
                    .as_deref()
                    .and_then(|p| box_around_point(p, width, height))
            })
            .ok_or(DropReason::Geometry)?;

        Ok(Detection {
            label,
            bbox,
            confidence,
        })
    }

    fn canonical_label(&self, label: &str) -> std::result::Result<String, DropReason> {
        let wanted = label_key(label);
        self.labels
            .iter()
            .find(|allowed| label_key(allowed) == wanted)
            .cloned()
            .ok_or(DropReason::UnknownLabel)
    }

    fn check_confidence(
        &self,
        confidence: Option<&Coord>,
    ) -> std::result::Result<Option<f64>, DropReason> {
        let Some(coord) = confidence else {
            return Ok(None);
        };
        let value = coord.value().ok_or(DropReason::Confidence)?;
        if !(0.0..=1.0).contains(&value) {
            return Err(DropReason::Confidence);
        }
        if let Some(min) = self.min_confidence {
            if value < min {
                return Err(DropReason::BelowThreshold);
            }
        }
        Ok(Some(value))
    }
}

impl Validated {
    fn record(&mut self, outcome: std::result::Result<Detection, DropReason>) {
        match outcome {
            Ok(detection) => self.detections.push(detection),
            Err(reason) => self.dropped.push(reason),
        }
    }
}

/// Strip markdown fences and escaped underscores some models emit.
pub fn clean_response_text(text: &str) -> String {
    let mut cleaned = text.trim().to_string();
    if cleaned.starts_with("```") {
        cleaned = LEADING_FENCE.replace(&cleaned, "").trim().to_string();
        cleaned = TRAILING_FENCE.replace(&cleaned, "").trim().to_string();
    }
    cleaned.replace("\\_", "_")
}

fn decode(raw_text: &str) -> Result<ModelOutput> {
    let cleaned = clean_response_text(raw_text);
    if cleaned.is_empty() {
        return Err(InspectError::ResponseFormat("empty model output".to_string()));
    }

    if let Some(output) = parse_output(&cleaned) {
        return Ok(output);
    }

    // Prose around the payload. An array span only counts when the payload
    // itself is a list; otherwise it would pick up an inner `bbox`.
    let list_first = match (cleaned.find('['), cleaned.find('{')) {
        (Some(list), Some(object)) => list < object,
        (Some(_), None) => true,
        (None, _) => false,
    };
    let span = if list_first { &*ARRAY_SPAN } else { &*OBJECT_SPAN };
    if let Some(m) = span.find(&cleaned) {
        if let Some(output) = parse_output(m.as_str()) {
            return Ok(output);
        }
    }

    Err(InspectError::ResponseFormat(format!(
        "no recognizable detection schema in model output: {}",
        preview(&cleaned)
    )))
}

/// Objects decode as a detection list or a verdict, arrays only as a list
/// of objects. Structs never decode from arrays.
fn parse_output(text: &str) -> Option<ModelOutput> {
    match serde_json::from_str::<serde_json::Value>(text).ok()? {
        object @ serde_json::Value::Object(_) => {
            if let Ok(list) = serde_json::from_value::<DetectionList>(object.clone()) {
                return Some(ModelOutput::List(list));
            }
            serde_json::from_value::<Verdict>(object)
                .ok()
                .map(ModelOutput::Verdict)
        }
        items @ serde_json::Value::Array(_) => serde_json::from_value(items).ok().map(ModelOutput::Bare),
        _ => None,
    }
}

fn preview(text: &str) -> String {
    const MAX: usize = 120;
    match text.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

fn four_values(coords: &[Coord]) -> Option<[f64; 4]> {
    if coords.len() != 4 {
        return None;
    }
    Some([
        coords[0].value()?,
        coords[1].value()?,
        coords[2].value()?,
        coords[3].value()?,
    ])
}

/// Convert model coordinates into an in-bounds pixel box, or `None` when
/// nothing with positive area remains.
pub fn normalize_bbox(values: [f64; 4], width: u32, height: u32) -> Option<BoundingBox> {
    if width < 2 || height < 2 {
        return None;
    }
    let max_x = (width - 1) as f64;
    let max_y = (height - 1) as f64;

    let [mut x1, mut y1, mut x2, mut y2] = values;
    if values.iter().all(|v| (0.0..=1.0).contains(v)) {
        x1 *= max_x;
        x2 *= max_x;
        y1 *= max_y;
        y2 *= max_y;
    }

    let (x1, x2) = ordered(x1.round(), x2.round());
    let (y1, y2) = ordered(y1.round(), y2.round());

    let (x1, x2) = (x1.clamp(0.0, max_x), x2.clamp(0.0, max_x));
    let (y1, y2) = (y1.clamp(0.0, max_y), y2.clamp(0.0, max_y));
    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    Some(BoundingBox {
        x_min: x1 as u32,
        y_min: y1 as u32,
        x_max: x2 as u32,
        y_max: y2 as u32,
    })
}

fn ordered(a: f64, b: f64) -> (f64, f64) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Square box centered on a verdict's point. `[0, 0]` means no point.
fn box_around_point(point: &[Coord], width: u32, height: u32) -> Option<BoundingBox> {
    if point.len() != 2 || width < 2 || height < 2 {
        return None;
    }
    let (mut x, mut y) = (point[0].value()?, point[1].value()?);
    if x == 0.0 && y == 0.0 {
        return None;
    }
    let max_x = (width - 1) as i64;
    let max_y = (height - 1) as i64;
    if (0.0..=1.0).contains(&x) && (0.0..=1.0).contains(&y) {
        x *= max_x as f64;
        y *= max_y as f64;
    }
    let x = (x.round() as i64).clamp(0, max_x);
    let y = (y.round() as i64).clamp(0, max_y);

    let half = POINT_BOX_MIN_HALF.max((width.min(height) as f64 * 0.05).round() as i64);
    let (x1, x2) = ((x - half).clamp(0, max_x), (x + half).clamp(0, max_x));
    let (y1, y2) = ((y - half).clamp(0, max_y), (y + half).clamp(0, max_y));
    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    Some(BoundingBox {
        x_min: x1 as u32,
        y_min: y1 as u32,
        x_max: x2 as u32,
        y_max: y2 as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: (u32, u32) = (200, 100);

    fn validator() -> ResponseValidator {
        ResponseValidator::with_labels(vec!["defective".into(), "scratch".into()], None)
    }

    fn bbox(x_min: u32, y_min: u32, x_max: u32, y_max: u32) -> BoundingBox {
        BoundingBox { x_min, y_min, x_max, y_max }
    }

    #[test]
    fn test_detection_list_accepted() {
        let raw = r#"{"detections": [{"label": "defective", "bbox": [10, 10, 50, 50], "confidence": 0.8}]}"#;
        let v = validator().check(raw, SIZE).unwrap();
        assert_eq!(v.detections.len(), 1);
        assert_eq!(v.detections[0].label, "defective");
        assert_eq!(v.detections[0].bbox, bbox(10, 10, 50, 50));
        assert_eq!(v.detections[0].confidence, Some(0.8));
        assert!(v.dropped.is_empty());
    }

    #[test]
    fn test_empty_list_is_negative_not_error() {
        let v = validator().check(r#"{"detections": []}"#, SIZE).unwrap();
        assert!(v.detections.is_empty());
        assert!(v.dropped.is_empty());
    }

    #[test]
    fn test_unknown_label_dropped_not_failed() {
        let raw = r#"{"detections": [
            {"label": "rust", "bbox": [10, 10, 50, 50]},
            {"label": " Scratch ", "bbox": [60, 10, 90, 40]}
        ]}"#;
        let v = validator().check(raw, SIZE).unwrap();
        assert_eq!(v.detections.len(), 1);
        assert_eq!(v.detections[0].label, "scratch");
        assert_eq!(v.dropped, vec![DropReason::UnknownLabel]);
    }

    #[test]
    fn test_malformed_candidate_dropped() {
        let raw = r#"{"detections": [
            {"label": "defective"},
            {"label": "defective", "bbox": [1, 2, 3]},
            {"label": "defective", "bbox": [10, 10, 50, 50], "extra": true},
            {"label": "defective", "bbox": ["12", "14", "40.4", "44.6"]}
        ]}"#;
        let v = validator().check(raw, SIZE).unwrap();
        assert_eq!(v.detections.len(), 1);
        assert_eq!(v.detections[0].bbox, bbox(12, 14, 40, 45));
        assert_eq!(
            v.dropped,
            vec![DropReason::Malformed, DropReason::Geometry, DropReason::Malformed]
        );
    }

    #[test]
    fn test_bare_list_in_prose_accepted() {
        let raw = r#"Found these: [{"label": "scratch", "bbox": [60, 10, 90, 40]}] done"#;
        let v = validator().check(raw, SIZE).unwrap();
        assert_eq!(v.detections[0].bbox, bbox(60, 10, 90, 40));
    }

    #[test]
    fn test_non_ascii_labels_match_case_insensitively() {
        let v = ResponseValidator::with_labels(vec!["Défaut".into()], None);
        let raw = r#"{"detections": [{"label": "DÉFAUT", "bbox": [10, 10, 50, 50]}]}"#;
        let checked = v.check(raw, SIZE).unwrap();
        assert_eq!(checked.detections[0].label, "Défaut");
    }

    #[test]
    fn test_degenerate_boxes_dropped() {
        let raw = r#"[
            {"label": "defective", "bbox": [10, 10, 10, 50]},
            {"label": "defective", "bbox": [10, 30, 50, 30]},
            {"label": "defective", "bbox": [300, 10, 400, 50]}
        ]"#;
        let v = validator().check(raw, SIZE).unwrap();
        assert!(v.detections.is_empty());
        assert_eq!(v.dropped, vec![DropReason::Geometry; 3]);
    }

    #[test]
    fn test_partially_outside_box_is_clamped() {
        let raw = r#"{"detections": [{"label": "defective", "bbox": [-20, 50, 250, 180]}]}"#;
        let v = validator().check(raw, SIZE).unwrap();
        assert_eq!(v.detections[0].bbox, bbox(0, 50, 199, 99));
    }

    #[test]
    fn test_swapped_corners_reordered() {
        assert_eq!(normalize_bbox([50.0, 40.0, 10.0, 5.0], 200, 100), Some(bbox(10, 5, 50, 40)));
    }

    #[test]
    fn test_normalized_coordinates_scaled() {
        assert_eq!(
            normalize_bbox([0.1, 0.2, 0.5, 1.0], 201, 101),
            Some(bbox(20, 20, 100, 100))
        );
    }

    #[test]
    fn test_tiny_images_have_no_valid_boxes() {
        assert_eq!(normalize_bbox([0.0, 0.0, 5.0, 5.0], 1, 100), None);
    }

    #[test]
    fn test_confidence_rules() {
        let strict = ResponseValidator::with_labels(vec!["defective".into()], Some(0.5));
        let raw = r#"{"detections": [
            {"label": "defective", "bbox": [10, 10, 50, 50], "confidence": 0.4},
            {"label": "defective", "bbox": [10, 10, 50, 50], "confidence": 1.7},
            {"label": "defective", "bbox": [10, 10, 50, 50], "confidence": "0.9"},
            {"label": "defective", "bbox": [10, 10, 50, 50]}
        ]}"#;
        let v = strict.check(raw, SIZE).unwrap();
        assert_eq!(v.detections.len(), 2);
        assert_eq!(v.detections[0].confidence, Some(0.9));
        assert_eq!(v.detections[1].confidence, None);
        assert_eq!(v.dropped, vec![DropReason::BelowThreshold, DropReason::Confidence]);
    }

    #[test]
    fn test_fenced_and_prose_wrapped_output() {
        let fenced = "```json\n{\"detections\": [{\"label\": \"defective\", \"bbox\": [1, 1, 9, 9]}]}\n```";
        assert_eq!(validator().check(fenced, SIZE).unwrap().detections.len(), 1);

        let prose = "Sure! Here is the result:\n{\"detections\": []}\nLet me know.";
        assert!(validator().check(prose, SIZE).unwrap().detections.is_empty());

        let escaped = r#"{"detections": [{"label": "defective", "bbox\_2d": [1, 1, 9, 9]}]}"#;
        assert_eq!(validator().check(escaped, SIZE).unwrap().detections.len(), 1);
    }

    #[test]
    fn test_unrecognizable_output_is_format_error() {
        for raw in [
            "",
            "The image shows a scratch near the top.",
            r#"{"detections": [{"label": "defective", "bbox": [1, 1,"#,
            r#"{"result": "defective"}"#,
            r#"{"detections": "none", "notes": "x"}"#,
            r#"{"is_forbidden": true, "reason": "defective", "bbox": [10, 10, 50, 50], "po"#,
            r#"{"is_forbidden": true, "reason": "defective", "bbox": [10,10,50,50], "description": "dent"}"#,
            r#"{"is_forbidden": true, "label": "defective", "reason": "defective", "bbox": [10, 10, 50, 50]}"#,
            r#"Answer: {"verdict": "defective", "bbox": [10, 10, 50, 50]}"#,
            "[10, 10, 50, 50]",
            "Boxes: [[10, 10, 50, 50]]",
            "[[10, 10, 50, 50]]",
        ] {
            let err = validator().check(raw, SIZE).unwrap_err();
            assert!(matches!(err, InspectError::ResponseFormat(_)), "{raw:?}");
        }
    }

    #[test]
    fn test_verdict_shape() {
        let negative = r#"{"is_forbidden": false, "reason": "defective", "bbox": [1, 1, 9, 9]}"#;
        assert!(validator().check(negative, SIZE).unwrap().detections.is_empty());

        let positive = r#"{"is_forbidden": true, "reason": "defective", "bbox": [10, 10, 50, 50]}"#;
        let v = validator().check(positive, SIZE).unwrap();
        assert_eq!(v.detections[0].bbox, bbox(10, 10, 50, 50));

        let off_taxonomy = r#"{"is_forbidden": true, "reason": "a smoking person", "bbox": [10, 10, 50, 50]}"#;
        let v = validator().check(off_taxonomy, SIZE).unwrap();
        assert!(v.detections.is_empty());
        assert_eq!(v.dropped, vec![DropReason::UnknownLabel]);
    }

    #[test]
    fn test_verdict_point_fallback() {
        let raw = r#"{"is_forbidden": true, "label": "scratch", "bbox": [0, 0, 0, 0], "point": [100, 50]}"#;
        let v = validator().check(raw, SIZE).unwrap();
        // half = max(20, round(0.05 * 100)) = 20
        assert_eq!(v.detections[0].bbox, bbox(80, 30, 120, 70));

        let near_edge = r#"{"is_forbidden": true, "label": "scratch", "point": [195, 5]}"#;
        let v = validator().check(near_edge, SIZE).unwrap();
        assert_eq!(v.detections[0].bbox, bbox(175, 0, 199, 25));

        let no_geometry = r#"{"is_forbidden": true, "label": "scratch", "point": [0, 0]}"#;
        let v = validator().check(no_geometry, SIZE).unwrap();
        assert_eq!(v.dropped, vec![DropReason::Geometry]);
    }

    #[test]
    fn test_validate_builds_result() {
        let task = InspectionTask {
            task_id: "a.jpg".into(),
            source_image_path: "/in/a.jpg".into(),
        };
        let result = validator()
            .validate(&task, r#"{"detections": [{"label": "defective", "bbox": [1, 1, 9, 9]}]}"#, SIZE)
            .unwrap();
        assert!(result.is_positive);
        assert!(result.error.is_none());
        assert_eq!(result.task_id, "a.jpg");
    }

    #[test]
    fn test_clean_response_text() {
        assert_eq!(clean_response_text("```JSON\n{}\n```"), "{}");
        assert_eq!(clean_response_text("  {\"a\\_b\": 1} "), "{\"a_b\": 1}");
    }
}
