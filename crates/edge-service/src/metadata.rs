//! Tolerant decoding of the `meta` JSON envelope pushed by edge devices.
//!
//! Devices disagree on key casing (`camera_id`, `cameraId`, `CameraId`) and
//! some send numbers as strings. Rather than relying on serde attributes, each
//! field is looked up through a small alias table after normalizing keys
//! (lower-case, `_` and `-` removed), and numeric values are coerced
//! explicitly.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::PipelineError;

mod keys {
    pub const TIMESTAMP: &[&str] = &["timestamputc", "timestamp", "capturedutc"];
    pub const CAMERA_ID: &[&str] = &["cameraid", "camera"];
    pub const IMAGE: &[&str] = &["image"];
    pub const COMPUTE: &[&str] = &["compute"];
    pub const PEOPLE: &[&str] = &["people"];
    pub const DETECTIONS: &[&str] = &["detections"];

    pub const WIDTH: &[&str] = &["width", "w"];
    pub const HEIGHT: &[&str] = &["height", "h"];

    pub const INFERENCE_MS: &[&str] = &["inferencems", "inference"];
    pub const MODEL: &[&str] = &["model", "modelname"];

    pub const COUNT: &[&str] = &["count"];
    pub const CONFIDENCE_AVG: &[&str] = &["confidenceavg"];

    pub const CLASS_ID: &[&str] = &["classid"];
    pub const CLASS_NAME: &[&str] = &["classname", "label"];
    pub const CONFIDENCE: &[&str] = &["confidence", "score"];
    pub const BBOX: &[&str] = &["bboxxyxy", "bbox"];
    pub const TRACK_ID: &[&str] = &["trackid"];
}

const DEFAULT_CLASS_NAME: &str = "person";

/// Parsed `meta` envelope
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeIngestionMetadata {
    pub timestamp_utc: String,
    pub camera_id: String,
    pub image: ImageInfo,
    pub compute: Option<ComputeInfo>,
    pub people: Option<PeopleSummary>,
    pub detections: Vec<Detection>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImageInfo {
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ComputeInfo {
    pub inference_ms: Option<f64>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PeopleSummary {
    pub count: i64,
    pub confidence_avg: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub class_id: i64,
    pub class_name: String,
    pub confidence: f64,
    pub bbox_xyxy: [f64; 4],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_id: Option<i64>,
}

impl EdgeIngestionMetadata {
    /// Capture instant; offset-less timestamps are read as UTC.
    pub fn capture_timestamp(&self) -> Result<DateTime<Utc>, PipelineError> {
        parse_timestamp(&self.timestamp_utc)
            .ok_or_else(|| PipelineError::validation("timestamp_utc", "is not a valid timestamp"))
    }

    /// Detections serialized for verbatim storage
    pub fn detections_json(&self) -> Result<String, PipelineError> {
        serde_json::to_string(&self.detections)
            .map_err(|e| PipelineError::MetadataParse(e.to_string()))
    }
}

/// Decode and check the mandatory fields.
///
/// Syntax and type errors are `MetadataParse`; a missing or blank
/// `camera_id`/`timestamp_utc` is a `Validation` error naming the field.
pub fn parse(text: &str) -> Result<EdgeIngestionMetadata, PipelineError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| PipelineError::MetadataParse(e.to_string()))?;
    let root = value
        .as_object()
        .ok_or_else(|| PipelineError::MetadataParse("meta must be a JSON object".to_string()))?;

    let timestamp_utc = string_field(root, keys::TIMESTAMP, "timestamp_utc")?.unwrap_or_default();
    let camera_id = string_field(root, keys::CAMERA_ID, "camera_id")?.unwrap_or_default();

    let image = match object_field(root, keys::IMAGE, "image")? {
        Some(obj) => ImageInfo {
            width: dimension(obj, keys::WIDTH, "image.width")?,
            height: dimension(obj, keys::HEIGHT, "image.height")?,
        },
        None => ImageInfo::default(),
    };

    let compute = object_field(root, keys::COMPUTE, "compute")?
        .map(|obj| -> Result<ComputeInfo, PipelineError> {
            Ok(ComputeInfo {
                inference_ms: number_field(obj, keys::INFERENCE_MS, "compute.inference_ms")?,
                model: string_field(obj, keys::MODEL, "compute.model")?,
            })
        })
        .transpose()?;

    let people = object_field(root, keys::PEOPLE, "people")?
        .map(|obj| -> Result<PeopleSummary, PipelineError> {
            Ok(PeopleSummary {
                count: integer_field(obj, keys::COUNT, "people.count")?.unwrap_or(0),
                confidence_avg: number_field(obj, keys::CONFIDENCE_AVG, "people.confidence_avg")?
                    .unwrap_or(0.0),
            })
        })
        .transpose()?;

    let detections = match lookup(root, keys::DETECTIONS) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, item)| detection(item, i))
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => {
            return Err(PipelineError::MetadataParse(
                "detections must be an array".to_string(),
            ))
        }
    };

    let metadata = EdgeIngestionMetadata {
        timestamp_utc,
        camera_id,
        image,
        compute,
        people,
        detections,
    };

    if metadata.camera_id.trim().is_empty() {
        return Err(PipelineError::validation("camera_id", "is required"));
    }
    if metadata.timestamp_utc.trim().is_empty() {
        return Err(PipelineError::validation("timestamp_utc", "is required"));
    }

    Ok(metadata)
}

fn detection(value: &Value, index: usize) -> Result<Detection, PipelineError> {
    let obj = value.as_object().ok_or_else(|| {
        PipelineError::MetadataParse(format!("detections[{index}] must be an object"))
    })?;
    let field = |name: &str| format!("detections[{index}].{name}");

    let bbox_xyxy = match lookup(obj, keys::BBOX) {
        None | Some(Value::Null) => [0.0; 4],
        Some(Value::Array(coords)) if coords.len() == 4 => {
            let mut out = [0.0; 4];
            for (slot, coord) in out.iter_mut().zip(coords) {
                *slot = coerce_f64(coord).ok_or_else(|| {
                    PipelineError::MetadataParse(format!("{} must contain numbers", field("bbox_xyxy")))
                })?;
            }
            out
        }
        Some(_) => {
            return Err(PipelineError::MetadataParse(format!(
                "{} must be an array of 4 numbers",
                field("bbox_xyxy")
            )))
        }
    };

    Ok(Detection {
        class_id: integer_field(obj, keys::CLASS_ID, &field("class_id"))?.unwrap_or(0),
        class_name: string_field(obj, keys::CLASS_NAME, &field("class_name"))?
            .unwrap_or_else(|| DEFAULT_CLASS_NAME.to_string()),
        confidence: number_field(obj, keys::CONFIDENCE, &field("confidence"))?.unwrap_or(0.0),
        bbox_xyxy,
        track_id: integer_field(obj, keys::TRACK_ID, &field("track_id"))?,
    })
}

fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

/// First value whose normalized key appears in `aliases`, in alias order.
fn lookup<'a>(obj: &'a Map<String, Value>, aliases: &[&str]) -> Option<&'a Value> {
    aliases.iter().find_map(|alias| {
        obj.iter()
            .find(|(key, _)| normalize_key(key) == *alias)
            .map(|(_, value)| value)
    })
}

fn object_field<'a>(
    obj: &'a Map<String, Value>,
    aliases: &[&str],
    name: &str,
) -> Result<Option<&'a Map<String, Value>>, PipelineError> {
    match lookup(obj, aliases) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(inner)) => Ok(Some(inner)),
        Some(_) => Err(PipelineError::MetadataParse(format!("{name} must be an object"))),
    }
}

fn string_field(
    obj: &Map<String, Value>,
    aliases: &[&str],
    name: &str,
) -> Result<Option<String>, PipelineError> {
    match lookup(obj, aliases) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(_) => Err(PipelineError::MetadataParse(format!("{name} must be a string"))),
    }
}

fn number_field(
    obj: &Map<String, Value>,
    aliases: &[&str],
    name: &str,
) -> Result<Option<f64>, PipelineError> {
    match lookup(obj, aliases) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => coerce_f64(value)
            .map(Some)
            .ok_or_else(|| PipelineError::MetadataParse(format!("{name} must be a number"))),
    }
}

fn integer_field(
    obj: &Map<String, Value>,
    aliases: &[&str],
    name: &str,
) -> Result<Option<i64>, PipelineError> {
    match lookup(obj, aliases) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => coerce_i64(value)
            .map(Some)
            .ok_or_else(|| PipelineError::MetadataParse(format!("{name} must be an integer"))),
    }
}

fn dimension(obj: &Map<String, Value>, aliases: &[&str], name: &str) -> Result<i32, PipelineError> {
    let raw = integer_field(obj, aliases, name)?.unwrap_or(0);
    i32::try_from(raw)
        .ok()
        .filter(|v| *v >= 0)
        .ok_or_else(|| PipelineError::MetadataParse(format!("{name} must be a non-negative integer")))
}

fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn coerce_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}
