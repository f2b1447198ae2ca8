//! Input validation for data arriving from edge devices and API callers
//!
//! Field checks return [`FieldError`] so callers can collect every violation
//! of a request instead of stopping at the first one. Path helpers guard the
//! storage layout against traversal through caller-supplied folder names.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};

// ============================================================================
// CONSTANTS: Input Size Limits
// ============================================================================

/// Maximum length for camera identifiers
pub const MAX_CAMERA_ID_LENGTH: usize = 200;

/// Maximum length for stored frame URLs
pub const MAX_FRAME_URL_LENGTH: usize = 500;

/// Maximum length for the inference model name
pub const MAX_COMPUTE_MODEL_LENGTH: usize = 200;

/// Maximum length for file paths
pub const MAX_PATH_LENGTH: usize = 4096;

// ============================================================================
// Field errors
// ============================================================================

/// A single violation attributed to a named field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Accumulates violations across several checks
#[derive(Debug, Default)]
pub struct Violations {
    errors: Vec<FieldError>,
}

impl Violations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of a check, keeping the error if there was one
    pub fn check(&mut self, outcome: std::result::Result<(), FieldError>) -> &mut Self {
        if let Err(e) = outcome {
            self.errors.push(e);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// `Ok(())` when nothing was recorded, otherwise every violation in order
    pub fn finish(self) -> std::result::Result<(), Vec<FieldError>> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors)
        }
    }
}

// ============================================================================
// String Validation
// ============================================================================

/// Validate string length (in characters) against a maximum
pub fn validate_length(
    value: &str,
    max_length: usize,
    field_name: &str,
) -> std::result::Result<(), FieldError> {
    let len = value.chars().count();
    if len > max_length {
        return Err(FieldError::new(
            field_name,
            format!("must be at most {} characters (got {})", max_length, len),
        ));
    }
    Ok(())
}

/// Validate non-empty string
pub fn validate_non_empty(value: &str, field_name: &str) -> std::result::Result<(), FieldError> {
    if value.trim().is_empty() {
        return Err(FieldError::new(field_name, "is required"));
    }
    Ok(())
}

/// Validate a camera identifier: present and bounded
pub fn validate_camera_id(camera_id: &str) -> std::result::Result<(), FieldError> {
    validate_non_empty(camera_id, "camera_id")?;
    validate_length(camera_id.trim(), MAX_CAMERA_ID_LENGTH, "camera_id")
}

/// Validate an optional string only when it is present
pub fn validate_optional_length(
    value: Option<&str>,
    max_length: usize,
    field_name: &str,
) -> std::result::Result<(), FieldError> {
    match value {
        Some(v) => validate_length(v, max_length, field_name),
        None => Ok(()),
    }
}

// ============================================================================
// Path Validation (Prevent Path Traversal)
// ============================================================================

/// Normalize a logical folder name such as `edge-frames\raw/` into
/// `edge-frames/raw`.
///
/// Backslashes are treated as separators. Absolute paths, `..` and empty
/// results are rejected.
pub fn normalize_relative_folder(folder: &str, field_name: &str) -> Result<String> {
    let unified = folder.trim().replace('\\', "/");
    let mut parts = Vec::new();

    for part in unified.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                return Err(anyhow!(
                    "{} contains '..' component (path traversal attempt)",
                    field_name
                ))
            }
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        return Err(anyhow!("{} cannot be empty", field_name));
    }

    let normalized = parts.join("/");
    if normalized.len() > MAX_PATH_LENGTH {
        return Err(anyhow!(
            "{} exceeds maximum length of {} bytes",
            field_name,
            MAX_PATH_LENGTH
        ));
    }

    Ok(normalized)
}

/// Join a caller-supplied relative path onto `base_dir` without requiring the
/// target to exist.
///
/// Only normal components are accepted, so the result can never escape
/// `base_dir`.
pub fn validate_path_components(path: &Path, base_dir: &Path, field_name: &str) -> Result<PathBuf> {
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow!("{} contains invalid UTF-8", field_name))?;

    if path_str.len() > MAX_PATH_LENGTH {
        return Err(anyhow!(
            "{} exceeds maximum length of {} bytes",
            field_name,
            MAX_PATH_LENGTH
        ));
    }

    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Err(anyhow!(
                    "{} contains '..' component (path traversal attempt)",
                    field_name
                ))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(anyhow!("{} must be a relative path", field_name))
            }
        }
    }

    Ok(base_dir.join(path))
}

// ============================================================================
// Tests
// ============================================================================
