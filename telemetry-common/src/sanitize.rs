//! Preparing untrusted device identifiers for interpolation into a delete predicate.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static DEVICE_ID_ALLOW_LIST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_\-:.]+$").expect("device id pattern is valid"));

/// Longest identifier preview we are willing to put in a log line.
const PREVIEW_CHARS: usize = 64;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SanitizeError {
    #[error("deviceId is missing or empty")]
    Missing,
    #[error("deviceId contains characters outside the allow-list: {preview}")]
    Rejected { preview: String },
}

impl SanitizeError {
    /// A rejection means someone sent a crafted identifier; a missing one is
    /// just a bad request. Neither is ever retried.
    pub fn is_security_violation(&self) -> bool {
        matches!(self, SanitizeError::Rejected { .. })
    }
}

/// Sanitize a device identifier, in this exact order:
///   1. reject a missing or empty identifier
///   2. strip NUL bytes
///   3. reject anything not matching `^[a-zA-Z0-9_\-:.]+$`
///   4. escape backslash and double quote
pub fn sanitize_device_id(device_id: Option<&str>) -> Result<String, SanitizeError> {
    let device_id = match device_id {
        Some(id) if !id.is_empty() => id,
        _ => return Err(SanitizeError::Missing),
    };

    let stripped = device_id.replace('\0', "");

    if !DEVICE_ID_ALLOW_LIST.is_match(&stripped) {
        return Err(SanitizeError::Rejected {
            preview: preview(device_id),
        });
    }

    Ok(stripped.replace('\\', "\\\\").replace('"', "\\\""))
}

fn preview(device_id: &str) -> String {
    let truncated: String = device_id.chars().take(PREVIEW_CHARS).collect();
    format!("{:?}", truncated)
}
