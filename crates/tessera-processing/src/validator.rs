use crate::sniff::{normalize_mime, Detected};
use std::path::Path;

/// Content problems found while processing a finished upload.
///
/// All of these are deterministic for a given payload, so a retry cannot fix them.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Empty file")]
    EmptyFile,

    #[error("Declared type {declared} does not match detected content {detected}")]
    TypeMismatch { declared: String, detected: String },

    #[error("File extension .{extension} does not match declared type {declared} (expected one of: {expected})")]
    ExtensionMismatch {
        extension: String,
        declared: String,
        expected: String,
    },

    #[error("{file_type} uploads must be images, detected {detected}")]
    NotAnImage { file_type: String, detected: String },

    #[error("Image could not be decoded: {0}")]
    UndecodableImage(String),

    #[error("Malformed document: {0}")]
    MalformedDocument(String),

    #[error("Variant encoding failed: {0}")]
    EncodeFailed(String),
}

/// MIME types expected for well-known extensions.
fn expected_content_types(extension: &str) -> Option<&'static [&'static str]> {
    let expected: &'static [&'static str] = match extension {
        // Images
        "jpg" | "jpeg" => &["image/jpeg"],
        "png" => &["image/png"],
        "gif" => &["image/gif"],
        "webp" => &["image/webp"],
        "avif" => &["image/avif"],
        "svg" => &["image/svg+xml"],
        "bmp" => &["image/bmp"],
        "ico" => &["image/x-icon", "image/vnd.microsoft.icon"],
        // Videos
        "mp4" => &["video/mp4"],
        "webm" => &["video/webm"],
        "mov" => &["video/quicktime"],
        "mkv" => &["video/x-matroska"],
        // Audio
        "mp3" => &["audio/mpeg", "audio/mp3"],
        "wav" => &["audio/wav", "audio/wave", "audio/x-wav"],
        "ogg" => &["audio/ogg", "application/ogg"],
        "flac" => &["audio/flac"],
        // Documents
        "pdf" => &["application/pdf"],
        "doc" => &["application/msword"],
        "docx" => &["application/vnd.openxmlformats-officedocument.wordprocessingml.document"],
        "xls" => &["application/vnd.ms-excel"],
        "xlsx" => &["application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"],
        "txt" => &["text/plain"],
        "csv" => &["text/csv"],
        "md" => &["text/markdown", "text/plain"],
        "json" => &["application/json"],
        "zip" => &["application/zip", "application/x-zip-compressed"],
        _ => return None,
    };
    Some(expected)
}

/// Check the declared MIME type against the bytes and against the file name.
///
/// Without a declared type nothing can be contradicted and the check passes.
pub fn validate_declared_type(
    filename: Option<&str>,
    declared: Option<&str>,
    detected: Detected,
) -> Result<(), ValidationError> {
    let Some(declared) = declared else {
        return Ok(());
    };

    if !detected.matches_declared(declared) {
        return Err(ValidationError::TypeMismatch {
            declared: declared.to_string(),
            detected: detected.mime().to_string(),
        });
    }

    let extension = filename
        .and_then(|name| Path::new(name).extension())
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());

    if let Some(extension) = extension {
        let normalized = normalize_mime(declared);
        match expected_content_types(&extension) {
            Some(expected) if !expected.iter().any(|ct| *ct == normalized) => {
                return Err(ValidationError::ExtensionMismatch {
                    extension,
                    declared: declared.to_string(),
                    expected: expected.join(", "),
                });
            }
            Some(_) => {}
            None => {
                tracing::debug!(
                    extension = %extension,
                    declared = %declared,
                    "Unknown extension, skipping extension/type cross-validation"
                );
            }
        }
    }

    Ok(())
}
