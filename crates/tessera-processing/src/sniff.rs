//! Content signature detection

use image::ImageFormat;

const TEXT_SAMPLE_BYTES: usize = 8 * 1024;

/// What the bytes of an upload look like, judged by their signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detected {
    Image(ImageFormat),
    Pdf,
    /// ZIP container (also OOXML, ODF, EPUB)
    Zip,
    /// OLE2 compound file (legacy Office)
    OfficeLegacy,
    Text,
    Unknown,
}

impl Detected {
    pub fn is_image(&self) -> bool {
        matches!(self, Detected::Image(_))
    }

    /// Canonical MIME type for diagnostics
    pub fn mime(&self) -> &'static str {
        match self {
            Detected::Image(format) => format.to_mime_type(),
            Detected::Pdf => "application/pdf",
            Detected::Zip => "application/zip",
            Detected::OfficeLegacy => "application/x-ole-storage",
            Detected::Text => "text/plain",
            Detected::Unknown => "application/octet-stream",
        }
    }

    /// Whether a declared MIME type is consistent with the detected signature.
    ///
    /// Only types with a recognizable signature can be contradicted; a declared
    /// `video/mp4` on bytes we cannot identify is accepted.
    pub fn matches_declared(&self, declared: &str) -> bool {
        let declared = normalize_mime(declared);
        if declared == "application/octet-stream" {
            return true;
        }

        match self {
            Detected::Image(format) => declared == format.to_mime_type(),
            Detected::Pdf => declared == "application/pdf",
            Detected::Zip => is_zip_family(&declared),
            Detected::OfficeLegacy => is_legacy_office(&declared),
            Detected::Text | Detected::Unknown => !claims_signature(&declared),
        }
    }
}

pub(crate) fn normalize_mime(mime: &str) -> String {
    let base = mime.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    match base.as_str() {
        "image/jpg" | "image/pjpeg" => "image/jpeg".to_string(),
        "image/x-png" => "image/png".to_string(),
        _ => base,
    }
}

fn is_zip_family(mime: &str) -> bool {
    matches!(
        mime,
        "application/zip" | "application/x-zip-compressed" | "application/epub+zip"
    ) || mime.starts_with("application/vnd.openxmlformats-officedocument.")
        || mime.starts_with("application/vnd.oasis.opendocument.")
}

fn is_legacy_office(mime: &str) -> bool {
    mime == "application/msword" || mime.starts_with("application/vnd.ms-")
}

/// Declared types whose bytes always carry a signature we can check.
fn claims_signature(mime: &str) -> bool {
    (mime.starts_with("image/") && mime != "image/svg+xml")
        || mime == "application/pdf"
        || is_zip_family(mime)
        || is_legacy_office(mime)
}

/// Identify content by its leading bytes.
pub fn detect(data: &[u8]) -> Detected {
    if data.is_empty() {
        return Detected::Unknown;
    }
    if data.starts_with(b"%PDF-") {
        return Detected::Pdf;
    }
    if data.starts_with(b"PK\x03\x04") || data.starts_with(b"PK\x05\x06") {
        return Detected::Zip;
    }
    if data.starts_with(&[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1]) {
        return Detected::OfficeLegacy;
    }
    if let Ok(format) = image::guess_format(data) {
        return Detected::Image(format);
    }
    if looks_like_text(data) {
        return Detected::Text;
    }
    Detected::Unknown
}

fn looks_like_text(data: &[u8]) -> bool {
    let sample = &data[..data.len().min(TEXT_SAMPLE_BYTES)];
    if sample.contains(&0) {
        return false;
    }
    match std::str::from_utf8(sample) {
        Ok(_) => true,
        // a multi-byte character cut by the sample boundary
        Err(e) => e.error_len().is_none() && sample.len() == TEXT_SAMPLE_BYTES,
    }
}
