//! Structural checks for document uploads

use crate::sniff::{normalize_mime, Detected};
use crate::validator::ValidationError;

/// PDF writers may append whitespace or junk after `%%EOF`; readers tolerate ~1KiB.
const PDF_TRAILER_WINDOW: usize = 1024;
/// End-of-central-directory record plus the maximum comment length.
const ZIP_EOCD_WINDOW: usize = 22 + u16::MAX as usize;

pub fn validate_document(
    data: &[u8],
    declared: Option<&str>,
    detected: Detected,
) -> Result<(), ValidationError> {
    if data.is_empty() {
        return Err(ValidationError::EmptyFile);
    }

    let declared = declared.map(normalize_mime);
    let declared = declared.as_deref();

    if detected == Detected::Pdf || declared == Some("application/pdf") {
        return validate_pdf(data);
    }
    if detected == Detected::Zip {
        return validate_zip(data);
    }
    if declared.is_some_and(|d| d.starts_with("text/")) {
        return std::str::from_utf8(data).map(|_| ()).map_err(|e| {
            ValidationError::MalformedDocument(format!(
                "text is not valid UTF-8 at byte {}",
                e.valid_up_to()
            ))
        });
    }

    Ok(())
}

fn validate_pdf(data: &[u8]) -> Result<(), ValidationError> {
    if !data.starts_with(b"%PDF-") {
        return Err(ValidationError::MalformedDocument(
            "missing %PDF- header".to_string(),
        ));
    }
    let tail = &data[data.len().saturating_sub(PDF_TRAILER_WINDOW)..];
    if !contains(tail, b"%%EOF") {
        return Err(ValidationError::MalformedDocument(
            "missing %%EOF trailer, file looks truncated".to_string(),
        ));
    }
    Ok(())
}

fn validate_zip(data: &[u8]) -> Result<(), ValidationError> {
    let tail = &data[data.len().saturating_sub(ZIP_EOCD_WINDOW)..];
    if !contains(tail, b"PK\x05\x06") {
        return Err(ValidationError::MalformedDocument(
            "missing zip central directory, file looks truncated".to_string(),
        ));
    }
    Ok(())
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sniff::detect;

    fn check(data: &[u8], declared: Option<&str>) -> Result<(), ValidationError> {
        validate_document(data, declared, detect(data))
    }

    #[test]
    fn test_pdf_requires_trailer() {
        let good = b"%PDF-1.4\n1 0 obj\n<<>>\nendobj\ntrailer\n%%EOF\n";
        assert!(check(good, Some("application/pdf")).is_ok());

        let truncated = b"%PDF-1.4\n1 0 obj\n<<>>\n";
        assert!(matches!(
            check(truncated, Some("application/pdf")),
            Err(ValidationError::MalformedDocument(_))
        ));

        assert!(check(b"plain words", Some("application/pdf")).is_err());
    }

    #[test]
    fn test_text_must_be_utf8() {
        assert!(check("héllo".as_bytes(), Some("text/plain; charset=utf-8")).is_ok());
        assert!(check(&[0x68, 0x69, 0xFF, 0xFE], Some("text/csv")).is_err());
    }

    #[test]
    fn test_zip_requires_central_directory() {
        let mut data = b"PK\x03\x04".to_vec();
        data.extend_from_slice(&[0u8; 64]);
        assert!(check(&data, None).is_err());

        data.extend_from_slice(b"PK\x05\x06");
        data.extend_from_slice(&[0u8; 18]);
        assert!(check(&data, None).is_ok());
    }

    #[test]
    fn test_empty_and_opaque() {
        assert!(matches!(check(b"", None), Err(ValidationError::EmptyFile)));
        assert!(check(&[0x00, 0x01, 0x02], Some("application/octet-stream")).is_ok());
    }
}
