//! Shared key generation for storage backends.

use uuid::Uuid;

/// Upload ids are URL-safe base64 without padding.
pub fn is_valid_upload_id(upload_id: &str) -> bool {
    !upload_id.is_empty()
        && upload_id.len() <= 128
        && upload_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Permanent key of a finished upload: `uploads/{owner}/{upload_id}[.{ext}]`.
///
/// Deterministic so that a finalize retried after a crash lands on the same key.
pub fn upload_key(owner: Uuid, upload_id: &str, extension: Option<&str>) -> String {
    match extension {
        Some(ext) => format!("uploads/{}/{}.{}", owner, upload_id, ext),
        None => format!("uploads/{}/{}", owner, upload_id),
    }
}

/// Key of a derived variant: `thumbs/{upload_id}/{variant}.png`.
pub fn variant_key(upload_id: &str, variant: &str) -> String {
    format!("thumbs/{}/{}.png", upload_id, variant)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_id_validation() {
        assert!(is_valid_upload_id("aB3_-x"));
        assert!(!is_valid_upload_id(""));
        assert!(!is_valid_upload_id("../etc"));
        assert!(!is_valid_upload_id("a/b"));
        assert!(!is_valid_upload_id("a+b="));
    }

    #[test]
    fn test_key_layout() {
        let owner = Uuid::nil();
        assert_eq!(
            upload_key(owner, "abc", Some("png")),
            "uploads/00000000-0000-0000-0000-000000000000/abc.png"
        );
        assert_eq!(
            upload_key(owner, "abc", None),
            "uploads/00000000-0000-0000-0000-000000000000/abc"
        );
        assert_eq!(variant_key("abc", "100x100"), "thumbs/abc/100x100.png");
    }
}
