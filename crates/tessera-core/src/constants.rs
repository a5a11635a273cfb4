//! Protocol constants shared by the HTTP layer and the upload services.

/// Protocol version spoken and required on every request.
pub const TUS_VERSION: &str = "1.0.0";

/// Extensions advertised in `Tus-Extension`.
pub const TUS_EXTENSIONS: &[&str] = &[
    "creation",
    "creation-defer-length",
    "termination",
    "expiration",
];

/// Content type required on PATCH requests.
pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

pub const HEADER_TUS_RESUMABLE: &str = "tus-resumable";
pub const HEADER_TUS_VERSION: &str = "tus-version";
pub const HEADER_TUS_EXTENSION: &str = "tus-extension";
pub const HEADER_TUS_MAX_SIZE: &str = "tus-max-size";
pub const HEADER_UPLOAD_OFFSET: &str = "upload-offset";
pub const HEADER_UPLOAD_LENGTH: &str = "upload-length";
pub const HEADER_UPLOAD_DEFER_LENGTH: &str = "upload-defer-length";
pub const HEADER_UPLOAD_METADATA: &str = "upload-metadata";
pub const HEADER_UPLOAD_EXPIRES: &str = "upload-expires";

/// Path prefix of the protocol routes; `Location` headers are built from it.
pub const TUS_BASE_PATH: &str = "/tus";

/// Bytes of randomness in a generated upload id (32 base64url characters).
pub const UPLOAD_ID_BYTES: usize = 24;
