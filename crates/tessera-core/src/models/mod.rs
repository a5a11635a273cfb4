//! Data models for the `file_uploads` record and its protocol metadata.

mod upload;

pub use upload::{
    FileType, ProcessingStatus, UpdateUploadRequest, UploadMetadata, UploadRecord,
    UploadRecordPatch, UploadRecordResponse, Visibility,
};
