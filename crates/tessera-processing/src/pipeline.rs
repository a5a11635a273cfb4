//! Per-file-type processing rules applied to finalized uploads

use tessera_core::models::FileType;
use tessera_core::ThumbnailSize;

use crate::document::validate_document;
use crate::sniff::detect;
use crate::thumbnail::thumbnails;
use crate::validator::{validate_declared_type, ValidationError};

/// A finalized upload as seen by a processor.
pub struct ProcessingInput<'a> {
    pub upload_id: &'a str,
    pub data: &'a [u8],
    pub declared_mime: Option<&'a str>,
    pub filename: Option<&'a str>,
    pub thumbnail_sizes: &'a [ThumbnailSize],
}

/// A derived artifact, keyed by `name` in `processed_variants`.
#[derive(Debug, Clone)]
pub struct Variant {
    pub name: String,
    pub data: Vec<u8>,
}

/// CPU-bound, synchronous processing for one file type.
///
/// Implementations are pure functions of their input, so every error they
/// return is final for that payload.
pub trait ContentProcessor: Send + Sync {
    fn file_type(&self) -> FileType;

    fn process(&self, input: &ProcessingInput<'_>) -> Result<Vec<Variant>, ValidationError>;
}

pub struct AvatarProcessor;

impl ContentProcessor for AvatarProcessor {
    fn file_type(&self) -> FileType {
        FileType::Avatar
    }

    fn process(&self, input: &ProcessingInput<'_>) -> Result<Vec<Variant>, ValidationError> {
        if input.data.is_empty() {
            return Err(ValidationError::EmptyFile);
        }
        let detected = detect(input.data);
        if !detected.is_image() {
            return Err(ValidationError::NotAnImage {
                file_type: self.file_type().to_string(),
                detected: detected.mime().to_string(),
            });
        }
        validate_declared_type(input.filename, input.declared_mime, detected)?;
        thumbnails(input.data, input.thumbnail_sizes)
    }
}

pub struct MediaProcessor;

impl ContentProcessor for MediaProcessor {
    fn file_type(&self) -> FileType {
        FileType::Media
    }

    fn process(&self, input: &ProcessingInput<'_>) -> Result<Vec<Variant>, ValidationError> {
        if input.data.is_empty() {
            return Err(ValidationError::EmptyFile);
        }
        let detected = detect(input.data);
        validate_declared_type(input.filename, input.declared_mime, detected)?;

        if detected.is_image() {
            thumbnails(input.data, input.thumbnail_sizes)
        } else {
            tracing::debug!(
                upload_id = %input.upload_id,
                detected = %detected.mime(),
                "Non-image media, no variants"
            );
            Ok(Vec::new())
        }
    }
}

pub struct DocumentProcessor;

impl ContentProcessor for DocumentProcessor {
    fn file_type(&self) -> FileType {
        FileType::Document
    }

    fn process(&self, input: &ProcessingInput<'_>) -> Result<Vec<Variant>, ValidationError> {
        let detected = detect(input.data);
        if !input.data.is_empty() {
            validate_declared_type(input.filename, input.declared_mime, detected)?;
        }
        validate_document(input.data, input.declared_mime, detected)?;
        Ok(Vec::new())
    }
}

/// Temporary files are stored as-is.
pub struct TempProcessor;

impl ContentProcessor for TempProcessor {
    fn file_type(&self) -> FileType {
        FileType::Temp
    }

    fn process(&self, _input: &ProcessingInput<'_>) -> Result<Vec<Variant>, ValidationError> {
        Ok(Vec::new())
    }
}

static AVATAR: AvatarProcessor = AvatarProcessor;
static MEDIA: MediaProcessor = MediaProcessor;
static DOCUMENT: DocumentProcessor = DocumentProcessor;
static TEMP: TempProcessor = TempProcessor;

pub fn processor_for(file_type: FileType) -> &'static dyn ContentProcessor {
    match file_type {
        FileType::Avatar => &AVATAR,
        FileType::Media => &MEDIA,
        FileType::Document => &DOCUMENT,
        FileType::Temp => &TEMP,
    }
}
