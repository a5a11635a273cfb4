use std::collections::{BTreeMap, HashSet};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::error::AppError;

/// Storage class of an upload; selects the processing rules applied after finalize.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Avatar,
    Document,
    #[default]
    Media,
    Temp,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Avatar => "avatar",
            FileType::Document => "document",
            FileType::Media => "media",
            FileType::Temp => "temp",
        }
    }
}

impl Display for FileType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "avatar" => Ok(FileType::Avatar),
            "document" => Ok(FileType::Document),
            "media" => Ok(FileType::Media),
            "temp" => Ok(FileType::Temp),
            _ => Err(AppError::InvalidRequest(format!(
                "Invalid file_type '{}', expected avatar, document, media or temp",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    #[default]
    Private,
    Shared,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
            Visibility::Shared => "shared",
        }
    }
}

impl Display for Visibility {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for Visibility {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Visibility::Public),
            "private" => Ok(Visibility::Private),
            "shared" => Ok(Visibility::Shared),
            _ => Err(AppError::InvalidRequest(format!(
                "Invalid visibility '{}', expected public, private or shared",
                s
            ))),
        }
    }
}

/// Post-upload processing state.
///
/// Advances `pending -> processing -> {completed, failed}`; `failed -> pending`
/// is the only way back and is reserved for an explicit retry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, next: ProcessingStatus) -> bool {
        use ProcessingStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Failed, Pending)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingStatus::Completed | ProcessingStatus::Failed)
    }
}

impl Display for ProcessingStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProcessingStatus::Pending),
            "processing" => Ok(ProcessingStatus::Processing),
            "completed" => Ok(ProcessingStatus::Completed),
            "failed" => Ok(ProcessingStatus::Failed),
            _ => Err(AppError::InvalidRequest(format!(
                "Invalid processing status '{}'",
                s
            ))),
        }
    }
}

/// Typed `Upload-Metadata`.
///
/// Only the keys below are accepted. `name` and `type` are accepted as aliases
/// of `filename` and `filetype` and are normalized on parse.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema, Validate)]
#[serde(deny_unknown_fields)]
pub struct UploadMetadata {
    /// Client-supplied file name
    #[serde(skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 1, max = 255, message = "filename must be 1-255 characters"))]
    pub filename: Option<String>,
    /// Declared MIME type, e.g. `image/png`
    #[serde(skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 255, message = "filetype must be at most 255 characters"))]
    pub filetype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_type: Option<FileType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 100, message = "category must be at most 100 characters"))]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,
    #[serde(rename = "relativePath", skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 1024, message = "relativePath must be at most 1024 characters"))]
    pub relative_path: Option<String>,
}

impl UploadMetadata {
    /// Parse an `Upload-Metadata` header: comma-separated `key base64value` pairs.
    pub fn from_header(header: &str) -> Result<Self, AppError> {
        let mut metadata = UploadMetadata::default();
        let header = header.trim();
        if header.is_empty() {
            return Ok(metadata);
        }

        let mut seen = HashSet::new();
        for pair in header.split(',') {
            let pair = pair.trim();
            let mut parts = pair.splitn(2, ' ');
            let key = parts.next().unwrap_or_default();
            if key.is_empty() {
                return Err(AppError::InvalidRequest(
                    "Upload-Metadata contains an empty key".to_string(),
                ));
            }
            if !seen.insert(canonical_key(key)) {
                return Err(AppError::InvalidRequest(format!(
                    "Upload-Metadata key '{}' given more than once",
                    key
                )));
            }

            let encoded = parts.next().map(str::trim).unwrap_or_default();
            let decoded = STANDARD.decode(encoded).map_err(|_| {
                AppError::InvalidRequest(format!(
                    "Upload-Metadata value for '{}' is not valid base64",
                    key
                ))
            })?;
            let value = String::from_utf8(decoded).map_err(|_| {
                AppError::InvalidRequest(format!(
                    "Upload-Metadata value for '{}' is not valid UTF-8",
                    key
                ))
            })?;
            if value.is_empty() {
                continue;
            }

            match key {
                "filename" | "name" => metadata.filename = Some(value),
                "filetype" | "type" => metadata.filetype = Some(parse_mime(&value)?),
                "file_type" => metadata.file_type = Some(value.parse()?),
                "category" => metadata.category = Some(value),
                "visibility" => metadata.visibility = Some(value.parse()?),
                "relativePath" => metadata.relative_path = Some(value),
                other => {
                    return Err(AppError::InvalidRequest(format!(
                        "Unrecognized Upload-Metadata key '{}'",
                        other
                    )))
                }
            }
        }

        metadata.validate()?;
        Ok(metadata)
    }

    /// Re-encode for the `Upload-Metadata` response header.
    pub fn to_header(&self) -> String {
        let mut pairs = Vec::new();
        let mut push = |key: &str, value: Option<&str>| {
            if let Some(value) = value {
                pairs.push(format!("{} {}", key, STANDARD.encode(value)));
            }
        };
        push("filename", self.filename.as_deref());
        push("filetype", self.filetype.as_deref());
        push("file_type", self.file_type.map(|t| t.as_str()));
        push("category", self.category.as_deref());
        push("visibility", self.visibility.map(|v| v.as_str()));
        push("relativePath", self.relative_path.as_deref());
        pairs.join(",")
    }

    /// Lowercased extension of `filename`, if it is short and alphanumeric.
    pub fn extension(&self) -> Option<String> {
        let name = self.filename.as_deref()?;
        let (stem, ext) = name.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() || ext.len() > 10 {
            return None;
        }
        ext.chars()
            .all(|c| c.is_ascii_alphanumeric())
            .then(|| ext.to_ascii_lowercase())
    }
}

fn canonical_key(key: &str) -> &str {
    match key {
        "name" => "filename",
        "type" => "filetype",
        other => other,
    }
}

fn parse_mime(value: &str) -> Result<String, AppError> {
    let mime = value.trim().to_ascii_lowercase();
    match mime.split_once('/') {
        Some((kind, sub)) if !kind.is_empty() && !sub.is_empty() && !mime.contains(' ') => {
            Ok(mime)
        }
        _ => Err(AppError::InvalidRequest(format!(
            "filetype '{}' is not a MIME type",
            value
        ))),
    }
}

/// One `file_uploads` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub upload_id: String,
    /// Bytes durably received
    pub offset: u64,
    /// Declared length; `None` while the length is deferred
    pub total_size: Option<u64>,
    pub metadata: UploadMetadata,
    pub file_type: FileType,
    pub category: Option<String>,
    pub owner: Uuid,
    pub visibility: Visibility,
    pub processing_status: ProcessingStatus,
    /// Variant name (e.g. `100x100`) to storage key
    pub processed_variants: BTreeMap<String, String>,
    pub original_name: Option<String>,
    /// Permanent storage key, set on finalize
    pub file: Option<String>,
    pub processing_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl UploadRecord {
    pub fn new(
        upload_id: String,
        owner: Uuid,
        total_size: Option<u64>,
        metadata: UploadMetadata,
        file_type: FileType,
        visibility: Visibility,
    ) -> Self {
        let now = Utc::now();
        Self {
            upload_id,
            offset: 0,
            total_size,
            file_type,
            category: metadata.category.clone(),
            owner,
            visibility,
            processing_status: ProcessingStatus::Pending,
            processed_variants: BTreeMap::new(),
            original_name: metadata.filename.clone(),
            file: None,
            processing_error: None,
            metadata,
            created_at: now,
            updated_at: now,
            last_activity_at: now,
        }
    }

    /// All declared bytes have been received.
    pub fn is_upload_complete(&self) -> bool {
        self.total_size == Some(self.offset)
    }

    /// Payload has been promoted to permanent storage.
    pub fn is_finalized(&self) -> bool {
        self.file.is_some()
    }

    pub fn remaining(&self) -> Option<u64> {
        self.total_size.map(|total| total.saturating_sub(self.offset))
    }

    pub fn is_owned_by(&self, principal: Uuid) -> bool {
        self.owner == principal
    }

    pub fn is_visible_to(&self, principal: Uuid) -> bool {
        self.is_owned_by(principal) || self.visibility == Visibility::Public
    }

    /// Declared MIME type, if any
    pub fn declared_mime(&self) -> Option<&str> {
        self.metadata.filetype.as_deref()
    }
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for UploadRecord {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        fn decode<T: FromStr<Err = AppError>>(value: String, column: &str) -> Result<T, sqlx::Error> {
            value.parse().map_err(|e: AppError| {
                sqlx::Error::Decode(format!("Failed to parse {}: {}", column, e).into())
            })
        }

        let metadata: serde_json::Value = row.try_get("metadata")?;
        let variants: serde_json::Value = row.try_get("processed_variants")?;

        Ok(UploadRecord {
            upload_id: row.try_get("upload_id")?,
            offset: row.try_get::<i64, _>("upload_offset")?.max(0) as u64,
            total_size: row
                .try_get::<Option<i64>, _>("upload_length")?
                .map(|len| len.max(0) as u64),
            metadata: serde_json::from_value(metadata).map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse metadata: {}", e).into())
            })?,
            file_type: decode(row.try_get("file_type")?, "file_type")?,
            category: row.try_get("category")?,
            owner: row.try_get("user")?,
            visibility: decode(row.try_get("visibility")?, "visibility")?,
            processing_status: decode(row.try_get("processing_status")?, "processing_status")?,
            processed_variants: serde_json::from_value(variants).map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse processed_variants: {}", e).into())
            })?,
            original_name: row.try_get("original_name")?,
            file: row.try_get("file")?,
            processing_error: row.try_get("processing_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            last_activity_at: row.try_get("last_activity_at")?,
        })
    }
}

/// Partial update of an [`UploadRecord`]. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadRecordPatch {
    pub offset: Option<u64>,
    pub total_size: Option<u64>,
    pub processing_status: Option<ProcessingStatus>,
    pub processed_variants: Option<BTreeMap<String, String>>,
    pub file: Option<String>,
    pub processing_error: Option<Option<String>>,
    pub category: Option<Option<String>>,
    pub visibility: Option<Visibility>,
    pub original_name: Option<Option<String>>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl UploadRecordPatch {
    /// Offset advance after an acknowledged append.
    pub fn progress(offset: u64, at: DateTime<Utc>) -> Self {
        Self {
            offset: Some(offset),
            last_activity_at: Some(at),
            ..Default::default()
        }
    }

    pub fn status(status: ProcessingStatus) -> Self {
        Self {
            processing_status: Some(status),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(&self, record: &mut UploadRecord) {
        if let Some(offset) = self.offset {
            record.offset = offset;
        }
        if let Some(total_size) = self.total_size {
            record.total_size = Some(total_size);
        }
        if let Some(status) = self.processing_status {
            record.processing_status = status;
        }
        if let Some(variants) = &self.processed_variants {
            record.processed_variants = variants.clone();
        }
        if let Some(file) = &self.file {
            record.file = Some(file.clone());
        }
        if let Some(error) = &self.processing_error {
            record.processing_error = error.clone();
        }
        if let Some(category) = &self.category {
            record.category = category.clone();
        }
        if let Some(visibility) = self.visibility {
            record.visibility = visibility;
        }
        if let Some(name) = &self.original_name {
            record.original_name = name.clone();
        }
        if let Some(at) = self.last_activity_at {
            record.last_activity_at = at;
        }
        record.updated_at = Utc::now();
    }
}

/// Editable record fields exposed on the records API
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct UpdateUploadRequest {
    #[validate(length(max = 100, message = "Category must be at most 100 characters"))]
    pub category: Option<String>,
    pub visibility: Option<Visibility>,
    #[validate(length(
        min = 1,
        max = 255,
        message = "Original name must be between 1 and 255 characters"
    ))]
    pub original_name: Option<String>,
}

impl UpdateUploadRequest {
    pub fn into_patch(self) -> UploadRecordPatch {
        UploadRecordPatch {
            category: self.category.map(|c| Some(c).filter(|c| !c.is_empty())),
            visibility: self.visibility,
            original_name: self.original_name.map(Some),
            ..Default::default()
        }
    }
}

/// Response body for a record on the records API
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct UploadRecordResponse {
    pub upload_id: String,
    pub offset: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u64>,
    pub metadata: UploadMetadata,
    pub file_type: FileType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub user: Uuid,
    pub visibility: Visibility,
    pub processing_status: ProcessingStatus,
    pub processed_variants: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<UploadRecord> for UploadRecordResponse {
    fn from(record: UploadRecord) -> Self {
        Self {
            upload_id: record.upload_id,
            offset: record.offset,
            total_size: record.total_size,
            metadata: record.metadata,
            file_type: record.file_type,
            category: record.category,
            user: record.owner,
            visibility: record.visibility,
            processing_status: record.processing_status,
            processed_variants: record.processed_variants,
            original_name: record.original_name,
            file: record.file,
            processing_error: record.processing_error,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}
