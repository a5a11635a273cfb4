use async_trait::async_trait;
use sqlx::postgres::PgArguments;
use sqlx::query::QueryAs;
use sqlx::{PgPool, Postgres};
use tessera_core::models::{ProcessingStatus, UploadRecord, UploadRecordPatch};
use tessera_core::AppError;
use uuid::Uuid;

use super::metadata_store::{check_transition, MetadataStore};

const SELECT_COLUMNS: &str = r#"
    upload_id, upload_offset, upload_length, metadata, processing_status, file_type,
    category, "user", visibility, processed_variants, original_name, file,
    processing_error, created_at, updated_at, last_activity_at
"#;

/// PostgreSQL-backed [`MetadataStore`] over the `file_uploads` table
#[derive(Clone)]
pub struct FileUploadRepository {
    pool: PgPool,
}

impl FileUploadRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// `UPDATE ... RETURNING` for a patch, optionally guarded on the current status.
    ///
    /// `None` patch fields keep the stored value (`COALESCE`); the nullable text
    /// fields carry an explicit "set" flag so they can be cleared.
    fn update_sql(guarded: bool) -> String {
        format!(
            r#"
            UPDATE file_uploads SET
                upload_offset = COALESCE($2, upload_offset),
                upload_length = COALESCE($3, upload_length),
                processing_status = COALESCE($4, processing_status),
                processed_variants = COALESCE($5, processed_variants),
                file = COALESCE($6, file),
                processing_error = CASE WHEN $7 THEN $8 ELSE processing_error END,
                category = CASE WHEN $9 THEN $10 ELSE category END,
                visibility = COALESCE($11, visibility),
                original_name = CASE WHEN $12 THEN $13 ELSE original_name END,
                last_activity_at = COALESCE($14, last_activity_at),
                updated_at = NOW()
            WHERE upload_id = $1 {}
            RETURNING {}
            "#,
            if guarded {
                "AND processing_status = $15"
            } else {
                ""
            },
            SELECT_COLUMNS
        )
    }

    fn bind_patch<'q>(
        query: QueryAs<'q, Postgres, UploadRecord, PgArguments>,
        upload_id: &'q str,
        patch: &'q UploadRecordPatch,
    ) -> Result<QueryAs<'q, Postgres, UploadRecord, PgArguments>, AppError> {
        let variants = patch
            .processed_variants
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        Ok(query
            .bind(upload_id)
            .bind(patch.offset.map(to_i64))
            .bind(patch.total_size.map(to_i64))
            .bind(patch.processing_status.map(|s| s.as_str()))
            .bind(variants)
            .bind(patch.file.as_deref())
            .bind(patch.processing_error.is_some())
            .bind(patch.processing_error.clone().flatten())
            .bind(patch.category.is_some())
            .bind(patch.category.clone().flatten())
            .bind(patch.visibility.map(|v| v.as_str()))
            .bind(patch.original_name.is_some())
            .bind(patch.original_name.clone().flatten())
            .bind(patch.last_activity_at))
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl MetadataStore for FileUploadRepository {
    #[tracing::instrument(skip(self, record), fields(upload_id = %record.upload_id))]
    async fn create(&self, record: &UploadRecord) -> Result<(), AppError> {
        // Use dynamic SQLx queries to avoid requiring DATABASE_URL/sqlx prepare
        let result = sqlx::query(
            r#"
            INSERT INTO file_uploads (
                upload_id, upload_offset, upload_length, metadata, processing_status,
                file_type, category, "user", visibility, processed_variants,
                original_name, file, processing_error, created_at, updated_at, last_activity_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(&record.upload_id)
        .bind(to_i64(record.offset))
        .bind(record.total_size.map(to_i64))
        .bind(serde_json::to_value(&record.metadata)?)
        .bind(record.processing_status.as_str())
        .bind(record.file_type.as_str())
        .bind(&record.category)
        .bind(record.owner)
        .bind(record.visibility.as_str())
        .bind(serde_json::to_value(&record.processed_variants)?)
        .bind(&record.original_name)
        .bind(&record.file)
        .bind(&record.processing_error)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.last_activity_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(AppError::Conflict(
                format!("Upload {} already exists", record.upload_id),
            )),
            Err(e) => Err(e.into()),
        }
    }

    #[tracing::instrument(skip(self, patch))]
    async fn update(
        &self,
        upload_id: &str,
        patch: &UploadRecordPatch,
    ) -> Result<UploadRecord, AppError> {
        let sql = Self::update_sql(false);
        let query = Self::bind_patch(sqlx::query_as::<_, UploadRecord>(&sql), upload_id, patch)?;

        query
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Upload {} not found", upload_id)))
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, upload_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM file_uploads WHERE upload_id = $1")
            .bind(upload_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_by_id(&self, upload_id: &str) -> Result<Option<UploadRecord>, AppError> {
        let sql = format!(
            "SELECT {} FROM file_uploads WHERE upload_id = $1",
            SELECT_COLUMNS
        );
        let record = sqlx::query_as::<_, UploadRecord>(&sql)
            .bind(upload_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    #[tracing::instrument(skip(self, patch))]
    async fn transition_status(
        &self,
        upload_id: &str,
        from: ProcessingStatus,
        to: ProcessingStatus,
        patch: &UploadRecordPatch,
    ) -> Result<Option<UploadRecord>, AppError> {
        check_transition(from, to)?;

        let patch = UploadRecordPatch {
            processing_status: Some(to),
            ..patch.clone()
        };
        let sql = Self::update_sql(true);
        let query = Self::bind_patch(sqlx::query_as::<_, UploadRecord>(&sql), upload_id, &patch)?
            .bind(from.as_str());

        let record = query.fetch_optional(&self.pool).await?;
        if record.is_none() {
            tracing::debug!(upload_id, from = %from, to = %to, "Status guard did not match");
        }
        Ok(record)
    }

    async fn list_by_owner(&self, owner: Uuid) -> Result<Vec<UploadRecord>, AppError> {
        let sql = format!(
            r#"SELECT {} FROM file_uploads WHERE "user" = $1 ORDER BY created_at DESC"#,
            SELECT_COLUMNS
        );
        let records = sqlx::query_as::<_, UploadRecord>(&sql)
            .bind(owner)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    async fn list_unfinished(&self) -> Result<Vec<UploadRecord>, AppError> {
        let sql = format!(
            r#"
            SELECT {} FROM file_uploads
            WHERE processing_status IN ('pending', 'processing')
            ORDER BY created_at
            "#,
            SELECT_COLUMNS
        );
        let records = sqlx::query_as::<_, UploadRecord>(&sql)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    async fn ping(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
