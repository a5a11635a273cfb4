//! One processing attempt for a finalized upload

use std::collections::BTreeMap;

use tessera_core::models::UploadRecord;
use tessera_core::{AppError, TaskError, TaskResultExt};
use tessera_processing::{processor_for, ProcessingInput, Variant};
use tessera_storage::keys;

use crate::context::ProcessingContext;

/// Read the payload, derive variants and write them to storage.
///
/// Returns the `processed_variants` map (variant name to storage key). Nothing
/// is written to the record here; the caller commits the map together with the
/// status transition.
#[tracing::instrument(skip(ctx, record), fields(upload_id = %record.upload_id, file_type = %record.file_type))]
pub async fn run_attempt(
    ctx: &ProcessingContext,
    record: &UploadRecord,
) -> Result<BTreeMap<String, String>, TaskError> {
    let file_key = record.file.clone().ok_or_else(|| {
        TaskError::unrecoverable(anyhow::anyhow!(
            "Upload {} has no stored file",
            record.upload_id
        ))
    })?;

    let data = ctx
        .storage
        .get(&file_key)
        .await
        .map_err(AppError::from)?;

    let variants = derive_variants(ctx, record, data).await?;

    let mut stored = BTreeMap::new();
    for variant in variants {
        let key = keys::variant_key(&record.upload_id, &variant.name);
        ctx.storage
            .put(&key, variant.data)
            .await
            .map_err(AppError::from)?;
        tracing::debug!(variant = %variant.name, key = %key, "Variant stored");
        stored.insert(variant.name, key);
    }

    Ok(stored)
}

/// Run the file type's processor on a blocking thread.
async fn derive_variants(
    ctx: &ProcessingContext,
    record: &UploadRecord,
    data: Vec<u8>,
) -> Result<Vec<Variant>, TaskError> {
    let upload_id = record.upload_id.clone();
    let file_type = record.file_type;
    let declared = record.declared_mime().map(str::to_string);
    let filename = record.metadata.filename.clone();
    let sizes = ctx.thumbnail_sizes.clone();

    tokio::task::spawn_blocking(move || {
        let input = ProcessingInput {
            upload_id: &upload_id,
            data: &data,
            declared_mime: declared.as_deref(),
            filename: filename.as_deref(),
            thumbnail_sizes: &sizes,
        };
        processor_for(file_type).process(&input)
    })
    .await
    .recoverable()?
    .unrecoverable()
}
