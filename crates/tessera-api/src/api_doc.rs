//! OpenAPI documentation, served at `/api/openapi.json`.

use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::error;
use crate::handlers;
use tessera_core::models;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Tessera API",
        version = "0.1.0",
        description = "Resumable uploads over the tus 1.0.0 protocol, with post-upload processing and a JSON records API."
    ),
    paths(
        handlers::tus::options_upload,
        handlers::tus::create_upload,
        handlers::tus::head_upload,
        handlers::tus::patch_upload,
        handlers::tus::delete_upload,
        handlers::uploads::list_uploads,
        handlers::uploads::get_upload,
        handlers::uploads::update_upload,
        handlers::uploads::delete_upload_record,
        handlers::uploads::retry_processing,
        handlers::health::liveness,
        handlers::health::readiness,
    ),
    components(schemas(
        error::ErrorResponse,
        models::UploadRecordResponse,
        models::UpdateUploadRequest,
        models::UploadMetadata,
        models::FileType,
        models::Visibility,
        models::ProcessingStatus,
        handlers::health::ReadinessResponse,
    )),
    modifiers(&BearerAuth),
    tags(
        (name = "tus", description = "Resumable upload protocol"),
        (name = "uploads", description = "Upload records and processing"),
        (name = "health", description = "Probes")
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_lists_protocol_and_records_paths() {
        let spec = ApiDoc::openapi();
        assert!(spec.paths.paths.contains_key("/tus"));
        assert!(spec.paths.paths.contains_key("/tus/{upload_id}"));
        assert!(spec.paths.paths.contains_key("/api/v0/uploads/{upload_id}/retry"));
        assert!(spec
            .components
            .unwrap()
            .security_schemes
            .contains_key("bearer_auth"));
    }
}
