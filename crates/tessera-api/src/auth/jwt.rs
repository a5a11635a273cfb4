//! HS256 bearer token verification

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use tessera_core::AppError;

use crate::auth::models::{AuthUser, JwtClaims};

pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 30;
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Validate signature and expiry and return the principal.
    pub fn verify(&self, token: &str) -> Result<AuthUser, AppError> {
        let data = decode::<JwtClaims>(token, &self.key, &self.validation).map_err(|e| {
            tracing::debug!(error = %e, "JWT validation failed");
            AppError::Unauthorized("Invalid or expired token".to_string())
        })?;
        Ok(AuthUser {
            user_id: data.claims.sub,
        })
    }
}
