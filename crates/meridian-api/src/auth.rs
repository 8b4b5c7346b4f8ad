//! Operator authentication.
//!
//! Tokens are issued by the deployment's auth service; this crate only
//! validates them. Claims carry the owner/admin flags and role masks, and
//! effective permissions are computed per request.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::header;
use axum::http::request::Parts;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use meridian_common::error::MeridianError;
use meridian_common::permissions::{compute_permissions, Permissions, RoleMask};

use crate::AppState;

/// JWT claims of an operator access token.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,
    /// Expiration (Unix timestamp)
    pub exp: i64,
    #[serde(default)]
    pub is_owner: bool,
    #[serde(default)]
    pub is_admin: bool,
    /// Guild default permission bits.
    #[serde(default)]
    pub default_mask: i64,
    #[serde(default)]
    pub roles: Vec<RoleMask>,
}

impl Claims {
    pub fn permissions(&self) -> Permissions {
        compute_permissions(
            self.is_owner,
            self.is_admin,
            Permissions::from_bits_truncate(self.default_mask),
            &self.roles,
        )
    }
}

/// Validate and decode a JWT token.
pub fn validate_token(token: &str, secret: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;
    Ok(token_data.claims)
}

/// An authenticated operator, extracted from `Authorization: Bearer <token>`.
#[derive(Debug, Clone)]
pub struct Operator {
    pub user_id: Uuid,
    pub permissions: Permissions,
}

impl Operator {
    pub fn require(&self, permission: Permissions) -> Result<(), MeridianError> {
        if self.permissions.has(permission) {
            Ok(())
        } else {
            Err(MeridianError::MissingPermission { permission: format!("{permission:?}") })
        }
    }

    /// Passes when the operator holds at least one of `any`.
    pub fn require_any(&self, any: Permissions) -> Result<(), MeridianError> {
        if self.permissions.is_admin() || self.permissions.intersects(any) {
            Ok(())
        } else {
            Err(MeridianError::MissingPermission { permission: format!("{any:?}") })
        }
    }
}

impl FromRequestParts<Arc<AppState>> for Operator {
    type Rejection = MeridianError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(MeridianError::Unauthorized)?;

        let claims = validate_token(token, &state.jwt_secret).map_err(|_| MeridianError::InvalidToken)?;
        let user_id = claims.sub.parse::<Uuid>().map_err(|_| MeridianError::InvalidToken)?;

        Ok(Operator { user_id, permissions: claims.permissions() })
    }
}
