//! Request authentication
//!
//! Extracts and validates the bearer token of a request.

use crate::auth::{decode_token, Role};
use crate::error::AppError;
use crate::state::SharedState;
use axum::{extract::FromRequestParts, http::request::Parts};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use uuid::Uuid;

/// Who is calling, as proven by their bearer token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub role: Role,
}

impl AuthContext {
    pub fn require(&self, required: Role) -> Result<(), AppError> {
        require_role(self.role, required)
    }
}

impl FromRequestParts<SharedState> for AuthContext {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AppError::Unauthorized("Missing authorization header".to_string()))?;

        let claims = decode_token(bearer.token(), &state.settings.auth.jwt_secret)?;

        Ok(AuthContext {
            user_id: claims.sub,
            role: claims.role,
        })
    }
}

/// Require a role at least as strong as `required`
pub fn require_role(role: Role, required: Role) -> Result<(), AppError> {
    let has_permission = match required {
        Role::Student => true,
        Role::Bookkeeper => role.can_inspect(),
        Role::Admin => role.can_migrate(),
    };

    if !has_permission {
        return Err(AppError::Forbidden(format!(
            "Requires {} role, you have {}",
            required, role
        )));
    }

    Ok(())
}
