//! Session of the caller.

use axum::http::StatusCode;
use axum::extract::State;
use axum::{Extension, Json};
use serde::Serialize;

use crate::claims::{Identity, Principal, Role};
use crate::{AppState, AuthError};

#[derive(Debug, Serialize)]
pub struct WhoAmI {
    #[serde(flatten)]
    principal: Principal,
    role: Role,
    expires_at: i64,
}

pub async fn whoami(Extension(identity): Extension<Identity>) -> Json<WhoAmI> {
    Json(WhoAmI {
        principal: identity.principal(),
        role: identity.role(),
        expires_at: identity.expires_at(),
    })
}

/// Revoke the refresh tokens of the current session.
pub async fn logout(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<StatusCode, AuthError> {
    state.auth.logout(&identity).await?;
    Ok(StatusCode::NO_CONTENT)
}
