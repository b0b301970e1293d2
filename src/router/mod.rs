//! HTTP API over the token subsystem.
mod session;
pub mod status;
pub mod token;

use axum::extract::{Request, State};
use axum::http::header;
use axum::response::Response;
use axum::routing::{delete, get};
use axum::{Router, middleware};

use crate::{AppState, AuthError};

/// Custom middleware for authentification.
///
/// Inserts the verified [`crate::claims::Identity`] into request extensions.
async fn auth(
    State(state): State<AppState>,
    mut req: Request,
    next: middleware::Next,
) -> Result<Response, AuthError> {
    let identity = state
        .auth
        .authenticate_header(
            req.headers()
                .get(header::AUTHORIZATION)
                .and_then(|header| header.to_str().ok()),
        )
        .await?;

    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

/// Routes requiring a valid access token.
pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        // `GET /whoami` goes to `whoami`.
        .route("/whoami", get(session::whoami))
        // `DELETE /sessions/@me` goes to `logout`.
        .route("/sessions/@me", delete(session::logout))
        .route_layer(middleware::from_fn_with_state(state, auth))
}
