//! Get a new token pair with a refresh token.

use axum::Json;
use axum::extract::State;
use serde::Deserialize;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::TokenError;
use crate::resolver::extract_bearer;
use crate::token::TokenPair;
use crate::{AppState, AuthError};

#[derive(Debug, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Body {
    refresh_token: String,
}

pub async fn refresh(
    State(state): State<AppState>,
    Json(body): Json<Body>,
) -> Result<Json<TokenPair>, AuthError> {
    let token = extract_bearer(&body.refresh_token).ok_or(TokenError::Malformed)?;
    Ok(Json(state.auth.refresh(token).await?))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use http_body_util::BodyExt;
    use serde_json::json;

    use crate::claims::Role;
    use crate::clock::FixedClock;
    use crate::token::tests::NOW;
    use crate::*;

    #[tokio::test]
    async fn test_refresh_handler() {
        let clock = FixedClock::new(NOW);
        let state = test_state(&clock);
        let pair = state.auth.login_account("u1", Role::User).await.unwrap();

        let body = json!({ "refresh_token": pair.refresh_token }).to_string();
        let response =
            make_request(app(state.clone()), Method::POST, "/token/refresh", None, body.clone()).await;
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let next: token::TokenPair = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(next.token_type, "Bearer");
        assert_eq!(next.expires_in, 15 * 60);
        assert!(state.auth.authenticate(&next.access_token).await.is_ok());

        // Replaying the rotated token.
        let response = make_request(app(state), Method::POST, "/token/refresh", None, body).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_refresh_handler_with_bearer_prefix() {
        let state = test_state(&FixedClock::new(NOW));
        let pair = state.auth.login_account("u1", Role::User).await.unwrap();

        let body = json!({ "refresh_token": format!("Bearer {}", pair.refresh_token) }).to_string();
        let response = make_request(app(state), Method::POST, "/token/refresh", None, body).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_refresh_handler_with_garbage() {
        let state = test_state(&FixedClock::new(NOW));
        let body = json!({ "refresh_token": "not.a.token" }).to_string();

        let response = make_request(app(state), Method::POST, "/token/refresh", None, body).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
