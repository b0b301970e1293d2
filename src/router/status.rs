//! Public server status.

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::AppState;

/// Structured status.
#[derive(Serialize)]
pub struct Status {
    name: String,
    version: String,
}

/// Public server status (configuration).
pub async fn status(State(state): State<AppState>) -> Json<Status> {
    Json(Status {
        name: state.config.name.clone(),
        version: state.config.version().to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use http_body_util::BodyExt;

    use crate::clock::FixedClock;
    use crate::*;

    #[tokio::test]
    async fn test_status_handler() {
        let state = test_state(&FixedClock::new(0));
        let response =
            make_request(app(state), Method::GET, "/status.json", None, String::default()).await;

        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["name"], "sigil");
        assert_eq!(value["version"], env!("CARGO_PKG_VERSION"));
    }
}
