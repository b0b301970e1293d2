//! Sigil issues and validates signed tokens for accounts and the
//! third-party services registered against them.

#![forbid(unsafe_code)]
pub mod auth;
pub mod claims;
pub mod clock;
pub mod config;
pub mod database;
pub mod error;
pub mod memory;
pub mod resolver;
mod router;
pub mod store;
pub mod telemetry;
pub mod token;
pub mod vault;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
#[cfg(test)]
use axum::http::Method;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Router, middleware as AxumMiddleware};
pub use error::AuthError;
use metrics_exporter_prometheus::PrometheusHandle;
use tower::ServiceBuilder;
use tower_http::LatencyUnit;
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};

use crate::auth::Authenticator;
use crate::clock::SystemClock;
use crate::config::{CONFIG_PATH_ENV, Configuration, Secrets};
use crate::store::{PrincipalStore, RefreshStore};
use crate::token::TokenService;
use crate::vault::SecretVault;

/// MUST NEVER be used in production.
#[cfg(test)]
pub async fn make_request(
    app: Router,
    method: Method,
    path: &str,
    token: Option<&str>,
    body: String,
) -> axum::http::Response<axum::body::Body> {
    use axum::extract::Request;
    use tower::util::ServiceExt;

    let mut request = Request::builder()
        .method(method)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }

    app.oneshot(request.body(axum::body::Body::from(body)).unwrap())
        .await
        .unwrap()
}

/// State backed by memory and a fixed clock.
#[cfg(test)]
pub fn test_state(clock: &clock::FixedClock) -> AppState {
    AppState {
        config: Arc::new(Configuration::default()),
        auth: Arc::new(auth::tests::authenticator(clock)),
        metrics: None,
    }
}

/// State sharing between routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Configuration>,
    pub auth: Arc<Authenticator>,
    pub metrics: Option<PrometheusHandle>,
}

/// Render Prometheus metrics, if a recorder is installed.
async fn render_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, String::new()),
    }
}

/// Create router.
pub fn app(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        // Add high level tracing/logging to all requests.
        .layer(
            TraceLayer::new_for_http()
                .on_body_chunk(|chunk: &Bytes, latency: Duration, _span: &tracing::Span| {
                    tracing::trace!(size_bytes = chunk.len(), latency = ?latency, "sending body chunk")
                })
                .make_span_with(DefaultMakeSpan::new().include_headers(true).level(tracing::Level::INFO))
                .on_request(DefaultOnRequest::new())
                .on_response(DefaultOnResponse::new().include_headers(true).latency_unit(LatencyUnit::Micros)),
        )
        // Set a timeout.
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, Duration::from_secs(10)))
        // Remove sensitive headers from trace.
        .layer(SetSensitiveHeadersLayer::new([header::AUTHORIZATION, header::COOKIE]));

    Router::new()
        // `GET /status.json` goes to `status`.
        .route("/status.json", get(router::status::status))
        // `GET /metrics` goes to `render_metrics`.
        .route("/metrics", get(render_metrics))
        // `POST /token/refresh` goes to `refresh`.
        .route("/token/refresh", post(router::token::refresh))
        .merge(router::router(state.clone()))
        .with_state(state)
        .route_layer(AxumMiddleware::from_fn(telemetry::track))
        .layer(middleware)
}

/// Initialize the application state.
pub async fn initialize_state(
    metrics: Option<PrometheusHandle>,
) -> Result<AppState, Box<dyn std::error::Error>> {
    // read configuration file. let it in memory.
    let path = std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_default();
    let config = Configuration::default().path(path).read()?;

    // refuse to start with missing or shared secrets.
    let secrets = Secrets::from_env()?;

    let (principals, refresh): (Arc<dyn PrincipalStore>, Arc<dyn RefreshStore>) =
        match config.postgres {
            Some(ref config) => {
                let db = Arc::new(
                    database::Database::new(
                        &config.address,
                        config
                            .username
                            .as_deref()
                            .unwrap_or(database::DEFAULT_CREDENTIALS),
                        config
                            .password
                            .as_deref()
                            .unwrap_or(database::DEFAULT_CREDENTIALS),
                        config
                            .database
                            .as_deref()
                            .unwrap_or(database::DEFAULT_DATABASE_NAME),
                        config.pool_size.unwrap_or(database::DEFAULT_POOL_SIZE),
                    )
                    .await?,
                );

                // execute migrations scripts on start.
                db.migrate().await?;
                (db.clone() as Arc<dyn PrincipalStore>, db as Arc<dyn RefreshStore>)
            },
            None => {
                tracing::warn!("missing `postgres` entry on `config.yaml` file, sessions are kept in memory");
                let store = Arc::new(memory::MemoryStore::new());
                (store.clone() as Arc<dyn PrincipalStore>, store as Arc<dyn RefreshStore>)
            },
        };

    let tokens = Arc::new(TokenService::new(
        &secrets,
        config.token,
        Arc::new(SystemClock),
    ));
    let vault = Arc::new(SecretVault::from_passphrase(secrets.vault.as_bytes()));
    let auth = Arc::new(Authenticator::new(tokens, vault, principals, refresh));

    Ok(AppState {
        config,
        auth,
        metrics,
    })
}
