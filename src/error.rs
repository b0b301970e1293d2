//! Error handler for sigil.

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, AuthError>;

const UNAUTHORIZED_TITLE: &str = "Invalid or expired token.";

/// Reasons a token is refused. Never exposed to clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("token is malformed")]
    Malformed,
    #[error("token signature is invalid")]
    SignatureInvalid,
    #[error("token belongs to another principal kind")]
    WrongKind,
    #[error("token claims are invalid")]
    InvalidClaims,
    #[error("token is expired")]
    Expired,
}

impl TokenError {
    /// Short label used in logs and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            TokenError::Malformed => "malformed",
            TokenError::SignatureInvalid => "signature",
            TokenError::WrongKind => "wrong_kind",
            TokenError::InvalidClaims => "invalid_claims",
            TokenError::Expired => "expired",
        }
    }
}

/// Failures of the secret vault.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("ciphertext is not valid base64")]
    Base64(#[from] base64::DecodeError),
    #[error("ciphertext is {value} bytes while at least {expected} are expected")]
    TooShort { value: usize, expected: usize },
    #[error("authenticated encryption failed")]
    Aead,
    #[error("decrypted secret is not utf8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Failures of the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQL request failed: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("{0} already exists")]
    Duplicate(&'static str),
    #[error("timestamp {0} is out of range")]
    Timestamp(i64),
}

/// Enum representing every failure of the token subsystem.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("principal cannot be resolved")]
    UnknownPrincipal,

    #[error("refresh token is not active")]
    InvalidRefresh,

    #[error("invalid identifier `{0}`")]
    InvalidIdentifier(String),

    #[error("secret vault failure: {0}")]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("internal server error, {details}")]
    Internal {
        details: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl AuthError {
    pub fn internal<E>(details: impl Into<String>, err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Internal {
            details: details.into(),
            source: Some(Box::new(err)),
        }
    }

    /// Whether the caller must see a uniform 401 rather than a server error.
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            AuthError::Token(_) | AuthError::UnknownPrincipal | AuthError::InvalidRefresh
        )
    }

    pub fn status(&self) -> StatusCode {
        match self {
            _ if self.is_unauthorized() => StatusCode::UNAUTHORIZED,
            AuthError::InvalidIdentifier(_) => StatusCode::BAD_REQUEST,
            AuthError::Store(StoreError::Duplicate(_)) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Structure for detailed error responses.
#[derive(Debug, Serialize)]
pub struct ResponseError {
    r#type: Option<String>,
    title: String,
    status: u16,
    detail: Option<String>,
    instance: Option<String>,
}

impl ResponseError {
    /// Update error status code.
    pub fn status(mut self, code: StatusCode) -> Self {
        self.status = code.as_u16();
        self
    }

    /// Update `title` field.
    pub fn title(mut self, title: &str) -> Self {
        self.title = title.into();
        self
    }

    /// Transform [`ResponseError`] into axum [`Response`].
    pub fn into_response(self) -> std::result::Result<Response, axum::http::Error> {
        let mut builder = Response::builder()
            .status(self.status)
            .header(header::CONTENT_TYPE, "application/json");

        if self.status == StatusCode::UNAUTHORIZED.as_u16() {
            builder = builder.header(header::WWW_AUTHENTICATE, "Bearer");
        }

        match serde_json::to_string(&self) {
            Ok(body) => builder.body(body.into()),
            Err(_) => Ok(internal_server_error()),
        }
    }
}

impl Default for ResponseError {
    fn default() -> Self {
        Self {
            r#type: None,
            title: "Internal server error.".to_owned(),
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            detail: None,
            instance: None,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let response = match &self {
            AuthError::Token(err) => {
                tracing::debug!(reason = err.reason(), "token rejected");
                ResponseError::default()
                    .title(UNAUTHORIZED_TITLE)
                    .status(StatusCode::UNAUTHORIZED)
            },
            AuthError::UnknownPrincipal | AuthError::InvalidRefresh => {
                tracing::debug!(error = %self, "token rejected");
                ResponseError::default()
                    .title(UNAUTHORIZED_TITLE)
                    .status(StatusCode::UNAUTHORIZED)
            },
            AuthError::InvalidIdentifier(_) | AuthError::Store(StoreError::Duplicate(_)) => {
                ResponseError::default()
                    .title(&self.to_string())
                    .status(self.status())
            },
            AuthError::Internal { details, source } => {
                tracing::error!(err = ?source, %details, "server returned 500 status");
                ResponseError::default()
            },
            _ => {
                tracing::error!(error = %self, "server returned 500 status");
                ResponseError::default()
            },
        };

        response
            .into_response()
            .unwrap_or_else(|_| internal_server_error())
    }
}

fn internal_server_error() -> Response {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "application/json")
        .body(
            serde_json::json!({
                "type": null,
                "title": "Internal server error.",
                "status": StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                "detail": null,
                "instance": null,
            })
            .to_string()
            .into(),
        )
        .unwrap_or_else(|_| Response::new("Internal server error".into()))
}
