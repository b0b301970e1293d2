//! Routing of raw tokens to the secret that verifies them.
//!
//! [`classify`] only peeks at the payload to pick a key. It trusts nothing:
//! the token is always verified afterwards under that key.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;

use crate::claims::TokenKind;
use crate::error::{AuthError, Result, TokenError};
use crate::store::PrincipalStore;
use crate::vault::{SecretVault, ServiceSecret};

const BEARER: &str = "bearer";

/// Principal kind a token claims to be, before verification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TokenClass {
    Account,
    Service { service_id: String },
    Unknown,
}

impl TokenClass {
    pub fn kind(&self) -> Option<TokenKind> {
        match self {
            TokenClass::Account => Some(TokenKind::Account),
            TokenClass::Service { .. } => Some(TokenKind::Service),
            TokenClass::Unknown => None,
        }
    }
}

#[derive(Deserialize)]
struct Peek {
    #[serde(default)]
    user_id: Option<serde_json::Value>,
    #[serde(default)]
    service_id: Option<String>,
}

/// Inspect the payload of `token` without verifying it.
///
/// A `service_id` field makes it a service token, a `user_id` field alone
/// an account token.
pub fn classify(token: &str) -> std::result::Result<TokenClass, TokenError> {
    let mut segments = token.split('.');
    let (Some(_), Some(payload), Some(_), None) =
        (segments.next(), segments.next(), segments.next(), segments.next())
    else {
        return Err(TokenError::Malformed);
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|_| TokenError::Malformed)?;
    let peek: Peek = serde_json::from_slice(&bytes).map_err(|_| TokenError::Malformed)?;

    Ok(match (peek.service_id, peek.user_id) {
        (Some(service_id), _) => TokenClass::Service { service_id },
        (None, Some(_)) => TokenClass::Account,
        (None, None) => TokenClass::Unknown,
    })
}

/// Token carried by a header value, either `Bearer <token>` or the bare
/// three-segment token.
pub fn extract_bearer(header: &str) -> Option<&str> {
    let header = header.trim();

    match header.split_once(' ') {
        Some((scheme, token)) => {
            let token = token.trim();
            (scheme.eq_ignore_ascii_case(BEARER) && !token.is_empty() && !token.contains(' '))
                .then_some(token)
        },
        None => (header.matches('.').count() == 2).then_some(header),
    }
}

/// Decrypted view of a registered service.
#[derive(Clone, Debug)]
pub struct ResolvedService {
    pub service_id: String,
    pub owner_id: String,
    pub secret: ServiceSecret,
}

/// Loads and decrypts per-service signing secrets.
#[derive(Clone)]
pub struct SecretResolver {
    store: Arc<dyn PrincipalStore>,
    vault: Arc<SecretVault>,
}

impl SecretResolver {
    /// Create a new [`SecretResolver`].
    pub fn new(store: Arc<dyn PrincipalStore>, vault: Arc<SecretVault>) -> Self {
        Self { store, vault }
    }

    /// Resolve a service and decrypt its secret.
    ///
    /// A missing service is [`AuthError::UnknownPrincipal`]. A ciphertext
    /// that fails to decrypt is a server fault.
    pub async fn resolve_service(&self, service_id: &str) -> Result<ResolvedService> {
        let record = self
            .store
            .find_service(service_id)
            .await?
            .ok_or(AuthError::UnknownPrincipal)?;

        let secret = self.vault.open(&record.secret.ciphertext).map_err(|err| {
            tracing::error!(error = %err, %service_id, "stored service secret cannot be decrypted");
            AuthError::Crypto(err)
        })?;

        Ok(ResolvedService {
            service_id: record.secret.service_id,
            owner_id: record.owner_id,
            secret,
        })
    }

    pub async fn resolve_service_secret(&self, service_id: &str) -> Result<ServiceSecret> {
        self.resolve_service(service_id).await.map(|service| service.secret)
    }
}
