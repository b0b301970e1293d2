//! Manage json web tokens for accounts and services.
//!
//! Every token is HS256. Account tokens are signed with the account
//! access/refresh secrets. Service tokens are signed with a key derived
//! from the service's own secret and the service access/refresh secret, so
//! each service is isolated and access keys never verify refresh tokens.

use std::fmt;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::claims::{AccountClaims, Role, ServiceClaims, TokenClaims, TokenKind};
use crate::clock::Clock;
use crate::config::{Lifetimes, Secrets, TokenLifetimes};
use crate::error::{AuthError, Result, TokenError};
use crate::resolver::{TokenClass, classify};
use crate::vault::ServiceSecret;

pub const TOKEN_TYPE: &str = "Bearer";
const ALGORITHM: Algorithm = Algorithm::HS256;

/// Token class inside a principal kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TokenUse {
    Access,
    Refresh,
}

impl TokenUse {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenUse::Access => "access",
            TokenUse::Refresh => "refresh",
        }
    }
}

/// Symmetric key a token class is signed with.
#[derive(Clone)]
pub struct SigningKey(Zeroizing<Vec<u8>>);

impl SigningKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Zeroizing::new(bytes.into()))
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKey(..)")
    }
}

/// Access and refresh tokens handed out together.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub token_type: String,
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds.
    pub expires_in: i64,
    /// Unix time at which the refresh token stops being accepted.
    #[serde(skip)]
    pub refresh_expires_at: i64,
}

/// Signs and verifies tokens.
pub struct TokenService {
    account_access: SigningKey,
    account_refresh: SigningKey,
    service_access: SigningKey,
    service_refresh: SigningKey,
    lifetimes: TokenLifetimes,
    clock: Arc<dyn Clock>,
}

impl TokenService {
    /// Create a new [`TokenService`].
    pub fn new(secrets: &Secrets, lifetimes: TokenLifetimes, clock: Arc<dyn Clock>) -> Self {
        Self {
            account_access: SigningKey::new(secrets.account_access.as_bytes()),
            account_refresh: SigningKey::new(secrets.account_refresh.as_bytes()),
            service_access: SigningKey::new(secrets.service_access.as_bytes()),
            service_refresh: SigningKey::new(secrets.service_refresh.as_bytes()),
            lifetimes,
            clock,
        }
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    pub fn lifetimes(&self, kind: TokenKind) -> Lifetimes {
        match kind {
            TokenKind::Account => self.lifetimes.account,
            TokenKind::Service => self.lifetimes.service,
        }
    }

    fn ttl(&self, kind: TokenKind, usage: TokenUse) -> i64 {
        let lifetimes = self.lifetimes(kind);
        match usage {
            TokenUse::Access => lifetimes.access_ttl,
            TokenUse::Refresh => lifetimes.refresh_ttl,
        }
    }

    /// Key of account tokens.
    pub fn account_key(&self, usage: TokenUse) -> &SigningKey {
        match usage {
            TokenUse::Access => &self.account_access,
            TokenUse::Refresh => &self.account_refresh,
        }
    }

    /// Key of one service's tokens.
    pub fn service_key(&self, usage: TokenUse, secret: &ServiceSecret) -> Result<SigningKey> {
        let base = match usage {
            TokenUse::Access => &self.service_access,
            TokenUse::Refresh => &self.service_refresh,
        };

        let mut mac = Hmac::<Sha256>::new_from_slice(base.as_bytes()).map_err(|_| {
            AuthError::Internal {
                details: "service key derivation rejected the base key".into(),
                source: None,
            }
        })?;
        mac.update(secret.as_bytes());

        Ok(SigningKey::new(mac.finalize().into_bytes().to_vec()))
    }

    /// Sign `claims` with `key`.
    pub fn mint<C: TokenClaims>(&self, claims: &C, key: &SigningKey) -> Result<String> {
        claims.check_identity()?;
        claims.check_window()?;

        encode(
            &Header::new(ALGORITHM),
            claims,
            &EncodingKey::from_secret(key.as_bytes()),
        )
        .map_err(|err| AuthError::internal("cannot sign token", err))
    }

    /// Check structure, then signature, then claims and validity at the
    /// current time.
    pub fn verify<C: TokenClaims>(&self, token: &str, key: &SigningKey) -> std::result::Result<C, TokenError> {
        if token.split('.').count() != 3 {
            return Err(TokenError::Malformed);
        }

        // Shape mismatch is decided on structure alone, before any crypto.
        match classify(token)? {
            TokenClass::Unknown => return Err(TokenError::Malformed),
            class if class.kind() != Some(C::KIND) => return Err(TokenError::WrongKind),
            _ => {},
        }

        let mut validation = Validation::new(ALGORITHM);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let claims = decode::<C>(token, &DecodingKey::from_secret(key.as_bytes()), &validation)
            .map(|data| data.claims)
            .map_err(|err| match err.kind() {
                ErrorKind::InvalidSignature => TokenError::SignatureInvalid,
                _ => TokenError::Malformed,
            })?;

        claims.validate(self.clock.now())?;
        Ok(claims)
    }

    /// Claims for an account token issued now.
    pub fn account_claims(&self, user_id: &str, role: Role, usage: TokenUse) -> AccountClaims {
        let claims = AccountClaims::new(user_id, role, self.now(), self.ttl(TokenKind::Account, usage));
        match usage {
            TokenUse::Access => claims,
            TokenUse::Refresh => claims.with_id(Uuid::new_v4().to_string()),
        }
    }

    /// Claims for a service token issued now, role resolved from the owner.
    pub fn service_claims(
        &self,
        user_id: &str,
        service_id: &str,
        owner_id: &str,
        usage: TokenUse,
    ) -> ServiceClaims {
        let claims = ServiceClaims::new(
            user_id,
            service_id,
            owner_id,
            self.now(),
            self.ttl(TokenKind::Service, usage),
        );
        match usage {
            TokenUse::Access => claims,
            TokenUse::Refresh => claims.with_id(Uuid::new_v4().to_string()),
        }
    }

    /// Mint an access/refresh pair for an account.
    pub fn issue_account(&self, user_id: &str, role: Role) -> Result<TokenPair> {
        let access = self.account_claims(user_id, role, TokenUse::Access);
        let refresh = self.account_claims(user_id, role, TokenUse::Refresh);

        let pair = TokenPair {
            token_type: TOKEN_TYPE.to_owned(),
            access_token: self.mint(&access, self.account_key(TokenUse::Access))?,
            refresh_token: self.mint(&refresh, self.account_key(TokenUse::Refresh))?,
            expires_in: access.expires_at - access.issued_at,
            refresh_expires_at: refresh.expires_at,
        };

        record_issue(TokenKind::Account);
        Ok(pair)
    }

    /// Mint an access/refresh pair for a user of a service.
    pub fn issue_service(
        &self,
        user_id: &str,
        service_id: &str,
        owner_id: &str,
        secret: &ServiceSecret,
    ) -> Result<TokenPair> {
        let access = self.service_claims(user_id, service_id, owner_id, TokenUse::Access);
        let refresh = self.service_claims(user_id, service_id, owner_id, TokenUse::Refresh);

        let pair = TokenPair {
            token_type: TOKEN_TYPE.to_owned(),
            access_token: self.mint(&access, &self.service_key(TokenUse::Access, secret)?)?,
            refresh_token: self.mint(&refresh, &self.service_key(TokenUse::Refresh, secret)?)?,
            expires_in: access.expires_at - access.issued_at,
            refresh_expires_at: refresh.expires_at,
        };

        record_issue(TokenKind::Service);
        Ok(pair)
    }

    /// Verify an account token of the given class.
    pub fn verify_account(&self, token: &str, usage: TokenUse) -> std::result::Result<AccountClaims, TokenError> {
        let result = self.verify::<AccountClaims>(token, self.account_key(usage));
        record_verification(TokenKind::Account, usage, &result);
        result
    }

    /// Verify a service token of the given class under that service's secret.
    pub fn verify_service(
        &self,
        token: &str,
        usage: TokenUse,
        secret: &ServiceSecret,
    ) -> Result<ServiceClaims> {
        let key = self.service_key(usage, secret)?;
        let result = self.verify::<ServiceClaims>(token, &key);
        record_verification(TokenKind::Service, usage, &result);
        Ok(result?)
    }
}

fn record_issue(kind: TokenKind) {
    for usage in [TokenUse::Access, TokenUse::Refresh] {
        metrics::counter!(
            "tokens_issued_total",
            "kind" => kind.as_str(),
            "usage" => usage.as_str()
        )
        .increment(1);
    }
}

fn record_verification<T>(kind: TokenKind, usage: TokenUse, result: &std::result::Result<T, TokenError>) {
    let outcome = match result {
        Ok(_) => "valid",
        Err(err) => {
            tracing::debug!(%kind, usage = usage.as_str(), reason = err.reason(), "token verification failed");
            err.reason()
        },
    };

    metrics::counter!(
        "token_verifications_total",
        "kind" => kind.as_str(),
        "usage" => usage.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

impl fmt::Debug for TokenService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenService")
            .field("lifetimes", &self.lifetimes)
            .finish_non_exhaustive()
    }
}
