//! Claim shapes carried by account and service tokens.
//!
//! Both shapes refuse unknown fields, so a service payload can never be read
//! as account claims (and the reverse).

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::TokenError;

const MAX_IDENTIFIER_LENGTH: usize = 128;
/// Longest accepted span between `issued_at` and `expires_at`, ten years.
pub const MAX_LIFETIME: i64 = 10 * 365 * 24 * 60 * 60;

/// Role asserted by a token.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    #[default]
    User,
    Admin,
}

impl Role {
    /// Role of `user_id` inside a service owned by `owner_id`.
    pub fn resolve(user_id: &str, owner_id: &str) -> Self {
        if user_id == owner_id {
            Role::Admin
        } else {
            Role::User
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "USER",
            Role::Admin => "ADMIN",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Principal kind a token was issued for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Account,
    Service,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Account => "account",
            TokenKind::Service => "service",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity a token speaks for.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Principal {
    Account {
        id: String,
    },
    Service {
        id: String,
        /// Account the service session belongs to.
        owner_account_id: String,
    },
}

impl Principal {
    pub fn account(id: impl Into<String>) -> Self {
        Principal::Account { id: id.into() }
    }

    pub fn service(id: impl Into<String>, owner_account_id: impl Into<String>) -> Self {
        Principal::Service {
            id: id.into(),
            owner_account_id: owner_account_id.into(),
        }
    }

    pub fn kind(&self) -> TokenKind {
        match self {
            Principal::Account { .. } => TokenKind::Account,
            Principal::Service { .. } => TokenKind::Service,
        }
    }

    /// Account behind the principal, whatever its kind.
    pub fn account_id(&self) -> &str {
        match self {
            Principal::Account { id } => id,
            Principal::Service {
                owner_account_id, ..
            } => owner_account_id,
        }
    }

    pub fn service_id(&self) -> Option<&str> {
        match self {
            Principal::Account { .. } => None,
            Principal::Service { id, .. } => Some(id),
        }
    }
}

/// Identifiers are short ASCII strings made of alphanumerics, `-` and `_`.
pub fn is_valid_identifier(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_IDENTIFIER_LENGTH
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Behaviour shared by both claim shapes.
pub trait TokenClaims: Serialize + DeserializeOwned + Clone + Send + Sync {
    /// Principal kind this shape encodes.
    const KIND: TokenKind;

    fn issued_at(&self) -> i64;

    fn expires_at(&self) -> i64;

    fn principal(&self) -> Principal;

    fn role(&self) -> Role;

    /// Check that required identity fields are present and well-formed.
    fn check_identity(&self) -> Result<(), TokenError>;

    /// Check that `expires_at` follows `issued_at` by at most [`MAX_LIFETIME`].
    fn check_window(&self) -> Result<(), TokenError> {
        let lifetime = self.expires_at().saturating_sub(self.issued_at());
        if lifetime <= 0 || lifetime > MAX_LIFETIME {
            return Err(TokenError::InvalidClaims);
        }
        Ok(())
    }

    /// Full validity predicate at `now`.
    ///
    /// Strict: a token is expired as soon as `now >= expires_at`.
    fn validate(&self, now: i64) -> Result<(), TokenError> {
        self.check_identity()?;
        self.check_window()?;

        if self.issued_at() > now {
            return Err(TokenError::InvalidClaims);
        }

        if now >= self.expires_at() {
            return Err(TokenError::Expired);
        }

        Ok(())
    }
}

/// Claims of a token issued to an end-user account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccountClaims {
    pub user_id: String,
    #[serde(rename = "role_type")]
    pub role: Role,
    #[serde(rename = "exp", alias = "expires_at")]
    pub expires_at: i64,
    #[serde(rename = "iat", alias = "issued_at")]
    pub issued_at: i64,
    /// Unique token identifier, set on refresh tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

impl AccountClaims {
    /// Create claims valid for `ttl` seconds from `issued_at`.
    pub fn new(user_id: impl Into<String>, role: Role, issued_at: i64, ttl: i64) -> Self {
        Self {
            user_id: user_id.into(),
            role,
            expires_at: issued_at.saturating_add(ttl),
            issued_at,
            jti: None,
        }
    }

    /// Attach a unique identifier.
    pub fn with_id(mut self, jti: impl Into<String>) -> Self {
        self.jti = Some(jti.into());
        self
    }
}

impl TokenClaims for AccountClaims {
    const KIND: TokenKind = TokenKind::Account;

    fn issued_at(&self) -> i64 {
        self.issued_at
    }

    fn expires_at(&self) -> i64 {
        self.expires_at
    }

    fn principal(&self) -> Principal {
        Principal::account(&self.user_id)
    }

    fn role(&self) -> Role {
        self.role
    }

    fn check_identity(&self) -> Result<(), TokenError> {
        if self.user_id.trim().is_empty() {
            return Err(TokenError::InvalidClaims);
        }
        Ok(())
    }
}

/// Claims of a token issued by a registered service to one of its users.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceClaims {
    pub user_id: String,
    pub service_id: String,
    #[serde(rename = "role_type")]
    pub role: Role,
    #[serde(rename = "exp", alias = "expires_at")]
    pub expires_at: i64,
    #[serde(rename = "iat", alias = "issued_at")]
    pub issued_at: i64,
    /// Unique token identifier, set on refresh tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

impl ServiceClaims {
    /// Create claims valid for `ttl` seconds from `issued_at`.
    ///
    /// The role is resolved from the service owner: the owner is `ADMIN`,
    /// everyone else `USER`.
    pub fn new(
        user_id: impl Into<String>,
        service_id: impl Into<String>,
        owner_id: &str,
        issued_at: i64,
        ttl: i64,
    ) -> Self {
        let user_id = user_id.into();
        let role = Role::resolve(&user_id, owner_id);

        Self {
            user_id,
            service_id: service_id.into(),
            role,
            expires_at: issued_at.saturating_add(ttl),
            issued_at,
            jti: None,
        }
    }

    /// Attach a unique identifier.
    pub fn with_id(mut self, jti: impl Into<String>) -> Self {
        self.jti = Some(jti.into());
        self
    }
}

impl TokenClaims for ServiceClaims {
    const KIND: TokenKind = TokenKind::Service;

    fn issued_at(&self) -> i64 {
        self.issued_at
    }

    fn expires_at(&self) -> i64 {
        self.expires_at
    }

    fn principal(&self) -> Principal {
        Principal::service(&self.service_id, &self.user_id)
    }

    fn role(&self) -> Role {
        self.role
    }

    fn check_identity(&self) -> Result<(), TokenError> {
        if !is_valid_identifier(&self.user_id) || !is_valid_identifier(&self.service_id) {
            return Err(TokenError::InvalidClaims);
        }
        Ok(())
    }
}

/// Verified claims of either kind; the request's identity context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Identity {
    Account(AccountClaims),
    Service(ServiceClaims),
}

impl Identity {
    pub fn principal(&self) -> Principal {
        match self {
            Identity::Account(claims) => claims.principal(),
            Identity::Service(claims) => claims.principal(),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Identity::Account(claims) => claims.role,
            Identity::Service(claims) => claims.role,
        }
    }

    pub fn kind(&self) -> TokenKind {
        match self {
            Identity::Account(_) => TokenKind::Account,
            Identity::Service(_) => TokenKind::Service,
        }
    }

    pub fn expires_at(&self) -> i64 {
        match self {
            Identity::Account(claims) => claims.expires_at,
            Identity::Service(claims) => claims.expires_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn test_account_json_keys() {
        let claims = AccountClaims::new("u1", Role::User, NOW, 900);
        let value = serde_json::to_value(&claims).unwrap();

        assert_eq!(
            value,
            json!({ "user_id": "u1", "role_type": "USER", "exp": NOW + 900, "iat": NOW })
        );
    }

    #[test]
    fn test_legacy_expires_at_key() {
        let claims: AccountClaims = serde_json::from_value(json!({
            "user_id": "u1",
            "role_type": "ADMIN",
            "expires_at": NOW + 60,
            "iat": NOW,
        }))
        .unwrap();

        assert_eq!(claims.expires_at, NOW + 60);
        assert_eq!(claims.role, Role::Admin);
    }

    #[test]
    fn test_shapes_do_not_overlap() {
        let service = ServiceClaims::new("u1", "s1", "owner", NOW, 900);
        let value = serde_json::to_value(&service).unwrap();
        assert!(serde_json::from_value::<AccountClaims>(value).is_err());

        let account = AccountClaims::new("u1", Role::User, NOW, 900);
        let value = serde_json::to_value(&account).unwrap();
        assert!(serde_json::from_value::<ServiceClaims>(value).is_err());
    }

    #[test]
    fn test_role_resolution() {
        assert_eq!(ServiceClaims::new("owner", "s1", "owner", NOW, 1).role, Role::Admin);
        assert_eq!(ServiceClaims::new("guest", "s1", "owner", NOW, 1).role, Role::User);
    }

    #[test]
    fn test_expiry_boundary() {
        let claims = AccountClaims::new("u1", Role::User, NOW, 900);

        assert!(claims.validate(NOW).is_ok());
        assert!(claims.validate(NOW + 899).is_ok());
        assert!(matches!(claims.validate(NOW + 900), Err(TokenError::Expired)));
    }

    #[test]
    fn test_invalid_claims() {
        let empty = AccountClaims::new("", Role::User, NOW, 900);
        assert!(matches!(empty.validate(NOW), Err(TokenError::InvalidClaims)));

        let future = AccountClaims::new("u1", Role::User, NOW + 10, 900);
        assert!(matches!(future.validate(NOW), Err(TokenError::InvalidClaims)));

        let inverted = AccountClaims::new("u1", Role::User, NOW, 0);
        assert!(matches!(inverted.validate(NOW), Err(TokenError::InvalidClaims)));

        let bad_service = ServiceClaims::new("u1", "s 1", "owner", NOW, 900);
        assert!(matches!(bad_service.validate(NOW), Err(TokenError::InvalidClaims)));
    }

    #[test]
    fn test_lifetime_overflow() {
        let endless = AccountClaims::new("u1", Role::User, NOW, i64::MAX);
        assert_eq!(endless.expires_at, i64::MAX);
        assert!(matches!(endless.validate(NOW), Err(TokenError::InvalidClaims)));

        let longest = ServiceClaims::new("u1", "s1", "owner", NOW, MAX_LIFETIME);
        assert!(longest.validate(NOW).is_ok());
        let too_long = ServiceClaims::new("u1", "s1", "owner", NOW, MAX_LIFETIME + 1);
        assert!(matches!(too_long.validate(NOW), Err(TokenError::InvalidClaims)));
    }

    #[test]
    fn test_identifiers() {
        assert!(is_valid_identifier("s1"));
        assert!(is_valid_identifier("4f1c2a9e-0b7d-4d8e-9a51-2f6b3c1d0e77"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("a.b"));
        assert!(!is_valid_identifier(&"a".repeat(MAX_IDENTIFIER_LENGTH + 1)));
    }

    #[test]
    fn test_principal() {
        let claims = ServiceClaims::new("u1", "s1", "owner", NOW, 900);
        let principal = claims.principal();

        assert_eq!(principal.kind(), TokenKind::Service);
        assert_eq!(principal.account_id(), "u1");
        assert_eq!(principal.service_id(), Some("s1"));
    }
}
