//! Persistence boundary of the token subsystem.
//!
//! Two ports: [`PrincipalStore`] resolves services, [`RefreshStore`] keeps
//! issued refresh tokens. See [`crate::memory`] and [`crate::database`] for
//! implementations.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::claims::Principal;
use crate::error::{Result, StoreError};
use crate::vault::SealedSecret;

/// A registered service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceRecord {
    /// Account that registered, and therefore administers, the service.
    pub owner_id: String,
    pub secret: SealedSecret,
}

impl ServiceRecord {
    pub fn id(&self) -> &str {
        &self.secret.service_id
    }
}

/// A stored refresh token.
///
/// Only the SHA-256 digest of the token is kept.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshRecord {
    pub id: String,
    pub owner: Principal,
    pub token_hash: String,
    pub expires_at: i64,
}

impl RefreshRecord {
    pub fn is_active(&self, now: i64) -> bool {
        now < self.expires_at
    }
}

/// Hex SHA-256 digest under which a refresh token is stored.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Port for service lookups.
#[async_trait]
pub trait PrincipalStore: Send + Sync {
    /// Register a new service. Fails if the identifier is taken.
    async fn insert_service(&self, record: ServiceRecord) -> std::result::Result<(), StoreError>;

    /// Find a service by its identifier.
    async fn find_service(&self, service_id: &str) -> std::result::Result<Option<ServiceRecord>, StoreError>;

    /// Delete a service. Returns whether it existed.
    async fn delete_service(&self, service_id: &str) -> std::result::Result<bool, StoreError>;
}

/// Port for refresh token management.
#[async_trait]
pub trait RefreshStore: Send + Sync {
    /// Persist a freshly minted refresh token.
    async fn issue(
        &self,
        owner: &Principal,
        token: &str,
        expires_at: i64,
    ) -> std::result::Result<RefreshRecord, StoreError>;

    /// Replace `old_token` by `new_token`, atomically.
    ///
    /// Succeeds for exactly one caller per `old_token`; every other caller
    /// (replay, concurrent refresh, unknown token) gets
    /// [`crate::error::AuthError::InvalidRefresh`].
    async fn rotate(&self, old_token: &str, new_token: &str, expires_at: i64) -> Result<RefreshRecord>;

    /// Delete the refresh records of one login session.
    ///
    /// For an account principal, only account sessions are removed; for a
    /// service principal, only that service's sessions for that account.
    async fn revoke(&self, owner: &Principal) -> std::result::Result<u64, StoreError>;

    async fn lookup(&self, token: &str) -> std::result::Result<Option<RefreshRecord>, StoreError>;

    /// Delete every record owned by the account, including service sessions.
    async fn purge_account(&self, account_id: &str) -> std::result::Result<u64, StoreError>;

    /// Delete every record of a service.
    async fn purge_service(&self, service_id: &str) -> std::result::Result<u64, StoreError>;

    /// Delete records expired at `now`.
    async fn purge_expired(&self, now: i64) -> std::result::Result<u64, StoreError>;
}
