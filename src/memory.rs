//! In-process implementation of the store ports, backed by `dashmap`.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

use crate::claims::Principal;
use crate::error::{AuthError, Result, StoreError};
use crate::store::{PrincipalStore, RefreshRecord, RefreshStore, ServiceRecord, hash_token};

/// Services and refresh records kept in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    services: DashMap<String, ServiceRecord>,
    /// Refresh records keyed by token hash.
    refresh: DashMap<String, RefreshRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every refresh record matching `predicate`.
    fn remove_where(&self, predicate: impl Fn(&RefreshRecord) -> bool) -> u64 {
        let keys: Vec<String> = self
            .refresh
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();

        keys.into_iter()
            .filter(|key| self.refresh.remove_if(key, |_, record| predicate(record)).is_some())
            .count() as u64
    }
}

#[async_trait]
impl PrincipalStore for MemoryStore {
    async fn insert_service(&self, record: ServiceRecord) -> std::result::Result<(), StoreError> {
        match self.services.entry(record.id().to_owned()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate("service")),
            Entry::Vacant(entry) => {
                entry.insert(record);
                Ok(())
            },
        }
    }

    async fn find_service(&self, service_id: &str) -> std::result::Result<Option<ServiceRecord>, StoreError> {
        Ok(self.services.get(service_id).map(|entry| entry.value().clone()))
    }

    async fn delete_service(&self, service_id: &str) -> std::result::Result<bool, StoreError> {
        Ok(self.services.remove(service_id).is_some())
    }
}

#[async_trait]
impl RefreshStore for MemoryStore {
    async fn issue(
        &self,
        owner: &Principal,
        token: &str,
        expires_at: i64,
    ) -> std::result::Result<RefreshRecord, StoreError> {
        let record = RefreshRecord {
            id: Uuid::new_v4().to_string(),
            owner: owner.clone(),
            token_hash: hash_token(token),
            expires_at,
        };

        match self.refresh.entry(record.token_hash.clone()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate("refresh token")),
            Entry::Vacant(entry) => {
                entry.insert(record.clone());
                Ok(record)
            },
        }
    }

    async fn rotate(&self, old_token: &str, new_token: &str, expires_at: i64) -> Result<RefreshRecord> {
        // Removing the old hash is the compare-and-swap: one caller wins.
        let (_, old) = self
            .refresh
            .remove(&hash_token(old_token))
            .ok_or(AuthError::InvalidRefresh)?;

        let record = RefreshRecord {
            token_hash: hash_token(new_token),
            expires_at,
            ..old
        };
        self.refresh.insert(record.token_hash.clone(), record.clone());

        Ok(record)
    }

    async fn revoke(&self, owner: &Principal) -> std::result::Result<u64, StoreError> {
        Ok(self.remove_where(|record| record.owner == *owner))
    }

    async fn lookup(&self, token: &str) -> std::result::Result<Option<RefreshRecord>, StoreError> {
        Ok(self
            .refresh
            .get(&hash_token(token))
            .map(|entry| entry.value().clone()))
    }

    async fn purge_account(&self, account_id: &str) -> std::result::Result<u64, StoreError> {
        Ok(self.remove_where(|record| record.owner.account_id() == account_id))
    }

    async fn purge_service(&self, service_id: &str) -> std::result::Result<u64, StoreError> {
        Ok(self.remove_where(|record| record.owner.service_id() == Some(service_id)))
    }

    async fn purge_expired(&self, now: i64) -> std::result::Result<u64, StoreError> {
        Ok(self.remove_where(|record| !record.is_active(now)))
    }
}
