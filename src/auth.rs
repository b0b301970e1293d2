//! Login, authentication and refresh flows.
//!
//! Credentials are checked elsewhere; [`Authenticator`] starts once an
//! account is known to be who it claims.

use std::sync::Arc;

use crate::claims::{Identity, Principal, Role, is_valid_identifier};
use crate::error::{AuthError, Result, TokenError};
use crate::resolver::{SecretResolver, TokenClass, classify, extract_bearer};
use crate::store::{PrincipalStore, RefreshStore, ServiceRecord};
use crate::token::{TokenPair, TokenService, TokenUse};
use crate::vault::{SecretVault, ServiceSecret};

fn check_identifier(id: &str) -> Result<()> {
    if is_valid_identifier(id) {
        Ok(())
    } else {
        Err(AuthError::InvalidIdentifier(id.to_owned()))
    }
}

fn record_rotation(outcome: &'static str) {
    metrics::counter!("refresh_rotations_total", "outcome" => outcome).increment(1);
}

/// Entry point of the token subsystem.
pub struct Authenticator {
    tokens: Arc<TokenService>,
    vault: Arc<SecretVault>,
    resolver: SecretResolver,
    principals: Arc<dyn PrincipalStore>,
    refresh: Arc<dyn RefreshStore>,
}

impl Authenticator {
    /// Create a new [`Authenticator`].
    pub fn new(
        tokens: Arc<TokenService>,
        vault: Arc<SecretVault>,
        principals: Arc<dyn PrincipalStore>,
        refresh: Arc<dyn RefreshStore>,
    ) -> Self {
        Self {
            resolver: SecretResolver::new(Arc::clone(&principals), Arc::clone(&vault)),
            tokens,
            vault,
            principals,
            refresh,
        }
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    /// Register a service owned by `owner_id`.
    ///
    /// The plaintext secret is returned once and only stored encrypted.
    /// When `secret` is `None` or empty, a random one is generated.
    pub async fn register_service(
        &self,
        service_id: &str,
        owner_id: &str,
        secret: Option<ServiceSecret>,
    ) -> Result<ServiceSecret> {
        check_identifier(service_id)?;
        check_identifier(owner_id)?;

        let secret = secret
            .filter(|secret| !secret.expose().is_empty())
            .unwrap_or_else(ServiceSecret::generate);

        let record = ServiceRecord {
            owner_id: owner_id.to_owned(),
            secret: self.vault.seal(service_id, &secret)?,
        };
        self.principals.insert_service(record).await?;

        tracing::info!(%service_id, %owner_id, "service registered");
        Ok(secret)
    }

    /// Issue tokens to an account.
    pub async fn login_account(&self, account_id: &str, role: Role) -> Result<TokenPair> {
        check_identifier(account_id)?;

        let pair = self.tokens.issue_account(account_id, role)?;
        self.refresh
            .issue(&Principal::account(account_id), &pair.refresh_token, pair.refresh_expires_at)
            .await?;

        tracing::debug!(%account_id, %role, "account logged in");
        Ok(pair)
    }

    /// Issue service tokens to an account logging into `service_id`.
    ///
    /// The service owner gets `ADMIN`, everyone else `USER`.
    pub async fn login_service(&self, account_id: &str, service_id: &str) -> Result<TokenPair> {
        check_identifier(account_id)?;

        let service = self.resolver.resolve_service(service_id).await?;
        let pair = self.tokens.issue_service(
            account_id,
            &service.service_id,
            &service.owner_id,
            &service.secret,
        )?;
        self.refresh
            .issue(
                &Principal::service(&service.service_id, account_id),
                &pair.refresh_token,
                pair.refresh_expires_at,
            )
            .await?;

        tracing::debug!(%account_id, %service_id, "account logged into service");
        Ok(pair)
    }

    /// Verify an access token of either kind.
    pub async fn authenticate(&self, token: &str) -> Result<Identity> {
        match classify(token)? {
            TokenClass::Account => Ok(Identity::Account(
                self.tokens.verify_account(token, TokenUse::Access)?,
            )),
            TokenClass::Service { service_id } => {
                let secret = self.resolver.resolve_service_secret(&service_id).await?;
                let claims = self.tokens.verify_service(token, TokenUse::Access, &secret)?;
                Ok(Identity::Service(claims))
            },
            TokenClass::Unknown => Err(TokenError::Malformed.into()),
        }
    }

    /// Verify the token carried by an `Authorization` header value.
    pub async fn authenticate_header(&self, header: Option<&str>) -> Result<Identity> {
        let token = header
            .and_then(extract_bearer)
            .ok_or(AuthError::Token(TokenError::Malformed))?;

        self.authenticate(token).await
    }

    /// Exchange a refresh token for a new pair and rotate the stored record.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let (owner, pair) = match classify(refresh_token)? {
            TokenClass::Account => {
                let claims = self.tokens.verify_account(refresh_token, TokenUse::Refresh)?;
                let pair = self.tokens.issue_account(&claims.user_id, claims.role)?;
                (Principal::account(claims.user_id), pair)
            },
            TokenClass::Service { service_id } => {
                let service = self.resolver.resolve_service(&service_id).await?;
                let claims = self
                    .tokens
                    .verify_service(refresh_token, TokenUse::Refresh, &service.secret)?;
                // Ownership may have changed since the last login.
                let pair = self.tokens.issue_service(
                    &claims.user_id,
                    &service.service_id,
                    &service.owner_id,
                    &service.secret,
                )?;
                (Principal::service(service.service_id, claims.user_id), pair)
            },
            TokenClass::Unknown => return Err(TokenError::Malformed.into()),
        };

        let active = self
            .refresh
            .lookup(refresh_token)
            .await?
            .is_some_and(|record| record.owner == owner && record.is_active(self.tokens.now()));
        if !active {
            tracing::warn!(account_id = owner.account_id(), "refresh token is not stored or expired");
            record_rotation("rejected");
            return Err(AuthError::InvalidRefresh);
        }

        match self
            .refresh
            .rotate(refresh_token, &pair.refresh_token, pair.refresh_expires_at)
            .await
        {
            Ok(_) => {
                record_rotation("rotated");
                Ok(pair)
            },
            Err(AuthError::InvalidRefresh) => {
                tracing::warn!(
                    account_id = owner.account_id(),
                    "refresh token used concurrently, possible replay"
                );
                record_rotation("replay");
                Err(AuthError::InvalidRefresh)
            },
            Err(err) => Err(err),
        }
    }

    /// Revoke the refresh records of the session behind `identity`.
    pub async fn logout(&self, identity: &Identity) -> Result<u64> {
        Ok(self.refresh.revoke(&identity.principal()).await?)
    }

    /// Revoke everything an account holds, service sessions included.
    pub async fn purge_account(&self, account_id: &str) -> Result<u64> {
        let count = self.refresh.purge_account(account_id).await?;
        tracing::info!(%account_id, count, "account sessions purged");
        Ok(count)
    }

    /// Delete a service and every session opened on it.
    ///
    /// Its tokens stop verifying at once since the secret is gone.
    pub async fn purge_service(&self, service_id: &str) -> Result<u64> {
        if !self.principals.delete_service(service_id).await? {
            return Err(AuthError::UnknownPrincipal);
        }

        let count = self.refresh.purge_service(service_id).await?;
        tracing::info!(%service_id, count, "service purged");
        Ok(count)
    }

    /// Drop refresh records that can no longer be used.
    pub async fn purge_expired(&self) -> Result<u64> {
        Ok(self.refresh.purge_expired(self.tokens.now()).await?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::claims::TokenKind;
    use crate::clock::FixedClock;
    use crate::error::StoreError;
    use crate::memory::MemoryStore;
    use crate::token::tests::{NOW, token_service};

    pub fn authenticator(clock: &FixedClock) -> Authenticator {
        let store = Arc::new(MemoryStore::new());

        Authenticator::new(
            Arc::new(token_service(clock)),
            Arc::new(SecretVault::from_passphrase("vault-secret")),
            store.clone(),
            store,
        )
    }

    #[tokio::test]
    async fn test_account_session() {
        let clock = FixedClock::new(NOW);
        let auth = authenticator(&clock);

        let pair = auth.login_account("u1", Role::User).await.unwrap();
        assert_eq!(pair.token_type, "Bearer");
        assert_eq!(pair.expires_in, 15 * 60);

        let identity = auth.authenticate(&pair.access_token).await.unwrap();
        assert_eq!(identity.principal(), Principal::account("u1"));
        assert_eq!(identity.role(), Role::User);

        let header = format!("Bearer {}", pair.access_token);
        assert!(auth.authenticate_header(Some(header.as_str())).await.is_ok());
        assert!(auth.authenticate_header(Some(pair.access_token.as_str())).await.is_ok());
        assert!(matches!(
            auth.authenticate_header(None).await,
            Err(AuthError::Token(TokenError::Malformed))
        ));

        clock.advance(16 * 60);
        assert!(matches!(
            auth.authenticate(&pair.access_token).await,
            Err(AuthError::Token(TokenError::Expired))
        ));
    }

    #[tokio::test]
    async fn test_service_session() {
        let clock = FixedClock::new(NOW);
        let auth = authenticator(&clock);
        let secret = auth
            .register_service("s1", "owner", Some(ServiceSecret::new("my-secret-key-1234")))
            .await
            .unwrap();
        assert_eq!(secret.expose(), "my-secret-key-1234");

        let owner = auth.login_service("owner", "s1").await.unwrap();
        let guest = auth.login_service("guest", "s1").await.unwrap();

        let identity = auth.authenticate(&owner.access_token).await.unwrap();
        assert_eq!(identity.kind(), TokenKind::Service);
        assert_eq!(identity.role(), Role::Admin);
        assert_eq!(identity.principal(), Principal::service("s1", "owner"));

        let identity = auth.authenticate(&guest.access_token).await.unwrap();
        assert_eq!(identity.role(), Role::User);

        assert!(matches!(
            auth.login_service("guest", "unknown").await,
            Err(AuthError::UnknownPrincipal)
        ));
    }

    #[tokio::test]
    async fn test_services_are_isolated() {
        let clock = FixedClock::new(NOW);
        let auth = authenticator(&clock);
        auth.register_service("s1", "owner", None).await.unwrap();
        let other = auth.register_service("s2", "owner", None).await.unwrap();

        // A token naming s1 but signed with the secret of s2.
        let pair = auth.tokens().issue_service("u1", "s1", "owner", &other).unwrap();
        assert!(matches!(
            auth.authenticate(&pair.access_token).await,
            Err(AuthError::Token(TokenError::SignatureInvalid))
        ));
    }

    #[tokio::test]
    async fn test_refresh_rotation() {
        let clock = FixedClock::new(NOW);
        let auth = authenticator(&clock);
        let first = auth.login_account("u1", Role::Admin).await.unwrap();

        clock.advance(60);
        let second = auth.refresh(&first.refresh_token).await.unwrap();
        assert_ne!(second.refresh_token, first.refresh_token);
        assert_eq!(
            auth.authenticate(&second.access_token).await.unwrap().role(),
            Role::Admin
        );

        // The rotated value is dead.
        assert!(matches!(
            auth.refresh(&first.refresh_token).await,
            Err(AuthError::InvalidRefresh)
        ));
        assert!(auth.refresh(&second.refresh_token).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_refresh() {
        let clock = FixedClock::new(NOW);
        let auth = Arc::new(authenticator(&clock));
        let pair = auth.login_account("u1", Role::User).await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let auth = Arc::clone(&auth);
                let token = pair.refresh_token.clone();
                tokio::spawn(async move { auth.refresh(&token).await })
            })
            .collect();

        let mut succeeded = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => succeeded += 1,
                Err(err) => assert!(matches!(err, AuthError::InvalidRefresh)),
            }
        }

        assert_eq!(succeeded, 1);
    }

    #[tokio::test]
    async fn test_refresh_rejects_access_tokens() {
        let clock = FixedClock::new(NOW);
        let auth = authenticator(&clock);
        let pair = auth.login_account("u1", Role::User).await.unwrap();

        assert!(matches!(
            auth.refresh(&pair.access_token).await,
            Err(AuthError::Token(TokenError::SignatureInvalid))
        ));
    }

    #[tokio::test]
    async fn test_refresh_expiry() {
        let clock = FixedClock::new(NOW);
        let auth = authenticator(&clock);
        let pair = auth.login_account("u1", Role::User).await.unwrap();

        clock.set(pair.refresh_expires_at);
        assert!(matches!(
            auth.refresh(&pair.refresh_token).await,
            Err(AuthError::Token(TokenError::Expired))
        ));
        assert_eq!(auth.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_service_refresh_follows_ownership() {
        let clock = FixedClock::new(NOW);
        let auth = authenticator(&clock);
        auth.register_service("s1", "owner", None).await.unwrap();

        let pair = auth.login_service("owner", "s1").await.unwrap();
        let next = auth.refresh(&pair.refresh_token).await.unwrap();

        let identity = auth.authenticate(&next.access_token).await.unwrap();
        assert_eq!(identity.role(), Role::Admin);
        assert_eq!(identity.principal(), Principal::service("s1", "owner"));
    }

    #[tokio::test]
    async fn test_logout() {
        let clock = FixedClock::new(NOW);
        let auth = authenticator(&clock);
        auth.register_service("s1", "owner", None).await.unwrap();

        let account = auth.login_account("u1", Role::User).await.unwrap();
        let service = auth.login_service("u1", "s1").await.unwrap();

        let identity = auth.authenticate(&service.access_token).await.unwrap();
        assert_eq!(auth.logout(&identity).await.unwrap(), 1);

        assert!(matches!(
            auth.refresh(&service.refresh_token).await,
            Err(AuthError::InvalidRefresh)
        ));
        assert!(auth.refresh(&account.refresh_token).await.is_ok());
    }

    #[tokio::test]
    async fn test_purge_account() {
        let clock = FixedClock::new(NOW);
        let auth = authenticator(&clock);
        auth.register_service("s1", "owner", None).await.unwrap();

        let account = auth.login_account("u1", Role::User).await.unwrap();
        let service = auth.login_service("u1", "s1").await.unwrap();

        assert_eq!(auth.purge_account("u1").await.unwrap(), 2);
        for token in [account.refresh_token, service.refresh_token] {
            assert!(matches!(auth.refresh(&token).await, Err(AuthError::InvalidRefresh)));
        }
    }

    #[tokio::test]
    async fn test_purge_service() {
        let clock = FixedClock::new(NOW);
        let auth = authenticator(&clock);
        auth.register_service("s1", "owner", None).await.unwrap();
        let pair = auth.login_service("u1", "s1").await.unwrap();

        assert_eq!(auth.purge_service("s1").await.unwrap(), 1);

        let err = auth.authenticate(&pair.access_token).await.unwrap_err();
        assert!(matches!(err, AuthError::UnknownPrincipal));
        assert!(err.is_unauthorized());
        assert!(matches!(
            auth.purge_service("s1").await,
            Err(AuthError::UnknownPrincipal)
        ));
    }

    #[tokio::test]
    async fn test_register_service_errors() {
        let clock = FixedClock::new(NOW);
        let auth = authenticator(&clock);
        auth.register_service("s1", "owner", None).await.unwrap();

        assert!(matches!(
            auth.register_service("s1", "other", None).await,
            Err(AuthError::Store(StoreError::Duplicate(_)))
        ));
        assert!(matches!(
            auth.register_service("s 1", "owner", None).await,
            Err(AuthError::InvalidIdentifier(_))
        ));
        assert!(matches!(
            auth.login_account("", Role::User).await,
            Err(AuthError::InvalidIdentifier(_))
        ));
    }
}
