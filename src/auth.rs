//! OAuth access tokens: expiry tracking, refresh, and connection lifecycle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hyper::client::HttpConnector;
use hyper_rustls::HttpsConnector;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::accounts::AccountRegistry;
use crate::config::OAuthSettings;
use crate::db::Database;
use crate::error::{Result, SyncError};
use crate::models::{OAuthCredential, Provider};

pub type HttpsClient = hyper::Client<HttpsConnector<HttpConnector>>;

pub fn https_client() -> std::io::Result<HttpsClient> {
    let connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()?
        .https_or_http()
        .enable_http1()
        .build();
    Ok(hyper::Client::builder().build(connector))
}

/// Tokens issued by a provider's token endpoint.
#[derive(Debug, Clone, Default)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    pub scopes: Vec<String>,
}

#[derive(Debug, Error)]
pub enum RefreshError {
    /// The provider refused the refresh token (revoked, invalid grant).
    #[error("refresh rejected: {0}")]
    Rejected(String),

    #[error("refresh failed: {0}")]
    Transient(String),
}

/// Performs the network half of a token refresh.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(
        &self,
        provider: Provider,
        refresh_token: &str,
    ) -> std::result::Result<TokenGrant, RefreshError>;
}

type RefreshKey = (i64, Provider);

/// Hands out non-expired access tokens, refreshing at most once per
/// (account, provider) at a time.
pub struct TokenManager {
    db: Database,
    accounts: Arc<dyn AccountRegistry>,
    refresher: Arc<dyn TokenRefresher>,
    margin: chrono::Duration,
    refresh_timeout: Duration,
    refresh_locks: Mutex<HashMap<RefreshKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl TokenManager {
    pub fn new(
        db: Database,
        accounts: Arc<dyn AccountRegistry>,
        refresher: Arc<dyn TokenRefresher>,
        margin: chrono::Duration,
        refresh_timeout: Duration,
    ) -> Self {
        Self {
            db,
            accounts,
            refresher,
            margin,
            refresh_timeout,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_valid_token(&self, account_id: i64, provider: Provider) -> Result<String> {
        if let Some(cred) = self.active_credential(account_id, provider).await? {
            if cred.is_usable_for(Utc::now(), self.margin) {
                return Ok(cred.access_token);
            }
        }

        let lock = self.refresh_lock(account_id, provider);
        let _guard = lock.lock().await;

        // Whoever held the lock before us may already have refreshed.
        let Some(cred) = self.active_credential(account_id, provider).await? else {
            return Err(self
                .require_reauth(account_id, format!("no active {provider} credential"))
                .await);
        };
        if cred.is_usable_for(Utc::now(), self.margin) {
            debug!(account_id, %provider, "token refreshed by a concurrent caller");
            return Ok(cred.access_token);
        }

        let Some(refresh_token) = cred.refresh_token.clone().filter(|t| !t.is_empty()) else {
            return Err(self
                .require_reauth(account_id, "access token expired and no refresh token is stored".to_string())
                .await);
        };

        info!(account_id, %provider, "refreshing access token");
        let outcome = tokio::time::timeout(
            self.refresh_timeout,
            self.refresher.refresh(provider, &refresh_token),
        )
        .await
        .unwrap_or_else(|_| Err(RefreshError::Transient("token refresh timed out".to_string())));

        match outcome {
            Ok(grant) => {
                let refreshed = apply_grant(cred, grant);
                self.db.save_credential(&refreshed).await?;
                Ok(refreshed.access_token)
            }
            Err(RefreshError::Rejected(reason)) => {
                warn!(account_id, %provider, reason = %reason, "refresh token rejected");
                Err(self.require_reauth(account_id, reason).await)
            }
            Err(RefreshError::Transient(reason)) => {
                warn!(account_id, %provider, reason = %reason, "token refresh failed, will retry");
                Err(SyncError::TransientProvider(reason))
            }
        }
    }

    /// Forces the next [`get_valid_token`](Self::get_valid_token) to refresh.
    pub async fn invalidate(&self, account_id: i64, provider: Provider) -> Result<()> {
        self.db.expire_credential(account_id, provider).await
    }

    /// Records tokens from a completed authorization and re-enables the
    /// linked account.
    pub async fn store_connection(
        &self,
        account_id: i64,
        provider: Provider,
        grant: TokenGrant,
    ) -> Result<OAuthCredential> {
        let now = Utc::now();
        let credential = match self.db.get_credential(account_id, provider).await? {
            Some(existing) => apply_grant(
                OAuthCredential {
                    is_active: true,
                    ..existing
                },
                grant,
            ),
            None => OAuthCredential {
                account_id,
                provider,
                access_token: grant.access_token,
                refresh_token: grant.refresh_token,
                expires_at: grant
                    .expires_in
                    .map(|secs| now + chrono::Duration::seconds(secs)),
                scopes: grant.scopes,
                is_active: true,
                updated_at: now,
            },
        };
        self.db.save_credential(&credential).await?;

        self.db.set_account_active(account_id, true).await?;
        self.db.set_needs_reauth(account_id, false).await?;
        info!(account_id, %provider, "connection stored");
        Ok(credential)
    }

    /// Disconnects a provider link and the account it authorizes.
    pub async fn deactivate_connection(&self, account_id: i64, provider: Provider) -> Result<bool> {
        let existed = self.db.deactivate_credential(account_id, provider).await?;
        if existed {
            self.db.set_account_active(account_id, false).await?;
            info!(account_id, %provider, "connection deactivated");
        } else {
            warn!(account_id, %provider, "no connection to deactivate");
        }
        Ok(existed)
    }

    async fn active_credential(
        &self,
        account_id: i64,
        provider: Provider,
    ) -> Result<Option<OAuthCredential>> {
        Ok(self
            .db
            .get_credential(account_id, provider)
            .await?
            .filter(|c| c.is_active))
    }

    async fn require_reauth(&self, account_id: i64, reason: String) -> SyncError {
        if let Err(e) = self.accounts.mark_needs_reauth(account_id).await {
            warn!(account_id, error = %e, "could not flag account for re-authorization");
        }
        SyncError::Credential(reason)
    }

    fn refresh_lock(&self, account_id: i64, provider: Provider) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .refresh_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry((account_id, provider)).or_default().clone()
    }
}

fn apply_grant(cred: OAuthCredential, grant: TokenGrant) -> OAuthCredential {
    let now = Utc::now();
    OAuthCredential {
        access_token: grant.access_token,
        // Providers may omit the refresh token when it is unchanged.
        refresh_token: grant.refresh_token.or(cred.refresh_token),
        expires_at: match grant.expires_in {
            Some(secs) => Some(now + chrono::Duration::seconds(secs)),
            None => cred.expires_at,
        },
        scopes: if grant.scopes.is_empty() {
            cred.scopes
        } else {
            grant.scopes
        },
        updated_at: now,
        ..cred
    }
}

/// `refresh_token` grant against the provider's OAuth token endpoint.
pub struct HttpTokenRefresher {
    client: HttpsClient,
    settings: OAuthSettings,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

impl HttpTokenRefresher {
    pub fn new(client: HttpsClient, settings: OAuthSettings) -> Self {
        Self { client, settings }
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(
        &self,
        provider: Provider,
        refresh_token: &str,
    ) -> std::result::Result<TokenGrant, RefreshError> {
        let Some(client) = self.settings.client_for(provider) else {
            return Err(RefreshError::Rejected(format!(
                "no OAuth client configured for {provider}"
            )));
        };

        let body = {
            let mut form = url::form_urlencoded::Serializer::new(String::new());
            form.append_pair("grant_type", "refresh_token")
                .append_pair("refresh_token", refresh_token)
                .append_pair("client_id", &client.client_id);
            if let Some(secret) = &client.client_secret {
                form.append_pair("client_secret", secret);
            }
            form.finish()
        };

        let request = hyper::Request::builder()
            .method(hyper::Method::POST)
            .uri(client.token_url.as_str())
            .header(hyper::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(hyper::header::ACCEPT, "application/json")
            .body(hyper::Body::from(body))
            .map_err(|e| RefreshError::Rejected(format!("invalid token endpoint: {e}")))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| RefreshError::Transient(e.to_string()))?;
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| RefreshError::Transient(e.to_string()))?;

        if status.is_success() {
            let token: TokenResponse = serde_json::from_slice(&bytes)
                .map_err(|e| RefreshError::Transient(format!("unreadable token response: {e}")))?;
            return Ok(TokenGrant {
                access_token: token.access_token,
                refresh_token: token.refresh_token,
                expires_in: token.expires_in,
                scopes: token
                    .scope
                    .map(|s| s.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default(),
            });
        }

        match status.as_u16() {
            400 | 401 => {
                let reason = serde_json::from_slice::<TokenErrorResponse>(&bytes)
                    .map(|e| match e.error_description {
                        Some(desc) => format!("{}: {}", e.error, desc),
                        None => e.error,
                    })
                    .unwrap_or_else(|_| format!("HTTP {status}"));
                Err(RefreshError::Rejected(reason))
            }
            _ => Err(RefreshError::Transient(format!("HTTP {status}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AuthMethod, NewAccount};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRefresher {
        calls: AtomicUsize,
        delay: Duration,
        reject: bool,
    }

    impl CountingRefresher {
        fn new(delay: Duration, reject: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                reject,
            })
        }
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh(
            &self,
            _provider: Provider,
            _refresh_token: &str,
        ) -> std::result::Result<TokenGrant, RefreshError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if self.reject {
                return Err(RefreshError::Rejected("invalid_grant".into()));
            }
            Ok(TokenGrant {
                access_token: format!("fresh-{n}"),
                refresh_token: None,
                expires_in: Some(3600),
                scopes: vec![],
            })
        }
    }

    async fn setup(refresher: Arc<CountingRefresher>) -> (Database, TokenManager, i64) {
        let db = Database::in_memory().await.unwrap();
        let account = db
            .insert_account(&NewAccount {
                owner: "test@example.com".into(),
                email_address: "test@gmail.com".into(),
                provider: Provider::Google,
                auth_method: AuthMethod::OAuth,
                imap_server: None,
                imap_port: None,
                password: None,
            })
            .await
            .unwrap();
        let manager = TokenManager::new(
            db.clone(),
            Arc::new(db.clone()),
            refresher,
            chrono::Duration::seconds(60),
            Duration::from_secs(5),
        );
        (db, manager, account.id)
    }

    fn credential(account_id: i64, expires_in: i64, refresh: Option<&str>) -> OAuthCredential {
        OAuthCredential {
            account_id,
            provider: Provider::Google,
            access_token: "stale".into(),
            refresh_token: refresh.map(str::to_string),
            expires_at: Some(Utc::now() + chrono::Duration::seconds(expires_in)),
            scopes: vec!["https://mail.google.com/".into()],
            is_active: true,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn valid_token_is_returned_without_refresh() {
        let refresher = CountingRefresher::new(Duration::ZERO, false);
        let (db, manager, id) = setup(refresher.clone()).await;
        db.save_credential(&credential(id, 3600, Some("r"))).await.unwrap();

        assert_eq!(manager.get_valid_token(id, Provider::Google).await.unwrap(), "stale");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn token_inside_margin_is_refreshed_and_persisted() {
        let refresher = CountingRefresher::new(Duration::ZERO, false);
        let (db, manager, id) = setup(refresher.clone()).await;
        db.save_credential(&credential(id, 30, Some("r"))).await.unwrap();

        assert_eq!(manager.get_valid_token(id, Provider::Google).await.unwrap(), "fresh-1");

        let stored = db.get_credential(id, Provider::Google).await.unwrap().unwrap();
        assert_eq!(stored.access_token, "fresh-1");
        assert_eq!(stored.refresh_token.as_deref(), Some("r"));
        assert_eq!(stored.scopes, vec!["https://mail.google.com/"]);
        assert!(!stored.is_expired(Utc::now() + chrono::Duration::seconds(3000)));
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let refresher = CountingRefresher::new(Duration::from_millis(50), false);
        let (db, manager, id) = setup(refresher.clone()).await;
        db.save_credential(&credential(id, -10, Some("r"))).await.unwrap();

        let (a, b, c) = tokio::join!(
            manager.get_valid_token(id, Provider::Google),
            manager.get_valid_token(id, Provider::Google),
            manager.get_valid_token(id, Provider::Google),
        );
        assert_eq!(a.unwrap(), "fresh-1");
        assert_eq!(b.unwrap(), "fresh-1");
        assert_eq!(c.unwrap(), "fresh-1");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_refresh_token_requires_reauth() {
        let refresher = CountingRefresher::new(Duration::ZERO, false);
        let (db, manager, id) = setup(refresher.clone()).await;
        db.save_credential(&credential(id, -10, None)).await.unwrap();

        let err = manager.get_valid_token(id, Provider::Google).await.unwrap_err();
        assert!(matches!(err, SyncError::Credential(_)));
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
        assert!(db.get_account(id).await.unwrap().unwrap().needs_reauth);
    }

    #[tokio::test]
    async fn revoked_refresh_token_requires_reauth() {
        let refresher = CountingRefresher::new(Duration::ZERO, true);
        let (db, manager, id) = setup(refresher).await;
        db.save_credential(&credential(id, -10, Some("revoked"))).await.unwrap();

        let err = manager.get_valid_token(id, Provider::Google).await.unwrap_err();
        assert!(matches!(err, SyncError::Credential(_)));
        assert!(db.get_account(id).await.unwrap().unwrap().needs_reauth);
    }

    #[tokio::test]
    async fn slow_refresh_is_transient() {
        let refresher = CountingRefresher::new(Duration::from_millis(200), false);
        let db = Database::in_memory().await.unwrap();
        let account = db
            .insert_account(&NewAccount {
                owner: "o".into(),
                email_address: "slow@gmail.com".into(),
                provider: Provider::Google,
                auth_method: AuthMethod::OAuth,
                imap_server: None,
                imap_port: None,
                password: None,
            })
            .await
            .unwrap();
        let manager = TokenManager::new(
            db.clone(),
            Arc::new(db.clone()),
            refresher,
            chrono::Duration::seconds(60),
            Duration::from_millis(20),
        );
        db.save_credential(&credential(account.id, -10, Some("r"))).await.unwrap();

        let err = manager.get_valid_token(account.id, Provider::Google).await.unwrap_err();
        assert!(matches!(err, SyncError::TransientProvider(_)));
        assert!(!db.get_account(account.id).await.unwrap().unwrap().needs_reauth);
    }

    #[tokio::test]
    async fn storing_a_connection_reactivates_the_account() {
        let refresher = CountingRefresher::new(Duration::ZERO, false);
        let (db, manager, id) = setup(refresher).await;
        db.set_needs_reauth(id, true).await.unwrap();
        db.set_account_active(id, false).await.unwrap();

        let cred = manager
            .store_connection(
                id,
                Provider::Google,
                TokenGrant {
                    access_token: "new".into(),
                    refresh_token: Some("refresh".into()),
                    expires_in: Some(3600),
                    scopes: vec!["https://mail.google.com/".into()],
                },
            )
            .await
            .unwrap();
        assert!(cred.is_active);

        let account = db.get_account(id).await.unwrap().unwrap();
        assert!(account.is_active);
        assert!(!account.needs_reauth);
        assert_eq!(manager.get_valid_token(id, Provider::Google).await.unwrap(), "new");

        assert!(manager.deactivate_connection(id, Provider::Google).await.unwrap());
        assert!(!db.get_account(id).await.unwrap().unwrap().is_active);
        assert!(matches!(
            manager.get_valid_token(id, Provider::Google).await,
            Err(SyncError::Credential(_))
        ));
        assert!(!manager.deactivate_connection(id, Provider::Microsoft).await.unwrap());
    }
}
