#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use mailsync::accounts::AccountRegistry;
use mailsync::auth::{RefreshError, TokenGrant, TokenManager, TokenRefresher};
use mailsync::config::SyncSettings;
use mailsync::db::Database;
use mailsync::error::{ProviderError, SyncError};
use mailsync::models::{
    Account, AuthMethod, CanonicalMessage, NewAccount, OAuthCredential, PageSummary, Provider,
    SyncRun,
};
use mailsync::provider::{FetchRequest, MailProvider, Page, ProviderAuth, RemoteChange};
use mailsync::sync::{SyncHook, SyncOrchestrator};

pub const INITIAL_TOKEN: &str = "initial-token";

/// What the scripted provider does on its next call.
pub enum Step {
    Page(Page),
    Fail(ProviderError),
    /// Sleeps before answering, long enough to trip the fetch timeout.
    Slow(Duration, Page),
    /// Answers, then expires the stored access token.
    ExpireTokenAfter(Page),
    /// Answers, then takes the messages table offline so the page cannot
    /// be stored.
    BreakStoreAfter(Page),
}

pub struct ScriptedProvider {
    db: Database,
    steps: Mutex<VecDeque<Step>>,
    pub requests: Mutex<Vec<FetchRequest>>,
    pub auths: Mutex<Vec<ProviderAuth>>,
}

impl ScriptedProvider {
    pub fn new(db: Database, steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            db,
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
            auths: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, step: Step) {
        self.steps.lock().unwrap().push_back(step);
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn cursors(&self) -> Vec<Option<String>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.cursor.clone())
            .collect()
    }

    pub fn bearer_tokens(&self) -> Vec<String> {
        self.auths
            .lock()
            .unwrap()
            .iter()
            .filter_map(|auth| match auth {
                ProviderAuth::Bearer(token) => Some(token.clone()),
                ProviderAuth::Password { .. } => None,
            })
            .collect()
    }
}

#[async_trait]
impl MailProvider for ScriptedProvider {
    async fn fetch_page(
        &self,
        account: &Account,
        auth: &ProviderAuth,
        request: &FetchRequest,
    ) -> Result<Page, ProviderError> {
        self.requests.lock().unwrap().push(request.clone());
        self.auths.lock().unwrap().push(auth.clone());
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Page(page)) => Ok(page),
            Some(Step::Fail(err)) => Err(err),
            Some(Step::Slow(delay, page)) => {
                tokio::time::sleep(delay).await;
                Ok(page)
            }
            Some(Step::ExpireTokenAfter(page)) => {
                self.db
                    .expire_credential(account.id, account.provider)
                    .await
                    .unwrap();
                Ok(page)
            }
            Some(Step::BreakStoreAfter(page)) => {
                sqlx::query("ALTER TABLE messages RENAME TO messages_offline")
                    .execute(self.db.pool())
                    .await
                    .unwrap();
                Ok(page)
            }
            None => Ok(last_page(vec![])),
        }
    }
}

pub struct FakeRefresher {
    pub calls: AtomicUsize,
    /// Calls answered with a transient failure before `outcome` applies.
    pub transient_failures: AtomicUsize,
    pub outcome: Mutex<Result<(), RefreshError>>,
}

impl FakeRefresher {
    pub fn new() -> Arc<Self> {
        Self::flaky(0)
    }

    pub fn flaky(transient_failures: usize) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            transient_failures: AtomicUsize::new(transient_failures),
            outcome: Mutex::new(Ok(())),
        })
    }

    pub fn rejecting() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            transient_failures: AtomicUsize::new(0),
            outcome: Mutex::new(Err(RefreshError::Rejected("invalid_grant".into()))),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenRefresher for FakeRefresher {
    async fn refresh(&self, _provider: Provider, _refresh_token: &str) -> Result<TokenGrant, RefreshError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let flaky = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if flaky {
            return Err(RefreshError::Transient("HTTP 503".into()));
        }
        match &*self.outcome.lock().unwrap() {
            Ok(()) => Ok(TokenGrant {
                access_token: format!("fresh-{n}"),
                refresh_token: None,
                expires_in: Some(3600),
                scopes: vec![],
            }),
            Err(RefreshError::Rejected(reason)) => Err(RefreshError::Rejected(reason.clone())),
            Err(RefreshError::Transient(reason)) => Err(RefreshError::Transient(reason.clone())),
        }
    }
}

/// Records hook calls as `<name>:page<N>` and `<name>:finished:<status>`.
pub struct RecordingHook {
    pub name: &'static str,
    pub log: Arc<Mutex<Vec<String>>>,
}

impl SyncHook for RecordingHook {
    fn page_reconciled(&self, _account: &Account, _run_id: i64, summary: &PageSummary) {
        self.log
            .lock()
            .unwrap()
            .push(format!("{}:page{}", self.name, summary.page));
    }

    fn run_finished(&self, _account: &Account, run: &SyncRun) {
        self.log
            .lock()
            .unwrap()
            .push(format!("{}:finished:{}", self.name, run.status));
    }
}

/// Cancels the account's run once the given page has been reconciled.
pub struct CancelAfterPage {
    pub page: i64,
    pub target: OnceLock<Weak<SyncOrchestrator>>,
}

impl SyncHook for CancelAfterPage {
    fn page_reconciled(&self, account: &Account, _run_id: i64, summary: &PageSummary) {
        if summary.page == self.page {
            if let Some(orchestrator) = self.target.get().and_then(Weak::upgrade) {
                orchestrator.cancel(account.id);
            }
        }
    }
}

pub struct Harness {
    pub db: Database,
    pub provider: Arc<ScriptedProvider>,
    pub refresher: Arc<FakeRefresher>,
    pub tokens: Arc<TokenManager>,
    pub account: Account,
}

impl Harness {
    pub async fn new(steps: Vec<Step>) -> Self {
        Self::with_refresher(steps, FakeRefresher::new()).await
    }

    pub async fn with_refresher(steps: Vec<Step>, refresher: Arc<FakeRefresher>) -> Self {
        let db = Database::in_memory().await.unwrap();
        let account = db
            .insert_account(&NewAccount {
                owner: "dana".into(),
                email_address: "dana@gmail.com".into(),
                provider: Provider::Google,
                auth_method: AuthMethod::OAuth,
                imap_server: None,
                imap_port: None,
                password: None,
            })
            .await
            .unwrap();
        db.save_credential(&OAuthCredential {
            account_id: account.id,
            provider: Provider::Google,
            access_token: INITIAL_TOKEN.into(),
            refresh_token: Some("refresh-token".into()),
            expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
            scopes: vec!["https://mail.google.com/".into()],
            is_active: true,
            updated_at: Utc::now(),
        })
        .await
        .unwrap();

        let accounts: Arc<dyn AccountRegistry> = Arc::new(db.clone());
        let tokens = Arc::new(TokenManager::new(
            db.clone(),
            accounts,
            refresher.clone(),
            chrono::Duration::seconds(60),
            Duration::from_secs(1),
        ));
        let provider = ScriptedProvider::new(db.clone(), steps);

        Self {
            db,
            provider,
            refresher,
            tokens,
            account,
        }
    }

    pub fn orchestrator(&self) -> SyncOrchestrator {
        self.orchestrator_with(fast_settings())
    }

    pub fn orchestrator_with(&self, settings: SyncSettings) -> SyncOrchestrator {
        self.orchestrator_with_registry(settings, Arc::new(self.db.clone()))
    }

    pub fn orchestrator_with_registry(
        &self,
        settings: SyncSettings,
        accounts: Arc<dyn AccountRegistry>,
    ) -> SyncOrchestrator {
        SyncOrchestrator::new(
            self.db.clone(),
            accounts,
            self.tokens.clone(),
            self.provider.clone(),
            settings,
        )
    }

    pub async fn restore_store(&self) {
        sqlx::query("ALTER TABLE messages_offline RENAME TO messages")
            .execute(self.db.pool())
            .await
            .unwrap();
    }

    pub async fn expire_token(&self) {
        self.db
            .expire_credential(self.account.id, Provider::Google)
            .await
            .unwrap();
    }
}

/// Account source that cannot record re-authorization flags.
pub struct ReauthUnavailable {
    pub db: Database,
}

#[async_trait]
impl AccountRegistry for ReauthUnavailable {
    async fn get_account(&self, id: i64) -> mailsync::Result<Option<Account>> {
        self.db.get_account(id).await
    }

    async fn active_accounts(&self) -> mailsync::Result<Vec<Account>> {
        self.db.active_accounts().await
    }

    async fn mark_needs_reauth(&self, _id: i64) -> mailsync::Result<()> {
        Err(SyncError::Store(sqlx::Error::PoolTimedOut))
    }
}

pub fn fast_settings() -> SyncSettings {
    SyncSettings {
        page_size: 10,
        fetch_timeout_secs: 5,
        max_retries: 2,
        backoff_base_ms: 1,
        backoff_max_ms: 5,
        ..SyncSettings::default()
    }
}

pub fn message(id: &str, subject: &str) -> CanonicalMessage {
    let mut msg = CanonicalMessage::new(id, Utc::now());
    msg.subject = subject.to_string();
    msg.from_address = "sender@example.com".to_string();
    msg
}

pub fn upserts(ids: &[&str]) -> Vec<RemoteChange> {
    ids.iter()
        .map(|id| RemoteChange::Upsert(message(id, "hello")))
        .collect()
}

pub fn page(changes: Vec<RemoteChange>, cursor: &str) -> Page {
    Page {
        changes,
        next_cursor: Some(cursor.to_string()),
        done: false,
        total_estimate: None,
    }
}

pub fn last_page(changes: Vec<RemoteChange>) -> Page {
    Page {
        changes,
        next_cursor: Some("checkpoint".to_string()),
        done: true,
        total_estimate: None,
    }
}
