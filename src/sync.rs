//! Per-account sync state machine.
//!
//! A run moves `started -> in_progress -> completed | failed`. Each provider
//! page is reconciled in a single transaction, so an interrupted run always
//! leaves the store equal to some whole number of pages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::accounts::AccountRegistry;
use crate::auth::TokenManager;
use crate::config::SyncSettings;
use crate::db::Database;
use crate::error::{ProviderError, Result, SyncError};
use crate::models::{Account, AuthMethod, PageSummary, SyncKind, SyncRun, SyncScope, SyncState};
use crate::provider::{FetchRequest, MailProvider, Page, ProviderAuth, RemoteChange};
use crate::store::MessageStore;

/// Answer to an asynchronous sync request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerResponse {
    Accepted { run_id: i64 },
    Rejected { account_id: i64, reason: String },
}

/// Observer called after each committed page and after a run ends. Hooks run
/// inline on the sync task in registration order.
#[allow(unused_variables)]
pub trait SyncHook: Send + Sync {
    fn page_reconciled(&self, account: &Account, run_id: i64, summary: &PageSummary) {}

    fn run_finished(&self, account: &Account, run: &SyncRun) {}
}

pub struct SyncOrchestrator {
    db: Database,
    accounts: Arc<dyn AccountRegistry>,
    tokens: Arc<TokenManager>,
    provider: Arc<dyn MailProvider>,
    settings: SyncSettings,
    hooks: Vec<Arc<dyn SyncHook>>,
    cancellations: Mutex<HashMap<i64, Arc<AtomicBool>>>,
}

impl SyncOrchestrator {
    pub fn new(
        db: Database,
        accounts: Arc<dyn AccountRegistry>,
        tokens: Arc<TokenManager>,
        provider: Arc<dyn MailProvider>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            db,
            accounts,
            tokens,
            provider,
            settings,
            hooks: Vec::new(),
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn SyncHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Claims the account and records a `started` run. Fails with
    /// [`SyncError::Conflict`] when another run holds the account.
    pub async fn start_sync(&self, account_id: i64, kind: SyncKind) -> Result<(Account, SyncRun, SyncState)> {
        let account = self
            .accounts
            .get_account(account_id)
            .await?
            .ok_or(SyncError::AccountNotFound(account_id))?;
        if !account.is_active {
            return Err(SyncError::AccountInactive(account_id));
        }

        let (run, state) = self.db.begin_sync(account_id, kind).await?;
        self.cancel_flags()
            .insert(account_id, Arc::new(AtomicBool::new(false)));
        info!(
            account_id,
            run_id = run.id,
            kind = %kind,
            resumed_from = state.synced_messages,
            "sync started"
        );
        Ok((account, run, state))
    }

    /// Starts a run and returns immediately; the pages are fetched on a
    /// spawned task.
    pub async fn trigger(self: &Arc<Self>, account_id: i64, kind: SyncKind) -> Result<TriggerResponse> {
        match self.start_sync(account_id, kind).await {
            Ok((account, run, state)) => {
                let run_id = run.id;
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = this.execute(account, run, state).await {
                        error!(account_id, run_id, error = %e, "sync task could not record its outcome");
                    }
                });
                Ok(TriggerResponse::Accepted { run_id })
            }
            Err(e @ SyncError::Conflict { .. }) => Ok(TriggerResponse::Rejected {
                account_id,
                reason: e.summary(),
            }),
            Err(e) => Err(e),
        }
    }

    /// Starts a run and drives it to a terminal state. A failed run is
    /// returned as `Ok` with its recorded error; `Err` means the run could
    /// not be started or its outcome could not be stored.
    pub async fn run_sync(&self, account_id: i64, kind: SyncKind) -> Result<SyncRun> {
        let (account, run, state) = self.start_sync(account_id, kind).await?;
        self.execute(account, run, state).await
    }

    /// Runs every active account concurrently.
    pub async fn sync_all_active(&self, kind: SyncKind) -> Result<Vec<(i64, Result<SyncRun>)>> {
        let accounts = self.accounts.active_accounts().await?;
        let runs = accounts.iter().map(|account| async move {
            (account.id, self.run_sync(account.id, kind).await)
        });
        Ok(join_all(runs).await)
    }

    /// Asks the account's running sync to stop before its next page. Returns
    /// false when nothing is running.
    pub fn cancel(&self, account_id: i64) -> bool {
        match self.cancel_flags().get(&account_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                info!(account_id, "sync cancellation requested");
                true
            }
            None => false,
        }
    }

    pub async fn complete_sync(&self, run_id: i64) -> Result<SyncRun> {
        let run = self.db.complete_run(run_id).await?;
        info!(
            account_id = run.account_id,
            run_id,
            processed = run.messages_processed,
            added = run.messages_added,
            updated = run.messages_updated,
            deleted = run.messages_deleted,
            skipped = run.messages_skipped,
            "sync completed"
        );
        Ok(run)
    }

    pub async fn fail_sync(&self, run_id: i64, err: &SyncError) -> Result<SyncRun> {
        let run = self.db.fail_run(run_id, err).await?;
        warn!(
            account_id = run.account_id,
            run_id,
            kind = err.kind().as_str(),
            recoverable = err.is_recoverable(),
            error = %err,
            "sync failed"
        );
        Ok(run)
    }

    /// Fails every run a previous process left unfinished and releases the
    /// accounts it held. Call once at startup, before any run begins.
    pub async fn recover_interrupted(&self) -> Result<Vec<SyncRun>> {
        let mut recovered = Vec::new();
        for run in self.db.unfinished_runs().await? {
            let failed = self.db.fail_run(run.id, &SyncError::Interrupted).await?;
            warn!(account_id = run.account_id, run_id = run.id, "marked interrupted run as failed");
            recovered.push(failed);
        }
        let released = self.db.clear_orphaned_flags().await?;
        if released > 0 {
            warn!(released, "cleared stale syncing flags");
        }
        Ok(recovered)
    }

    async fn execute(&self, account: Account, run: SyncRun, state: SyncState) -> Result<SyncRun> {
        let outcome = self.drive(&account, &run, &state).await;
        self.cancel_flags().remove(&account.id);

        let finished = match outcome {
            Ok(()) => match self.complete_sync(run.id).await {
                Ok(run) => run,
                Err(e) => {
                    error!(account_id = account.id, run_id = run.id, error = %e, "could not complete run");
                    self.fail_sync(run.id, &e).await?
                }
            },
            Err(e) => {
                if matches!(e, SyncError::Credential(_)) {
                    if let Err(flag_err) = self.accounts.mark_needs_reauth(account.id).await {
                        warn!(
                            account_id = account.id,
                            error = %flag_err,
                            "could not flag account for re-authorization"
                        );
                    }
                }
                self.fail_sync(run.id, &e).await?
            }
        };
        for hook in &self.hooks {
            hook.run_finished(&account, &finished);
        }
        Ok(finished)
    }

    async fn drive(&self, account: &Account, run: &SyncRun, state: &SyncState) -> Result<()> {
        let cancelled = self.cancel_flag(account.id);
        let scope = SyncScope {
            from_date: state.sync_from_date,
            to_date: state.sync_to_date,
            folder: match run.kind {
                SyncKind::Folder => Some(
                    state
                        .provider_folder
                        .clone()
                        .unwrap_or_else(|| self.settings.default_folder.clone()),
                ),
                SyncKind::Full | SyncKind::Incremental => None,
            },
        };
        let mut cursor = state.starting_cursor(run.kind);
        let mut page_number = 0;

        loop {
            if cancelled.load(Ordering::SeqCst) {
                return Err(SyncError::Cancelled);
            }

            let request = FetchRequest {
                kind: run.kind,
                cursor: cursor.clone(),
                scope: scope.clone(),
                page_size: self.settings.page_size,
            };
            let page = self.fetch_with_retry(account, &request).await?;
            page_number += 1;

            let summary = self.reconcile_page(account, run.id, page_number, &page).await?;
            for hook in &self.hooks {
                hook.page_reconciled(account, run.id, &summary);
            }

            if page.done {
                return Ok(());
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => {
                    warn!(account_id = account.id, run_id = run.id, "provider page has no continuation, stopping");
                    return Ok(());
                }
            }
        }
    }

    async fn fetch_with_retry(&self, account: &Account, request: &FetchRequest) -> Result<Page> {
        let mut attempt = 0;
        let mut refreshed = false;
        loop {
            let auth = match self.auth_for(account).await {
                Ok(auth) => auth,
                Err(SyncError::TransientProvider(reason)) if attempt < self.settings.max_retries => {
                    let delay = self.settings.backoff(attempt);
                    attempt += 1;
                    warn!(
                        account_id = account.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "token refresh failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let fetched = tokio::time::timeout(
                self.settings.fetch_timeout(),
                self.provider.fetch_page(account, &auth, request),
            )
            .await
            .unwrap_or(Err(ProviderError::Timeout));

            match fetched {
                Ok(page) => return Ok(page),
                Err(ProviderError::Unauthorized(reason))
                    if !refreshed && account.auth_method == AuthMethod::OAuth =>
                {
                    warn!(account_id = account.id, reason = %reason, "provider rejected the access token, refreshing");
                    self.tokens.invalidate(account.id, account.provider).await?;
                    refreshed = true;
                }
                Err(err) if err.is_transient() && attempt < self.settings.max_retries => {
                    let delay = match &err {
                        ProviderError::RateLimited {
                            retry_after: Some(after),
                        } => *after,
                        _ => self.settings.backoff(attempt),
                    };
                    attempt += 1;
                    warn!(
                        account_id = account.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient provider failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!(account_id = account.id, attempt, error = %err, "provider fetch failed");
                    return Err(err.into());
                }
            }
        }
    }

    async fn auth_for(&self, account: &Account) -> Result<ProviderAuth> {
        match account.auth_method {
            AuthMethod::OAuth => {
                let token = self.tokens.get_valid_token(account.id, account.provider).await?;
                Ok(ProviderAuth::Bearer(token))
            }
            AuthMethod::Password => {
                let password = account
                    .password
                    .clone()
                    .ok_or_else(|| SyncError::Credential("no password stored".to_string()))?;
                Ok(ProviderAuth::Password {
                    username: account.email_address.clone(),
                    password,
                })
            }
        }
    }

    async fn reconcile_page(
        &self,
        account: &Account,
        run_id: i64,
        page_number: i64,
        page: &Page,
    ) -> Result<PageSummary> {
        let mut summary = PageSummary {
            page: page_number,
            ..PageSummary::default()
        };
        let mut tx = self.db.pool().begin().await?;

        for change in &page.changes {
            match change {
                RemoteChange::Upsert(message) => {
                    if let Err(e) = message.validate() {
                        warn!(
                            account_id = account.id,
                            run_id,
                            provider_message_id = %message.provider_message_id,
                            error = %e,
                            "skipping invalid message"
                        );
                        summary.skipped += 1;
                        continue;
                    }
                    let (_, created) = MessageStore::upsert_in(&mut tx, account.id, message).await?;
                    summary.processed += 1;
                    if created {
                        summary.added += 1;
                    } else {
                        summary.updated += 1;
                    }
                }
                RemoteChange::Deleted { provider_message_id } => {
                    summary.processed += 1;
                    if MessageStore::mark_deleted_in(&mut tx, account.id, provider_message_id).await? {
                        summary.deleted += 1;
                    }
                }
                RemoteChange::Malformed {
                    provider_message_id,
                    reason,
                } => {
                    warn!(
                        account_id = account.id,
                        run_id,
                        provider_message_id = provider_message_id.as_deref().unwrap_or("-"),
                        reason = %reason,
                        "skipping malformed record"
                    );
                    summary.skipped += 1;
                }
            }
        }

        Database::record_page(
            &mut tx,
            run_id,
            account.id,
            &summary,
            page.next_cursor.as_deref(),
            page.total_estimate,
        )
        .await?;
        tx.commit().await?;

        debug!(
            account_id = account.id,
            run_id,
            page = page_number,
            processed = summary.processed,
            added = summary.added,
            updated = summary.updated,
            skipped = summary.skipped,
            "page reconciled"
        );
        Ok(summary)
    }

    fn cancel_flag(&self, account_id: i64) -> Arc<AtomicBool> {
        self.cancel_flags()
            .entry(account_id)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    fn cancel_flags(&self) -> std::sync::MutexGuard<'_, HashMap<i64, Arc<AtomicBool>>> {
        self.cancellations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
