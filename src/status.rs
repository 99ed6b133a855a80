//! Read-only projections of sync progress.

use serde::Serialize;
use sqlx::Row;

use crate::db::Database;
use crate::error::Result;
use crate::models::{Account, SyncRun, SyncState, SyncStatusView};

const DASHBOARD_RUNS: i64 = 10;

#[derive(Debug, Clone, Serialize)]
pub struct AccountDashboard {
    pub account: Account,
    pub status: SyncStatusView,
    pub recent_runs: Vec<SyncRun>,
}

#[derive(Clone)]
pub struct StatusReporter {
    db: Database,
}

impl StatusReporter {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Current state of the account, or an idle default when it never synced.
    pub async fn get_status(&self, account_id: i64) -> Result<SyncState> {
        Ok(self
            .db
            .get_sync_state(account_id)
            .await?
            .unwrap_or_else(|| SyncState::new(account_id)))
    }

    pub async fn status_view(&self, account_id: i64) -> Result<SyncStatusView> {
        let state = self.get_status(account_id).await?;
        let needs_reauth = self
            .db
            .get_account(account_id)
            .await?
            .is_some_and(|a| a.needs_reauth);
        Ok(view_of(&state, needs_reauth))
    }

    /// Newest first.
    pub async fn get_recent_runs(&self, account_id: i64, limit: i64) -> Result<Vec<SyncRun>> {
        self.db.recent_runs(account_id, limit).await
    }

    /// Stored, non-deleted messages per account address of `owner`, largest
    /// mailbox first.
    pub async fn message_counts(&self, owner: &str) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT a.email_address AS email_address, COUNT(m.id) AS total
             FROM accounts a LEFT JOIN messages m ON m.account_id = a.id AND m.is_deleted = 0
             WHERE a.owner = ?
             GROUP BY a.id
             ORDER BY total DESC, a.email_address",
        )
        .bind(owner)
        .fetch_all(self.db.pool())
        .await?;

        let mut counts = Vec::with_capacity(rows.len());
        for row in rows {
            counts.push((row.try_get("email_address")?, row.try_get("total")?));
        }
        Ok(counts)
    }

    pub async fn dashboard(&self, owner: &str) -> Result<Vec<AccountDashboard>> {
        let mut entries = Vec::new();
        for account in self.db.accounts_for_owner(owner).await? {
            if !account.is_active {
                continue;
            }
            let state = self.get_status(account.id).await?;
            let recent_runs = self.db.recent_runs(account.id, DASHBOARD_RUNS).await?;
            entries.push(AccountDashboard {
                status: view_of(&state, account.needs_reauth),
                account,
                recent_runs,
            });
        }
        Ok(entries)
    }
}

fn view_of(state: &SyncState, needs_reauth: bool) -> SyncStatusView {
    SyncStatusView {
        is_syncing: state.is_syncing,
        progress: state.progress_percentage(),
        synced_messages: state.synced_messages,
        total_messages: state.total_messages,
        last_sync_completed: state.last_sync_completed,
        last_sync_error: state.last_sync_error.clone(),
        needs_reauth,
    }
}
