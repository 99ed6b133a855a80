use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::Row;
use tracing::{debug, info};

use crate::error::{Result, SyncError, UnknownVariant};
use crate::models::{
    Account, NewAccount, OAuthCredential, PageSummary, Provider, RunStatus, SyncKind, SyncRun,
    SyncScope, SyncState,
};

/// SQLite persistence for accounts, credentials and sync bookkeeping.
/// Message rows live behind [`crate::store::MessageStore`].
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        info!(database_url, "opened sync database");
        Ok(Self { pool })
    }

    /// Private in-memory database with the schema applied.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        let schema = include_str!("../schema.sql");
        sqlx::query(schema).execute(&self.pool).await?;
        debug!("schema applied");
        Ok(())
    }

    // ---- accounts ----

    pub async fn insert_account(&self, account: &NewAccount) -> Result<Account> {
        let now = Utc::now();
        let id = sqlx::query(
            "INSERT INTO accounts (owner, email_address, provider, auth_method, imap_server, imap_port, password, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&account.owner)
        .bind(&account.email_address)
        .bind(account.provider.as_str())
        .bind(account.auth_method.as_str())
        .bind(&account.imap_server)
        .bind(account.imap_port)
        .bind(&account.password)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.get_account(id)
            .await?
            .ok_or(SyncError::AccountNotFound(id))
    }

    pub async fn get_account(&self, id: i64) -> Result<Option<Account>> {
        let row = sqlx::query("SELECT * FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| account_from_row(&r)).transpose()?)
    }

    pub async fn active_accounts(&self) -> Result<Vec<Account>> {
        let rows = sqlx::query("SELECT * FROM accounts WHERE is_active = 1 ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(account_from_row)
            .collect::<std::result::Result<_, _>>()?)
    }

    pub async fn accounts_for_owner(&self, owner: &str) -> Result<Vec<Account>> {
        let rows = sqlx::query("SELECT * FROM accounts WHERE owner = ? ORDER BY id")
            .bind(owner)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(account_from_row)
            .collect::<std::result::Result<_, _>>()?)
    }

    pub async fn set_account_active(&self, id: i64, is_active: bool) -> Result<()> {
        sqlx::query("UPDATE accounts SET is_active = ?, updated_at = ? WHERE id = ?")
            .bind(is_active)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_needs_reauth(&self, id: i64, needs_reauth: bool) -> Result<()> {
        sqlx::query("UPDATE accounts SET needs_reauth = ?, updated_at = ? WHERE id = ?")
            .bind(needs_reauth)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- credentials ----

    pub async fn get_credential(
        &self,
        account_id: i64,
        provider: Provider,
    ) -> Result<Option<OAuthCredential>> {
        let row = sqlx::query("SELECT * FROM credentials WHERE account_id = ? AND provider = ?")
            .bind(account_id)
            .bind(provider.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| credential_from_row(&r)).transpose()?)
    }

    pub async fn save_credential(&self, cred: &OAuthCredential) -> Result<()> {
        let scopes = serde_json::to_string(&cred.scopes)
            .map_err(|e| SyncError::Data(format!("unserializable scopes: {e}")))?;
        sqlx::query(
            "INSERT INTO credentials (account_id, provider, access_token, refresh_token, expires_at, scopes, is_active, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(account_id, provider) DO UPDATE SET access_token=excluded.access_token,
             refresh_token=excluded.refresh_token, expires_at=excluded.expires_at, scopes=excluded.scopes,
             is_active=excluded.is_active, updated_at=excluded.updated_at",
        )
        .bind(cred.account_id)
        .bind(cred.provider.as_str())
        .bind(&cred.access_token)
        .bind(&cred.refresh_token)
        .bind(cred.expires_at)
        .bind(scopes)
        .bind(cred.is_active)
        .bind(cred.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Moves the expiry to now so the next token request refreshes.
    pub async fn expire_credential(&self, account_id: i64, provider: Provider) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE credentials SET expires_at = ?, updated_at = ? WHERE account_id = ? AND provider = ?",
        )
        .bind(now)
        .bind(now)
        .bind(account_id)
        .bind(provider.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn deactivate_credential(&self, account_id: i64, provider: Provider) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE credentials SET is_active = 0, updated_at = ? WHERE account_id = ? AND provider = ?",
        )
        .bind(Utc::now())
        .bind(account_id)
        .bind(provider.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ---- sync state ----

    pub async fn get_sync_state(&self, account_id: i64) -> Result<Option<SyncState>> {
        let row = sqlx::query("SELECT * FROM sync_state WHERE account_id = ?")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| sync_state_from_row(&r)).transpose()?)
    }

    pub async fn set_sync_scope(&self, account_id: i64, scope: &SyncScope) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO sync_state (account_id, sync_from_date, sync_to_date, provider_folder, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(account_id) DO UPDATE SET sync_from_date=excluded.sync_from_date,
             sync_to_date=excluded.sync_to_date, provider_folder=excluded.provider_folder,
             updated_at=excluded.updated_at",
        )
        .bind(account_id)
        .bind(scope.from_date)
        .bind(scope.to_date)
        .bind(&scope.folder)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomically claims the account for a new run. The conditional update on
    /// `is_syncing = 0` is the only gate, so two concurrent callers can never
    /// both succeed.
    pub async fn begin_sync(&self, account_id: i64, kind: SyncKind) -> Result<(SyncRun, SyncState)> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO sync_state (account_id, updated_at) VALUES (?, ?) ON CONFLICT(account_id) DO NOTHING",
        )
        .bind(account_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let claimed = sqlx::query(
            "UPDATE sync_state SET is_syncing = 1, last_sync_started = ?, updated_at = ?
             WHERE account_id = ? AND is_syncing = 0",
        )
        .bind(now)
        .bind(now)
        .bind(account_id)
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(SyncError::Conflict { account_id });
        }

        let run_id = sqlx::query(
            "INSERT INTO sync_runs (account_id, kind, status, started_at) VALUES (?, ?, ?, ?)",
        )
        .bind(account_id)
        .bind(kind.as_str())
        .bind(RunStatus::Started.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        let row = sqlx::query("SELECT * FROM sync_state WHERE account_id = ?")
            .bind(account_id)
            .fetch_one(&mut *tx)
            .await?;
        let previous = sync_state_from_row(&row)?;
        let resuming = previous.resume_pending
            && previous.resume_kind == Some(kind)
            && previous.resume_cursor.is_some();

        // A fresh run restarts the counters; a resumed one keeps counting from
        // where the interrupted run stopped.
        if resuming {
            sqlx::query(
                "UPDATE sync_state SET current_run_id = ?, resume_pending = 1, resume_kind = ? WHERE account_id = ?",
            )
            .bind(run_id)
            .bind(kind.as_str())
            .bind(account_id)
            .execute(&mut *tx)
            .await?;
        } else {
            let keep_cursor = kind == SyncKind::Incremental;
            sqlx::query(
                "UPDATE sync_state SET current_run_id = ?, synced_messages = 0, total_messages = 0,
                 resume_pending = 1, resume_kind = ?,
                 resume_cursor = CASE WHEN ? THEN resume_cursor ELSE NULL END
                 WHERE account_id = ?",
            )
            .bind(run_id)
            .bind(kind.as_str())
            .bind(keep_cursor)
            .bind(account_id)
            .execute(&mut *tx)
            .await?;
        }

        let run_row = sqlx::query("SELECT * FROM sync_runs WHERE id = ?")
            .bind(run_id)
            .fetch_one(&mut *tx)
            .await?;
        let state_row = sqlx::query("SELECT * FROM sync_state WHERE account_id = ?")
            .bind(account_id)
            .fetch_one(&mut *tx)
            .await?;
        let run = sync_run_from_row(&run_row)?;
        let state = sync_state_from_row(&state_row)?;

        tx.commit().await?;
        Ok((run, state))
    }

    /// Applies one reconciled page to the run counters and the account's
    /// progress inside the caller's transaction.
    pub async fn record_page(
        conn: &mut SqliteConnection,
        run_id: i64,
        account_id: i64,
        summary: &PageSummary,
        next_cursor: Option<&str>,
        total_estimate: Option<i64>,
    ) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE sync_runs SET status = ?,
             messages_processed = messages_processed + ?, messages_added = messages_added + ?,
             messages_updated = messages_updated + ?, messages_deleted = messages_deleted + ?,
             messages_skipped = messages_skipped + ?, pages_completed = pages_completed + 1
             WHERE id = ? AND status IN ('started', 'in_progress')",
        )
        .bind(RunStatus::InProgress.as_str())
        .bind(summary.processed)
        .bind(summary.added)
        .bind(summary.updated)
        .bind(summary.deleted)
        .bind(summary.skipped)
        .bind(run_id)
        .execute(&mut *conn)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(SyncError::Interrupted);
        }

        // Only stored messages count towards progress; deletions do not.
        let synced = summary.added + summary.updated;
        sqlx::query(
            "UPDATE sync_state SET synced_messages = synced_messages + ?,
             total_messages = MAX(COALESCE(?, total_messages), synced_messages + ?),
             resume_cursor = COALESCE(?, resume_cursor), updated_at = ?
             WHERE account_id = ? AND current_run_id = ?",
        )
        .bind(synced)
        .bind(total_estimate)
        .bind(synced)
        .bind(next_cursor)
        .bind(Utc::now())
        .bind(account_id)
        .bind(run_id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn complete_run(&self, run_id: i64) -> Result<SyncRun> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let run = fetch_run(&mut tx, run_id).await?;
        if !run.status.can_transition_to(RunStatus::Completed) {
            tx.rollback().await?;
            return Ok(run);
        }

        sqlx::query(
            "UPDATE sync_runs SET status = ?, completed_at = ? WHERE id = ? AND status IN ('started', 'in_progress')",
        )
        .bind(RunStatus::Completed.as_str())
        .bind(now)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE sync_state SET is_syncing = 0, current_run_id = NULL, last_sync_completed = ?,
             last_sync_error = NULL, resume_pending = 0, updated_at = ?
             WHERE account_id = ? AND current_run_id = ?",
        )
        .bind(now)
        .bind(now)
        .bind(run.account_id)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        let run = fetch_run(&mut tx, run_id).await?;
        tx.commit().await?;
        Ok(run)
    }

    pub async fn fail_run(&self, run_id: i64, error: &SyncError) -> Result<SyncRun> {
        let now = Utc::now();
        let summary = error.summary();
        let recoverable = error.is_recoverable();
        let mut tx = self.pool.begin().await?;
        let run = fetch_run(&mut tx, run_id).await?;
        if !run.status.can_transition_to(RunStatus::Failed) {
            tx.rollback().await?;
            return Ok(run);
        }

        sqlx::query(
            "UPDATE sync_runs SET status = ?, completed_at = ?, error_kind = ?, error_message = ?, recoverable = ?
             WHERE id = ? AND status IN ('started', 'in_progress')",
        )
        .bind(RunStatus::Failed.as_str())
        .bind(now)
        .bind(error.kind().as_str())
        .bind(&summary)
        .bind(recoverable)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE sync_state SET is_syncing = 0, current_run_id = NULL, last_sync_error = ?,
             resume_pending = ?, updated_at = ?
             WHERE account_id = ? AND current_run_id = ?",
        )
        .bind(&summary)
        .bind(error.keeps_cursor())
        .bind(now)
        .bind(run.account_id)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        let run = fetch_run(&mut tx, run_id).await?;
        tx.commit().await?;
        Ok(run)
    }

    pub async fn get_run(&self, run_id: i64) -> Result<Option<SyncRun>> {
        let row = sqlx::query("SELECT * FROM sync_runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| sync_run_from_row(&r)).transpose()?)
    }

    pub async fn recent_runs(&self, account_id: i64, limit: i64) -> Result<Vec<SyncRun>> {
        let rows = sqlx::query(
            "SELECT * FROM sync_runs WHERE account_id = ? ORDER BY started_at DESC, id DESC LIMIT ?",
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(sync_run_from_row)
            .collect::<std::result::Result<_, _>>()?)
    }

    /// Runs a crash left behind in a non-terminal state.
    pub async fn unfinished_runs(&self) -> Result<Vec<SyncRun>> {
        let rows = sqlx::query(
            "SELECT * FROM sync_runs WHERE status IN ('started', 'in_progress') ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(sync_run_from_row)
            .collect::<std::result::Result<_, _>>()?)
    }

    /// Clears `is_syncing` flags that no longer point at a live run.
    pub async fn clear_orphaned_flags(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE sync_state SET is_syncing = 0, current_run_id = NULL, updated_at = ?
             WHERE is_syncing = 1 AND (current_run_id IS NULL OR current_run_id NOT IN
             (SELECT id FROM sync_runs WHERE status IN ('started', 'in_progress')))",
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

async fn fetch_run(conn: &mut SqliteConnection, run_id: i64) -> Result<SyncRun> {
    let row = sqlx::query("SELECT * FROM sync_runs WHERE id = ?")
        .bind(run_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(sync_run_from_row(&row)?)
}

fn parse_column<T>(row: &SqliteRow, column: &str) -> std::result::Result<T, sqlx::Error>
where
    T: FromStr<Err = UnknownVariant>,
{
    let text: String = row.try_get(column)?;
    text.parse().map_err(|e: UnknownVariant| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}

fn parse_optional_column<T>(row: &SqliteRow, column: &str) -> std::result::Result<Option<T>, sqlx::Error>
where
    T: FromStr<Err = UnknownVariant>,
{
    let text: Option<String> = row.try_get(column)?;
    text.map(|t| {
        t.parse().map_err(|e: UnknownVariant| sqlx::Error::ColumnDecode {
            index: column.to_string(),
            source: Box::new(e),
        })
    })
    .transpose()
}

pub(crate) fn json_list(row: &SqliteRow, column: &str) -> std::result::Result<Vec<String>, sqlx::Error> {
    let text: String = row.try_get(column)?;
    serde_json::from_str(&text).map_err(|e| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}

fn account_from_row(row: &SqliteRow) -> std::result::Result<Account, sqlx::Error> {
    Ok(Account {
        id: row.try_get("id")?,
        owner: row.try_get("owner")?,
        email_address: row.try_get("email_address")?,
        provider: parse_column(row, "provider")?,
        auth_method: parse_column(row, "auth_method")?,
        imap_server: row.try_get("imap_server")?,
        imap_port: row.try_get("imap_port")?,
        password: row.try_get("password")?,
        is_active: row.try_get("is_active")?,
        needs_reauth: row.try_get("needs_reauth")?,
        created_at: row.try_get("created_at")?,
    })
}

fn credential_from_row(row: &SqliteRow) -> std::result::Result<OAuthCredential, sqlx::Error> {
    Ok(OAuthCredential {
        account_id: row.try_get("account_id")?,
        provider: parse_column(row, "provider")?,
        access_token: row.try_get("access_token")?,
        refresh_token: row.try_get("refresh_token")?,
        expires_at: row.try_get::<Option<DateTime<Utc>>, _>("expires_at")?,
        scopes: json_list(row, "scopes")?,
        is_active: row.try_get("is_active")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn sync_state_from_row(row: &SqliteRow) -> std::result::Result<SyncState, sqlx::Error> {
    Ok(SyncState {
        account_id: row.try_get("account_id")?,
        is_syncing: row.try_get("is_syncing")?,
        current_run_id: row.try_get("current_run_id")?,
        last_sync_started: row.try_get("last_sync_started")?,
        last_sync_completed: row.try_get("last_sync_completed")?,
        last_sync_error: row.try_get("last_sync_error")?,
        total_messages: row.try_get("total_messages")?,
        synced_messages: row.try_get("synced_messages")?,
        sync_from_date: row.try_get("sync_from_date")?,
        sync_to_date: row.try_get("sync_to_date")?,
        provider_folder: row.try_get("provider_folder")?,
        resume_cursor: row.try_get("resume_cursor")?,
        resume_kind: parse_optional_column(row, "resume_kind")?,
        resume_pending: row.try_get("resume_pending")?,
    })
}

fn sync_run_from_row(row: &SqliteRow) -> std::result::Result<SyncRun, sqlx::Error> {
    Ok(SyncRun {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        kind: parse_column(row, "kind")?,
        status: parse_column(row, "status")?,
        messages_processed: row.try_get("messages_processed")?,
        messages_added: row.try_get("messages_added")?,
        messages_updated: row.try_get("messages_updated")?,
        messages_deleted: row.try_get("messages_deleted")?,
        messages_skipped: row.try_get("messages_skipped")?,
        pages_completed: row.try_get("pages_completed")?,
        error_kind: parse_optional_column(row, "error_kind")?,
        error_message: row.try_get("error_message")?,
        recoverable: row.try_get("recoverable")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}
