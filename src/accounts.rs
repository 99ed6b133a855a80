use async_trait::async_trait;

use crate::db::Database;
use crate::error::Result;
use crate::models::Account;

/// Source of authorized mail accounts. Registration and login live outside
/// this crate; the engine only reads accounts and flags them for re-auth.
#[async_trait]
pub trait AccountRegistry: Send + Sync {
    async fn get_account(&self, id: i64) -> Result<Option<Account>>;

    async fn active_accounts(&self) -> Result<Vec<Account>>;

    async fn mark_needs_reauth(&self, id: i64) -> Result<()>;
}

#[async_trait]
impl AccountRegistry for Database {
    async fn get_account(&self, id: i64) -> Result<Option<Account>> {
        Database::get_account(self, id).await
    }

    async fn active_accounts(&self) -> Result<Vec<Account>> {
        Database::active_accounts(self).await
    }

    async fn mark_needs_reauth(&self, id: i64) -> Result<()> {
        self.set_needs_reauth(id, true).await
    }
}
