use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::models::{Account, CanonicalMessage, Provider, SyncKind, SyncScope};

/// Credentials handed to a provider for one fetch.
#[derive(Clone)]
pub enum ProviderAuth {
    Bearer(String),
    Password { username: String, password: String },
}

impl std::fmt::Debug for ProviderAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderAuth::Bearer(_) => f.write_str("Bearer(..)"),
            ProviderAuth::Password { username, .. } => {
                write!(f, "Password {{ username: {username:?}, .. }}")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub kind: SyncKind,
    /// Opaque position returned by the previous page or run.
    pub cursor: Option<String>,
    pub scope: SyncScope,
    pub page_size: u32,
}

/// One remote change, in the order the provider delivered it.
#[derive(Debug, Clone)]
pub enum RemoteChange {
    Upsert(CanonicalMessage),
    Deleted { provider_message_id: String },
    /// A record the provider sent but that could not be mapped.
    Malformed {
        provider_message_id: Option<String>,
        reason: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct Page {
    pub changes: Vec<RemoteChange>,
    /// Checkpoint to persist after this page is reconciled.
    pub next_cursor: Option<String>,
    /// True when the provider has nothing further for this run.
    pub done: bool,
    pub total_estimate: Option<i64>,
}

/// Paged view of a remote mailbox.
#[async_trait]
pub trait MailProvider: Send + Sync {
    async fn fetch_page(
        &self,
        account: &Account,
        auth: &ProviderAuth,
        request: &FetchRequest,
    ) -> Result<Page, ProviderError>;
}

/// Dispatches each account to the adapter registered for its provider.
#[derive(Clone, Default)]
pub struct ProviderRouter {
    adapters: HashMap<Provider, Arc<dyn MailProvider>>,
}

impl ProviderRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: Provider, adapter: Arc<dyn MailProvider>) -> Self {
        self.adapters.insert(provider, adapter);
        self
    }
}

#[async_trait]
impl MailProvider for ProviderRouter {
    async fn fetch_page(
        &self,
        account: &Account,
        auth: &ProviderAuth,
        request: &FetchRequest,
    ) -> Result<Page, ProviderError> {
        match self.adapters.get(&account.provider) {
            Some(adapter) => adapter.fetch_page(account, auth, request).await,
            None => Err(ProviderError::Fatal(format!(
                "no mail adapter for {} accounts",
                account.provider
            ))),
        }
    }
}
