pub mod accounts;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod gmail;
pub mod models;
pub mod provider;
pub mod status;
pub mod store;
pub mod sync;

pub use accounts::AccountRegistry;
pub use auth::{HttpTokenRefresher, TokenGrant, TokenManager, TokenRefresher};
pub use config::Config;
pub use db::Database;
pub use error::{ErrorKind, ProviderError, Result, SyncError};
pub use provider::{MailProvider, Page, ProviderRouter, RemoteChange};
pub use status::StatusReporter;
pub use store::MessageStore;
pub use sync::{SyncHook, SyncOrchestrator, TriggerResponse};
