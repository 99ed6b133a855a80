use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Everything that can end or reject a sync operation.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("account {account_id} is already syncing")]
    Conflict { account_id: i64 },

    #[error("re-authorization required: {0}")]
    Credential(String),

    #[error("provider temporarily unavailable: {0}")]
    TransientProvider(String),

    #[error("invalid remote record: {0}")]
    Data(String),

    #[error("storage failure: {0}")]
    Store(#[from] sqlx::Error),

    #[error("provider rejected the request: {0}")]
    Provider(String),

    #[error("sync cancelled")]
    Cancelled,

    #[error("sync interrupted before completion")]
    Interrupted,

    #[error("account {0} not found")]
    AccountNotFound(i64),

    #[error("account {0} is not active")]
    AccountInactive(i64),
}

/// Persisted classification of a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Conflict,
    Credential,
    TransientProvider,
    Data,
    Store,
    Provider,
    Cancelled,
    Interrupted,
    NotFound,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Conflict => "conflict",
            ErrorKind::Credential => "credential",
            ErrorKind::TransientProvider => "transient_provider",
            ErrorKind::Data => "data",
            ErrorKind::Store => "store",
            ErrorKind::Provider => "provider",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::NotFound => "not_found",
        }
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "conflict" => Ok(ErrorKind::Conflict),
            "credential" => Ok(ErrorKind::Credential),
            "transient_provider" => Ok(ErrorKind::TransientProvider),
            "data" => Ok(ErrorKind::Data),
            "store" => Ok(ErrorKind::Store),
            "provider" => Ok(ErrorKind::Provider),
            "cancelled" => Ok(ErrorKind::Cancelled),
            "interrupted" => Ok(ErrorKind::Interrupted),
            "not_found" => Ok(ErrorKind::NotFound),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// A stored enum column held a value this build does not know.
#[derive(Debug, Error)]
#[error("unknown variant: {0}")]
pub struct UnknownVariant(pub String);

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Conflict { .. } => ErrorKind::Conflict,
            SyncError::Credential(_) => ErrorKind::Credential,
            SyncError::TransientProvider(_) => ErrorKind::TransientProvider,
            SyncError::Data(_) => ErrorKind::Data,
            SyncError::Store(_) => ErrorKind::Store,
            SyncError::Provider(_) => ErrorKind::Provider,
            SyncError::Cancelled => ErrorKind::Cancelled,
            SyncError::Interrupted => ErrorKind::Interrupted,
            SyncError::AccountNotFound(_) | SyncError::AccountInactive(_) => ErrorKind::NotFound,
        }
    }

    /// Whether the next run may continue from the saved resume cursor.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::Credential(_)
                | SyncError::TransientProvider(_)
                | SyncError::Cancelled
                | SyncError::Interrupted
        )
    }

    /// Whether the run's checkpoint stays pending for the next run of the
    /// same kind. Store failures keep it even though the run itself is not
    /// recoverable.
    pub fn keeps_cursor(&self) -> bool {
        self.is_recoverable() || matches!(self, SyncError::Store(_))
    }

    /// Short text stored on the run and shown to users. Never carries
    /// transport-level detail.
    pub fn summary(&self) -> String {
        match self {
            SyncError::Conflict { .. } => "A sync is already running for this account".to_string(),
            SyncError::Credential(_) => {
                "The account needs to be re-authorized before it can sync".to_string()
            }
            SyncError::TransientProvider(reason) => format!(
                "The mail provider is temporarily unavailable ({})",
                reason_label(reason).unwrap_or("network error")
            ),
            SyncError::Data(reason) => format!("A remote message could not be read ({reason})"),
            SyncError::Store(_) => "Local storage failed while saving messages".to_string(),
            SyncError::Provider(reason) => format!(
                "The mail provider rejected the sync ({})",
                reason_label(reason).unwrap_or("request refused")
            ),
            SyncError::Cancelled => "The sync was cancelled".to_string(),
            SyncError::Interrupted => "The sync was interrupted before it finished".to_string(),
            SyncError::AccountNotFound(_) => "The account no longer exists".to_string(),
            SyncError::AccountInactive(_) => "The account is disconnected".to_string(),
        }
    }
}

/// Classified part of an error reason that is safe to show: a leading
/// `HTTP <status>`, a timeout or a rate limit.
fn reason_label(reason: &str) -> Option<&str> {
    if let Some(code) = reason.strip_prefix("HTTP ").and_then(|rest| rest.get(..3)) {
        if code.bytes().all(|b| b.is_ascii_digit()) {
            return reason.get(..8);
        }
    }
    if reason.contains("timed out") {
        Some("timed out")
    } else if reason.contains("rate limit") {
        Some("rate limited")
    } else {
        None
    }
}

/// Classified outcome of a failed provider call. The orchestrator switches on
/// this tag and never inspects error text.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("request timed out")]
    Timeout,

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout | ProviderError::RateLimited { .. } | ProviderError::Transient(_)
        )
    }

    /// Classify an HTTP status returned by a provider endpoint.
    pub fn from_status(status: u16, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match status {
            401 => ProviderError::Unauthorized(detail),
            403 if detail.to_ascii_lowercase().contains("ratelimitexceeded") => {
                ProviderError::RateLimited { retry_after: None }
            }
            429 => ProviderError::RateLimited { retry_after: None },
            408 | 500..=599 => ProviderError::Transient(format!("HTTP {status}")),
            _ => ProviderError::Fatal(format!("HTTP {status}: {detail}")),
        }
    }
}

impl From<ProviderError> for SyncError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Timeout => SyncError::TransientProvider("request timed out".to_string()),
            ProviderError::RateLimited { .. } => {
                SyncError::TransientProvider("rate limit exceeded".to_string())
            }
            ProviderError::Transient(reason) => SyncError::TransientProvider(reason),
            ProviderError::Unauthorized(reason) => SyncError::Credential(reason),
            ProviderError::Fatal(reason) => SyncError::Provider(reason),
        }
    }
}
