use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, SyncError, UnknownVariant};

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant(other.to_string())),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Google,
    Microsoft,
    Yahoo,
    Imap,
}

text_enum!(Provider {
    Google => "google",
    Microsoft => "microsoft",
    Yahoo => "yahoo",
    Imap => "imap",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    OAuth,
    Password,
}

text_enum!(AuthMethod {
    OAuth => "oauth",
    Password => "password",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub owner: String,
    pub email_address: String,
    pub provider: Provider,
    pub auth_method: AuthMethod,
    pub imap_server: Option<String>,
    pub imap_port: Option<i64>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub is_active: bool,
    pub needs_reauth: bool,
    pub created_at: DateTime<Utc>,
}

/// Connection parameters for registering an account.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub owner: String,
    pub email_address: String,
    pub provider: Provider,
    pub auth_method: AuthMethod,
    pub imap_server: Option<String>,
    pub imap_port: Option<i64>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthCredential {
    pub account_id: i64,
    pub provider: Provider,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    pub is_active: bool,
    pub updated_at: DateTime<Utc>,
}

impl OAuthCredential {
    /// A token without an expiry is never trusted.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => now >= expires_at,
            None => true,
        }
    }

    pub fn is_usable_for(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        !self.is_expired(now + margin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncKind {
    Full,
    Incremental,
    Folder,
}

text_enum!(SyncKind {
    Full => "full",
    Incremental => "incremental",
    Folder => "folder",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Started,
    InProgress,
    Completed,
    Failed,
}

text_enum!(RunStatus {
    Started => "started",
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
});

impl RunStatus {
    /// Transitions only move forward; terminal states never change.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match (self, next) {
            (RunStatus::Started, RunStatus::Started) => false,
            (RunStatus::Started, _) => true,
            (RunStatus::InProgress, RunStatus::Started) => false,
            (RunStatus::InProgress, _) => true,
            (RunStatus::Completed | RunStatus::Failed, _) => false,
        }
    }
}

/// One attempt to synchronize one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: i64,
    pub account_id: i64,
    pub kind: SyncKind,
    pub status: RunStatus,
    pub messages_processed: i64,
    pub messages_added: i64,
    pub messages_updated: i64,
    pub messages_deleted: i64,
    pub messages_skipped: i64,
    pub pages_completed: i64,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub recoverable: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Current aggregate view of one account's sync health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    pub account_id: i64,
    pub is_syncing: bool,
    pub current_run_id: Option<i64>,
    pub last_sync_started: Option<DateTime<Utc>>,
    pub last_sync_completed: Option<DateTime<Utc>>,
    pub last_sync_error: Option<String>,
    pub total_messages: i64,
    pub synced_messages: i64,
    pub sync_from_date: Option<DateTime<Utc>>,
    pub sync_to_date: Option<DateTime<Utc>>,
    pub provider_folder: Option<String>,
    pub resume_cursor: Option<String>,
    pub resume_kind: Option<SyncKind>,
    pub resume_pending: bool,
}

impl SyncState {
    pub fn new(account_id: i64) -> Self {
        Self {
            account_id,
            is_syncing: false,
            current_run_id: None,
            last_sync_started: None,
            last_sync_completed: None,
            last_sync_error: None,
            total_messages: 0,
            synced_messages: 0,
            sync_from_date: None,
            sync_to_date: None,
            provider_folder: None,
            resume_cursor: None,
            resume_kind: None,
            resume_pending: false,
        }
    }

    pub fn progress_percentage(&self) -> u8 {
        if self.total_messages <= 0 {
            return 0;
        }
        let synced = self.synced_messages.max(0);
        (synced.saturating_mul(100) / self.total_messages).min(100) as u8
    }

    pub fn is_complete(&self) -> bool {
        self.total_messages > 0 && self.synced_messages >= self.total_messages
    }

    /// Cursor a new run of `kind` starts from. Incremental runs always build
    /// on the last checkpoint; full and folder runs only pick up a cursor left
    /// by an unfinished run of the same kind.
    pub fn starting_cursor(&self, kind: SyncKind) -> Option<String> {
        match kind {
            SyncKind::Incremental => self.resume_cursor.clone(),
            SyncKind::Full | SyncKind::Folder => {
                if self.resume_pending && self.resume_kind == Some(kind) {
                    self.resume_cursor.clone()
                } else {
                    None
                }
            }
        }
    }
}

/// Counts for one reconciled page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSummary {
    pub page: i64,
    pub processed: i64,
    pub added: i64,
    pub updated: i64,
    pub deleted: i64,
    pub skipped: i64,
}

/// Date range and folder a sync is limited to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncScope {
    pub from_date: Option<DateTime<Utc>>,
    pub to_date: Option<DateTime<Utc>>,
    pub folder: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalAttachment {
    pub provider_attachment_id: String,
    pub filename: String,
    pub content_type: String,
    pub size: i64,
}

/// Provider-agnostic form of one remote message, the upsert input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalMessage {
    pub provider_message_id: String,
    pub thread_id: String,
    pub subject: String,
    pub from_address: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub snippet: String,
    pub body_plain: String,
    pub body_html: String,
    pub sent_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub is_read: bool,
    pub is_starred: bool,
    pub is_draft: bool,
    pub is_deleted: bool,
    pub is_spam: bool,
    pub is_important: bool,
    pub size: i64,
    pub labels: Vec<String>,
    pub attachments: Vec<CanonicalAttachment>,
}

impl CanonicalMessage {
    pub fn new(provider_message_id: impl Into<String>, received_at: DateTime<Utc>) -> Self {
        Self {
            provider_message_id: provider_message_id.into(),
            thread_id: String::new(),
            subject: String::new(),
            from_address: String::new(),
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            snippet: String::new(),
            body_plain: String::new(),
            body_html: String::new(),
            sent_at: received_at,
            received_at,
            is_read: false,
            is_starred: false,
            is_draft: false,
            is_deleted: false,
            is_spam: false,
            is_important: false,
            size: 0,
            labels: Vec::new(),
            attachments: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.provider_message_id.trim().is_empty() {
            return Err(SyncError::Data("message has no provider id".to_string()));
        }
        if self.from_address.trim().is_empty() && !self.is_draft {
            return Err(SyncError::Data(format!(
                "message {} has no sender",
                self.provider_message_id
            )));
        }
        if self.size < 0 {
            return Err(SyncError::Data(format!(
                "message {} has a negative size",
                self.provider_message_id
            )));
        }
        if let Some(att) = self
            .attachments
            .iter()
            .find(|a| a.provider_attachment_id.trim().is_empty())
        {
            return Err(SyncError::Data(format!(
                "attachment {:?} of message {} has no provider id",
                att.filename, self.provider_message_id
            )));
        }
        Ok(())
    }
}

/// Stored message row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: i64,
    pub account_id: i64,
    pub provider_message_id: String,
    pub thread_id: String,
    pub subject: String,
    pub from_address: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub snippet: String,
    pub body_plain: String,
    pub body_html: String,
    pub sent_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub is_read: bool,
    pub is_starred: bool,
    pub is_draft: bool,
    pub is_deleted: bool,
    pub is_spam: bool,
    pub is_important: bool,
    pub size: i64,
    pub labels: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub id: i64,
    pub message_id: i64,
    pub provider_attachment_id: String,
    pub filename: String,
    pub content_type: String,
    pub size: i64,
}

/// JSON status object served to dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatusView {
    pub is_syncing: bool,
    pub progress: u8,
    pub synced_messages: i64,
    pub total_messages: i64,
    pub last_sync_completed: Option<DateTime<Utc>>,
    pub last_sync_error: Option<String>,
    pub needs_reauth: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(synced: i64, total: i64) -> SyncState {
        SyncState {
            synced_messages: synced,
            total_messages: total,
            ..SyncState::new(1)
        }
    }

    #[test]
    fn progress_is_zero_without_a_total() {
        assert_eq!(state(0, 0).progress_percentage(), 0);
        assert_eq!(state(250, 0).progress_percentage(), 0);
    }

    #[test]
    fn progress_floors_and_caps() {
        assert_eq!(state(50, 100).progress_percentage(), 50);
        assert_eq!(state(2, 3).progress_percentage(), 66);
        assert_eq!(state(130, 100).progress_percentage(), 100);
        assert!(state(100, 100).is_complete());
        assert!(!state(99, 100).is_complete());
        assert!(!state(0, 0).is_complete());
    }

    #[test]
    fn run_status_never_regresses() {
        assert!(RunStatus::Started.can_transition_to(RunStatus::InProgress));
        assert!(RunStatus::InProgress.can_transition_to(RunStatus::InProgress));
        assert!(RunStatus::InProgress.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::InProgress));
        assert!(!RunStatus::Failed.can_transition_to(RunStatus::Completed));
        assert!(!RunStatus::InProgress.can_transition_to(RunStatus::Started));
    }

    #[test]
    fn credentials_without_expiry_are_expired() {
        let now = Utc::now();
        let mut cred = OAuthCredential {
            account_id: 1,
            provider: Provider::Google,
            access_token: "a".into(),
            refresh_token: None,
            expires_at: None,
            scopes: vec![],
            is_active: true,
            updated_at: now,
        };
        assert!(cred.is_expired(now));

        cred.expires_at = Some(now + chrono::Duration::seconds(30));
        assert!(!cred.is_expired(now));
        assert!(!cred.is_usable_for(now, chrono::Duration::seconds(60)));
        assert!(cred.is_usable_for(now, chrono::Duration::seconds(10)));
    }

    #[test]
    fn full_runs_only_resume_their_own_cursor() {
        let mut st = SyncState::new(1);
        st.resume_cursor = Some("page-3".into());
        st.resume_kind = Some(SyncKind::Full);

        assert_eq!(st.starting_cursor(SyncKind::Full), None);
        assert_eq!(st.starting_cursor(SyncKind::Incremental).as_deref(), Some("page-3"));

        st.resume_pending = true;
        assert_eq!(st.starting_cursor(SyncKind::Full).as_deref(), Some("page-3"));
        assert_eq!(st.starting_cursor(SyncKind::Folder), None);
    }

    #[test]
    fn validation_rejects_unidentifiable_messages() {
        let now = Utc::now();
        let mut msg = CanonicalMessage::new("", now);
        assert!(matches!(msg.validate(), Err(SyncError::Data(_))));

        msg.provider_message_id = "m1".into();
        assert!(msg.validate().is_err());

        msg.from_address = "a@example.com".into();
        assert!(msg.validate().is_ok());

        msg.attachments.push(CanonicalAttachment::default());
        assert!(msg.validate().is_err());
    }
}
