//! Idempotent message and attachment persistence.
//!
//! Every write is keyed by (account, provider message id); re-delivering a
//! message overwrites the stored row instead of adding a second one.

use chrono::Utc;
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqliteRow};
use sqlx::Row;
use tracing::debug;

use crate::db::{json_list, Database};
use crate::error::{Result, SyncError};
use crate::models::{AttachmentRecord, CanonicalMessage, MessageRecord};

#[derive(Clone)]
pub struct MessageStore {
    pool: SqlitePool,
}

impl MessageStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Inserts or overwrites one message together with its attachments.
    /// Returns the stored row and whether it was newly created.
    pub async fn upsert_message(
        &self,
        account_id: i64,
        message: &CanonicalMessage,
    ) -> Result<(MessageRecord, bool)> {
        message.validate()?;
        let mut tx = self.pool.begin().await?;
        let result = Self::upsert_in(&mut tx, account_id, message).await?;
        tx.commit().await?;
        Ok(result)
    }

    /// Same as [`upsert_message`](Self::upsert_message) on a caller-owned
    /// connection, so a whole page can share one transaction.
    pub async fn upsert_in(
        conn: &mut SqliteConnection,
        account_id: i64,
        message: &CanonicalMessage,
    ) -> Result<(MessageRecord, bool)> {
        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM messages WHERE account_id = ? AND provider_message_id = ?",
        )
        .bind(account_id)
        .bind(&message.provider_message_id)
        .fetch_optional(&mut *conn)
        .await?;

        let now = Utc::now();
        let message_id: i64 = sqlx::query_scalar(
            "INSERT INTO messages (account_id, provider_message_id, thread_id, subject, from_address,
             to_addresses, cc_addresses, bcc_addresses, snippet, body_plain, body_html, sent_at, received_at,
             is_read, is_starred, is_draft, is_deleted, is_spam, is_important, size, labels,
             created_at, updated_at, last_synced_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(account_id, provider_message_id) DO UPDATE SET thread_id=excluded.thread_id,
             subject=excluded.subject, from_address=excluded.from_address, to_addresses=excluded.to_addresses,
             cc_addresses=excluded.cc_addresses, bcc_addresses=excluded.bcc_addresses, snippet=excluded.snippet,
             body_plain=excluded.body_plain, body_html=excluded.body_html, sent_at=excluded.sent_at,
             received_at=excluded.received_at, is_read=excluded.is_read, is_starred=excluded.is_starred,
             is_draft=excluded.is_draft, is_deleted=excluded.is_deleted, is_spam=excluded.is_spam,
             is_important=excluded.is_important, size=excluded.size, labels=excluded.labels,
             updated_at=excluded.updated_at, last_synced_at=excluded.last_synced_at
             RETURNING id",
        )
        .bind(account_id)
        .bind(&message.provider_message_id)
        .bind(&message.thread_id)
        .bind(&message.subject)
        .bind(&message.from_address)
        .bind(to_json(&message.to)?)
        .bind(to_json(&message.cc)?)
        .bind(to_json(&message.bcc)?)
        .bind(&message.snippet)
        .bind(&message.body_plain)
        .bind(&message.body_html)
        .bind(message.sent_at)
        .bind(message.received_at)
        .bind(message.is_read)
        .bind(message.is_starred)
        .bind(message.is_draft)
        .bind(message.is_deleted)
        .bind(message.is_spam)
        .bind(message.is_important)
        .bind(message.size)
        .bind(to_json(&message.labels)?)
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;

        for attachment in &message.attachments {
            sqlx::query(
                "INSERT INTO attachments (message_id, provider_attachment_id, filename, content_type, size, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(message_id, provider_attachment_id) DO UPDATE SET filename=excluded.filename,
                 content_type=excluded.content_type, size=excluded.size",
            )
            .bind(message_id)
            .bind(&attachment.provider_attachment_id)
            .bind(&attachment.filename)
            .bind(&attachment.content_type)
            .bind(attachment.size)
            .bind(now)
            .execute(&mut *conn)
            .await?;
        }

        let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
            .bind(message_id)
            .fetch_one(&mut *conn)
            .await?;
        let created = existing.is_none();
        debug!(
            account_id,
            provider_message_id = %message.provider_message_id,
            created,
            "message reconciled"
        );
        Ok((message_from_row(&row)?, created))
    }

    /// Flags a message as deleted without removing it. Returns false when the
    /// message was never stored.
    pub async fn mark_deleted(&self, account_id: i64, provider_message_id: &str) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        Self::mark_deleted_in(&mut conn, account_id, provider_message_id).await
    }

    pub async fn mark_deleted_in(
        conn: &mut SqliteConnection,
        account_id: i64,
        provider_message_id: &str,
    ) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE messages SET is_deleted = 1, updated_at = ?, last_synced_at = ?
             WHERE account_id = ? AND provider_message_id = ?",
        )
        .bind(now)
        .bind(now)
        .bind(account_id)
        .bind(provider_message_id)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_message(
        &self,
        account_id: i64,
        provider_message_id: &str,
    ) -> Result<Option<MessageRecord>> {
        let row = sqlx::query(
            "SELECT * FROM messages WHERE account_id = ? AND provider_message_id = ?",
        )
        .bind(account_id)
        .bind(provider_message_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| message_from_row(&r)).transpose()?)
    }

    pub async fn attachments_for(&self, message_id: i64) -> Result<Vec<AttachmentRecord>> {
        let rows = sqlx::query(
            "SELECT id, message_id, provider_attachment_id, filename, content_type, size
             FROM attachments WHERE message_id = ? ORDER BY id",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;

        let attachments = rows
            .into_iter()
            .map(|row| AttachmentRecord {
                id: row.get(0),
                message_id: row.get(1),
                provider_attachment_id: row.get(2),
                filename: row.get(3),
                content_type: row.get(4),
                size: row.get(5),
            })
            .collect();
        Ok(attachments)
    }

    pub async fn count_for_account(&self, account_id: i64) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE account_id = ?")
            .bind(account_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn to_json(values: &[String]) -> Result<String> {
    serde_json::to_string(values).map_err(|e| SyncError::Data(format!("unserializable list: {e}")))
}

fn message_from_row(row: &SqliteRow) -> std::result::Result<MessageRecord, sqlx::Error> {
    Ok(MessageRecord {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        provider_message_id: row.try_get("provider_message_id")?,
        thread_id: row.try_get("thread_id")?,
        subject: row.try_get("subject")?,
        from_address: row.try_get("from_address")?,
        to: json_list(row, "to_addresses")?,
        cc: json_list(row, "cc_addresses")?,
        bcc: json_list(row, "bcc_addresses")?,
        snippet: row.try_get("snippet")?,
        body_plain: row.try_get("body_plain")?,
        body_html: row.try_get("body_html")?,
        sent_at: row.try_get("sent_at")?,
        received_at: row.try_get("received_at")?,
        is_read: row.try_get("is_read")?,
        is_starred: row.try_get("is_starred")?,
        is_draft: row.try_get("is_draft")?,
        is_deleted: row.try_get("is_deleted")?,
        is_spam: row.try_get("is_spam")?,
        is_important: row.try_get("is_important")?,
        size: row.try_get("size")?,
        labels: json_list(row, "labels")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_synced_at: row.try_get("last_synced_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AuthMethod, CanonicalAttachment, NewAccount, Provider};

    async fn setup() -> (MessageStore, i64) {
        let db = Database::in_memory().await.unwrap();
        let account = db
            .insert_account(&NewAccount {
                owner: "test@example.com".into(),
                email_address: "test@example.com".into(),
                provider: Provider::Google,
                auth_method: AuthMethod::OAuth,
                imap_server: None,
                imap_port: None,
                password: None,
            })
            .await
            .unwrap();
        (MessageStore::new(&db), account.id)
    }

    fn message(id: &str, subject: &str) -> CanonicalMessage {
        let mut msg = CanonicalMessage::new(id, Utc::now());
        msg.subject = subject.into();
        msg.from_address = "sender@example.com".into();
        msg.to = vec!["recipient@example.com".into()];
        msg.labels = vec!["INBOX".into()];
        msg.size = 1024;
        msg
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let (store, account_id) = setup().await;
        let msg = message("msg123", "Test Email");

        let (first, created) = store.upsert_message(account_id, &msg).await.unwrap();
        assert!(created);
        let (second, created) = store.upsert_message(account_id, &msg).await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert!(second.last_synced_at >= first.last_synced_at);
        assert_eq!(store.count_for_account(account_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn later_delivery_overwrites_fields() {
        let (store, account_id) = setup().await;
        store
            .upsert_message(account_id, &message("dup", "first"))
            .await
            .unwrap();

        let mut resend = message("dup", "second");
        resend.is_read = true;
        resend.labels = vec!["INBOX".into(), "IMPORTANT".into()];
        store.upsert_message(account_id, &resend).await.unwrap();

        let stored = store.get_message(account_id, "dup").await.unwrap().unwrap();
        assert_eq!(stored.subject, "second");
        assert!(stored.is_read);
        assert_eq!(stored.labels, vec!["INBOX", "IMPORTANT"]);
        assert_eq!(store.count_for_account(account_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn attachments_are_unique_per_message() {
        let (store, account_id) = setup().await;
        let mut msg = message("with-att", "Report");
        msg.attachments = vec![CanonicalAttachment {
            provider_attachment_id: "attach123".into(),
            filename: "test.pdf".into(),
            content_type: "application/pdf".into(),
            size: 2048,
        }];
        let (record, _) = store.upsert_message(account_id, &msg).await.unwrap();

        msg.attachments[0].filename = "renamed.pdf".into();
        store.upsert_message(account_id, &msg).await.unwrap();

        let attachments = store.attachments_for(record.id).await.unwrap();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].filename, "renamed.pdf");
        assert_eq!(attachments[0].size, 2048);
    }

    #[tokio::test]
    async fn invalid_attachment_rolls_back_nothing_written() {
        let (store, account_id) = setup().await;
        let mut msg = message("broken", "Broken");
        msg.attachments = vec![CanonicalAttachment::default()];

        let result = store.upsert_message(account_id, &msg).await;
        assert!(matches!(result, Err(SyncError::Data(_))));
        assert!(store.get_message(account_id, "broken").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deletion_keeps_the_row() {
        let (store, account_id) = setup().await;
        store
            .upsert_message(account_id, &message("gone", "Bye"))
            .await
            .unwrap();

        assert!(store.mark_deleted(account_id, "gone").await.unwrap());
        assert!(!store.mark_deleted(account_id, "never-seen").await.unwrap());

        let stored = store.get_message(account_id, "gone").await.unwrap().unwrap();
        assert!(stored.is_deleted);
        assert_eq!(store.count_for_account(account_id).await.unwrap(), 1);
    }
}
