//! Gmail REST implementation of [`MailProvider`].

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use google_gmail1::Gmail;
use google_gmail1::api::{Message, MessagePart};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auth::HttpsClient;
use crate::error::ProviderError;
use crate::models::{Account, CanonicalAttachment, CanonicalMessage, SyncKind};
use crate::provider::{FetchRequest, MailProvider, Page, ProviderAuth, RemoteChange};

/// Position inside a Gmail listing. `after` bounds incremental runs; `newest`
/// tracks the latest message seen so the finished run can set the next bound.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct GmailCursor {
    page_token: Option<String>,
    after: Option<i64>,
    newest: Option<i64>,
}

impl GmailCursor {
    fn decode(raw: Option<&str>) -> Self {
        match raw {
            Some(raw) => serde_json::from_str(raw).unwrap_or_else(|e| {
                warn!(error = %e, "discarding unreadable Gmail cursor");
                Self::default()
            }),
            None => Self::default(),
        }
    }

    fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Clone)]
pub struct GmailProvider {
    client: HttpsClient,
}

impl GmailProvider {
    pub fn new(client: HttpsClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MailProvider for GmailProvider {
    async fn fetch_page(
        &self,
        account: &Account,
        auth: &ProviderAuth,
        request: &FetchRequest,
    ) -> Result<Page, ProviderError> {
        let ProviderAuth::Bearer(token) = auth else {
            return Err(ProviderError::Fatal(
                "Gmail accounts must be connected through OAuth".to_string(),
            ));
        };
        let hub = Gmail::new(self.client.clone(), token.clone());
        let cursor = GmailCursor::decode(request.cursor.as_deref());

        let mut req = hub
            .users()
            .messages_list("me")
            .max_results(request.page_size)
            .include_spam_trash(true);
        if request.kind == SyncKind::Folder {
            if let Some(folder) = &request.scope.folder {
                req = req.add_label_ids(folder);
            }
        }
        let query = build_query(request, &cursor);
        if !query.is_empty() {
            req = req.q(&query);
        }
        if let Some(page_token) = &cursor.page_token {
            req = req.page_token(page_token);
        }

        let (_, listing) = req.doit().await.map_err(classify)?;
        let ids: Vec<String> = listing
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| m.id)
            .collect();
        debug!(
            account_id = account.id,
            count = ids.len(),
            query = %query,
            "listed Gmail messages"
        );

        let mut changes = Vec::with_capacity(ids.len());
        let mut newest = cursor.newest;
        for id in ids {
            let fetched = hub
                .users()
                .messages_get("me", &id)
                .format("full")
                .doit()
                .await;
            let msg = match fetched {
                Ok((_, msg)) => msg,
                Err(google_gmail1::Error::JsonDecodeError(_, e)) => {
                    changes.push(RemoteChange::Malformed {
                        provider_message_id: Some(id),
                        reason: format!("undecodable message: {e}"),
                    });
                    continue;
                }
                Err(e) => return Err(classify(e)),
            };
            match map_message(msg) {
                Ok(canonical) => {
                    let received = canonical.received_at.timestamp();
                    newest = Some(newest.map_or(received, |n| n.max(received)));
                    changes.push(RemoteChange::Upsert(canonical));
                }
                Err(reason) => changes.push(RemoteChange::Malformed {
                    provider_message_id: Some(id),
                    reason,
                }),
            }
        }

        let done = listing.next_page_token.is_none();
        let next = if done {
            GmailCursor {
                page_token: None,
                after: newest.or(cursor.after),
                newest,
            }
        } else {
            GmailCursor {
                page_token: listing.next_page_token,
                after: cursor.after,
                newest,
            }
        };

        Ok(Page {
            changes,
            next_cursor: Some(next.encode()),
            done,
            total_estimate: listing.result_size_estimate.map(i64::from),
        })
    }
}

fn build_query(request: &FetchRequest, cursor: &GmailCursor) -> String {
    let mut terms = Vec::new();
    let after = match (request.kind, cursor.after) {
        (SyncKind::Incremental, Some(after)) => Some(after),
        _ => None,
    };
    let from = request.scope.from_date.map(|d| d.timestamp());
    if let Some(bound) = after.into_iter().chain(from).max() {
        terms.push(format!("after:{bound}"));
    }
    if let Some(to) = request.scope.to_date {
        terms.push(format!("before:{}", to.timestamp()));
    }
    terms.join(" ")
}

fn classify(err: google_gmail1::Error) -> ProviderError {
    match err {
        google_gmail1::Error::HttpError(e) => ProviderError::Transient(e.to_string()),
        google_gmail1::Error::Io(e) => ProviderError::Transient(e.to_string()),
        google_gmail1::Error::Failure(response) => {
            let retry_after = response
                .headers()
                .get(hyper::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(std::time::Duration::from_secs);
            match ProviderError::from_status(response.status().as_u16(), "") {
                ProviderError::RateLimited { .. } => ProviderError::RateLimited { retry_after },
                other => other,
            }
        }
        google_gmail1::Error::BadRequest(value) => {
            let code = value
                .pointer("/error/code")
                .and_then(|c| c.as_u64())
                .unwrap_or(400) as u16;
            ProviderError::from_status(code, value.to_string())
        }
        other => ProviderError::Fatal(other.to_string()),
    }
}

fn map_message(msg: Message) -> Result<CanonicalMessage, String> {
    let id = msg
        .id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| "message without id".to_string())?;
    let received_at = msg
        .internal_date
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .ok_or_else(|| format!("message {id} has no internal date"))?;

    let mut canonical = CanonicalMessage::new(id, received_at);
    canonical.thread_id = msg.thread_id.unwrap_or_default();
    canonical.snippet = msg.snippet.unwrap_or_default();
    canonical.size = msg.size_estimate.map(i64::from).unwrap_or(0);

    let labels = msg.label_ids.unwrap_or_default();
    let has = |label: &str| labels.iter().any(|l| l == label);
    canonical.is_read = !has("UNREAD");
    canonical.is_starred = has("STARRED");
    canonical.is_draft = has("DRAFT");
    canonical.is_deleted = has("TRASH");
    canonical.is_spam = has("SPAM");
    canonical.is_important = has("IMPORTANT");
    canonical.labels = labels;

    if let Some(payload) = &msg.payload {
        for header in payload.headers.iter().flatten() {
            let value = header.value.clone().unwrap_or_default();
            match header.name.as_deref() {
                Some("From") => canonical.from_address = value,
                Some("To") => canonical.to = split_addresses(&value),
                Some("Cc") => canonical.cc = split_addresses(&value),
                Some("Bcc") => canonical.bcc = split_addresses(&value),
                Some("Subject") => canonical.subject = value,
                Some("Date") => {
                    if let Ok(sent) = DateTime::parse_from_rfc2822(value.trim()) {
                        canonical.sent_at = sent.with_timezone(&Utc);
                    }
                }
                _ => {}
            }
        }
        canonical.body_plain = extract_body(payload, "text/plain").unwrap_or_default();
        canonical.body_html = extract_body(payload, "text/html").unwrap_or_default();
        collect_attachments(payload, &mut canonical.attachments);
    }

    Ok(canonical)
}

fn split_addresses(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect()
}

fn extract_body(part: &MessagePart, mime_type: &str) -> Option<String> {
    if part.mime_type.as_deref() == Some(mime_type) && part.filename.as_deref().unwrap_or("").is_empty() {
        if let Some(data) = part.body.as_ref().and_then(|b| b.data.as_ref()) {
            return Some(decode_body(data));
        }
    }

    let mut full_body = String::new();
    for p in part.parts.iter().flatten() {
        if let Some(body) = extract_body(p, mime_type) {
            full_body.push_str(&body);
        }
    }
    (!full_body.is_empty()).then_some(full_body)
}

/// The client library has already undone the base64url transfer encoding.
fn decode_body(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

fn collect_attachments(part: &MessagePart, out: &mut Vec<CanonicalAttachment>) {
    let filename = part.filename.as_deref().unwrap_or("");
    if let Some(body) = &part.body {
        if let Some(attachment_id) = body.attachment_id.as_ref().filter(|_| !filename.is_empty()) {
            out.push(CanonicalAttachment {
                provider_attachment_id: attachment_id.clone(),
                filename: filename.to_string(),
                content_type: part.mime_type.clone().unwrap_or_default(),
                size: body.size.map(i64::from).unwrap_or(0),
            });
        }
    }
    for p in part.parts.iter().flatten() {
        collect_attachments(p, out);
    }
}
