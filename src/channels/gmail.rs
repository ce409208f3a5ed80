//! Gmail fetcher: lists labelled messages newer than a bound and decodes
//! them into candidate items.
//!
//! Messages are fetched in `raw` format and parsed with `mail-parser`, so
//! the body and attachments come from one RFC 822 document.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::channels::gmail_auth::AccessTokenProvider;
use crate::error::FetchError;
use crate::pipeline::types::{Attachment, CandidateItem, ItemFetcher};

pub const DEFAULT_GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";

/// Gmail emits URL-safe base64, with or without padding.
const GMAIL_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    id: String,
    /// Milliseconds since the epoch, as a string.
    internal_date: String,
    raw: String,
}

// ── Client ──────────────────────────────────────────────────────────

pub struct GmailClient {
    http: reqwest::Client,
    api_base: String,
    label: String,
    auth: Arc<dyn AccessTokenProvider>,
}

impl GmailClient {
    pub fn new(
        api_base: impl Into<String>,
        label: impl Into<String>,
        auth: Arc<dyn AccessTokenProvider>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            label: label.into(),
            auth,
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
        what: &str,
    ) -> Result<T, FetchError> {
        let token = self.auth.access_token().await?;
        let resp = self
            .http
            .get(url)
            .bearer_auth(token.expose_secret())
            .query(query)
            .send()
            .await
            .map_err(|e| FetchError::Request(e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::Auth(format!("{status}: {body}")));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::Http { status, body });
        }

        resp.json::<T>().await.map_err(|e| FetchError::Decode {
            id: what.to_string(),
            reason: e.to_string(),
        })
    }

    /// Ids of all messages matching `query`, across pages.
    async fn list_message_ids(&self, query: &str) -> Result<Vec<String>, FetchError> {
        let url = format!("{}/users/me/messages", self.api_base);
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut params = vec![("q", query)];
            if let Some(token) = page_token.as_deref() {
                params.push(("pageToken", token));
            }
            let page: ListResponse = self.get(&url, &params, "message list").await?;
            ids.extend(page.messages.into_iter().map(|m| m.id));

            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }
        Ok(ids)
    }

    async fn fetch_message(&self, id: &str) -> Result<RawMessage, FetchError> {
        let url = format!("{}/users/me/messages/{id}", self.api_base);
        self.get(&url, &[("format", "raw")], id).await
    }
}

#[async_trait]
impl ItemFetcher for GmailClient {
    fn name(&self) -> &str {
        "gmail"
    }

    async fn fetch_since(&self, after: DateTime<Utc>) -> Result<Vec<CandidateItem>, FetchError> {
        let query = search_query(&self.label, after);
        let ids = self.list_message_ids(&query).await?;
        debug!(query = %query, count = ids.len(), "Listed Gmail messages");

        let mut items = Vec::with_capacity(ids.len());
        for id in &ids {
            let message = self.fetch_message(id).await?;
            // A message we cannot read must not hold back the rest of the mailbox.
            let item = match decode_message(&message) {
                Ok(item) => item,
                Err(e) => {
                    warn!(message_id = %id, error = %e, "Skipping undecodable message");
                    continue;
                }
            };
            // Gmail's `after:` has second granularity; enforce the exclusive bound here.
            if item.received_at > after {
                items.push(item);
            }
        }
        items.sort_by_key(|i| i.received_at);
        Ok(items)
    }
}

// ── Decoding ────────────────────────────────────────────────────────

fn search_query(label: &str, after: DateTime<Utc>) -> String {
    format!("label:{label} after:{}", after.timestamp())
}

fn decode_message(message: &RawMessage) -> Result<CandidateItem, FetchError> {
    let decode_err = |reason: String| FetchError::Decode {
        id: message.id.clone(),
        reason,
    };

    let millis: i64 = message
        .internal_date
        .parse()
        .map_err(|e| decode_err(format!("internalDate {:?}: {e}", message.internal_date)))?;
    let received_at = DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| decode_err(format!("internalDate {millis} out of range")))?;

    let bytes = GMAIL_BASE64
        .decode(message.raw.trim())
        .map_err(|e| decode_err(format!("base64: {e}")))?;
    let parsed = MessageParser::default()
        .parse(&bytes)
        .ok_or_else(|| decode_err("not an RFC 822 message".into()))?;

    let attachments = parsed
        .attachments()
        .map(|part| Attachment {
            name: part.attachment_name().map(str::to_string),
            content_type: part.content_type().map(|ct| match ct.subtype() {
                Some(sub) => format!("{}/{sub}", ct.ctype()),
                None => ct.ctype().to_string(),
            }),
            data: part.contents().to_vec(),
        })
        .collect();

    Ok(CandidateItem {
        id: message.id.clone(),
        sender: extract_sender(&parsed),
        subject: parsed.subject().unwrap_or("(no subject)").to_string(),
        body: extract_text(&parsed),
        attachments,
        received_at,
    })
}

fn extract_sender(parsed: &mail_parser::Message) -> String {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address().or(a.name()))
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into())
}

/// First text body. `mail-parser` converts HTML-only messages to text.
fn extract_text(parsed: &mail_parser::Message) -> String {
    parsed
        .body_text(0)
        .map(|text| text.trim().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const MULTIPART: &str = "From: Acme Billing <billing@acme.nl>\r\n\
To: me@example.com\r\n\
Subject: Factuur 2026-0042\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"XYZ\"\r\n\
\r\n\
--XYZ\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Please find the invoice attached.\r\n\
--XYZ\r\n\
Content-Type: application/pdf; name=\"factuur.pdf\"\r\n\
Content-Disposition: attachment; filename=\"factuur.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0xLjcK\r\n\
--XYZ--\r\n";

    fn raw(id: &str, rfc822: &str, millis: i64) -> RawMessage {
        RawMessage {
            id: id.into(),
            internal_date: millis.to_string(),
            raw: base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(rfc822),
        }
    }

    #[test]
    fn query_uses_label_and_unix_seconds() {
        let after = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(search_query("invoices", after), "label:invoices after:1767225600");
    }

    #[test]
    fn decodes_multipart_message() {
        let item = decode_message(&raw("abc", MULTIPART, 1_767_225_600_123)).unwrap();

        assert_eq!(item.id, "abc");
        assert_eq!(item.sender, "billing@acme.nl");
        assert_eq!(item.subject, "Factuur 2026-0042");
        assert!(item.body.contains("invoice attached"));
        assert_eq!(item.received_at.timestamp_millis(), 1_767_225_600_123);

        assert_eq!(item.attachments.len(), 1);
        let pdf = &item.attachments[0];
        assert_eq!(pdf.name.as_deref(), Some("factuur.pdf"));
        assert_eq!(pdf.content_type.as_deref(), Some("application/pdf"));
        assert!(pdf.is_pdf());
    }

    #[test]
    fn accepts_padded_base64() {
        let mut message = raw("p", "Subject: hi\r\n\r\nbody\r\n", 0);
        message.raw = base64::engine::general_purpose::URL_SAFE.encode("Subject: hi\r\n\r\nbody\r\n");
        let item = decode_message(&message).unwrap();
        assert_eq!(item.subject, "hi");
        assert_eq!(item.sender, "unknown");
    }

    #[test]
    fn html_only_body_becomes_text() {
        let html = "From: a@b.c\r\nSubject: x\r\nContent-Type: text/html\r\n\r\n<p>Total <b>EUR 10</b></p>\r\n";
        let item = decode_message(&raw("h", html, 0)).unwrap();
        assert_eq!(item.body, "Total EUR 10");
    }

    #[test]
    fn bad_internal_date_is_decode_error() {
        let mut message = raw("d", "Subject: x\r\n\r\ny", 0);
        message.internal_date = "yesterday".into();
        assert!(matches!(
            decode_message(&message),
            Err(FetchError::Decode { id, .. }) if id == "d"
        ));
    }

    #[test]
    fn list_response_tolerates_missing_messages() {
        let page: ListResponse = serde_json::from_str(r#"{"resultSizeEstimate": 0}"#).unwrap();
        assert!(page.messages.is_empty());
        assert!(page.next_page_token.is_none());
    }

    // ── Fake API ────────────────────────────────────────────────────

    struct StaticToken;

    #[async_trait]
    impl AccessTokenProvider for StaticToken {
        async fn access_token(&self) -> Result<secrecy::SecretString, FetchError> {
            Ok(secrecy::SecretString::from("test-token"))
        }
    }

    /// Two pages: m2 then m1, plus m0 which sits exactly on the bound.
    async fn serve_fake_gmail(status: axum::http::StatusCode) -> String {
        use axum::extract::{Path, Query};
        use axum::http::HeaderMap;
        use axum::{Json, Router, routing::get};
        use std::collections::HashMap;

        async fn list(
            headers: HeaderMap,
            Query(q): Query<HashMap<String, String>>,
        ) -> Json<serde_json::Value> {
            assert_eq!(headers["authorization"], "Bearer test-token");
            assert!(q["q"].starts_with("label:invoices after:"));
            match q.get("pageToken").map(String::as_str) {
                None => Json(serde_json::json!({
                    "messages": [{"id": "m2", "threadId": "t"}, {"id": "m0", "threadId": "t"}],
                    "nextPageToken": "p2"
                })),
                Some("p2") => Json(serde_json::json!({"messages": [{"id": "m1", "threadId": "t"}]})),
                Some(other) => panic!("unexpected page token {other}"),
            }
        }

        async fn message(Path(id): Path<String>) -> Json<serde_json::Value> {
            let millis = match id.as_str() {
                "m0" => 1_767_225_600_000_i64,
                "m1" => 1_767_225_601_000,
                _ => 1_767_225_602_000,
            };
            let rfc822 = format!("From: x@y.z\r\nSubject: {id}\r\n\r\nbody {id}\r\n");
            Json(serde_json::json!({
                "id": id,
                "internalDate": millis.to_string(),
                "raw": base64::engine::general_purpose::URL_SAFE.encode(rfc822),
            }))
        }

        let app = if status.is_success() {
            Router::new()
                .route("/users/me/messages", get(list))
                .route("/users/me/messages/{id}", get(message))
        } else {
            Router::new().route("/users/me/messages", get(move || async move { status }))
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn fetch_follows_pages_and_orders_oldest_first() {
        let base = serve_fake_gmail(axum::http::StatusCode::OK).await;
        let client = GmailClient::new(base, "invoices", Arc::new(StaticToken));

        let after = DateTime::from_timestamp_millis(1_767_225_600_000).unwrap();
        let items = client.fetch_since(after).await.unwrap();

        let ids: Vec<_> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["m1", "m2"]);
        assert_eq!(items[0].subject, "m1");
    }

    #[tokio::test]
    async fn undecodable_message_is_skipped_not_fatal() {
        use axum::extract::Path;
        use axum::{Json, Router, routing::get};

        async fn list() -> Json<serde_json::Value> {
            Json(serde_json::json!({
                "messages": [{"id": "good", "threadId": "t"}, {"id": "bad", "threadId": "t"}]
            }))
        }

        async fn message(Path(id): Path<String>) -> Json<serde_json::Value> {
            let raw = if id == "good" {
                base64::engine::general_purpose::URL_SAFE
                    .encode("From: x@y.z\r\nSubject: good\r\n\r\nbody\r\n")
            } else {
                "!!not base64!!".to_string()
            };
            Json(serde_json::json!({
                "id": id,
                "internalDate": "1767225601000",
                "raw": raw,
            }))
        }

        let app = Router::new()
            .route("/users/me/messages", get(list))
            .route("/users/me/messages/{id}", get(message));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let client = GmailClient::new(format!("http://{addr}"), "invoices", Arc::new(StaticToken));
        let after = DateTime::from_timestamp_millis(1_767_225_600_000).unwrap();
        let items = client.fetch_since(after).await.unwrap();

        let ids: Vec<_> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["good"]);
    }

    #[tokio::test]
    async fn forbidden_is_auth_error() {
        let base = serve_fake_gmail(axum::http::StatusCode::FORBIDDEN).await;
        let client = GmailClient::new(base, "invoices", Arc::new(StaticToken));
        let err = client.fetch_since(Utc::now()).await.unwrap_err();
        assert!(matches!(err, FetchError::Auth(_)));
    }

    #[tokio::test]
    async fn server_error_is_http_error() {
        let base = serve_fake_gmail(axum::http::StatusCode::BAD_GATEWAY).await;
        let client = GmailClient::new(base, "invoices", Arc::new(StaticToken));
        let err = client.fetch_since(Utc::now()).await.unwrap_err();
        assert!(matches!(err, FetchError::Http { status, .. } if status.as_u16() == 502));
    }
}
