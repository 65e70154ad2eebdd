//! HTTP JSON delivery to the remote entry store.
//!
//! One POST per batch: the body is a JSON array of entries, the response a
//! JSON array with one item per entry, carrying either `EntryId` or `Errors`.
//!
//! - 401 / 403 → `Authentication` (stops the run)
//! - transport errors, 429, 5xx and other non-2xx → zero-success outcome
//! - 2xx → per-item outcome

use crate::delivery::BatchDelivery;
use crate::models::{BatchOutcome, EndpointConfig, MailsiftError, PreparedRecord, Result};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Per-entry item in the response array.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EntryResponse {
    #[serde(default)]
    entry_id: Option<Value>,
    #[serde(default)]
    errors: Option<Vec<EntryError>>,
}

#[derive(Debug, Deserialize)]
struct EntryError {
    #[serde(default)]
    field: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

impl EntryError {
    fn describe(&self) -> String {
        format!(
            "Field: {}, Code: {}, Description: {}",
            self.field.as_deref().unwrap_or("Unknown"),
            self.code.as_deref().unwrap_or("Unknown"),
            self.description.as_deref().unwrap_or("Unknown"),
        )
    }
}

/// Posts batches to `{base_url}/data/entrydata/{object}`.
pub struct HttpDelivery {
    client: reqwest::Client,
    api_key: String,
    url: String,
}

impl HttpDelivery {
    pub fn new(config: &EndpointConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(MailsiftError::Network)?;

        Ok(Self {
            client,
            api_key,
            url: format!(
                "{}/data/entrydata/{}",
                config.base_url.trim_end_matches('/'),
                config.object
            ),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|_| MailsiftError::Authentication("API key is not a valid header value".into()))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }
}

#[async_trait]
impl BatchDelivery for HttpDelivery {
    async fn deliver(&self, batch: &[PreparedRecord]) -> Result<BatchOutcome> {
        if batch.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let entries: Vec<Value> = batch.iter().map(to_entry).collect();
        debug!(url = %self.url, entries = entries.len(), "Posting batch");

        let response = match self
            .client
            .post(&self.url)
            .headers(self.headers()?)
            .json(&entries)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Request failed");
                return Ok(BatchOutcome::failed_all(batch.len(), format!("Request failed: {e}")));
            }
        };

        let status = response.status().as_u16();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                warn!(status, error = %e, "Failed to read response body");
                return Ok(BatchOutcome::failed_all(
                    batch.len(),
                    format!("Reading response: {e}"),
                ));
            }
        };

        let outcome = classify_response(status, &body, batch)?;
        info!(
            status,
            delivered = outcome.succeeded,
            failed = outcome.failed,
            "Batch response"
        );
        Ok(outcome)
    }
}

/// Map an HTTP response onto a batch outcome.
pub fn classify_response(status: u16, body: &str, batch: &[PreparedRecord]) -> Result<BatchOutcome> {
    match status {
        401 | 403 => Err(MailsiftError::Authentication(format!(
            "HTTP {status}: {}",
            snippet(body)
        ))),
        200..=299 => Ok(per_item_outcome(body, batch)),
        _ => {
            warn!(status, body = %snippet(body), "Batch rejected");
            Ok(BatchOutcome::failed_all(
                batch.len(),
                format!("HTTP {status}: {}", snippet(body)),
            ))
        }
    }
}

fn per_item_outcome(body: &str, batch: &[PreparedRecord]) -> BatchOutcome {
    let items: Vec<EntryResponse> = match serde_json::from_str(body) {
        Ok(items) => items,
        Err(e) => {
            return BatchOutcome::failed_all(batch.len(), format!("Unreadable response: {e}"));
        }
    };

    let mut outcome = BatchOutcome::default();
    for (record, item) in batch.iter().zip(&items) {
        let errors = item.errors.as_deref().unwrap_or_default();
        if errors.is_empty() {
            outcome.succeeded += 1;
            if let Some(id) = &item.entry_id {
                outcome.remote_ids.push(match id {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                });
            }
        } else {
            outcome.failed += 1;
            let details: Vec<String> = errors.iter().map(EntryError::describe).collect();
            let headline: String = record.headline.chars().take(50).collect();
            let message = format!("Error delivering '{headline}': {}", details.join(", "));
            error!("{message}");
            outcome.errors.push(message);
        }
    }

    if items.len() < batch.len() {
        let missing = batch.len() - items.len();
        outcome.failed += missing;
        outcome
            .errors
            .push(format!("{missing} entries missing from response"));
    }
    outcome
}

/// Remote entry for one record. Empty fields are left out.
pub fn to_entry(record: &PreparedRecord) -> Value {
    let mut entry = Map::new();
    if !record.headline.is_empty() {
        entry.insert("Headline".into(), Value::from(record.headline.clone()));
    }
    if !record.article_text.is_empty() {
        entry.insert("ArticleText".into(), Value::from(record.article_text.clone()));
    }
    if !record.publish_date.is_empty() {
        entry.insert(
            "PublishDate".into(),
            Value::from(strip_timezone(&record.publish_date)),
        );
    }
    for (key, ids) in [
        ("Hotels", &record.hotels),
        ("Companies", &record.companies),
        ("Contacts", &record.contacts),
    ] {
        if !ids.is_empty() {
            entry.insert(key.into(), Value::from(ids.clone()));
        }
    }
    for (key, value) in &record.extra {
        entry.entry(key.clone()).or_insert_with(|| value.clone());
    }
    Value::Object(entry)
}

/// The remote store rejects offsets: `2025-07-01T10:52:37+02:00` → `2025-07-01T10:52:37`.
fn strip_timezone(date: &str) -> String {
    let date = date.trim_end_matches('Z');
    match date.find('T') {
        Some(t) => {
            let time = &date[t..];
            match time.find(['+', '-']) {
                Some(offset) => date[..t + offset].to_string(),
                None => date.to_string(),
            }
        }
        None => date.to_string(),
    }
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}
