use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{RecordSource, SourcePage};
use crate::error::IngestError;
use crate::record::RawRecord;
use crate::writer::truncate_for_log;

/// Client for the document store's HTTP listing endpoint:
/// GET {base}/{collection}?pageSize=N[&pageToken=...] returning pages of
/// documents with a typed field map and a continuation token.
#[derive(Debug, Clone)]
pub struct RemoteStoreClient {
    base_url: String,
    http: Client,
    auth_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListDocumentsResponse {
    #[serde(default)]
    documents: Vec<StoreDocument>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StoreDocument {
    /// Full resource path; the source key is the last path segment.
    name: String,
    #[serde(default)]
    fields: HashMap<String, FieldValue>,
    #[serde(rename = "createTime")]
    create_time: Option<DateTime<Utc>>,
}

/// Typed value wrapper used by the store's wire format. Integers arrive as
/// strings per the store's int64 JSON convention.
#[derive(Debug, Default, Deserialize)]
struct FieldValue {
    #[serde(rename = "stringValue")]
    string_value: Option<String>,
    #[serde(rename = "integerValue")]
    integer_value: Option<String>,
    #[serde(rename = "timestampValue")]
    timestamp_value: Option<DateTime<Utc>>,
}

impl RemoteStoreClient {
    pub fn new(base_url: &str, timeout_secs: Option<u64>) -> anyhow::Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let http = Client::builder()
            .user_agent("gamelog-ingest/0.1")
            .timeout(Duration::from_secs(timeout_secs.unwrap_or(30)))
            .build()?;
        Ok(Self {
            base_url,
            http,
            auth_token: None,
        })
    }

    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token.filter(|t| !t.trim().is_empty());
        self
    }

    async fn list_page(
        &self,
        collection: &str,
        page_size: u32,
        page_token: Option<&str>,
    ) -> Result<ListDocumentsResponse, IngestError> {
        let url = format!("{}/{collection}", self.base_url);
        let mut req = self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .query(&[("pageSize", page_size.to_string())]);
        if let Some(token) = page_token {
            req = req.query(&[("pageToken", token)]);
        }
        if let Some(token) = self.auth_token.as_deref() {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| IngestError::source_unavailable(format!("list {url} failed: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let body = truncate_for_log(resp.text().await.unwrap_or_default(), 2000);
            return Err(IngestError::SourceUnavailable(format!(
                "list failed: {status} url={url} body={body}"
            )));
        }
        resp.json::<ListDocumentsResponse>()
            .await
            .map_err(|e| IngestError::source_unavailable(format!("bad listing response: {e}")))
    }
}

fn decode_document(doc: &StoreDocument) -> Option<RawRecord> {
    let key = doc.name.rsplit('/').next()?.trim();
    if key.is_empty() {
        return None;
    }
    let game_json = doc.fields.get("gameJson")?.string_value.clone()?;
    let created_at = doc
        .fields
        .get("createdAt")
        .and_then(field_timestamp)
        .or(doc.create_time)
        .unwrap_or(DateTime::UNIX_EPOCH);
    Some(RawRecord {
        key: key.to_string(),
        game_json,
        created_at,
    })
}

fn field_timestamp(field: &FieldValue) -> Option<DateTime<Utc>> {
    if let Some(ts) = field.timestamp_value {
        return Some(ts);
    }
    field
        .integer_value
        .as_deref()
        .and_then(|s| s.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis)
}

/// Pages through the remote store until its continuation token runs out.
/// An optional lower time bound (the ingestion high-water mark) drops records
/// already known to be ingested before they reach the deduplicator.
#[derive(Debug)]
pub struct RemoteStoreSource {
    client: RemoteStoreClient,
    collection: String,
    page_size: u32,
    limit: Option<usize>,
    lower_bound: Option<DateTime<Utc>>,
    page_token: Option<String>,
    exhausted: bool,
    emitted: usize,
}

impl RemoteStoreSource {
    pub fn new(
        client: RemoteStoreClient,
        collection: &str,
        page_size: u32,
        limit: Option<usize>,
    ) -> Self {
        Self {
            client,
            collection: collection.to_string(),
            page_size: page_size.max(1),
            limit,
            lower_bound: None,
            page_token: None,
            exhausted: false,
            emitted: 0,
        }
    }

    pub fn set_lower_bound(&mut self, bound: DateTime<Utc>) {
        self.lower_bound = Some(bound);
    }

    fn limit_reached(&self) -> bool {
        self.limit.is_some_and(|lim| self.emitted >= lim)
    }
}

#[async_trait]
impl RecordSource for RemoteStoreSource {
    fn label(&self) -> &str {
        &self.collection
    }

    async fn next_page(&mut self) -> Result<Option<SourcePage>, IngestError> {
        if self.exhausted || self.limit_reached() {
            return Ok(None);
        }
        let resp = self
            .client
            .list_page(&self.collection, self.page_size, self.page_token.as_deref())
            .await?;

        let mut page = SourcePage::default();
        for doc in &resp.documents {
            if self.limit_reached() {
                break;
            }
            let Some(rec) = decode_document(doc) else {
                warn!(doc = %doc.name, "skipping undecodable store document");
                page.malformed += 1;
                continue;
            };
            if let Some(bound) = self.lower_bound {
                if rec.created_at <= bound {
                    debug!(key = %rec.key, "below high-water mark; dropped");
                    continue;
                }
            }
            page.records.push(rec);
            self.emitted += 1;
        }

        self.page_token = resp.next_page_token;
        if self.page_token.is_none() {
            self.exhausted = true;
        }
        if page.records.is_empty() && page.malformed == 0 && self.exhausted {
            return Ok(None);
        }
        Ok(Some(page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"{
        "documents": [
            {
                "name": "projects/p/databases/(default)/documents/games/K1",
                "fields": {
                    "gameJson": {"stringValue": "{\"players\":[{\"uid\":\"A\"}]}"},
                    "createdAt": {"timestampValue": "2023-06-01T10:00:00Z"}
                },
                "createTime": "2023-06-01T10:00:05Z"
            },
            {
                "name": "projects/p/databases/(default)/documents/games/K2",
                "fields": {
                    "gameJson": {"stringValue": "{}"},
                    "createdAt": {"integerValue": "1700000000000"}
                }
            },
            {
                "name": "projects/p/databases/(default)/documents/games/K3",
                "fields": {}
            }
        ],
        "nextPageToken": "tok-2"
    }"#;

    #[test]
    fn listing_page_parses_typed_fields() {
        let resp: ListDocumentsResponse = serde_json::from_str(PAGE).unwrap();
        assert_eq!(resp.documents.len(), 3);
        assert_eq!(resp.next_page_token.as_deref(), Some("tok-2"));

        let rec = decode_document(&resp.documents[0]).unwrap();
        assert_eq!(rec.key, "K1");
        assert_eq!(rec.game_json, "{\"players\":[{\"uid\":\"A\"}]}");
        // Explicit createdAt field wins over the document's createTime.
        assert_eq!(rec.created_at.to_rfc3339(), "2023-06-01T10:00:00+00:00");
    }

    #[test]
    fn integer_value_timestamps_are_millis() {
        let resp: ListDocumentsResponse = serde_json::from_str(PAGE).unwrap();
        let rec = decode_document(&resp.documents[1]).unwrap();
        assert_eq!(rec.created_at.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn documents_without_payload_are_undecodable() {
        let resp: ListDocumentsResponse = serde_json::from_str(PAGE).unwrap();
        assert!(decode_document(&resp.documents[2]).is_none());
    }

    #[test]
    fn empty_listing_parses() {
        let resp: ListDocumentsResponse = serde_json::from_str("{}").unwrap();
        assert!(resp.documents.is_empty());
        assert!(resp.next_page_token.is_none());
    }
}
