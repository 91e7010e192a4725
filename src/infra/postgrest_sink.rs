use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_RANGE, CONTENT_TYPE};
use std::time::Duration;
use tracing::{debug, warn};

use crate::app::ports::{InsertResult, Sink, SinkRow};
use crate::error::SinkError;

/// Bulk-insert sink speaking the PostgREST dialect (Supabase `/rest/v1`).
/// One `reqwest::Client` is shared by every batch so connections are pooled.
pub struct PostgrestSink {
    client: reqwest::Client,
    base_url: String,
}

impl PostgrestSink {
    pub fn new(url: &str, api_key: &str, timeout: Duration) -> Result<Self, SinkError> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(api_key).map_err(|e| SinkError::Unreachable(format!("bad api key: {}", e)))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|e| SinkError::Unreachable(format!("bad api key: {}", e)))?;
        headers.insert("apikey", key);
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| SinkError::Unreachable(e.to_string()))?;

        Ok(Self {
            client,
            base_url: format!("{}/rest/v1", url.trim_end_matches('/')),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}", self.base_url, table)
    }
}

/// PostgREST error bodies look like `{"code": "...", "message": "...", "details": ...}`
fn describe_error(status: u16, body: &str) -> String {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|v| v.get("message"))
        .and_then(|m| m.as_str());
    let code = parsed.as_ref().and_then(|v| v.get("code")).and_then(|c| c.as_str());
    match (code, message) {
        (Some(code), Some(message)) => format!("HTTP {} [{}] {}", status, code, message),
        (None, Some(message)) => format!("HTTP {} {}", status, message),
        _ => format!("HTTP {} {}", status, body.chars().take(200).collect::<String>()),
    }
}

/// Total from a `Content-Range` header such as `0-24/3573` or `*/0`
fn parse_content_range_total(value: &str) -> Option<usize> {
    value.rsplit('/').next().and_then(|total| total.trim().parse().ok())
}

#[async_trait]
impl Sink for PostgrestSink {
    async fn ping(&self) -> Result<(), SinkError> {
        let resp = self
            .client
            .get(format!("{}/", self.base_url))
            .send()
            .await
            .map_err(|e| SinkError::Unreachable(e.to_string()))?;
        let status = resp.status().as_u16();
        if status == 401 || status == 403 {
            return Err(SinkError::Unreachable(format!("credentials rejected (HTTP {})", status)));
        }
        debug!(status, "sink pre-flight ok");
        Ok(())
    }

    async fn insert(&self, table: &str, rows: &[SinkRow]) -> Result<InsertResult, SinkError> {
        let resp = self
            .client
            .post(self.table_url(table))
            .header("Prefer", "return=minimal")
            .json(rows)
            .send()
            .await
            .map_err(|e| SinkError::Io(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(InsertResult::ok(rows.len()));
        }
        let body = resp.text().await.unwrap_or_default();
        let detail = describe_error(status.as_u16(), &body);
        warn!(table, status = status.as_u16(), detail = %detail, "sink rejected batch");
        // PostgREST inserts a request body in one statement, so nothing landed.
        Ok(InsertResult::failed(0, SinkError::Rejected(detail)))
    }

    async fn count(&self, table: &str) -> Result<usize, SinkError> {
        let resp = self
            .client
            .head(self.table_url(table))
            .query(&[("select", "*")])
            .header("Prefer", "count=exact")
            .send()
            .await
            .map_err(|e| SinkError::Io(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(SinkError::Rejected(format!("count failed with HTTP {}", resp.status().as_u16())));
        }
        resp.headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)
            .ok_or_else(|| SinkError::Rejected("missing Content-Range total".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_range_total() {
        assert_eq!(parse_content_range_total("0-24/3573"), Some(3573));
        assert_eq!(parse_content_range_total("*/0"), Some(0));
        assert_eq!(parse_content_range_total("0-24/*"), None);
    }

    #[test]
    fn test_describe_structured_error() {
        let body = r#"{"code":"22P02","message":"invalid input syntax for type integer: \"3.0\""}"#;
        let detail = describe_error(400, body);
        assert!(detail.starts_with("HTTP 400 [22P02]"));
        assert_eq!(describe_error(502, "Bad Gateway"), "HTTP 502 Bad Gateway");
    }

    #[test]
    fn test_table_url() {
        let sink = PostgrestSink::new("https://x.supabase.co/", "key", Duration::from_secs(5)).unwrap();
        assert_eq!(sink.table_url("air_quality_data"), "https://x.supabase.co/rest/v1/air_quality_data");
    }
}
