//! REST implementation of `DataSource` speaking the hosted backend's
//! PostgREST-style row API.
//!
//! The change feed is a polling loop: the backend's push transport is not
//! part of this layer, so `subscribe` re-queries for rows newer than a
//! watermark on a fixed interval and emits them as inserts.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use crate::realtime::{ChangeEvent, ChangeOp, Subscription};

use super::{DataSource, Filter, Select};

/// Environment variable holding the backend API key.
const API_KEY_VAR: &str = "CHATSYNC_API_KEY";

#[derive(Clone)]
pub struct RestSource {
  http: reqwest::Client,
  base: Url,
  poll_interval: Duration,
}

impl RestSource {
  /// Create a client for the given backend URL. The API key is read from
  /// the environment, never from configuration files.
  pub fn new(base_url: &str, poll_interval: Duration) -> Result<Self> {
    let key = std::env::var(API_KEY_VAR)
      .map_err(|_| eyre!("Backend API key not found. Set {}.", API_KEY_VAR))?;

    let base = Url::parse(base_url).map_err(|e| eyre!("Invalid backend URL: {}", e))?;

    let mut headers = HeaderMap::new();
    let key_value =
      HeaderValue::from_str(&key).map_err(|e| eyre!("API key is not a valid header: {}", e))?;
    headers.insert("apikey", key_value.clone());
    let bearer = HeaderValue::from_str(&format!("Bearer {}", key))
      .map_err(|e| eyre!("API key is not a valid header: {}", e))?;
    headers.insert(reqwest::header::AUTHORIZATION, bearer);

    let http = reqwest::Client::builder()
      .default_headers(headers)
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self {
      http,
      base,
      poll_interval,
    })
  }

  fn table_url(&self, table: &str) -> Result<Url> {
    self
      .base
      .join(&format!("rest/v1/{}", table))
      .map_err(|e| eyre!("Invalid table endpoint: {}", e))
  }

  fn rpc_url(&self, function: &str) -> Result<Url> {
    self
      .base
      .join(&format!("rest/v1/rpc/{}", function))
      .map_err(|e| eyre!("Invalid rpc endpoint: {}", e))
  }

  fn select_url(&self, query: &Select) -> Result<Url> {
    let mut url = self.table_url(&query.table)?;
    {
      let mut pairs = url.query_pairs_mut();
      if let Some(columns) = &query.columns {
        pairs.append_pair("select", columns);
      }
      for filter in &query.filters {
        let (name, value) = filter.to_query_pair();
        pairs.append_pair(&name, &value);
      }
      if let Some(order) = &query.order {
        pairs.append_pair("order", &order.encode());
      }
      if let Some(limit) = query.limit {
        pairs.append_pair("limit", &limit.to_string());
      }
      if let Some(offset) = query.offset {
        pairs.append_pair("offset", &offset.to_string());
      }
    }
    Ok(url)
  }

  fn filtered_url(&self, table: &str, filters: &[Filter]) -> Result<Url> {
    let mut url = self.table_url(table)?;
    {
      let mut pairs = url.query_pairs_mut();
      for filter in filters {
        let (name, value) = filter.to_query_pair();
        pairs.append_pair(&name, &value);
      }
    }
    Ok(url)
  }

  async fn read_rows(&self, response: reqwest::Response, context: &str) -> Result<Vec<Value>> {
    let response = response
      .error_for_status()
      .map_err(|e| eyre!("{}: {}", context, e))?;
    response
      .json::<Vec<Value>>()
      .await
      .map_err(|e| eyre!("{}: invalid response body: {}", context, e))
  }
}

#[async_trait]
impl DataSource for RestSource {
  async fn select(&self, query: Select) -> Result<Vec<Value>> {
    let url = self.select_url(&query)?;
    let response = self
      .http
      .get(url)
      .send()
      .await
      .map_err(|e| eyre!("Failed to query {}: {}", query.table, e))?;
    self
      .read_rows(response, &format!("Failed to query {}", query.table))
      .await
  }

  async fn insert(&self, table: &str, row: Value) -> Result<Value> {
    let url = self.table_url(table)?;
    let response = self
      .http
      .post(url)
      .header("Prefer", "return=representation")
      .json(&row)
      .send()
      .await
      .map_err(|e| eyre!("Failed to insert into {}: {}", table, e))?;

    let mut rows = self
      .read_rows(response, &format!("Failed to insert into {}", table))
      .await?;
    rows
      .pop()
      .ok_or_else(|| eyre!("Insert into {} returned no representation", table))
  }

  async fn update(&self, table: &str, patch: Value, filters: Vec<Filter>) -> Result<Vec<Value>> {
    let url = self.filtered_url(table, &filters)?;
    let response = self
      .http
      .patch(url)
      .header("Prefer", "return=representation")
      .json(&patch)
      .send()
      .await
      .map_err(|e| eyre!("Failed to update {}: {}", table, e))?;
    self
      .read_rows(response, &format!("Failed to update {}", table))
      .await
  }

  async fn delete(&self, table: &str, filters: Vec<Filter>) -> Result<u64> {
    let url = self.filtered_url(table, &filters)?;
    let response = self
      .http
      .delete(url)
      .header("Prefer", "return=representation")
      .send()
      .await
      .map_err(|e| eyre!("Failed to delete from {}: {}", table, e))?;
    let rows = self
      .read_rows(response, &format!("Failed to delete from {}", table))
      .await?;
    Ok(rows.len() as u64)
  }

  async fn invoke(&self, function: &str, args: Value) -> Result<Value> {
    let url = self.rpc_url(function)?;
    let response = self
      .http
      .post(url)
      .json(&args)
      .send()
      .await
      .map_err(|e| eyre!("Failed to call {}: {}", function, e))?
      .error_for_status()
      .map_err(|e| eyre!("Failed to call {}: {}", function, e))?;

    response
      .json::<Value>()
      .await
      .map_err(|e| eyre!("Failed to call {}: invalid response body: {}", function, e))
  }

  fn subscribe(&self, table: &str, filter: Option<Filter>) -> Result<Subscription> {
    let source = self.clone();
    let table = table.to_string();
    let (tx, rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
      // Rows created before the subscription opened belong to the initial
      // history fetch, not the feed. The watermark is kept as an instant:
      // the backend renders timestamptz with a `+00:00` offset, so string
      // comparison against a locally-rendered `Z` form would misorder rows
      // within the same second.
      let mut watermark = Utc::now();

      loop {
        tokio::time::sleep(source.poll_interval).await;

        let rendered = watermark.to_rfc3339_opts(SecondsFormat::Micros, true);
        let mut query = Select::table(table.as_str())
          .filter(Filter::Gt("created_at".into(), Value::String(rendered)))
          .order_asc("created_at");
        if let Some(f) = &filter {
          query = query.filter(f.clone());
        }

        let rows = match source.select(query).await {
          Ok(rows) => rows,
          Err(e) => {
            // Transient poll failure; the next tick retries.
            debug!(table, error = %e, "change-feed poll failed");
            continue;
          }
        };

        for row in rows {
          if let Some(created_at) = row_timestamp(&row) {
            if created_at > watermark {
              watermark = created_at;
            }
          }
          let event = ChangeEvent {
            op: ChangeOp::Insert,
            table: table.clone(),
            row,
          };
          if tx.send(event).is_err() {
            return;
          }
        }
      }
    });

    Ok(Subscription::new(rx, task))
  }
}

/// A row's `created_at` as an instant, whichever RFC 3339 offset rendering
/// the backend used.
fn row_timestamp(row: &Value) -> Option<DateTime<Utc>> {
  row
    .get("created_at")
    .and_then(Value::as_str)
    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
    .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn source() -> RestSource {
    std::env::set_var(API_KEY_VAR, "test-key");
    RestSource::new("https://backend.example.com/", Duration::from_secs(5)).unwrap()
  }

  #[test]
  fn select_url_encodes_filters_order_and_range() {
    let url = source()
      .select_url(
        &Select::table("messages")
          .columns("id,body")
          .filter(Filter::Eq("recipient_id".into(), json!("u1")))
          .order_desc("created_at")
          .range(10, 50),
      )
      .unwrap();

    assert_eq!(url.path(), "/rest/v1/messages");
    let query: Vec<(String, String)> = url
      .query_pairs()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect();
    assert!(query.contains(&("select".to_string(), "id,body".to_string())));
    assert!(query.contains(&("recipient_id".to_string(), "eq.u1".to_string())));
    assert!(query.contains(&("order".to_string(), "created_at.desc".to_string())));
    assert!(query.contains(&("limit".to_string(), "50".to_string())));
    assert!(query.contains(&("offset".to_string(), "10".to_string())));
  }

  #[test]
  fn rpc_url_targets_the_function_endpoint() {
    let url = source().rpc_url("mark_messages_read").unwrap();
    assert_eq!(url.path(), "/rest/v1/rpc/mark_messages_read");
  }

  #[test]
  fn row_timestamp_orders_across_offset_renderings() {
    // Sub-second rows in the backend's `+00:00` form sort below a `Z`-form
    // watermark as strings; parsed as instants they order correctly.
    let watermark = DateTime::parse_from_rfc3339("2024-01-01T10:00:00.500Z")
      .unwrap()
      .with_timezone(&Utc);
    let later = "2024-01-01T10:00:00.500100+00:00";
    assert!(later < "2024-01-01T10:00:00.500Z");

    let parsed = row_timestamp(&json!({ "created_at": later })).unwrap();
    assert!(parsed > watermark);
  }

  #[test]
  fn row_timestamp_skips_missing_or_malformed_values() {
    assert!(row_timestamp(&json!({})).is_none());
    assert!(row_timestamp(&json!({ "created_at": 42 })).is_none());
    assert!(row_timestamp(&json!({ "created_at": "yesterday" })).is_none());
  }
}
