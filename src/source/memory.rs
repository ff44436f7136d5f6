//! In-memory `DataSource` with broadcast change feeds.
//!
//! Used by the test suite and available to embedders that want the chat
//! layer without a network. Rows live in per-table vectors; inserts get a
//! server-style id and created_at when the caller leaves them out.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::realtime::{ChangeEvent, ChangeOp, Subscription};

use super::{DataSource, Filter, Select};

type Tables = HashMap<String, Vec<Value>>;
type RpcHandler = Box<dyn Fn(&mut Tables, Value) -> Result<Value> + Send + Sync>;

pub struct MemorySource {
  tables: Mutex<Tables>,
  rpc: Mutex<HashMap<String, RpcHandler>>,
  feeds: Mutex<HashMap<String, broadcast::Sender<ChangeEvent>>>,
}

impl MemorySource {
  pub fn new() -> Self {
    Self {
      tables: Mutex::new(HashMap::new()),
      rpc: Mutex::new(HashMap::new()),
      feeds: Mutex::new(HashMap::new()),
    }
  }

  /// Pre-load rows into a table.
  pub fn seed(&self, table: &str, rows: Vec<Value>) {
    let mut tables = match self.tables.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    tables.entry(table.to_string()).or_default().extend(rows);
  }

  /// Register a server-side function. The handler runs under the table
  /// lock, which is what makes it atomic with respect to other operations.
  pub fn register_rpc<F>(&self, name: &str, handler: F)
  where
    F: Fn(&mut Tables, Value) -> Result<Value> + Send + Sync + 'static,
  {
    let mut rpc = match self.rpc.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    rpc.insert(name.to_string(), Box::new(handler));
  }

  fn emit(&self, op: ChangeOp, table: &str, row: Value) {
    let Ok(feeds) = self.feeds.lock() else {
      return;
    };
    if let Some(tx) = feeds.get(table) {
      // No receivers is fine; the send result only reports that.
      let _ = tx.send(ChangeEvent {
        op,
        table: table.to_string(),
        row,
      });
    }
  }

  fn feed_sender(&self, table: &str) -> Result<broadcast::Sender<ChangeEvent>> {
    let mut feeds = self
      .feeds
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      feeds
        .entry(table.to_string())
        .or_insert_with(|| broadcast::channel(256).0)
        .clone(),
    )
  }
}

impl Default for MemorySource {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl DataSource for MemorySource {
  async fn select(&self, query: Select) -> Result<Vec<Value>> {
    let tables = self
      .tables
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut rows: Vec<Value> = tables
      .get(&query.table)
      .map(|rows| {
        rows
          .iter()
          .filter(|row| query.filters.iter().all(|f| f.matches(row)))
          .cloned()
          .collect()
      })
      .unwrap_or_default();

    if let Some(order) = &query.order {
      rows.sort_by(|a, b| {
        let cmp = compare_values(a.get(&order.column), b.get(&order.column));
        if order.ascending {
          cmp
        } else {
          cmp.reverse()
        }
      });
    }

    let offset = query.offset.unwrap_or(0) as usize;
    let rows: Vec<Value> = rows.into_iter().skip(offset).collect();
    let rows = match query.limit {
      Some(limit) => rows.into_iter().take(limit as usize).collect(),
      None => rows,
    };

    Ok(rows)
  }

  async fn insert(&self, table: &str, mut row: Value) -> Result<Value> {
    {
      let obj = row
        .as_object_mut()
        .ok_or_else(|| eyre!("Insert payload must be an object"))?;
      obj
        .entry("id")
        .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
      obj.entry("created_at").or_insert_with(|| {
        Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
      });
    }

    {
      let mut tables = self
        .tables
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      tables
        .entry(table.to_string())
        .or_default()
        .push(row.clone());
    }

    self.emit(ChangeOp::Insert, table, row.clone());
    Ok(row)
  }

  async fn update(&self, table: &str, patch: Value, filters: Vec<Filter>) -> Result<Vec<Value>> {
    let patch = patch
      .as_object()
      .ok_or_else(|| eyre!("Update patch must be an object"))?
      .clone();

    let updated: Vec<Value> = {
      let mut tables = self
        .tables
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      let rows = tables.entry(table.to_string()).or_default();

      let mut updated = Vec::new();
      for row in rows.iter_mut() {
        if filters.iter().all(|f| f.matches(row)) {
          if let Some(obj) = row.as_object_mut() {
            for (k, v) in &patch {
              obj.insert(k.clone(), v.clone());
            }
          }
          updated.push(row.clone());
        }
      }
      updated
    };

    for row in &updated {
      self.emit(ChangeOp::Update, table, row.clone());
    }
    Ok(updated)
  }

  async fn delete(&self, table: &str, filters: Vec<Filter>) -> Result<u64> {
    let removed: Vec<Value> = {
      let mut tables = self
        .tables
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      let rows = tables.entry(table.to_string()).or_default();

      let (gone, keep): (Vec<Value>, Vec<Value>) = rows
        .drain(..)
        .partition(|row| filters.iter().all(|f| f.matches(row)));
      *rows = keep;
      gone
    };

    let count = removed.len() as u64;
    for row in removed {
      self.emit(ChangeOp::Delete, table, row);
    }
    Ok(count)
  }

  async fn invoke(&self, function: &str, args: Value) -> Result<Value> {
    let rpc = self
      .rpc
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let handler = rpc
      .get(function)
      .ok_or_else(|| eyre!("Unknown function: {}", function))?;

    let mut tables = self
      .tables
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    handler(&mut tables, args)
  }

  fn subscribe(&self, table: &str, filter: Option<Filter>) -> Result<Subscription> {
    let mut feed = self.feed_sender(table)?.subscribe();
    let (tx, rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
      loop {
        match feed.recv().await {
          Ok(event) => {
            let keep = filter.as_ref().map(|f| f.matches(&event.row)).unwrap_or(true);
            if keep && tx.send(event).is_err() {
              break;
            }
          }
          // Lagged receivers skip ahead; a reload picks up what was missed.
          Err(broadcast::error::RecvError::Lagged(_)) => continue,
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    });

    Ok(Subscription::new(rx, task))
  }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
  use std::cmp::Ordering;
  match (a, b) {
    (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
    (Some(Value::Number(a)), Some(Value::Number(b))) => a
      .as_f64()
      .partial_cmp(&b.as_f64())
      .unwrap_or(Ordering::Equal),
    (Some(_), None) => Ordering::Greater,
    (None, Some(_)) => Ordering::Less,
    _ => Ordering::Equal,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[tokio::test]
  async fn select_filters_orders_and_ranges() {
    let source = MemorySource::new();
    source.seed(
      "messages",
      vec![
        json!({ "id": "1", "sender_id": "a", "created_at": "2024-01-01T10:00:00Z" }),
        json!({ "id": "2", "sender_id": "a", "created_at": "2024-01-03T10:00:00Z" }),
        json!({ "id": "3", "sender_id": "b", "created_at": "2024-01-02T10:00:00Z" }),
      ],
    );

    let rows = source
      .select(
        Select::table("messages")
          .filter(Filter::Eq("sender_id".into(), json!("a")))
          .order_desc("created_at"),
      )
      .await
      .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["id"], "2");

    let page = source
      .select(Select::table("messages").order_asc("created_at").range(1, 1))
      .await
      .unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0]["id"], "3");
  }

  #[tokio::test]
  async fn insert_fills_id_and_created_at() {
    let source = MemorySource::new();
    let row = source
      .insert("messages", json!({ "body": "hi" }))
      .await
      .unwrap();
    assert!(row["id"].is_string());
    assert!(row["created_at"].is_string());
  }

  #[tokio::test]
  async fn update_patches_matching_rows() {
    let source = MemorySource::new();
    source.seed(
      "messages",
      vec![
        json!({ "id": "1", "recipient_id": "me", "read_at": null }),
        json!({ "id": "2", "recipient_id": "other", "read_at": null }),
      ],
    );

    let updated = source
      .update(
        "messages",
        json!({ "read_at": "2024-01-01T00:00:00Z" }),
        vec![Filter::Eq("recipient_id".into(), json!("me"))],
      )
      .await
      .unwrap();
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0]["read_at"], "2024-01-01T00:00:00Z");
  }

  #[tokio::test]
  async fn subscription_receives_filtered_inserts() {
    let source = MemorySource::new();
    let mut sub = source
      .subscribe(
        "messages",
        Some(Filter::Eq("recipient_id".into(), json!("me"))),
      )
      .unwrap();

    source
      .insert("messages", json!({ "recipient_id": "other", "body": "x" }))
      .await
      .unwrap();
    source
      .insert("messages", json!({ "recipient_id": "me", "body": "y" }))
      .await
      .unwrap();

    let event = sub.next().await.unwrap();
    assert_eq!(event.op, ChangeOp::Insert);
    assert_eq!(event.row["body"], "y");
  }

  #[tokio::test]
  async fn rpc_handler_mutates_tables_atomically() {
    let source = MemorySource::new();
    source.seed("posts", vec![json!({ "id": "p1", "views": 3 })]);
    source.register_rpc("increment_view", |tables, args| {
      let id = args["record_id"].clone();
      let rows = tables.entry("posts".to_string()).or_default();
      for row in rows.iter_mut() {
        if row["id"] == id {
          let views = row["views"].as_u64().unwrap_or(0) + 1;
          row["views"] = json!(views);
          return Ok(json!(views));
        }
      }
      Ok(Value::Null)
    });

    let result = source
      .invoke("increment_view", json!({ "record_id": "p1" }))
      .await
      .unwrap();
    assert_eq!(result, json!(4));
  }

  #[tokio::test]
  async fn unknown_rpc_is_an_error() {
    let source = MemorySource::new();
    assert!(source.invoke("nope", json!({})).await.is_err());
  }
}
