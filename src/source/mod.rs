//! Generic remote data interface.
//!
//! The hosted backend exposes a row-oriented API: filtered selects,
//! mutations, server-side RPC for operations that must run atomically, and
//! a change feed. `DataSource` abstracts that shape so the chat layer can
//! run against the real REST dialect or an in-memory double.

mod memory;
mod rest;

pub use memory::MemorySource;
pub use rest::RestSource;

use async_trait::async_trait;
use color_eyre::Result;
use serde_json::Value;

use crate::realtime::Subscription;

/// A row filter, encodable to the backend's query syntax and evaluable
/// in memory.
#[derive(Debug, Clone)]
pub enum Filter {
  /// Column equals value.
  Eq(String, Value),
  /// Column strictly greater than value. Uniformly-rendered ISO-8601
  /// timestamps compare correctly as strings.
  Gt(String, Value),
  /// Column is null.
  IsNull(String),
  /// Column is not null.
  NotNull(String),
  /// Column is one of the listed values.
  In(String, Vec<Value>),
  /// All inner filters hold.
  And(Vec<Filter>),
  /// At least one inner filter holds.
  Or(Vec<Filter>),
}

impl Filter {
  /// Encode as a top-level query parameter (name, value).
  pub fn to_query_pair(&self) -> (String, String) {
    match self {
      Filter::Eq(col, v) => (col.clone(), format!("eq.{}", render(v))),
      Filter::Gt(col, v) => (col.clone(), format!("gt.{}", render(v))),
      Filter::IsNull(col) => (col.clone(), "is.null".to_string()),
      Filter::NotNull(col) => (col.clone(), "not.is.null".to_string()),
      Filter::In(col, vs) => (col.clone(), format!("in.({})", render_list(vs))),
      Filter::And(inner) => ("and".to_string(), format!("({})", encode_group(inner))),
      Filter::Or(inner) => ("or".to_string(), format!("({})", encode_group(inner))),
    }
  }

  /// Encode for use inside an `and(...)` / `or(...)` group.
  fn encode_inner(&self) -> String {
    match self {
      Filter::Eq(col, v) => format!("{}.eq.{}", col, render(v)),
      Filter::Gt(col, v) => format!("{}.gt.{}", col, render(v)),
      Filter::IsNull(col) => format!("{}.is.null", col),
      Filter::NotNull(col) => format!("{}.not.is.null", col),
      Filter::In(col, vs) => format!("{}.in.({})", col, render_list(vs)),
      Filter::And(inner) => format!("and({})", encode_group(inner)),
      Filter::Or(inner) => format!("or({})", encode_group(inner)),
    }
  }

  /// Evaluate against an in-memory row.
  pub fn matches(&self, row: &Value) -> bool {
    match self {
      Filter::Eq(col, v) => row.get(col) == Some(v),
      Filter::Gt(col, v) => match (row.get(col), v) {
        (Some(Value::String(a)), Value::String(b)) => a > b,
        (Some(Value::Number(a)), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
          (Some(a), Some(b)) => a > b,
          _ => false,
        },
        _ => false,
      },
      Filter::IsNull(col) => matches!(row.get(col), None | Some(Value::Null)),
      Filter::NotNull(col) => !matches!(row.get(col), None | Some(Value::Null)),
      Filter::In(col, vs) => row.get(col).is_some_and(|v| vs.contains(v)),
      Filter::And(inner) => inner.iter().all(|f| f.matches(row)),
      Filter::Or(inner) => inner.iter().any(|f| f.matches(row)),
    }
  }
}

fn encode_group(filters: &[Filter]) -> String {
  filters
    .iter()
    .map(Filter::encode_inner)
    .collect::<Vec<_>>()
    .join(",")
}

fn render(v: &Value) -> String {
  match v {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

fn render_list(vs: &[Value]) -> String {
  vs.iter().map(|v| render(v)).collect::<Vec<_>>().join(",")
}

/// Ordering clause for a select.
#[derive(Debug, Clone)]
pub struct Order {
  pub column: String,
  pub ascending: bool,
}

impl Order {
  pub fn encode(&self) -> String {
    format!(
      "{}.{}",
      self.column,
      if self.ascending { "asc" } else { "desc" }
    )
  }
}

/// A select query builder.
#[derive(Debug, Clone)]
pub struct Select {
  pub table: String,
  pub columns: Option<String>,
  pub filters: Vec<Filter>,
  pub order: Option<Order>,
  pub limit: Option<u32>,
  pub offset: Option<u32>,
}

impl Select {
  pub fn table(name: impl Into<String>) -> Self {
    Self {
      table: name.into(),
      columns: None,
      filters: Vec::new(),
      order: None,
      limit: None,
      offset: None,
    }
  }

  pub fn columns(mut self, projection: impl Into<String>) -> Self {
    self.columns = Some(projection.into());
    self
  }

  pub fn filter(mut self, filter: Filter) -> Self {
    self.filters.push(filter);
    self
  }

  pub fn order_asc(mut self, column: impl Into<String>) -> Self {
    self.order = Some(Order {
      column: column.into(),
      ascending: true,
    });
    self
  }

  pub fn order_desc(mut self, column: impl Into<String>) -> Self {
    self.order = Some(Order {
      column: column.into(),
      ascending: false,
    });
    self
  }

  pub fn range(mut self, offset: u32, limit: u32) -> Self {
    self.offset = Some(offset);
    self.limit = Some(limit);
    self
  }
}

/// The remote row API consumed by the chat layer.
#[async_trait]
pub trait DataSource: Send + Sync {
  /// Run a filtered select and return the matching rows.
  async fn select(&self, query: Select) -> Result<Vec<Value>>;

  /// Insert a row and return its stored representation (server-assigned
  /// id and timestamps included).
  async fn insert(&self, table: &str, row: Value) -> Result<Value>;

  /// Patch all rows matching the filters; returns the updated rows.
  async fn update(&self, table: &str, patch: Value, filters: Vec<Filter>) -> Result<Vec<Value>>;

  /// Delete all rows matching the filters; returns how many went away.
  async fn delete(&self, table: &str, filters: Vec<Filter>) -> Result<u64>;

  /// Call a server-side function. Used where the logic must run atomically
  /// on the backend rather than as a client-composed read-modify-write.
  async fn invoke(&self, function: &str, args: Value) -> Result<Value>;

  /// Open a change feed for a table, optionally narrowed by a filter.
  fn subscribe(&self, table: &str, filter: Option<Filter>) -> Result<Subscription>;
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn eq_filter_encodes_and_matches() {
    let f = Filter::Eq("sender_id".into(), json!("u1"));
    assert_eq!(
      f.to_query_pair(),
      ("sender_id".to_string(), "eq.u1".to_string())
    );
    assert!(f.matches(&json!({ "sender_id": "u1" })));
    assert!(!f.matches(&json!({ "sender_id": "u2" })));
  }

  #[test]
  fn pair_scope_filter_matches_both_directions() {
    let f = Filter::Or(vec![
      Filter::And(vec![
        Filter::Eq("sender_id".into(), json!("a")),
        Filter::Eq("recipient_id".into(), json!("b")),
      ]),
      Filter::And(vec![
        Filter::Eq("sender_id".into(), json!("b")),
        Filter::Eq("recipient_id".into(), json!("a")),
      ]),
    ]);

    assert!(f.matches(&json!({ "sender_id": "a", "recipient_id": "b" })));
    assert!(f.matches(&json!({ "sender_id": "b", "recipient_id": "a" })));
    assert!(!f.matches(&json!({ "sender_id": "a", "recipient_id": "c" })));

    let (name, value) = f.to_query_pair();
    assert_eq!(name, "or");
    assert_eq!(
      value,
      "(and(sender_id.eq.a,recipient_id.eq.b),and(sender_id.eq.b,recipient_id.eq.a))"
    );
  }

  #[test]
  fn gt_filter_compares_iso_timestamps() {
    let f = Filter::Gt("created_at".into(), json!("2024-01-01T10:00:00Z"));
    assert!(f.matches(&json!({ "created_at": "2024-01-02T00:00:00Z" })));
    assert!(!f.matches(&json!({ "created_at": "2023-12-31T00:00:00Z" })));
  }

  #[test]
  fn null_filters_treat_missing_as_null() {
    let is_null = Filter::IsNull("read_at".into());
    assert!(is_null.matches(&json!({})));
    assert!(is_null.matches(&json!({ "read_at": null })));
    assert!(!is_null.matches(&json!({ "read_at": "2024-01-01T00:00:00Z" })));
  }

  #[test]
  fn in_filter_encodes_value_list() {
    let f = Filter::In("id".into(), vec![json!("a"), json!("b")]);
    assert_eq!(f.to_query_pair(), ("id".to_string(), "in.(a,b)".to_string()));
    assert!(f.matches(&json!({ "id": "b" })));
    assert!(!f.matches(&json!({ "id": "c" })));
  }
}
