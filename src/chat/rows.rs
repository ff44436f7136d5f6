//! Loose row shapes from the backend and their normalization into strict
//! domain types.
//!
//! Joined fields in a projected select arrive as either a single object or
//! a one-element array depending on how the relationship is declared, so
//! every ingestion boundary goes through the normalizers here instead of
//! deserializing domain types directly.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::types::{Message, Profile, ReferenceItem};

/// A joined field that may arrive as one object or an array of them.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
  One(T),
  Many(Vec<T>),
}

impl<T> OneOrMany<T> {
  pub fn into_first(self) -> Option<T> {
    match self {
      OneOrMany::One(v) => Some(v),
      OneOrMany::Many(vs) => vs.into_iter().next(),
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct MessageRow {
  pub id: Option<Uuid>,
  pub sender_id: Option<Uuid>,
  pub recipient_id: Option<Uuid>,
  #[serde(default)]
  pub body: String,
  pub created_at: Option<DateTime<Utc>>,
  pub read_at: Option<DateTime<Utc>>,
  /// Optionally embedded sender profile from a joined select.
  pub sender: Option<OneOrMany<ProfileRow>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfileRow {
  pub id: Option<Uuid>,
  pub username: Option<String>,
  pub full_name: Option<String>,
  pub image_url: Option<String>,
  pub last_seen: Option<DateTime<Utc>>,
}

impl ProfileRow {
  fn into_profile(self) -> Option<Profile> {
    Some(Profile {
      id: self.id?,
      username: self.username,
      full_name: self.full_name,
      image_url: self.image_url,
      last_seen: self.last_seen,
    })
  }
}

/// Normalize a message row. Returns the message and, when the select
/// embedded one, the sender's profile.
///
/// Rows missing required keys are dropped with a debug log rather than
/// failing the whole read.
pub fn normalize_message(row: &Value) -> Option<(Message, Option<Profile>)> {
  let parsed: MessageRow = match serde_json::from_value(row.clone()) {
    Ok(parsed) => parsed,
    Err(e) => {
      debug!(error = %e, "skipping malformed message row");
      return None;
    }
  };

  let (Some(id), Some(sender_id), Some(recipient_id), Some(created_at)) = (
    parsed.id,
    parsed.sender_id,
    parsed.recipient_id,
    parsed.created_at,
  ) else {
    debug!("skipping message row with missing identity fields");
    return None;
  };

  let sender_profile = parsed
    .sender
    .and_then(OneOrMany::into_first)
    .and_then(ProfileRow::into_profile);

  Some((
    Message {
      id,
      sender_id,
      recipient_id,
      body: parsed.body,
      created_at,
      read_at: parsed.read_at,
    },
    sender_profile,
  ))
}

/// Normalize a profile row; rows without an id are dropped.
pub fn normalize_profile(row: &Value) -> Option<Profile> {
  let parsed: ProfileRow = match serde_json::from_value(row.clone()) {
    Ok(parsed) => parsed,
    Err(e) => {
      debug!(error = %e, "skipping malformed profile row");
      return None;
    }
  };
  parsed.into_profile()
}

/// Normalize a reference-data row (id + name).
pub fn normalize_reference(row: &Value) -> Option<ReferenceItem> {
  match serde_json::from_value(row.clone()) {
    Ok(item) => Some(item),
    Err(e) => {
      debug!(error = %e, "skipping malformed reference row");
      None
    }
  }
}
