//! Domain types for the messaging layer.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single direct message between two users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
  pub id: Uuid,
  pub sender_id: Uuid,
  pub recipient_id: Uuid,
  pub body: String,
  pub created_at: DateTime<Utc>,
  /// When the recipient read the message; `None` means unread.
  pub read_at: Option<DateTime<Utc>>,
}

impl Message {
  /// The other participant of this message relative to `me`.
  pub fn counterpart(&self, me: Uuid) -> Uuid {
    if self.sender_id == me {
      self.recipient_id
    } else {
      self.sender_id
    }
  }

  /// Whether this message counts toward `me`'s unread total.
  pub fn is_unread_inbound(&self, me: Uuid) -> bool {
    self.recipient_id == me && self.read_at.is_none()
  }
}

/// A user's public profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
  pub id: Uuid,
  pub username: Option<String>,
  pub full_name: Option<String>,
  pub image_url: Option<String>,
  pub last_seen: Option<DateTime<Utc>>,
}

/// A distinct chat thread with one counterpart user.
///
/// Invariant: any merged conversation view holds at most one entry per
/// counterpart `user_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
  pub user_id: Uuid,
  pub username: Option<String>,
  pub full_name: Option<String>,
  pub image_url: Option<String>,
  /// Most recent message body; `None` for a synthesized thread with no
  /// messages yet.
  pub last_message: Option<String>,
  pub last_message_time: DateTime<Utc>,
  pub unread_count: u32,
  pub is_online: bool,
  pub last_seen: Option<DateTime<Utc>>,
}

/// Identifying data supplied when opening a thread with a user who has no
/// message history yet (e.g. from a "Message" button on a profile).
#[derive(Debug, Clone, Default)]
pub struct ConversationHint {
  pub user_id: Uuid,
  pub username: Option<String>,
  pub full_name: Option<String>,
  pub image_url: Option<String>,
}

impl ConversationHint {
  pub fn for_user(user_id: Uuid) -> Self {
    Self {
      user_id,
      ..Self::default()
    }
  }
}

/// Reference-data row (categories, countries) cached in the persistent
/// namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceItem {
  pub id: Uuid,
  pub name: String,
}

/// Point-in-time presence: active within the freshness window counts as
/// online. This does not update between reloads.
pub fn is_online(last_seen: Option<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) -> bool {
  match last_seen {
    Some(seen) => now - seen <= window,
    None => false,
  }
}
