//! Conversation reconciliation: derive threads from message history and
//! merge in manually-registered placeholders.
//!
//! A thread can be opened from many entry points before any message exists
//! (connection acceptance, seller directory, profile view). The merge lets
//! that placeholder appear in the list immediately while guaranteeing a
//! fetched entry is never clobbered by one.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use super::types::{is_online, Conversation, Message, Profile};

/// Build one conversation per counterpart from the full message history.
///
/// Keeps the most recent message per counterpart and accumulates the
/// unread count (inbound messages without a read timestamp). Display data
/// and presence come from the profile map when available.
pub fn conversations_from_messages(
  me: Uuid,
  messages: &[Message],
  profiles: &HashMap<Uuid, Profile>,
  now: DateTime<Utc>,
  presence_window: Duration,
) -> Vec<Conversation> {
  let mut by_counterpart: HashMap<Uuid, Conversation> = HashMap::new();

  for message in messages {
    let counterpart = message.counterpart(me);
    if counterpart == me {
      // Self-messages carry no thread.
      continue;
    }

    let entry = by_counterpart.entry(counterpart).or_insert_with(|| {
      let profile = profiles.get(&counterpart);
      let last_seen = profile.and_then(|p| p.last_seen);
      Conversation {
        user_id: counterpart,
        username: profile.and_then(|p| p.username.clone()),
        full_name: profile.and_then(|p| p.full_name.clone()),
        image_url: profile.and_then(|p| p.image_url.clone()),
        last_message: None,
        last_message_time: message.created_at,
        unread_count: 0,
        is_online: is_online(last_seen, now, presence_window),
        last_seen,
      }
    });

    if message.created_at >= entry.last_message_time || entry.last_message.is_none() {
      entry.last_message = Some(message.body.clone());
      entry.last_message_time = message.created_at;
    }
    if message.is_unread_inbound(me) {
      entry.unread_count += 1;
    }
  }

  let mut conversations: Vec<Conversation> = by_counterpart.into_values().collect();
  sort_recent_first(&mut conversations);
  conversations
}

/// Merge fetched conversations with manually-registered ones.
///
/// Fetched entries always win on a key collision: a placeholder is only
/// shown until real message data exists. The tie-break is strict and
/// non-commutative, so the merge must be applied in this argument order.
/// Output is sorted by recency; the whole operation is idempotent.
pub fn merge(fetched: Vec<Conversation>, manual: &[Conversation]) -> Vec<Conversation> {
  let mut by_counterpart: HashMap<Uuid, Conversation> = fetched
    .into_iter()
    .map(|c| (c.user_id, c))
    .collect();

  for placeholder in manual {
    by_counterpart
      .entry(placeholder.user_id)
      .or_insert_with(|| placeholder.clone());
  }

  let mut merged: Vec<Conversation> = by_counterpart.into_values().collect();
  sort_recent_first(&mut merged);
  merged
}

/// Descending by last message time; counterpart id as a deterministic
/// secondary key so repeated merges of equal inputs yield equal output.
fn sort_recent_first(conversations: &mut [Conversation]) {
  conversations.sort_by(|a, b| {
    b.last_message_time
      .cmp(&a.last_message_time)
      .then_with(|| a.user_id.cmp(&b.user_id))
  });
}
