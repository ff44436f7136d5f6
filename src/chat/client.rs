//! Cached operations layer over the remote data interface.
//!
//! `ChatClient` wraps a `DataSource` the way the UI consumes it: reads go
//! through the TTL cache, mutations invalidate the keys they make stale,
//! and the conversation list is the reconciled view of fetched history
//! plus manually-registered threads.

use chrono::{Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

use crate::cache::{digest_key, TtlCache};
use crate::realtime::Subscription;
use crate::source::{DataSource, Filter, Select};

use super::reconcile;
use super::rows::{normalize_message, normalize_profile, normalize_reference};
use super::thread::Transcript;
use super::types::{is_online, Conversation, ConversationHint, Message, Profile, ReferenceItem};

/// Product-tuned knobs. None of these are invariants; the defaults mirror
/// the shipped product behavior.
#[derive(Debug, Clone, Copy)]
pub struct Tunables {
  /// Freshness window for the online indicator.
  pub presence_window: Duration,
  /// TTL for the conversation list.
  pub list_ttl: Duration,
  /// TTL for detail reads (thread history, profiles, records).
  pub detail_ttl: Duration,
  /// TTL for reference data in the persistent namespace.
  pub reference_ttl: Duration,
}

impl Default for Tunables {
  fn default() -> Self {
    Self {
      presence_window: Duration::minutes(5),
      list_ttl: Duration::minutes(5),
      detail_ttl: Duration::minutes(10),
      reference_ttl: Duration::minutes(30),
    }
  }
}

pub struct ChatClient {
  source: Arc<dyn DataSource>,
  /// Session namespace for query results.
  cache: TtlCache,
  /// Persistent namespace for reference data.
  reference: TtlCache,
  tunables: Tunables,
  me: Uuid,
  /// Threads opened before any message exists, keyed by counterpart.
  manual: Mutex<HashMap<Uuid, Conversation>>,
}

impl ChatClient {
  pub fn new(source: Arc<dyn DataSource>, me: Uuid) -> Self {
    Self {
      source,
      cache: TtlCache::in_memory(),
      reference: TtlCache::in_memory(),
      tunables: Tunables::default(),
      me,
      manual: Mutex::new(HashMap::new()),
    }
  }

  /// Use a persistent cache (sqlite-backed) for the reference namespace.
  pub fn with_reference_cache(mut self, cache: TtlCache) -> Self {
    self.reference = cache;
    self
  }

  pub fn with_tunables(mut self, tunables: Tunables) -> Self {
    self.tunables = tunables;
    self
  }

  pub fn user_id(&self) -> Uuid {
    self.me
  }

  // ==========================================================================
  // Conversations
  // ==========================================================================

  /// The reconciled conversation list: cached fetch of message-derived
  /// threads, merged with manual registrations, most recent first.
  pub async fn conversations(&self) -> Result<Vec<Conversation>> {
    let key = self.conversations_key();
    let fetched = self
      .cache
      .fetch_with(&key, self.tunables.list_ttl, || async {
        self.fetch_conversations().await
      })
      .await?;

    let manual: Vec<Conversation> = {
      let registry = self.manual.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
      registry.values().cloned().collect()
    };

    Ok(reconcile::merge(fetched, &manual))
  }

  /// Register a thread for a user with no message history yet so it shows
  /// in the list immediately. The profile lookup is best-effort: on
  /// failure the hint's own display data stands.
  pub async fn register_conversation(&self, hint: ConversationHint) -> Result<Conversation> {
    let mut conversation = Conversation {
      user_id: hint.user_id,
      username: hint.username,
      full_name: hint.full_name,
      image_url: hint.image_url,
      last_message: None,
      // "Now" so the placeholder sorts to the top until messages arrive.
      last_message_time: Utc::now(),
      unread_count: 0,
      is_online: false,
      last_seen: None,
    };

    match self.profile(hint.user_id).await {
      Ok(Some(profile)) => {
        conversation.username = conversation.username.or(profile.username);
        conversation.full_name = conversation.full_name.or(profile.full_name);
        conversation.image_url = conversation.image_url.or(profile.image_url);
        conversation.last_seen = profile.last_seen;
        conversation.is_online =
          is_online(profile.last_seen, Utc::now(), self.tunables.presence_window);
      }
      Ok(None) => {}
      Err(e) => {
        debug!(user_id = %hint.user_id, error = %e, "profile enrichment failed, using hint data");
      }
    }

    let mut registry = self.manual.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    registry.insert(conversation.user_id, conversation.clone());
    Ok(conversation)
  }

  /// Drop the cached conversation list so the next read re-runs the
  /// fetch-and-merge cycle. Used when a realtime event lands.
  pub fn invalidate_conversations(&self) {
    self.cache.clear(&self.conversations_key());
  }

  async fn fetch_conversations(&self) -> Result<Vec<Conversation>> {
    let me = json!(self.me);
    let rows = self
      .source
      .select(
        Select::table("messages")
          .filter(Filter::Or(vec![
            Filter::Eq("sender_id".into(), me.clone()),
            Filter::Eq("recipient_id".into(), me),
          ]))
          .order_desc("created_at"),
      )
      .await?;

    let mut messages = Vec::with_capacity(rows.len());
    let mut profiles: HashMap<Uuid, Profile> = HashMap::new();
    for row in &rows {
      if let Some((message, embedded)) = normalize_message(row) {
        if let Some(profile) = embedded {
          profiles.entry(profile.id).or_insert(profile);
        }
        messages.push(message);
      }
    }

    // One batched lookup for every counterpart the join didn't cover.
    let missing: Vec<Value> = messages
      .iter()
      .map(|m| m.counterpart(self.me))
      .filter(|id| *id != self.me && !profiles.contains_key(id))
      .collect::<std::collections::HashSet<_>>()
      .into_iter()
      .map(|id| json!(id))
      .collect();

    if !missing.is_empty() {
      match self
        .source
        .select(Select::table("profiles").filter(Filter::In("id".into(), missing)))
        .await
      {
        Ok(rows) => {
          for profile in rows.iter().filter_map(normalize_profile) {
            profiles.insert(profile.id, profile);
          }
        }
        Err(e) => {
          // Display enrichment only; the list still renders without it.
          debug!(error = %e, "profile batch lookup failed");
        }
      }
    }

    Ok(reconcile::conversations_from_messages(
      self.me,
      &messages,
      &profiles,
      Utc::now(),
      self.tunables.presence_window,
    ))
  }

  // ==========================================================================
  // Threads and messages
  // ==========================================================================

  /// Message history with one counterpart, oldest first.
  pub async fn thread(&self, with: Uuid) -> Result<Vec<Message>> {
    let key = self.thread_key(with);
    self
      .cache
      .fetch_with(&key, self.tunables.detail_ttl, || async {
        let rows = self
          .source
          .select(
            Select::table("messages")
              .filter(pair_filter(self.me, with))
              .order_asc("created_at"),
          )
          .await?;
        Ok(rows.iter().filter_map(|r| normalize_message(r).map(|(m, _)| m)).collect())
      })
      .await
  }

  /// Open a thread for live viewing: change-feed subscription plus the
  /// initial transcript. Subscribing before the history fetch closes the
  /// gap where a message lands between the two; the transcript's id
  /// de-duplication absorbs the overlap.
  pub async fn open_thread(&self, with: Uuid) -> Result<(Transcript, Subscription)> {
    let subscription = self
      .source
      .subscribe("messages", Some(pair_filter(self.me, with)))?;

    // Live view must not serve a cached transcript.
    self.cache.clear(&self.thread_key(with));
    let history = self.thread(with).await?;

    Ok((Transcript::new(history), subscription))
  }

  /// Send a message. Validation runs before any remote call; on failure
  /// the caller still holds the input for retry.
  pub async fn send_message(&self, to: Uuid, body: &str) -> Result<Message> {
    let body = body.trim();
    if body.is_empty() {
      return Err(eyre!("Message body is empty"));
    }

    let row = self
      .source
      .insert(
        "messages",
        json!({
          "sender_id": self.me,
          "recipient_id": to,
          "body": body,
        }),
      )
      .await?;

    // The cached list and thread are stale now.
    self.cache.clear(&self.conversations_key());
    self.cache.clear(&self.thread_key(to));

    normalize_message(&row)
      .map(|(message, _)| message)
      .ok_or_else(|| eyre!("Backend returned a malformed message row"))
  }

  /// Mark every message from `with` as read. Runs server-side so the
  /// read timestamps land atomically.
  pub async fn mark_read(&self, with: Uuid) -> Result<()> {
    self
      .source
      .invoke(
        "mark_messages_read",
        json!({ "sender_id": with, "recipient_id": self.me }),
      )
      .await?;

    self.cache.clear(&self.conversations_key());
    self.cache.clear(&self.thread_key(with));
    Ok(())
  }

  // ==========================================================================
  // Profiles, records, reference data
  // ==========================================================================

  /// A user's profile; an absent row is not an error.
  pub async fn profile(&self, user_id: Uuid) -> Result<Option<Profile>> {
    let key = digest_key(&format!("profile:{}", user_id));
    self
      .cache
      .fetch_with(&key, self.tunables.detail_ttl, || async {
        let rows = self
          .source
          .select(
            Select::table("profiles")
              .filter(Filter::Eq("id".into(), json!(user_id)))
              .range(0, 1),
          )
          .await?;
        Ok(rows.first().and_then(normalize_profile))
      })
      .await
  }

  /// A content record (blog post, classified) by id, cached as a detail
  /// read.
  pub async fn record(&self, record_id: Uuid) -> Result<Option<Value>> {
    let key = record_cache_key(record_id);
    self
      .cache
      .fetch_with(&key, self.tunables.detail_ttl, || async {
        let rows = self
          .source
          .select(
            Select::table("posts")
              .filter(Filter::Eq("id".into(), json!(record_id)))
              .range(0, 1),
          )
          .await?;
        Ok(rows.into_iter().next())
      })
      .await
  }

  /// Toggle a like/dislike on a record. Server-side so concurrent toggles
  /// settle atomically; the cached detail is stale afterwards.
  pub async fn toggle_reaction(&self, record_id: Uuid, reaction: &str) -> Result<()> {
    self
      .source
      .invoke(
        "toggle_reaction",
        json!({ "record_id": record_id, "reaction": reaction, "user_id": self.me }),
      )
      .await?;

    self.cache.clear(&record_cache_key(record_id));
    Ok(())
  }

  /// Bump a record's view counter. Non-critical background write: failure
  /// is logged and swallowed.
  pub async fn increment_view(&self, record_id: Uuid) {
    if let Err(e) = self
      .source
      .invoke("increment_view", json!({ "record_id": record_id }))
      .await
    {
      debug!(record_id = %record_id, error = %e, "view count increment failed");
    }
  }

  pub async fn categories(&self) -> Result<Vec<ReferenceItem>> {
    self.reference_list("categories").await
  }

  pub async fn countries(&self) -> Result<Vec<ReferenceItem>> {
    self.reference_list("countries").await
  }

  async fn reference_list(&self, table: &'static str) -> Result<Vec<ReferenceItem>> {
    self
      .reference
      .fetch_with(table, self.tunables.reference_ttl, || async {
        let rows = self
          .source
          .select(Select::table(table).order_asc("name"))
          .await?;
        Ok(rows.iter().filter_map(normalize_reference).collect())
      })
      .await
  }

  fn conversations_key(&self) -> String {
    digest_key(&format!("conversations:{}", self.me))
  }

  fn thread_key(&self, with: Uuid) -> String {
    digest_key(&format!("thread:{}:{}", self.me, with))
  }
}

fn record_cache_key(record_id: Uuid) -> String {
  digest_key(&format!("record:{}", record_id))
}

/// Both directions of a two-party thread.
fn pair_filter(a: Uuid, b: Uuid) -> Filter {
  let a = json!(a);
  let b = json!(b);
  Filter::Or(vec![
    Filter::And(vec![
      Filter::Eq("sender_id".into(), a.clone()),
      Filter::Eq("recipient_id".into(), b.clone()),
    ]),
    Filter::And(vec![
      Filter::Eq("sender_id".into(), b),
      Filter::Eq("recipient_id".into(), a),
    ]),
  ])
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::source::MemorySource;

  fn uid(n: u8) -> Uuid {
    Uuid::from_u128(n as u128)
  }

  fn message_row(sender: Uuid, recipient: Uuid, body: &str, created_at: &str) -> Value {
    json!({
      "id": Uuid::new_v4(),
      "sender_id": sender,
      "recipient_id": recipient,
      "body": body,
      "created_at": created_at,
      "read_at": null
    })
  }

  fn client_with_source() -> (Arc<MemorySource>, ChatClient) {
    let source = Arc::new(MemorySource::new());
    let client = ChatClient::new(source.clone(), uid(1));
    (source, client)
  }

  #[tokio::test]
  async fn conversations_group_and_sort_history() {
    let (source, client) = client_with_source();
    source.seed(
      "messages",
      vec![
        message_row(uid(2), uid(1), "old thread", "2024-01-01T10:00:00Z"),
        message_row(uid(1), uid(3), "newer thread", "2024-01-02T10:00:00Z"),
        message_row(uid(3), uid(1), "newest", "2024-01-03T10:00:00Z"),
      ],
    );

    let convs = client.conversations().await.unwrap();
    assert_eq!(convs.len(), 2);
    assert_eq!(convs[0].user_id, uid(3));
    assert_eq!(convs[0].last_message.as_deref(), Some("newest"));
    assert_eq!(convs[0].unread_count, 1);
    assert_eq!(convs[1].user_id, uid(2));
  }

  #[tokio::test]
  async fn registered_conversation_appears_until_history_exists() {
    let (source, client) = client_with_source();
    source.seed(
      "messages",
      vec![message_row(uid(2), uid(1), "hello", "2024-01-01T10:00:00Z")],
    );
    source.seed(
      "profiles",
      vec![json!({ "id": uid(9), "username": "newbie" })],
    );

    client
      .register_conversation(ConversationHint::for_user(uid(9)))
      .await
      .unwrap();

    let convs = client.conversations().await.unwrap();
    assert_eq!(convs.len(), 2);
    // Placeholder registered "now" sorts above yesterday's history and
    // carries the enriched profile data.
    assert_eq!(convs[0].user_id, uid(9));
    assert_eq!(convs[0].username.as_deref(), Some("newbie"));
    assert!(convs[0].last_message.is_none());
  }

  #[tokio::test]
  async fn fetched_entry_wins_over_registration_for_same_user() {
    let (source, client) = client_with_source();
    source.seed(
      "messages",
      vec![message_row(uid(2), uid(1), "real history", "2024-01-01T10:00:00Z")],
    );

    client
      .register_conversation(ConversationHint::for_user(uid(2)))
      .await
      .unwrap();

    let convs = client.conversations().await.unwrap();
    assert_eq!(convs.len(), 1);
    assert_eq!(convs[0].last_message.as_deref(), Some("real history"));
  }

  #[tokio::test]
  async fn registration_survives_profile_lookup_failure() {
    // No profiles table seeded; lookup returns nothing but the hint's
    // display data stands and the call succeeds.
    let (_source, client) = client_with_source();

    let hint = ConversationHint {
      user_id: uid(5),
      username: Some("fallback".into()),
      ..Default::default()
    };
    let conv = client.register_conversation(hint).await.unwrap();
    assert_eq!(conv.username.as_deref(), Some("fallback"));
  }

  #[tokio::test]
  async fn send_message_invalidates_the_cached_list() {
    let (source, client) = client_with_source();
    source.seed(
      "messages",
      vec![message_row(uid(2), uid(1), "first", "2024-01-01T10:00:00Z")],
    );

    // Prime the cache.
    let before = client.conversations().await.unwrap();
    assert_eq!(before[0].last_message.as_deref(), Some("first"));

    client.send_message(uid(2), "reply").await.unwrap();

    let after = client.conversations().await.unwrap();
    assert_eq!(after[0].last_message.as_deref(), Some("reply"));
  }

  #[tokio::test]
  async fn empty_message_body_fails_before_any_remote_call() {
    let (_source, client) = client_with_source();
    assert!(client.send_message(uid(2), "   ").await.is_err());
  }

  #[tokio::test]
  async fn mark_read_runs_server_side_and_refreshes_unread() {
    let (source, client) = client_with_source();
    source.seed(
      "messages",
      vec![
        message_row(uid(2), uid(1), "one", "2024-01-01T10:00:00Z"),
        message_row(uid(2), uid(1), "two", "2024-01-01T11:00:00Z"),
      ],
    );
    source.register_rpc("mark_messages_read", |tables, args| {
      let rows = tables.entry("messages".to_string()).or_default();
      for row in rows.iter_mut() {
        if row["sender_id"] == args["sender_id"] && row["recipient_id"] == args["recipient_id"] {
          row["read_at"] = json!("2024-01-01T12:00:00Z");
        }
      }
      Ok(Value::Null)
    });

    assert_eq!(client.conversations().await.unwrap()[0].unread_count, 2);

    client.mark_read(uid(2)).await.unwrap();
    assert_eq!(client.conversations().await.unwrap()[0].unread_count, 0);
  }

  #[tokio::test]
  async fn open_thread_deduplicates_realtime_overlap() {
    let (source, client) = client_with_source();
    source.seed(
      "messages",
      vec![message_row(uid(2), uid(1), "history", "2024-01-01T10:00:00Z")],
    );

    let (mut transcript, mut sub) = client.open_thread(uid(2)).await.unwrap();
    assert_eq!(transcript.len(), 1);

    let sent = client.send_message(uid(2), "live").await.unwrap();
    let event = sub.next().await.unwrap();
    assert!(transcript.apply_event(&event));
    assert_eq!(transcript.len(), 2);

    // Applying the sent message again (already seen via the feed) is a
    // no-op.
    assert!(!transcript.apply(sent));
  }

  #[tokio::test]
  async fn thread_history_is_cached_as_a_detail_read() {
    let (source, client) = client_with_source();
    let client = client.with_tunables(Tunables {
      list_ttl: Duration::zero(),
      ..Tunables::default()
    });
    source.seed(
      "messages",
      vec![message_row(uid(2), uid(1), "first", "2024-01-01T10:00:00Z")],
    );

    assert_eq!(client.thread(uid(2)).await.unwrap().len(), 1);

    // A row landing behind the cache's back stays invisible while the
    // detail TTL holds, even with the list TTL already expired.
    source.seed(
      "messages",
      vec![message_row(uid(2), uid(1), "second", "2024-01-01T11:00:00Z")],
    );
    assert_eq!(client.thread(uid(2)).await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn missing_profile_is_none_not_an_error() {
    let (_source, client) = client_with_source();
    assert!(client.profile(uid(42)).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn toggle_reaction_invalidates_the_record_cache() {
    let (source, client) = client_with_source();
    source.seed("posts", vec![json!({ "id": uid(7), "likes": 0 })]);
    source.register_rpc("toggle_reaction", |tables, args| {
      let rows = tables.entry("posts".to_string()).or_default();
      for row in rows.iter_mut() {
        if row["id"] == args["record_id"] {
          row["likes"] = json!(row["likes"].as_u64().unwrap_or(0) + 1);
        }
      }
      Ok(Value::Null)
    });

    let before = client.record(uid(7)).await.unwrap().unwrap();
    assert_eq!(before["likes"], 0);

    client.toggle_reaction(uid(7), "like").await.unwrap();

    let after = client.record(uid(7)).await.unwrap().unwrap();
    assert_eq!(after["likes"], 1);
  }

  #[tokio::test]
  async fn increment_view_swallows_failures() {
    // No rpc registered: the call fails remotely but not locally.
    let (_source, client) = client_with_source();
    client.increment_view(uid(7)).await;
  }

  #[tokio::test]
  async fn reference_lists_are_cached_in_their_own_namespace() {
    let (source, client) = client_with_source();
    source.seed(
      "countries",
      vec![
        json!({ "id": uid(20), "name": "Portugal" }),
        json!({ "id": uid(21), "name": "Austria" }),
      ],
    );

    let countries = client.countries().await.unwrap();
    assert_eq!(countries.len(), 2);
    // Backend orders by name ascending.
    assert_eq!(countries[0].name, "Austria");

    // Second read is served from cache even if the table empties.
    source
      .delete("countries", vec![Filter::NotNull("id".into())])
      .await
      .unwrap();
    assert_eq!(client.countries().await.unwrap().len(), 2);
  }
}
