//! Transcript state for the active conversation thread.

use std::collections::HashSet;
use uuid::Uuid;

use crate::realtime::{ChangeEvent, ChangeOp};

use super::rows::normalize_message;
use super::types::Message;

/// The ordered message list for one open thread.
///
/// Realtime delivery can overlap the initial history fetch, so every
/// append is de-duplicated by message id.
#[derive(Debug)]
pub struct Transcript {
  messages: Vec<Message>,
  seen: HashSet<Uuid>,
}

impl Transcript {
  pub fn new(history: Vec<Message>) -> Self {
    let mut transcript = Self {
      messages: Vec::with_capacity(history.len()),
      seen: HashSet::with_capacity(history.len()),
    };
    for message in history {
      transcript.apply(message);
    }
    transcript
  }

  /// Append a message unless its id was already seen. Returns whether the
  /// transcript changed.
  pub fn apply(&mut self, message: Message) -> bool {
    if !self.seen.insert(message.id) {
      return false;
    }
    self.messages.push(message);
    true
  }

  /// Apply a change-feed event. Only inserts extend a transcript; updates
  /// (read receipts) and deletes are picked up by the next reload.
  pub fn apply_event(&mut self, event: &ChangeEvent) -> bool {
    if event.op != ChangeOp::Insert {
      return false;
    }
    match normalize_message(&event.row) {
      Some((message, _)) => self.apply(message),
      None => false,
    }
  }

  pub fn messages(&self) -> &[Message] {
    &self.messages
  }

  pub fn len(&self) -> usize {
    self.messages.len()
  }

  pub fn is_empty(&self) -> bool {
    self.messages.is_empty()
  }
}
