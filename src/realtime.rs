//! Change-feed events and the scoped subscription handle.
//!
//! A `Subscription` owns the receiving end of a change feed plus the task
//! producing into it. Dropping the handle is the unsubscribe operation, so
//! teardown happens on every exit path: switching the active thread or
//! tearing down a view just drops the old handle.

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Kind of row-level change delivered by a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
  Insert,
  Update,
  Delete,
}

/// A row-level change notification.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
  pub op: ChangeOp,
  pub table: String,
  /// The affected row as the backend represents it.
  pub row: Value,
}

/// Handle to an active change-feed subscription.
///
/// One subscription is opened per active conversation thread; open a new
/// one only after dropping the old handle, otherwise the same message is
/// delivered twice.
pub struct Subscription {
  rx: mpsc::UnboundedReceiver<ChangeEvent>,
  task: Option<JoinHandle<()>>,
}

impl Subscription {
  /// Build a subscription from a receiver and the task feeding it.
  pub fn new(rx: mpsc::UnboundedReceiver<ChangeEvent>, task: JoinHandle<()>) -> Self {
    Self {
      rx,
      task: Some(task),
    }
  }

  /// Receive the next event. Returns `None` once the feed is closed.
  pub async fn next(&mut self) -> Option<ChangeEvent> {
    self.rx.recv().await
  }

  /// Drain any events that are already queued, without waiting.
  pub fn drain(&mut self) -> Vec<ChangeEvent> {
    let mut events = Vec::new();
    while let Ok(event) = self.rx.try_recv() {
      events.push(event);
    }
    events
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(task) = self.task.take() {
      task.abort();
    }
  }
}
