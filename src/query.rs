//! Async fetch state for event-loop consumers.
//!
//! A `Query<T>` owns the fetching closure and the loading/success/error
//! state for one remote read (e.g. the conversation list in the watch
//! loop). Results arrive on a channel and are applied by `poll` from the
//! driving loop. A superseded fetch's receiver is dropped on `refetch`,
//! so a late response from an abandoned request is discarded rather than
//! applied.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// The state of a query.
#[derive(Clone)]
pub enum QueryState<T> {
  /// Not started yet.
  Idle,
  /// A fetch is in flight.
  Loading,
  /// Last fetch succeeded.
  Success(T),
  /// Last fetch failed.
  Error(String),
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, String>> + Send>>;
type FetcherFn<T> = Box<dyn Fn() -> BoxFuture<T> + Send + Sync>;

pub struct Query<T> {
  state: QueryState<T>,
  fetcher: FetcherFn<T>,
  pending: Option<oneshot::Receiver<Result<T, String>>>,
  fetched_at: Option<Instant>,
  stale_after: Duration,
}

impl<T: Send + 'static> Query<T> {
  /// Create a query around a fetcher closure. The closure is invoked anew
  /// for every `fetch`/`refetch`.
  pub fn new<F, Fut>(fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, String>> + Send + 'static,
  {
    Self {
      state: QueryState::Idle,
      fetcher: Box::new(move || Box::pin(fetcher())),
      pending: None,
      fetched_at: None,
      stale_after: Duration::from_secs(60),
    }
  }

  /// After this duration `is_stale` reports true and the driving loop
  /// should refetch.
  pub fn with_stale_after(mut self, duration: Duration) -> Self {
    self.stale_after = duration;
    self
  }

  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  pub fn data(&self) -> Option<&T> {
    match &self.state {
      QueryState::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&str> {
    match &self.state {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }

  pub fn is_loading(&self) -> bool {
    matches!(self.state, QueryState::Loading)
  }

  /// Whether successful data has outlived its freshness.
  pub fn is_stale(&self) -> bool {
    match &self.state {
      QueryState::Success(_) => self
        .fetched_at
        .map(|t| t.elapsed() > self.stale_after)
        .unwrap_or(true),
      _ => false,
    }
  }

  /// Force the next `fetch` to refetch regardless of freshness.
  pub fn invalidate(&mut self) {
    self.fetched_at = None;
  }

  /// Start a fetch unless one is already in flight.
  pub fn fetch(&mut self) {
    if self.is_loading() {
      return;
    }
    self.start();
  }

  /// Start a new fetch, discarding any in-flight one. The dropped
  /// receiver guarantees the superseded response is never applied.
  pub fn refetch(&mut self) {
    self.pending = None;
    self.start();
  }

  /// Apply a completed result if one arrived. Returns whether the state
  /// changed.
  pub fn poll(&mut self) -> bool {
    let Some(pending) = &mut self.pending else {
      return false;
    };

    match pending.try_recv() {
      Ok(Ok(data)) => {
        self.state = QueryState::Success(data);
        self.fetched_at = Some(Instant::now());
        self.pending = None;
        true
      }
      Ok(Err(error)) => {
        self.state = QueryState::Error(error);
        self.pending = None;
        true
      }
      Err(oneshot::error::TryRecvError::Empty) => false,
      Err(oneshot::error::TryRecvError::Closed) => {
        self.state = QueryState::Error("Fetch task dropped its result".to_string());
        self.pending = None;
        true
      }
    }
  }

  fn start(&mut self) {
    let (tx, rx) = oneshot::channel();
    self.pending = Some(rx);
    self.state = QueryState::Loading;

    let future = (self.fetcher)();
    tokio::spawn(async move {
      // The receiver may be gone if the query was superseded meanwhile.
      let _ = tx.send(future.await);
    });
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("state", &self.state)
      .field("fetched_at", &self.fetched_at)
      .field("stale_after", &self.stale_after)
      .finish_non_exhaustive()
  }
}

impl<T> std::fmt::Debug for QueryState<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      QueryState::Idle => write!(f, "Idle"),
      QueryState::Loading => write!(f, "Loading"),
      QueryState::Success(_) => write!(f, "Success"),
      QueryState::Error(e) => write!(f, "Error({})", e),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn success_path_applies_data_on_poll() {
    let mut query = Query::new(|| async { Ok::<_, String>(vec!["conversation".to_string()]) });

    assert!(matches!(query.state(), QueryState::Idle));
    query.fetch();
    assert!(query.is_loading());

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(query.poll());
    assert_eq!(query.data().map(|d| d.len()), Some(1));
  }

  #[tokio::test]
  async fn error_path_surfaces_the_message() {
    let mut query: Query<()> = Query::new(|| async { Err("backend unreachable".to_string()) });

    query.fetch();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(query.poll());
    assert_eq!(query.error(), Some("backend unreachable"));
  }

  #[tokio::test]
  async fn fetch_while_loading_is_a_noop() {
    let mut query = Query::new(|| async {
      tokio::time::sleep(Duration::from_millis(100)).await;
      Ok::<_, String>(1u32)
    });

    query.fetch();
    query.fetch();
    assert!(query.is_loading());
  }

  #[tokio::test]
  async fn superseded_fetch_result_is_never_applied() {
    let counter = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
    let c = counter.clone();

    let mut query = Query::new(move || {
      let c = c.clone();
      async move {
        tokio::time::sleep(Duration::from_millis(40)).await;
        Ok::<_, String>(c.fetch_add(1, std::sync::atomic::Ordering::SeqCst))
      }
    });

    query.fetch();
    tokio::time::sleep(Duration::from_millis(10)).await;
    query.refetch();
    tokio::time::sleep(Duration::from_millis(100)).await;

    query.poll();
    // Only the second fetch's value lands; the first was discarded.
    assert_eq!(query.data(), Some(&1));
  }

  #[tokio::test]
  async fn stale_after_and_invalidate() {
    let mut query =
      Query::new(|| async { Ok::<_, String>(0u32) }).with_stale_after(Duration::from_secs(60));

    query.fetch();
    tokio::time::sleep(Duration::from_millis(10)).await;
    query.poll();
    assert!(!query.is_stale());

    query.invalidate();
    assert!(query.is_stale());
  }
}
