//! chatsync: client-side data layer for a social messaging platform.
//!
//! The backend owns authentication, storage, and row-level security; this
//! crate owns what the client does with it: a TTL cache over idempotent
//! reads, conversation reconciliation (fetched history merged with
//! locally-opened threads), change-feed subscriptions with scoped
//! teardown, and the cached operations layer the UI calls.

pub mod cache;
pub mod chat;
pub mod config;
pub mod query;
pub mod realtime;
pub mod source;

pub use chat::{ChatClient, Conversation, ConversationHint, Message, Profile, Transcript, Tunables};
pub use config::Config;
