//! Messaging domain: conversation reconciliation, thread transcripts, and
//! the cached operations layer over the remote data interface.

pub mod client;
pub mod reconcile;
pub mod rows;
pub mod thread;
pub mod types;

pub use client::{ChatClient, Tunables};
pub use thread::Transcript;
pub use types::{Conversation, ConversationHint, Message, Profile, ReferenceItem};
