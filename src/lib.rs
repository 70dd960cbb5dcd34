//! Storage-backed durability layer for a transactional message queue.
//!
//! Messages are staged in `published`/`received` tables, promoted into a
//! transient `queue` table, and claimed one at a time by [`QueueFetcher`].
//! Each claim is a [`MessageLease`] holding a token on the queue row until it
//! is acknowledged (row deleted) or abandoned (row released).

pub mod bookkeeper;
pub mod config;
pub mod db;
pub mod error;
pub mod fetcher;
pub mod lease;
pub mod model;

pub use bookkeeper::Bookkeeper;
pub use db::{ConnectionProvider, SqliteConnectionProvider};
pub use error::StoreError;
pub use fetcher::QueueFetcher;
pub use lease::{LeaseConfig, LeaseState, LeaseTransaction, MessageLease};
pub use model::{
    MessageEnvelope, MessageType, NewPublishedMessage, NewReceivedMessage, PublishedMessage,
    ReceivedMessage, StatusName,
};
