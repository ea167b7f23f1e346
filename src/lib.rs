//! Asana webhook receiver.
//!
//! Accepts the `X-Hook-Secret` handshake, authenticates event batches with
//! HMAC-SHA256 over the raw request body, keeps a bounded in-memory history
//! and fans every event out to Server-Sent-Events subscribers. Durable
//! writes go through a detached [`persistence::PersistenceQueue`] and never
//! hold up the response to the sender.

pub mod broadcast;
pub mod config;
pub mod error;
pub mod history;
pub mod http_server;
pub mod persistence;
pub mod receiver;
pub mod secret;
pub mod store;
pub mod types;
pub mod verification;

pub use config::Config;
pub use error::{ConfigError, ReceiverError, StoreError};
pub use receiver::AppState;
