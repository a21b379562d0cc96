/// ChatMirror - read-only mirror of a local chat log
///
/// Polls an externally owned SQLite chat database, keeps an incrementally
/// refreshed in-memory copy of its conversations, and serves it over HTTP.

pub mod attachments;
pub mod bridge;
pub mod cache;
pub mod config;
pub mod decode;
pub mod error;
pub mod messenger_api;
pub mod mirror;
pub mod models;
pub mod queries;
pub mod refresh;
pub mod store;
pub mod watcher;

pub use config::Config;
pub use error::{MirrorError, Result};
pub use mirror::Mirror;
