//! Multi-instance chat bot supervisor with per-tenant hybrid knowledge stores.

pub mod cache;
pub mod config;
pub mod config_store;
pub mod embeddings;
pub mod error;
pub mod generation;
pub mod instance;
pub mod knowledge;
pub mod platform;
pub mod supervisor;
pub mod tenant;
pub mod vector_index;

pub use error::{Error, Result};
pub use supervisor::{InstanceUpdate, Reply, ReplySource, Supervisor, SupervisorSettings};

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
