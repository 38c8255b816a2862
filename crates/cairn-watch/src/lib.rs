//! Background observers of Cairn state.
//!
//! Two long-running tokio tasks live here: the [`Watcher`], which tails the
//! store's capped change log and fans entries out to per-document and
//! per-collection subscribers, and the presence pair ([`Pinger`] writing
//! heartbeats, [`PresenceWatcher`] folding them into alive/dead status).
//! Both deliver through [`Subscription`]s that coalesce rather than queue,
//! so a slow consumer never holds up the tailing loop.

pub mod hub;
pub mod presence;
pub mod watcher;

pub use hub::{Coalesce, Hub, Notification, Subscription};
pub use presence::{Pinger, PresenceChange, PresenceWatcher, PRESENCE};
pub use watcher::{Target, Watcher};

use cairn_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watcher is stopped")]
    Stopped,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("background task failed: {0}")]
    Task(String),
}

/// Run a blocking store call off the async worker threads.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, WatchError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| WatchError::Task(e.to_string()))?
        .map_err(WatchError::from)
}
