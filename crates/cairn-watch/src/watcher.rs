//! Change-log tailing and per-document notification.

use crate::hub::{Coalesce, Hub, Subscription};
use crate::{blocking, WatchError};
use cairn_schema::WatcherSection;
use cairn_store::{ChangeEntry, DocumentStore, LogRead};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const READ_BATCH: usize = 256;

/// What a subscription is interested in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Target {
    Document { collection: String, id: String },
    Collection(String),
}

impl Target {
    pub fn document(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Target::Document {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl Coalesce for ChangeEntry {
    type Key = (String, String);

    fn coalesce_key(&self) -> (String, String) {
        (self.collection.clone(), self.id.clone())
    }
}

/// Tails the change log in one background task.
///
/// Subscribers are told that a document changed, never what it contains;
/// they re-read through the transaction runner.
pub struct Watcher {
    hub: Hub<Target, ChangeEntry>,
    sync_tx: mpsc::UnboundedSender<oneshot::Sender<()>>,
    shutdown: watch::Sender<bool>,
    stopped: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct TailLoop {
    store: Arc<dyn DocumentStore>,
    hub: Hub<Target, ChangeEntry>,
    cursor: u64,
    /// The last poll failed; subscribers need a resync once it succeeds.
    broken: bool,
}

impl Watcher {
    /// Start tailing from the current end of the log.
    ///
    /// The position is read before returning, so every change committed
    /// after `start` is delivered to subscribers.
    pub fn start(
        store: Arc<dyn DocumentStore>,
        config: &WatcherSection,
        handle: &Handle,
    ) -> Result<Self, WatchError> {
        let head = store.log_head()?;
        debug!("watcher starting at log position {head}");
        let hub = Hub::new();
        let (sync_tx, sync_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let tail = TailLoop {
            store,
            hub: hub.clone(),
            cursor: head,
            broken: false,
        };
        let task = handle.spawn(tail.run(config.poll_interval(), sync_rx, shutdown_rx));
        Ok(Self {
            hub,
            sync_tx,
            shutdown,
            stopped: AtomicBool::new(false),
            task: Mutex::new(Some(task)),
        })
    }

    pub fn watch_document(&self, collection: &str, id: &str) -> Subscription<Target, ChangeEntry> {
        self.hub.subscribe(Target::document(collection, id))
    }

    pub fn watch_collection(&self, collection: &str) -> Subscription<Target, ChangeEntry> {
        self.hub.subscribe(Target::Collection(collection.to_owned()))
    }

    /// Poll the log now and wait until everything appended so far has been
    /// dispatched.
    pub async fn sync(&self) -> Result<(), WatchError> {
        if self.is_stopped() {
            return Err(WatchError::Stopped);
        }
        let (tx, rx) = oneshot::channel();
        self.sync_tx.send(tx).map_err(|_| WatchError::Stopped)?;
        rx.await.map_err(|_| WatchError::Stopped)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop the tailing task and close every subscription.
    pub fn stop(&self) -> Result<(), WatchError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Err(WatchError::Stopped);
        }
        let _ = self.shutdown.send(true);
        self.hub.close_all();
        debug!("watcher stopped");
        Ok(())
    }

    /// Wait for the background task to exit after [`stop`](Self::stop).
    pub async fn join(&self) -> Result<(), WatchError> {
        let task = self
            .task
            .lock()
            .map_err(|e| WatchError::Task(format!("mutex poisoned: {e}")))?
            .take();
        match task {
            Some(task) => task.await.map_err(|e| WatchError::Task(e.to_string())),
            None => Ok(()),
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

impl TailLoop {
    async fn run(
        mut self,
        poll_interval: std::time::Duration,
        mut sync_rx: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(reply) = sync_rx.recv() => {
                    self.poll().await;
                    let _ = reply.send(());
                }
                _ = ticker.tick() => self.poll().await,
            }
        }
        info!("change-log watcher exiting");
    }

    async fn poll(&mut self) {
        if let Err(e) = self.try_poll().await {
            if !self.broken {
                warn!("change-log watcher lost the store: {e}");
            }
            self.broken = true;
        }
    }

    async fn try_poll(&mut self) -> Result<(), WatchError> {
        let mut cursor = self.cursor;
        loop {
            let store = self.store.clone();
            let read: LogRead = blocking(move || store.read_log(cursor, READ_BATCH)).await?;
            if self.broken {
                info!("change-log watcher reconnected; resyncing subscribers");
                self.broken = false;
                self.hub.resync_all();
            }
            if read.gap {
                warn!(
                    "change log evicted entries after {cursor} (head {}); resyncing subscribers",
                    read.head
                );
                self.hub.resync_all();
                cursor = read.head;
                self.cursor = cursor;
                return Ok(());
            }
            let batch_len = read.entries.len();
            for entry in &read.entries {
                self.dispatch(entry);
                cursor = entry.seq;
            }
            self.cursor = cursor;
            if batch_len < READ_BATCH {
                return Ok(());
            }
        }
    }

    fn dispatch(&self, entry: &ChangeEntry) {
        self.hub.deliver(
            &Target::document(entry.collection.as_str(), entry.id.as_str()),
            entry,
        );
        self.hub
            .deliver(&Target::Collection(entry.collection.clone()), entry);
    }
}
