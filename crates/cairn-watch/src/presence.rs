//! Heartbeat-based agent liveness.
//!
//! A [`Pinger`] bumps a per-agent sequence number in the `presence`
//! collection every ping interval. A [`PresenceWatcher`] scans those
//! documents and judges staleness purely against its own clock: an agent is
//! alive while its sequence keeps moving and dead once it has been still for
//! the grace window. On start every agent is presumed dead until its
//! sequence moves.
//!
//! Every flip is also appended to the change log under the `presence`
//! collection, so collection watchers learn about it too. The entry's
//! `revno` is the heartbeat sequence that revived the agent, or `None`
//! when it died.

use crate::hub::{Coalesce, Hub, Subscription};
use crate::{blocking, WatchError};
use cairn_schema::{AgentId, PresenceSection};
use cairn_store::{Document, DocumentStore, Expect, Fields};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Collection holding one heartbeat document per agent.
pub const PRESENCE: &str = "presence";

/// An agent's liveness flipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    pub agent: AgentId,
    pub alive: bool,
}

impl Coalesce for PresenceChange {
    type Key = AgentId;

    fn coalesce_key(&self) -> AgentId {
        self.agent.clone()
    }
}

fn ping_once(store: &dyn DocumentStore, agent: &AgentId) -> Result<u64, cairn_store::StoreError> {
    let current = store.get(PRESENCE, agent)?;
    let last = current.as_ref().map_or(0, |d| d.i64_field("seq"));
    let seq = u64::try_from(last).unwrap_or(0) + 1;
    let mut fields = Fields::new();
    fields.insert("agent".to_owned(), Value::from(agent.as_str()));
    fields.insert("seq".to_owned(), Value::from(seq));
    fields.insert(
        "at".to_owned(),
        Value::from(chrono::Utc::now().to_rfc3339()),
    );
    let mut doc = Document::new(agent.as_str(), fields);
    doc.revno = current.map_or(1, |d| d.revno + 1);
    store.put(PRESENCE, &doc, Expect::Any)?;
    Ok(seq)
}

/// Periodically proves that an agent is alive.
pub struct Pinger {
    agent: AgentId,
    store: Arc<dyn DocumentStore>,
    shutdown: watch::Sender<bool>,
    stopped: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Pinger {
    /// Start pinging immediately and then every ping interval.
    pub fn start(
        store: Arc<dyn DocumentStore>,
        agent: AgentId,
        config: &PresenceSection,
        handle: &Handle,
    ) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let interval = config.ping_interval();
        let task_store = store.clone();
        let task_agent = agent.clone();
        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        let store = task_store.clone();
                        let agent = task_agent.clone();
                        let ping = blocking(move || ping_once(store.as_ref(), &agent));
                        match tokio::time::timeout(interval, ping).await {
                            Ok(Ok(seq)) => debug!("agent {task_agent} ping {seq}"),
                            Ok(Err(e)) => warn!("agent {task_agent} ping failed: {e}"),
                            Err(_) => warn!("agent {task_agent} ping timed out"),
                        }
                    }
                }
            }
            debug!("pinger for {task_agent} exiting");
        });
        info!("started pinger for agent {agent}");
        Self {
            agent,
            store,
            shutdown,
            stopped: AtomicBool::new(false),
            task: Mutex::new(Some(task)),
        }
    }

    pub fn agent(&self) -> &AgentId {
        &self.agent
    }

    /// Stop pinging. The agent is reported dead once the grace window passes.
    pub fn stop(&self) -> Result<(), WatchError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Err(WatchError::Stopped);
        }
        let _ = self.shutdown.send(true);
        Ok(())
    }

    /// Stop pinging and remove the heartbeat so the agent is reported dead
    /// on the next scan.
    pub async fn kill(&self) -> Result<(), WatchError> {
        let _ = self.stop();
        let task = self
            .task
            .lock()
            .map_err(|e| WatchError::Task(format!("mutex poisoned: {e}")))?
            .take();
        if let Some(task) = task {
            // No ping may land after the heartbeat is removed.
            task.await.map_err(|e| WatchError::Task(e.to_string()))?;
        }
        let store = self.store.clone();
        let agent = self.agent.clone();
        blocking(move || {
            if let Some(doc) = store.get(PRESENCE, &agent)? {
                store.delete(PRESENCE, &agent, doc.revno)?;
            }
            Ok(())
        })
        .await
    }
}

impl Drop for Pinger {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[derive(Debug, Clone)]
struct AgentState {
    seq: i64,
    last_moved: Instant,
    alive: bool,
}

struct Aggregator {
    store: Arc<dyn DocumentStore>,
    hub: Hub<AgentId, PresenceChange>,
    agents: Arc<Mutex<BTreeMap<AgentId, AgentState>>>,
    grace: Duration,
    /// Whether the baseline scan after start has completed.
    primed: bool,
}

/// Folds heartbeats into per-agent alive/dead status.
pub struct PresenceWatcher {
    hub: Hub<AgentId, PresenceChange>,
    agents: Arc<Mutex<BTreeMap<AgentId, AgentState>>>,
    sync_tx: mpsc::UnboundedSender<oneshot::Sender<()>>,
    shutdown: watch::Sender<bool>,
    stopped: AtomicBool,
}

fn lock_agents(
    agents: &Mutex<BTreeMap<AgentId, AgentState>>,
) -> MutexGuard<'_, BTreeMap<AgentId, AgentState>> {
    agents
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl PresenceWatcher {
    pub fn start(store: Arc<dyn DocumentStore>, config: &PresenceSection, handle: &Handle) -> Self {
        let hub = Hub::new();
        let agents = Arc::new(Mutex::new(BTreeMap::new()));
        let (sync_tx, sync_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let aggregator = Aggregator {
            store,
            hub: hub.clone(),
            agents: agents.clone(),
            grace: config.grace(),
            primed: false,
        };
        handle.spawn(aggregator.run(config.ping_interval(), sync_rx, shutdown_rx));
        Self {
            hub,
            agents,
            sync_tx,
            shutdown,
            stopped: AtomicBool::new(false),
        }
    }

    /// Liveness as of the most recent scan.
    pub fn alive(&self, agent: &AgentId) -> bool {
        lock_agents(&self.agents)
            .get(agent)
            .is_some_and(|state| state.alive)
    }

    /// Subscribe to liveness flips of one agent. The current status is
    /// delivered first.
    pub fn watch_agent(&self, agent: &AgentId) -> Subscription<AgentId, PresenceChange> {
        let sub = self.hub.subscribe(agent.clone());
        sub.push(PresenceChange {
            agent: agent.clone(),
            alive: self.alive(agent),
        });
        sub
    }

    /// Scan now and wait for the result to be applied.
    pub async fn sync(&self) -> Result<(), WatchError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(WatchError::Stopped);
        }
        let (tx, rx) = oneshot::channel();
        self.sync_tx.send(tx).map_err(|_| WatchError::Stopped)?;
        rx.await.map_err(|_| WatchError::Stopped)
    }

    pub fn stop(&self) -> Result<(), WatchError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Err(WatchError::Stopped);
        }
        let _ = self.shutdown.send(true);
        self.hub.close_all();
        Ok(())
    }
}

impl Drop for PresenceWatcher {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

impl Aggregator {
    async fn run(
        mut self,
        interval: Duration,
        mut sync_rx: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(reply) = sync_rx.recv() => {
                    self.scan().await;
                    let _ = reply.send(());
                }
                _ = ticker.tick() => self.scan().await,
            }
        }
        debug!("presence watcher exiting");
    }

    async fn scan(&mut self) {
        let store = self.store.clone();
        let docs = match blocking(move || store.list(PRESENCE)).await {
            Ok(docs) => docs,
            Err(e) => {
                // No data is not evidence of death; judge again next scan.
                debug!("presence scan failed: {e}");
                return;
            }
        };
        let now = Instant::now();
        let seen: BTreeMap<AgentId, i64> = docs
            .iter()
            .map(|d| (AgentId::new(d.id.as_str()), d.i64_field("seq")))
            .collect();

        let mut flips = Vec::new();
        {
            let mut agents = lock_agents(&self.agents);
            for (agent, seq) in &seen {
                match agents.get_mut(agent) {
                    None => {
                        // Before the baseline scan a heartbeat proves nothing.
                        let alive = self.primed;
                        agents.insert(
                            agent.clone(),
                            AgentState {
                                seq: *seq,
                                last_moved: now,
                                alive,
                            },
                        );
                        if alive {
                            flips.push(PresenceChange {
                                agent: agent.clone(),
                                alive,
                            });
                        }
                    }
                    Some(state) if state.seq != *seq => {
                        state.seq = *seq;
                        state.last_moved = now;
                        if !state.alive {
                            state.alive = true;
                            flips.push(PresenceChange {
                                agent: agent.clone(),
                                alive: true,
                            });
                        }
                    }
                    Some(state) => {
                        if state.alive && now.duration_since(state.last_moved) >= self.grace {
                            state.alive = false;
                            flips.push(PresenceChange {
                                agent: agent.clone(),
                                alive: false,
                            });
                        }
                    }
                }
            }
            agents.retain(|agent, state| {
                if seen.contains_key(agent) {
                    return true;
                }
                if state.alive {
                    flips.push(PresenceChange {
                        agent: agent.clone(),
                        alive: false,
                    });
                }
                false
            });
        }
        self.primed = true;

        for flip in flips {
            info!(
                "agent {} is now {}",
                flip.agent,
                if flip.alive { "alive" } else { "dead" }
            );
            let revno = if flip.alive {
                seen.get(&flip.agent).and_then(|seq| u64::try_from(*seq).ok())
            } else {
                None
            };
            let store = self.store.clone();
            let agent = flip.agent.clone();
            if let Err(e) =
                blocking(move || store.append_log(PRESENCE, agent.as_str(), revno)).await
            {
                warn!("cannot log presence change of {}: {e}", flip.agent);
            }
            self.hub.deliver(&flip.agent, &flip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_store::MemoryStore;

    #[test]
    fn ping_once_increments_sequence() {
        let store = MemoryStore::new();
        let agent = AgentId::new("unit-wordpress-0");
        assert_eq!(ping_once(&store, &agent).unwrap(), 1);
        assert_eq!(ping_once(&store, &agent).unwrap(), 2);
        let doc = store.get(PRESENCE, "unit-wordpress-0").unwrap().unwrap();
        assert_eq!(doc.i64_field("seq"), 2);
        assert_eq!(doc.str_field("agent"), "unit-wordpress-0");
    }

    #[tokio::test]
    async fn existing_heartbeats_are_presumed_dead_on_start() {
        let store = Arc::new(MemoryStore::new());
        let agent = AgentId::new("machine-0");
        ping_once(store.as_ref(), &agent).unwrap();

        let config = PresenceSection {
            ping_interval_ms: 20,
            grace_multiplier: 3,
        };
        let watcher = PresenceWatcher::start(store.clone(), &config, &Handle::current());
        watcher.sync().await.unwrap();
        assert!(!watcher.alive(&agent), "stale heartbeat must not count");

        ping_once(store.as_ref(), &agent).unwrap();
        watcher.sync().await.unwrap();
        assert!(watcher.alive(&agent), "a fresh ping revives the agent");
        watcher.stop().unwrap();
    }

    #[tokio::test]
    async fn flips_are_written_to_the_change_log() {
        let store = Arc::new(MemoryStore::new());
        let agent = AgentId::new("unit-riak-0");
        let config = PresenceSection {
            ping_interval_ms: 60_000,
            grace_multiplier: 1,
        };
        let watcher = PresenceWatcher::start(store.clone(), &config, &Handle::current());
        watcher.sync().await.unwrap();

        ping_once(store.as_ref(), &agent).unwrap();
        watcher.sync().await.unwrap();
        assert!(watcher.alive(&agent));
        let read = store.read_log(0, 10).unwrap();
        assert_eq!(read.entries.len(), 1);
        assert_eq!(read.entries[0].collection, PRESENCE);
        assert_eq!(read.entries[0].id, "unit-riak-0");
        assert_eq!(read.entries[0].revno, Some(1));

        store.delete(PRESENCE, "unit-riak-0", 1).unwrap();
        watcher.sync().await.unwrap();
        assert!(!watcher.alive(&agent));
        let read = store.read_log(0, 10).unwrap();
        assert_eq!(read.entries.len(), 2);
        assert_eq!(read.entries[1].revno, None);
        watcher.stop().unwrap();
    }
}
