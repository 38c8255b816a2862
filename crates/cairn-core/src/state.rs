use crate::CoreError;
use cairn_schema::{EnvironConfig, StateConfig};
use cairn_store::document::encode;
use cairn_store::{
    Assert, ChangeEntry, Document, DocumentStore, FieldOp, FileStore, Op, Runner, TxnError,
};
use cairn_watch::{PresenceWatcher, Subscription, Target, Watcher};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

pub(crate) const MACHINES: &str = "machines";
pub(crate) const SERVICES: &str = "services";
pub(crate) const UNITS: &str = "units";
pub(crate) const RELATIONS: &str = "relations";
pub(crate) const RELATION_SCOPES: &str = "relationscopes";
pub(crate) const CHARMS: &str = "charms";
pub(crate) const SETTINGS: &str = "settings";
pub(crate) const SEQUENCE: &str = "sequence";
pub(crate) const USERS: &str = "users";

/// Settings document holding the environment configuration.
pub(crate) const ENVIRON_SETTINGS: &str = "e";

const ADMIN_USER: &str = "admin";

const RELATION_INDEXES: [&str; 3] = [
    "endpoints.relation_name",
    "endpoints.service_name",
    "endpoints.interface",
];

/// Where and how to reach the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Info {
    /// Store addresses, tried in order. `file:<path>` opens a directory store.
    pub addrs: Vec<String>,
    /// Reach the store through a secure tunnel.
    pub use_ssh: bool,
    pub password: String,
}

/// Connects to store addresses this crate cannot open by itself.
pub trait Dialer: Send + Sync {
    fn dial(&self, addr: &str, use_ssh: bool) -> Result<Arc<dyn DocumentStore>, CoreError>;
}

/// Hex SHA-256 of a password, the form in which passwords are stored.
pub fn password_hash(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// A connection to an environment's shared state.
///
/// Cloning is cheap; clones share the same store, watcher and presence
/// watcher. The watchers only run when the state was opened inside a tokio
/// runtime.
#[derive(Clone)]
pub struct State {
    inner: Arc<Inner>,
}

struct Inner {
    runner: Runner,
    config: StateConfig,
    handle: Option<Handle>,
    watcher: Option<Watcher>,
    presence: Option<PresenceWatcher>,
    closed: AtomicBool,
}

fn dial_one(
    addr: &str,
    use_ssh: bool,
    dialer: Option<&dyn Dialer>,
) -> Result<Arc<dyn DocumentStore>, CoreError> {
    if !use_ssh {
        if let Some(path) = addr.strip_prefix("file:") {
            let store = FileStore::open(PathBuf::from(path))?;
            return Ok(Arc::new(store));
        }
    }
    match dialer {
        Some(dialer) => dialer.dial(addr, use_ssh),
        None if use_ssh => Err(CoreError::Config(
            "ssh connect requires a tunnel dialer".to_owned(),
        )),
        None => Err(CoreError::Config(format!(
            "unsupported store address \"{addr}\""
        ))),
    }
}

impl State {
    /// Connect to the store named by `info`.
    pub fn open(
        info: &Info,
        config: StateConfig,
        dialer: Option<&dyn Dialer>,
    ) -> Result<State, CoreError> {
        info!("opening state; store addresses: {:?}", info.addrs);
        if info.addrs.is_empty() {
            return Err(CoreError::Config("no store addresses".to_owned()));
        }
        let store = if info.use_ssh {
            if info.addrs.len() > 1 {
                return Err(CoreError::Config(
                    "ssh connect does not support multiple addresses".to_owned(),
                ));
            }
            dial_one(&info.addrs[0], true, dialer)?
        } else {
            let mut last_err = None;
            let mut dialed = None;
            for addr in &info.addrs {
                match dial_one(addr, false, dialer) {
                    Ok(store) => {
                        dialed = Some(store);
                        break;
                    }
                    Err(e) => {
                        warn!("cannot dial {addr}: {e}");
                        last_err = Some(e);
                    }
                }
            }
            match (dialed, last_err) {
                (Some(store), _) => store,
                (None, Some(e)) => return Err(e),
                (None, None) => return Err(CoreError::Config("no store addresses".to_owned())),
            }
        };
        Self::with_store(store, config, &info.password)
    }

    /// Open state over an already connected store.
    ///
    /// Checks the admin password, ensures the relation indexes and the
    /// change log exist, finishes transactions left behind by crashed
    /// writers, and starts the watchers when a tokio runtime is current.
    pub fn with_store(
        store: Arc<dyn DocumentStore>,
        config: StateConfig,
        password: &str,
    ) -> Result<State, CoreError> {
        let runner = Runner::new(store.clone(), config.txn.clone());

        if let Some(admin) = runner.read(USERS, ADMIN_USER)? {
            let stored = admin.str_field("password_hash");
            if !stored.is_empty() && stored != password_hash(password) {
                return Err(CoreError::Unauthorized("invalid admin password".to_owned()));
            }
        }

        for path in RELATION_INDEXES {
            store.ensure_index(RELATIONS, path)?;
        }
        store.ensure_log(config.watcher.log_capacity)?;

        let resumed = runner.resume_all()?;
        if resumed > 0 {
            info!("resumed {resumed} interrupted transactions");
        }

        let handle = Handle::try_current().ok();
        let (watcher, presence) = match &handle {
            Some(handle) => (
                Some(Watcher::start(store.clone(), &config.watcher, handle)?),
                Some(PresenceWatcher::start(store.clone(), &config.presence, handle)),
            ),
            None => {
                debug!("no tokio runtime; watchers are disabled");
                (None, None)
            }
        };

        debug!("state opened on {} store", store.name());
        Ok(State {
            inner: Arc::new(Inner {
                runner,
                config,
                handle,
                watcher,
                presence,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Stop the watchers. Every clone of this state becomes unusable.
    pub fn close(&self) -> Result<(), CoreError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Err(CoreError::Closed);
        }
        let mut first_err = None;
        if let Some(watcher) = &self.inner.watcher {
            if let Err(e) = watcher.stop() {
                first_err.get_or_insert(e);
            }
        }
        if let Some(presence) = &self.inner.presence {
            if let Err(e) = presence.stop() {
                first_err.get_or_insert(e);
            }
        }
        info!("state closed");
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &StateConfig {
        &self.inner.config
    }

    pub(crate) fn runner(&self) -> Result<&Runner, CoreError> {
        if self.is_closed() {
            return Err(CoreError::Closed);
        }
        Ok(&self.inner.runner)
    }

    pub(crate) fn handle(&self) -> Result<&Handle, CoreError> {
        self.inner.handle.as_ref().ok_or_else(|| {
            CoreError::Config("state was opened outside a tokio runtime".to_owned())
        })
    }

    /// The change-log watcher, when running.
    pub fn watcher(&self) -> Option<&Watcher> {
        self.inner.watcher.as_ref()
    }

    /// The presence watcher, when running.
    pub fn presence(&self) -> Option<&PresenceWatcher> {
        self.inner.presence.as_ref()
    }

    fn running_watcher(&self) -> Result<&Watcher, CoreError> {
        if self.is_closed() {
            return Err(CoreError::Closed);
        }
        self.watcher().ok_or_else(|| {
            CoreError::Config("state was opened outside a tokio runtime".to_owned())
        })
    }

    pub(crate) fn running_presence(&self) -> Result<&PresenceWatcher, CoreError> {
        if self.is_closed() {
            return Err(CoreError::Closed);
        }
        self.presence().ok_or_else(|| {
            CoreError::Config("state was opened outside a tokio runtime".to_owned())
        })
    }

    pub fn watch_document(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Subscription<Target, ChangeEntry>, CoreError> {
        Ok(self.running_watcher()?.watch_document(collection, id))
    }

    pub fn watch_collection(
        &self,
        collection: &str,
    ) -> Result<Subscription<Target, ChangeEntry>, CoreError> {
        Ok(self.running_watcher()?.watch_collection(collection))
    }

    pub(crate) fn read(&self, collection: &str, id: &str) -> Result<Option<Document>, CoreError> {
        Ok(self.runner()?.read(collection, id)?)
    }

    pub(crate) fn list(&self, collection: &str) -> Result<Vec<Document>, CoreError> {
        Ok(self.runner()?.list(collection)?)
    }

    pub(crate) fn find(
        &self,
        collection: &str,
        path: &str,
        value: &Value,
    ) -> Result<Vec<Document>, CoreError> {
        Ok(self.runner()?.find(collection, path, value)?)
    }

    /// Run a transaction built from the current state, rebuilding it when a
    /// concurrent writer invalidates its assertions.
    ///
    /// `build` receives the attempt number and either returns the ops to run
    /// or the domain error explaining why the operation cannot proceed. An
    /// empty op list means there is nothing to do.
    pub(crate) fn run_transaction<F>(&self, mut build: F) -> Result<(), CoreError>
    where
        F: FnMut(u32) -> Result<Vec<Op>, CoreError>,
    {
        let runner = self.runner()?;
        let attempts = self.inner.config.txn.max_attempts.max(1);
        for attempt in 0..attempts {
            let ops = build(attempt)?;
            if ops.is_empty() {
                return Ok(());
            }
            match runner.run(ops) {
                Ok(()) => return Ok(()),
                Err(TxnError::PreconditionFailed(reason)) => {
                    debug!("rebuilding transaction after attempt {attempt}: {reason}");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(CoreError::Conflict(format!(
            "state changing too quickly; gave up after {attempts} attempts"
        )))
    }

    /// Claim `count` consecutive values of a named counter, returning the
    /// first. The returned op must run in the same transaction that uses
    /// the values.
    pub(crate) fn sequence(&self, name: &str, count: u64) -> Result<(u64, Op), CoreError> {
        let count = count as i64;
        match self.read(SEQUENCE, name)? {
            None => {
                let fields = encode(&json!({ "counter": count }))?;
                Ok((0, Op::new(SEQUENCE, name).insert(fields)))
            }
            Some(doc) => {
                let n = doc.i64_field("counter");
                let op = Op::new(SEQUENCE, name)
                    .assert(Assert::eq("counter", n))
                    .update(vec![FieldOp::Inc("counter".to_owned(), count)]);
                Ok((n.max(0) as u64, op))
            }
        }
    }

    /// Require `password` on every later open. An empty password removes
    /// the requirement.
    pub fn set_admin_password(&self, password: &str) -> Result<(), CoreError> {
        let hash = if password.is_empty() {
            String::new()
        } else {
            password_hash(password)
        };
        self.run_transaction(|_| {
            let op = match self.read(USERS, ADMIN_USER)? {
                None => Op::new(USERS, ADMIN_USER)
                    .insert(encode(&json!({ "password_hash": hash }))?),
                Some(_) => Op::new(USERS, ADMIN_USER)
                    .update(vec![FieldOp::set("password_hash", hash.clone())]),
            };
            Ok(vec![op])
        })?;
        info!("admin password {}", if password.is_empty() { "cleared" } else { "changed" });
        Ok(())
    }

    /// The environment configuration as stored.
    pub fn environ_config(&self) -> Result<EnvironConfig, CoreError> {
        let settings = self.environ_settings()?;
        Ok(EnvironConfig::from_attrs(settings.map().clone())?)
    }

    /// Replace the stored environment configuration.
    pub fn set_environ_config(&self, config: &EnvironConfig) -> Result<(), CoreError> {
        crate::settings::replace(self, ENVIRON_SETTINGS, config.all_attrs())?;
        debug!("environment config for {} written", config.name());
        Ok(())
    }

    pub fn environ_settings(&self) -> Result<crate::Settings, CoreError> {
        crate::Settings::read(self, ENVIRON_SETTINGS)
    }
}
