//! Topology state for Cairn.
//!
//! [`State`] is a connection to a shared document store. Through it,
//! machines, services, units, relations, charms and settings are created and
//! mutated, each change expressed as a transaction run by the store's
//! [`Runner`](cairn_store::Runner) so that many processes can operate on the
//! same environment concurrently. [`Conn`] layers client-level operations
//! (charm upload, deploy, unit destruction, error resolution) on top, and
//! [`status`] holds the agent-facing status-set wrapper.

pub mod charm;
pub mod conn;
pub mod lifecycle;
pub mod machine;
pub mod relation;
pub mod service;
pub mod settings;
pub mod state;
pub mod status;
pub mod unit;

pub use charm::Charm;
pub use conn::{bootstrap, Conn};
pub use lifecycle::Lifecycle;
pub use machine::Machine;
pub use relation::{Relation, RelationUnit};
pub use service::Service;
pub use settings::Settings;
pub use state::{password_hash, Dialer, Info, State};
pub use status::{set_service_status, set_unit_status, StatusSetArgs};
pub use unit::Unit;

use cairn_schema::{CharmError, ConfigError, SchemaError, StatusDataError};
use cairn_store::{StoreError, TxnError};
use cairn_watch::WatchError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("store unavailable: {0}")]
    Transport(String),
    #[error("{0}")]
    Conflict(String),
    /// A domain precondition does not hold. `reason` is the full message and
    /// names the entity.
    #[error("{reason}")]
    PreconditionFailed { entity: String, reason: String },
    #[error("{0}")]
    Validation(String),
    #[error("cannot {operation}: {}", .failures.join("; "))]
    Aggregate {
        operation: String,
        failures: Vec<String>,
    },
    #[error("{0} not found")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("state has been closed")]
    Closed,
    #[error("{0}")]
    Config(String),
    #[error("charm error: {0}")]
    Charm(#[from] CharmError),
    #[error("store error: {0}")]
    Store(StoreError),
    #[error("watcher error: {0}")]
    Watch(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    pub(crate) fn precondition(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::PreconditionFailed {
            entity: entity.into(),
            reason: reason.into(),
        }
    }

    /// Whether the failure is the caller's fault rather than the store's.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            CoreError::PreconditionFailed { .. }
                | CoreError::Validation(_)
                | CoreError::Aggregate { .. }
                | CoreError::NotFound(_)
                | CoreError::Charm(_)
        )
    }

    /// Whether the failure came from the store connection.
    pub fn is_store_error(&self) -> bool {
        matches!(
            self,
            CoreError::Transport(_) | CoreError::Store(_) | CoreError::Conflict(_)
        )
    }
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        if e.is_transient() {
            CoreError::Transport(e.to_string())
        } else {
            CoreError::Store(e)
        }
    }
}

impl From<TxnError> for CoreError {
    fn from(e: TxnError) -> Self {
        match e {
            TxnError::PreconditionFailed(reason) => CoreError::precondition("transaction", reason),
            TxnError::Conflict { .. } => CoreError::Conflict(e.to_string()),
            TxnError::Transport { .. } => CoreError::Transport(e.to_string()),
            TxnError::Store(e) => e.into(),
            TxnError::Invalid(msg) => CoreError::Validation(msg),
        }
    }
}

impl From<WatchError> for CoreError {
    fn from(e: WatchError) -> Self {
        match e {
            WatchError::Stopped => CoreError::Closed,
            WatchError::Store(e) => e.into(),
            WatchError::Task(msg) => CoreError::Watch(msg),
        }
    }
}

impl From<SchemaError> for CoreError {
    fn from(e: SchemaError) -> Self {
        CoreError::Validation(e.to_string())
    }
}

impl From<ConfigError> for CoreError {
    fn from(e: ConfigError) -> Self {
        CoreError::Config(e.to_string())
    }
}

impl From<StatusDataError> for CoreError {
    fn from(e: StatusDataError) -> Self {
        CoreError::Validation(format!("cannot parse data to set status: {e}"))
    }
}
