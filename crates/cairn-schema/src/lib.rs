//! Domain vocabulary for Cairn: typed identifiers, lifecycle, charms,
//! relation endpoints, workload status and configuration.
//!
//! This crate has no knowledge of storage. It defines the values that the
//! store, watch and core crates persist and exchange: `Life`, `CharmUrl` and
//! `CharmMeta` (parsed from TOML), `Endpoint` with its role and scope,
//! `WorkloadStatus`/`ResolvedMode`, and the TOML-backed `StateConfig` and
//! `EnvironConfig`.

pub mod charm;
pub mod config;
pub mod endpoint;
pub mod life;
pub mod status;
pub mod types;

pub use charm::{bundle_sha256, CharmArchive, CharmError, CharmMeta, CharmUrl, RelationMeta, JUJU_INFO};
pub use config::{
    ConfigError, EnvironConfig, PresenceSection, StateConfig, TxnSection, WatcherSection,
    KNOWN_ENVIRON_ATTRS,
};
pub use endpoint::{relation_key, Endpoint, RelationRole, RelationScope};
pub use life::Life;
pub use status::{
    parse_status_data, ResolvedMode, StatusData, StatusDataError, StatusInfo, WorkloadStatus,
};
pub use types::{
    validate_service_name, validate_unit_name, AgentId, MachineId, ServiceName, TxnId, UnitName,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("{0}")]
    InvalidName(String),
}
