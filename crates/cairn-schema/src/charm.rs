use crate::endpoint::{Endpoint, RelationRole, RelationScope};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Interface every charm provides implicitly, so that subordinates can attach.
pub const JUJU_INFO: &str = "juju-info";

#[derive(Debug, Error)]
pub enum CharmError {
    #[error("failed to read charm metadata: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse charm metadata: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("charm URL has invalid form: \"{0}\"")]
    InvalidUrl(String),
    #[error("charm metadata: {0}")]
    InvalidMeta(String),
}

/// Location of a charm: `<schema>:<series>/<name>[-<revision>]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CharmUrl {
    pub schema: String,
    pub series: String,
    pub name: String,
    /// `None` asks for the latest available revision.
    pub revision: Option<u32>,
}

impl CharmUrl {
    #[must_use]
    pub fn with_revision(&self, revision: u32) -> Self {
        Self {
            revision: Some(revision),
            ..self.clone()
        }
    }

    /// The URL without revision, shared by every revision of the charm.
    pub fn base(&self) -> String {
        format!("{}:{}/{}", self.schema, self.series, self.name)
    }
}

impl fmt::Display for CharmUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.revision {
            Some(rev) => write!(f, "{}-{rev}", self.base()),
            None => f.write_str(&self.base()),
        }
    }
}

impl FromStr for CharmUrl {
    type Err = CharmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CharmError::InvalidUrl(s.to_owned());
        let (schema, rest) = s.split_once(':').ok_or_else(invalid)?;
        if schema != "local" && schema != "cs" {
            return Err(invalid());
        }
        let (series, name_rev) = rest.split_once('/').ok_or_else(invalid)?;
        if series.is_empty() || !series.bytes().all(|b| b.is_ascii_lowercase()) {
            return Err(invalid());
        }
        let (name, revision) = match name_rev.rsplit_once('-') {
            Some((name, rev)) if !rev.is_empty() && rev.bytes().all(|b| b.is_ascii_digit()) => {
                (name, Some(rev.parse::<u32>().map_err(|_| invalid())?))
            }
            _ => (name_rev, None),
        };
        crate::types::validate_service_name(name).map_err(|_| invalid())?;
        Ok(Self {
            schema: schema.to_owned(),
            series: series.to_owned(),
            name: name.to_owned(),
            revision,
        })
    }
}

impl TryFrom<String> for CharmUrl {
    type Error = CharmError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CharmUrl> for String {
    fn from(url: CharmUrl) -> Self {
        url.to_string()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RelationMeta {
    pub interface: String,
    #[serde(default)]
    pub scope: RelationScope,
    #[serde(default)]
    pub optional: bool,
}

/// Charm metadata, read from the `metadata.toml` of a charm.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CharmMeta {
    pub name: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub subordinate: bool,
    #[serde(default)]
    pub provides: BTreeMap<String, RelationMeta>,
    #[serde(default)]
    pub requires: BTreeMap<String, RelationMeta>,
    #[serde(default)]
    pub peers: BTreeMap<String, RelationMeta>,
}

impl CharmMeta {
    pub fn parse_str(content: &str) -> Result<Self, CharmError> {
        let meta: CharmMeta = toml::from_str(content)?;
        meta.validate()?;
        Ok(meta)
    }

    pub fn parse_file(path: &Path) -> Result<Self, CharmError> {
        let content = fs::read_to_string(path)?;
        Self::parse_str(&content)
    }

    fn validate(&self) -> Result<(), CharmError> {
        crate::types::validate_service_name(&self.name)
            .map_err(|_| CharmError::InvalidMeta(format!("invalid charm name \"{}\"", self.name)))?;
        let mut seen = std::collections::BTreeSet::new();
        for name in self
            .provides
            .keys()
            .chain(self.requires.keys())
            .chain(self.peers.keys())
        {
            if !seen.insert(name) {
                return Err(CharmError::InvalidMeta(format!(
                    "relation \"{name}\" is declared more than once"
                )));
            }
        }
        if self.provides.contains_key(JUJU_INFO) || self.requires.contains_key(JUJU_INFO) {
            return Err(CharmError::InvalidMeta(format!(
                "relation name \"{JUJU_INFO}\" is reserved"
            )));
        }
        if self.subordinate
            && !self
                .requires
                .values()
                .any(|r| r.scope == RelationScope::Container)
        {
            return Err(CharmError::InvalidMeta(
                "subordinate charm requires at least one container-scoped relation".to_owned(),
            ));
        }
        Ok(())
    }

    /// Every endpoint a service running this charm exposes, including the
    /// implicit `juju-info` provider.
    pub fn endpoints(&self, service_name: &str) -> Vec<Endpoint> {
        let make = |name: &str, meta: &RelationMeta, role: RelationRole| Endpoint {
            service_name: service_name.to_owned(),
            interface: meta.interface.clone(),
            relation_name: name.to_owned(),
            role,
            scope: meta.scope,
        };
        let mut eps: Vec<Endpoint> = Vec::new();
        eps.push(Endpoint {
            service_name: service_name.to_owned(),
            interface: JUJU_INFO.to_owned(),
            relation_name: JUJU_INFO.to_owned(),
            role: RelationRole::Provider,
            scope: RelationScope::Global,
        });
        eps.extend(
            self.provides
                .iter()
                .map(|(n, m)| make(n, m, RelationRole::Provider)),
        );
        eps.extend(
            self.requires
                .iter()
                .map(|(n, m)| make(n, m, RelationRole::Requirer)),
        );
        eps.extend(self.peers.iter().map(|(n, m)| make(n, m, RelationRole::Peer)));
        eps
    }

    /// Peer endpoints, which become self-relations when the service is added.
    pub fn peer_endpoints(&self, service_name: &str) -> Vec<Endpoint> {
        self.endpoints(service_name)
            .into_iter()
            .filter(|ep| ep.role == RelationRole::Peer)
            .collect()
    }
}

/// A charm bundle as uploaded: parsed metadata plus the raw archive bytes.
#[derive(Debug, Clone)]
pub struct CharmArchive {
    pub meta: CharmMeta,
    pub bytes: Vec<u8>,
}

impl CharmArchive {
    pub fn new(meta: CharmMeta, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            meta,
            bytes: bytes.into(),
        }
    }

    pub fn sha256(&self) -> String {
        bundle_sha256(&self.bytes)
    }
}

/// Hex-encoded SHA-256 of a bundle.
pub fn bundle_sha256(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
