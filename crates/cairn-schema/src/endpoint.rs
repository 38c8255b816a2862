use serde::{Deserialize, Serialize};
use std::fmt;

/// Role of an endpoint within a relation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RelationRole {
    Requirer,
    Provider,
    Peer,
}

impl RelationRole {
    /// The role an endpoint must have to relate to one with this role.
    pub fn counterpart(self) -> RelationRole {
        match self {
            RelationRole::Provider => RelationRole::Requirer,
            RelationRole::Requirer => RelationRole::Provider,
            RelationRole::Peer => RelationRole::Peer,
        }
    }
}

impl fmt::Display for RelationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelationRole::Requirer => write!(f, "requirer"),
            RelationRole::Provider => write!(f, "provider"),
            RelationRole::Peer => write!(f, "peer"),
        }
    }
}

/// Visibility of relation settings between units.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RelationScope {
    #[default]
    Global,
    Container,
}

impl fmt::Display for RelationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelationScope::Global => write!(f, "global"),
            RelationScope::Container => write!(f, "container"),
        }
    }
}

/// One side of a relation: a named, typed attachment point of a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub service_name: String,
    pub interface: String,
    pub relation_name: String,
    pub role: RelationRole,
    pub scope: RelationScope,
}

impl Endpoint {
    /// Whether this endpoint can form a relation with `other`.
    pub fn can_relate_to(&self, other: &Endpoint) -> bool {
        self.interface == other.interface
            && self.role != RelationRole::Peer
            && self.role.counterpart() == other.role
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service_name, self.relation_name)
    }
}

/// Stable key identifying the relation formed by `endpoints`.
///
/// Endpoints are ordered by role, then service name, so that the same pair
/// always yields the same key regardless of argument order.
pub fn relation_key(endpoints: &[Endpoint]) -> String {
    let mut sorted: Vec<&Endpoint> = endpoints.iter().collect();
    sorted.sort_by(|a, b| {
        a.role
            .cmp(&b.role)
            .then_with(|| a.service_name.cmp(&b.service_name))
    });
    sorted
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}
