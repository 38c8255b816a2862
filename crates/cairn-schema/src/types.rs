//! Newtype wrappers for entity identifiers, providing compile-time type safety.
//!
//! All newtypes serialize/deserialize as plain strings so they can be stored
//! directly inside documents.

use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance from a string.
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Return the inner string as a slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Name of a deployed service, e.g. `wordpress`.
    ServiceName
);

string_newtype!(
    /// Name of a unit, `<service>/<n>`.
    UnitName
);

string_newtype!(
    /// Decimal machine identifier.
    MachineId
);

string_newtype!(
    /// Identifier of a multi-document transaction.
    TxnId
);

string_newtype!(
    /// Identifier of an agent process tracked by presence.
    AgentId
);

impl UnitName {
    /// Build the name of the `n`th unit of `service`.
    pub fn for_service(service: &str, n: u64) -> Self {
        Self(format!("{service}/{n}"))
    }

    /// The service part of the unit name.
    pub fn service(&self) -> &str {
        self.0.split_once('/').map_or(self.0.as_str(), |(s, _)| s)
    }

    /// Agent identity for this unit's agent (`unit-wordpress-0`).
    pub fn agent_id(&self) -> AgentId {
        AgentId(format!("unit-{}", self.0.replace('/', "-")))
    }
}

impl MachineId {
    pub fn agent_id(&self) -> AgentId {
        AgentId(format!("machine-{}", self.0))
    }
}

/// Check that `name` is a valid service name: lowercase words separated by
/// single hyphens, starting with a letter, where no word is purely numeric.
pub fn validate_service_name(name: &str) -> Result<(), SchemaError> {
    let invalid = || SchemaError::InvalidName(format!("invalid service name \"{name}\""));
    if name.is_empty() || !name.as_bytes()[0].is_ascii_lowercase() {
        return Err(invalid());
    }
    for word in name.split('-') {
        if word.is_empty() {
            return Err(invalid());
        }
        if !word
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        {
            return Err(invalid());
        }
        if word.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
    }
    Ok(())
}

/// Check that `name` has the form `<service>/<n>`.
pub fn validate_unit_name(name: &str) -> Result<(), SchemaError> {
    let invalid = || SchemaError::InvalidName(format!("invalid unit name \"{name}\""));
    let Some((service, number)) = name.split_once('/') else {
        return Err(invalid());
    };
    validate_service_name(service).map_err(|_| invalid())?;
    if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    if number.len() > 1 && number.starts_with('0') {
        return Err(invalid());
    }
    Ok(())
}
