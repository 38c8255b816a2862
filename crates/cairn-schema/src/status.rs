use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Structured payload attached to a status, keyed by string.
pub type StatusData = Map<String, Value>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatusDataError {
    #[error("cannot process data: {0}")]
    Parse(String),
    #[error("cannot process data: keys must be strings")]
    NonStringKey,
    #[error("cannot process data: data must be a map")]
    NotAMap,
}

/// Workload status reported for a unit or service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadStatus {
    /// Initial status before the agent reports anything.
    Unknown,
    Maintenance,
    Blocked,
    Waiting,
    Active,
    Error,
}

impl WorkloadStatus {
    /// Statuses a workload may report through the status-set tool.
    pub const SETTABLE: [WorkloadStatus; 5] = [
        WorkloadStatus::Maintenance,
        WorkloadStatus::Blocked,
        WorkloadStatus::Waiting,
        WorkloadStatus::Active,
        WorkloadStatus::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkloadStatus::Unknown => "unknown",
            WorkloadStatus::Maintenance => "maintenance",
            WorkloadStatus::Blocked => "blocked",
            WorkloadStatus::Waiting => "waiting",
            WorkloadStatus::Active => "active",
            WorkloadStatus::Error => "error",
        }
    }
}

impl fmt::Display for WorkloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkloadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let names: Vec<&str> = Self::SETTABLE.iter().map(|s| s.as_str()).collect();
        Self::SETTABLE
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("invalid status \"{s}\", expected one of [{}]", names.join(" ")))
    }
}

/// How an errored unit should proceed once an operator marks it resolved.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ResolvedMode {
    #[default]
    #[serde(rename = "")]
    None,
    #[serde(rename = "retry-hooks")]
    RetryHooks,
    #[serde(rename = "no-hooks")]
    NoHooks,
}

impl ResolvedMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ResolvedMode::None => "",
            ResolvedMode::RetryHooks => "retry-hooks",
            ResolvedMode::NoHooks => "no-hooks",
        }
    }
}

impl fmt::Display for ResolvedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedMode::None => f.write_str("none"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// A recorded status with its message, payload and the time it was set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusInfo {
    pub status: WorkloadStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: StatusData,
    pub since: chrono::DateTime<chrono::Utc>,
}

/// Parse YAML status data into a string-keyed map, rejecting any mapping
/// (at any depth) whose keys are not strings.
pub fn parse_status_data(text: &str) -> Result<StatusData, StatusDataError> {
    if text.trim().is_empty() {
        return Ok(StatusData::new());
    }
    let value: serde_yaml::Value =
        serde_yaml::from_str(text).map_err(|e| StatusDataError::Parse(e.to_string()))?;
    match convert(value)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(StatusData::new()),
        _ => Err(StatusDataError::NotAMap),
    }
}

fn convert(value: serde_yaml::Value) -> Result<Value, StatusDataError> {
    use serde_yaml::Value as Y;
    Ok(match value {
        Y::Null => Value::Null,
        Y::Bool(b) => Value::Bool(b),
        Y::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(u) = n.as_u64() {
                Value::from(u)
            } else {
                n.as_f64().map_or(Value::Null, Value::from)
            }
        }
        Y::String(s) => Value::String(s),
        Y::Sequence(items) => Value::Array(items.into_iter().map(convert).collect::<Result<_, _>>()?),
        Y::Mapping(mapping) => {
            let mut map = Map::new();
            for (k, v) in mapping {
                let Y::String(key) = k else {
                    return Err(StatusDataError::NonStringKey);
                };
                map.insert(key, convert(v)?);
            }
            Value::Object(map)
        }
        Y::Tagged(tagged) => convert(tagged.value)?,
    })
}
