use crate::state::SETTINGS;
use crate::{CoreError, State};
use cairn_store::{Assert, FieldOp, Fields, Op};
use serde_json::Value;
use tracing::{debug, info};

/// Keys become document paths, so they must be plain names.
fn validate_key(key: &str) -> Result<(), CoreError> {
    if key.is_empty() || key.contains('.') || key.starts_with('$') {
        return Err(CoreError::Validation(format!(
            "invalid settings key \"{key}\""
        )));
    }
    Ok(())
}

fn validate_keys(values: &Fields) -> Result<(), CoreError> {
    values.keys().try_for_each(|k| validate_key(k))
}

/// A key/value map attached to the environment (`e`) or to a service
/// (`s#<service>`).
#[derive(Clone)]
pub struct Settings {
    state: State,
    key: String,
    map: Fields,
}

impl Settings {
    /// Read the settings document `key`. A missing document reads as empty.
    pub(crate) fn read(state: &State, key: &str) -> Result<Self, CoreError> {
        let map = state
            .read(SETTINGS, key)?
            .map(|doc| doc.fields)
            .unwrap_or_default();
        Ok(Self {
            state: state.clone(),
            key: key.to_owned(),
            map,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.map.get(key)
    }

    pub fn map(&self) -> &Fields {
        &self.map
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.map.keys()
    }

    pub fn refresh(&mut self) -> Result<(), CoreError> {
        *self = Self::read(&self.state, &self.key)?;
        Ok(())
    }

    /// Set every key in `changes`, overwriting existing values.
    pub fn update(&mut self, changes: &Fields) -> Result<(), CoreError> {
        validate_keys(changes)?;
        if changes.is_empty() {
            return Ok(());
        }
        self.state.run_transaction(|_| {
            let op = match self.state.read(SETTINGS, &self.key)? {
                None => Op::new(SETTINGS, self.key.as_str()).insert(changes.clone()),
                Some(_) => Op::new(SETTINGS, self.key.as_str()).update(
                    changes
                        .iter()
                        .map(|(k, v)| FieldOp::Set(k.clone(), v.clone()))
                        .collect(),
                ),
            };
            Ok(vec![op])
        })?;
        self.refresh()
    }

    pub fn delete(&mut self, key: &str) -> Result<(), CoreError> {
        validate_key(key)?;
        self.state.run_transaction(|_| {
            let Some(doc) = self.state.read(SETTINGS, &self.key)? else {
                return Ok(Vec::new());
            };
            if doc.get(key).is_none() {
                return Ok(Vec::new());
            }
            Ok(vec![Op::new(SETTINGS, self.key.as_str())
                .update(vec![FieldOp::Unset(key.to_owned())])])
        })?;
        self.refresh()
    }

    /// Set each key of `values` that is not already present. Existing values
    /// are never overwritten, so the first writer of a key wins even when
    /// several connections push at once. Returns the keys written.
    pub fn push_absent(&mut self, values: &Fields) -> Result<Vec<String>, CoreError> {
        validate_keys(values)?;
        let mut written = Vec::new();
        self.state.run_transaction(|_| {
            written.clear();
            let op = match self.state.read(SETTINGS, &self.key)? {
                None => {
                    written.extend(values.keys().cloned());
                    Op::new(SETTINGS, self.key.as_str()).insert(values.clone())
                }
                Some(doc) => {
                    let mut op = Op::new(SETTINGS, self.key.as_str());
                    let mut sets = Vec::new();
                    for (k, v) in values {
                        if doc.get(k).is_none() {
                            op = op.assert(Assert::field_missing(k.as_str()));
                            sets.push(FieldOp::Set(k.clone(), v.clone()));
                            written.push(k.clone());
                        }
                    }
                    if sets.is_empty() {
                        return Ok(Vec::new());
                    }
                    op.update(sets)
                }
            };
            Ok(vec![op])
        })?;
        if written.is_empty() {
            debug!("settings {}: nothing to push", self.key);
        } else {
            info!("settings {}: pushed {}", self.key, written.join(", "));
        }
        self.refresh()?;
        Ok(written)
    }
}

/// Make settings document `key` hold exactly `values`.
pub(crate) fn replace(state: &State, key: &str, values: &Fields) -> Result<(), CoreError> {
    validate_keys(values)?;
    state.run_transaction(|_| {
        let op = match state.read(SETTINGS, key)? {
            None => Op::new(SETTINGS, key).insert(values.clone()),
            Some(doc) => {
                let mut ops: Vec<FieldOp> = doc
                    .fields
                    .keys()
                    .filter(|k| !values.contains_key(*k))
                    .map(|k| FieldOp::Unset(k.clone()))
                    .collect();
                ops.extend(values.iter().map(|(k, v)| FieldOp::Set(k.clone(), v.clone())));
                Op::new(SETTINGS, key).update(ops)
            }
        };
        Ok(vec![op])
    })
}
