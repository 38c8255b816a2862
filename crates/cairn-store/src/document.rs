use cairn_schema::TxnId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field map of a document.
pub type Fields = Map<String, Value>;

fn default_true() -> bool {
    true
}

/// A single stored document.
///
/// `revno` increases on every write, including the writes that stamp or
/// unstamp a pending transaction, and is what conditional writes compare.
/// A document is either free (`pending == None`) or reserved by exactly one
/// in-flight transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: String,
    pub revno: u64,
    /// `false` for a placeholder created to reserve an id for a pending insert.
    #[serde(default = "default_true")]
    pub present: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<TxnId>,
    #[serde(default)]
    pub fields: Fields,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            revno: 1,
            present: true,
            pending: None,
            fields,
        }
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        get_path(&self.fields, path)
    }

    pub fn str_field(&self, path: &str) -> &str {
        self.get(path).and_then(Value::as_str).unwrap_or("")
    }

    pub fn i64_field(&self, path: &str) -> i64 {
        self.get(path).and_then(Value::as_i64).unwrap_or(0)
    }

    pub fn bool_field(&self, path: &str) -> bool {
        self.get(path).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn str_list(&self, path: &str) -> Vec<String> {
        self.get(path)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Deserialize the field map into a typed record.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.fields.clone()))
    }
}

/// Serialize a record into a field map. Non-object values are rejected.
pub fn encode<T: Serialize>(value: &T) -> Result<Fields, serde_json::Error> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(serde::ser::Error::custom(format!(
            "document must serialize to an object, got {other}"
        ))),
    }
}

/// Look up a dotted path such as `life` or `status.message`.
pub fn get_path<'a>(fields: &'a Fields, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = fields.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Set a dotted path, creating intermediate objects as needed.
pub fn set_path(fields: &mut Fields, path: &str, value: Value) {
    let mut parts: Vec<&str> = path.split('.').collect();
    let Some(last) = parts.pop() else {
        return;
    };
    let mut current = fields;
    for part in parts {
        let entry = current
            .entry(part.to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Value::Object(map) = entry else {
            return;
        };
        current = map;
    }
    current.insert(last.to_owned(), value);
}

/// Remove a dotted path. Missing paths are ignored.
pub fn remove_path(fields: &mut Fields, path: &str) {
    let mut parts: Vec<&str> = path.split('.').collect();
    let Some(last) = parts.pop() else {
        return;
    };
    let mut current = fields;
    for part in parts {
        match current.get_mut(part) {
            Some(Value::Object(map)) => current = map,
            _ => return,
        }
    }
    current.remove(last);
}

/// Values a document contributes to an index on `path`.
///
/// Arrays along the path fan out, so an index on `endpoints.service_name`
/// yields one value per endpoint.
pub fn index_values(fields: &Fields, path: &str) -> Vec<Value> {
    let mut current: Vec<&Value> = Vec::new();
    let mut parts = path.split('.');
    let Some(first) = parts.next() else {
        return Vec::new();
    };
    if let Some(v) = fields.get(first) {
        current.push(v);
    }
    for part in parts {
        let mut next = Vec::new();
        for value in current {
            match value {
                Value::Object(map) => next.extend(map.get(part)),
                Value::Array(items) => {
                    for item in items {
                        if let Some(v) = item.as_object().and_then(|m| m.get(part)) {
                            next.push(v);
                        }
                    }
                }
                _ => {}
            }
        }
        current = next;
    }
    let mut out = Vec::new();
    for value in current {
        match value {
            Value::Array(items) => out.extend(items.iter().cloned()),
            other => out.push(other.clone()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn get_nested_path() {
        let f = fields(json!({"status": {"message": "hi"}, "life": "alive"}));
        assert_eq!(get_path(&f, "life"), Some(&json!("alive")));
        assert_eq!(get_path(&f, "status.message"), Some(&json!("hi")));
        assert_eq!(get_path(&f, "status.missing"), None);
        assert_eq!(get_path(&f, "life.x"), None);
    }

    #[test]
    fn set_creates_intermediate_objects() {
        let mut f = Fields::new();
        set_path(&mut f, "a.b.c", json!(1));
        assert_eq!(Value::Object(f), json!({"a": {"b": {"c": 1}}}));
    }

    #[test]
    fn set_replaces_scalar_parent() {
        let mut f = fields(json!({"a": 3}));
        set_path(&mut f, "a.b", json!(true));
        assert_eq!(Value::Object(f), json!({"a": {"b": true}}));
    }

    #[test]
    fn remove_nested_path() {
        let mut f = fields(json!({"a": {"b": 1, "c": 2}}));
        remove_path(&mut f, "a.b");
        remove_path(&mut f, "x.y");
        assert_eq!(Value::Object(f), json!({"a": {"c": 2}}));
    }

    #[test]
    fn index_values_fan_out_over_arrays() {
        let f = fields(json!({
            "endpoints": [
                {"service_name": "wordpress", "interface": "mysql"},
                {"service_name": "mysql", "interface": "mysql"}
            ]
        }));
        let values = index_values(&f, "endpoints.service_name");
        assert_eq!(values, vec![json!("wordpress"), json!("mysql")]);
    }

    #[test]
    fn index_values_flatten_leaf_arrays() {
        let f = fields(json!({"principals": ["a/0", "b/1"]}));
        assert_eq!(index_values(&f, "principals").len(), 2);
    }

    #[test]
    fn typed_accessors() {
        let doc = Document::new(
            "u",
            fields(json!({"n": 4, "ok": true, "s": "x", "l": ["a", 1, "b"]})),
        );
        assert_eq!(doc.i64_field("n"), 4);
        assert!(doc.bool_field("ok"));
        assert_eq!(doc.str_field("s"), "x");
        assert_eq!(doc.str_field("absent"), "");
        assert_eq!(doc.str_list("l"), vec!["a".to_owned(), "b".to_owned()]);
    }

    #[test]
    fn encode_rejects_non_objects() {
        assert!(encode(&42).is_err());
        assert!(encode(&json!({"a": 1})).is_ok());
    }
}
