use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Cache key of a query: procedure path plus canonical input.
///
/// The hash is the JSON text `["<path>",<input>]` with object keys sorted recursively
/// and `null` members dropped, so `{limit: 10}` and `{cursor: null, limit: 10}` name
/// the same entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "(String, Value)", into = "(String, Value)")]
pub struct QueryKey {
    path: String,
    input: Value,
    hash: String,
}

impl QueryKey {
    pub fn new(path: impl Into<String>, input: Value) -> Self {
        let path = path.into();
        let input = canonicalize(input);
        let hash = Value::Array(vec![Value::String(path.clone()), input.clone()]).to_string();
        Self { path, input, hash }
    }

    pub fn from_input<T: Serialize>(path: &str, input: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(path, serde_json::to_value(input)?))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl From<(String, Value)> for QueryKey {
    fn from((path, input): (String, Value)) -> Self {
        Self::new(path, input)
    }
}

impl From<QueryKey> for (String, Value) {
    fn from(key: QueryKey) -> Self {
        (key.path, key.input)
    }
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map
                .into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, canonicalize(v)))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().collect::<Map<_, _>>())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn key_order_and_nulls_do_not_matter() {
        let a = QueryKey::new("post.list", json!({ "limit": 10, "cursor": null }));
        let b = QueryKey::new("post.list", json!({ "limit": 10 }));
        assert_eq!(a, b);
        assert_eq!(a.hash(), r#"["post.list",{"limit":10}]"#);

        let nested = QueryKey::new("x.y", json!({ "b": { "z": 1, "a": [ { "d": 1, "c": 2 } ] }, "a": 0 }));
        assert_eq!(nested.hash(), r#"["x.y",{"a":0,"b":{"a":[{"c":2,"d":1}],"z":1}}]"#);
    }

    #[test]
    fn path_and_input_both_distinguish() {
        let list = QueryKey::new("post.list", json!({ "limit": 10 }));
        assert_ne!(list, QueryKey::new("post.list", json!({ "limit": 20 })));
        assert_ne!(list, QueryKey::new("post.byId", json!({ "limit": 10 })));
    }

    #[test]
    fn serializes_as_path_input_pair() {
        let key = QueryKey::new("post.byId", json!({ "id": "abc" }));
        let value = serde_json::to_value(&key).unwrap();
        assert_eq!(value, json!(["post.byId", { "id": "abc" }]));
        let back: QueryKey = serde_json::from_value(value).unwrap();
        assert_eq!(back, key);
    }
}
