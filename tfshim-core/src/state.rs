use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::Result;
use crate::flatmap::{flatmap_from_value, value_from_flatmap, Flatmap, UNKNOWN_VARIABLE_VALUE};
use crate::schema::Block;
use crate::types::Type;
use crate::value::Value;

/// Free-form side channel stored next to a state or diff.
pub type Meta = serde_json::Map<String, JsonValue>;

pub const SCHEMA_VERSION_META_KEY: &str = "schema_version";

/// A resource instance in the legacy attribute-bag form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    /// Empty when the instance does not exist (or no longer exists).
    pub id: String,
    #[serde(default)]
    pub attributes: Flatmap,
    #[serde(default)]
    pub meta: Meta,
}

impl InstanceState {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let mut attributes = Flatmap::new();
        attributes.insert("id".to_string(), id.clone());
        InstanceState {
            id,
            attributes,
            meta: Meta::new(),
        }
    }

    /// Decode the attributes into an object of type `ty`, with the
    /// instance id taking precedence over any stored `id` attribute.
    pub fn attrs_as_object_value(&self, ty: &Type) -> Result<Value> {
        let mut attrs = self.attributes.clone();
        if self.id != UNKNOWN_VARIABLE_VALUE {
            attrs.insert("id".to_string(), self.id.clone());
        }
        value_from_flatmap(&attrs, ty)
    }

    pub fn schema_version(&self) -> Option<i64> {
        match self.meta.get(SCHEMA_VERSION_META_KEY)? {
            JsonValue::String(s) => s.parse().ok(),
            JsonValue::Number(n) => n.as_i64(),
            _ => None,
        }
    }
}

/// Identifies the resource type an operation applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub type_name: String,
}

/// The legacy view of a configuration: a flatmap where values that are not
/// yet known carry [`UNKNOWN_VARIABLE_VALUE`].
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceConfig {
    pub raw: Value,
    pub config: Flatmap,
}

impl ResourceConfig {
    pub fn new_shimmed(value: &Value, block: &Block) -> Result<Self> {
        Ok(ResourceConfig {
            raw: value.clone(),
            config: flatmap_from_value(value, &block.implied_type())?,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.config.get(key).map(String::as_str)
    }

    pub fn is_computed(&self, key: &str) -> bool {
        self.get(key) == Some(UNKNOWN_VARIABLE_VALUE)
    }

    /// At apply time the only unknowns left are the ones the resource
    /// computes itself; they must not reach the diff as values.
    pub(crate) fn remove_unknowns(&mut self) {
        self.config.retain(|_, v| v != UNKNOWN_VARIABLE_VALUE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_id_takes_precedence() {
        let ty = Type::object([("id", Type::String), ("name", Type::String)]);
        let mut s = InstanceState::new("real");
        s.attributes.insert("id".to_string(), "stale".to_string());
        s.attributes.insert("name".to_string(), "n".to_string());
        let v = s.attrs_as_object_value(&ty).unwrap();
        assert_eq!(v.attr("id"), Some(&Value::string("real")));

        s.id = UNKNOWN_VARIABLE_VALUE.to_string();
        let v = s.attrs_as_object_value(&ty).unwrap();
        assert_eq!(v.attr("id"), Some(&Value::string("stale")));
    }

    #[test]
    fn test_schema_version() {
        let mut s = InstanceState::default();
        assert_eq!(s.schema_version(), None);
        s.meta.insert(SCHEMA_VERSION_META_KEY.to_string(), json!("2"));
        assert_eq!(s.schema_version(), Some(2));
    }

    #[test]
    fn test_config_unknowns() {
        let block: Block = serde_json::from_value(json!({
            "attributes": {
                "a": {"type": "string", "optional": true},
                "b": {"type": "string", "computed": true}
            }
        }))
        .unwrap();
        let mut c = ResourceConfig::new_shimmed(
            &Value::object([("a", Value::string("x")), ("b", Value::Unknown)]),
            &block,
        )
        .unwrap();
        assert!(c.is_computed("b"));
        c.remove_unknowns();
        assert_eq!(c.get("b"), None);
        assert_eq!(c.get("a"), Some("x"));
    }
}
