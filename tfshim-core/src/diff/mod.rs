//! Legacy instance diffs: computing them from a prior state and a
//! configuration, and applying them to a flatmap.

mod apply;
mod engine;

pub use engine::diff_from_values;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use crate::state::Meta;

/// Private-data key under which `new_extra` values travel from plan to apply.
pub const NEW_EXTRA_KEY: &str = "_new_extra_shim";

/// The change of a single flatmap key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceAttrDiff {
    pub old: String,
    pub new: String,
    /// The new value is only known after apply.
    #[serde(default)]
    pub new_computed: bool,
    #[serde(default)]
    pub new_removed: bool,
    /// Raw configured value of an attribute whose stored value went through a state function.
    #[serde(default)]
    pub new_extra: Option<JsonValue>,
    #[serde(default)]
    pub requires_new: bool,
    #[serde(default)]
    pub sensitive: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceDiff {
    pub attributes: BTreeMap<String, ResourceAttrDiff>,
    #[serde(default)]
    pub destroy: bool,
    #[serde(default)]
    pub meta: Meta,
}

impl InstanceDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn destroy() -> Self {
        InstanceDiff {
            destroy: true,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.destroy && self.attributes.is_empty()
    }

    pub fn requires_new(&self) -> bool {
        self.attributes.values().any(|d| d.requires_new)
    }

    pub fn requires_new_keys(&self) -> impl Iterator<Item = &str> {
        self.attributes
            .iter()
            .filter(|(_, d)| d.requires_new)
            .map(|(k, _)| k.as_str())
    }

    /// The `new_extra` value of every key that has one.
    pub fn new_extras(&self) -> serde_json::Map<String, JsonValue> {
        self.attributes
            .iter()
            .filter_map(|(k, d)| d.new_extra.clone().map(|v| (k.clone(), v)))
            .collect()
    }

    /// Store the `new_extra` values in `meta` under [`NEW_EXTRA_KEY`].
    pub fn fold_new_extras(&self, meta: &mut Meta) {
        meta.insert(NEW_EXTRA_KEY.to_string(), JsonValue::Object(self.new_extras()));
    }

    /// Take the `new_extra` values a plan stored in `private` and put them
    /// back on the matching entries. The remaining private data becomes the
    /// diff's meta.
    pub fn restore_new_extras(&mut self, mut private: Meta) {
        if let Some(JsonValue::Object(extras)) = private.remove(NEW_EXTRA_KEY) {
            for (k, v) in extras {
                if let Some(d) = self.attributes.get_mut(&k) {
                    d.new_extra = Some(v);
                }
            }
        }
        self.meta = private;
    }
}
