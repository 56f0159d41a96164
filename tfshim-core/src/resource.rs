//! The legacy per-attribute resource schema, as written by provider authors.

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::flatmap::{flatmap_from_value, hash_code, keys_under, Flatmap, UNKNOWN_VARIABLE_VALUE};
use crate::schema::{Attribute, Block, NestedBlock, NestingMode};
use crate::state::{InstanceState, Meta, SCHEMA_VERSION_META_KEY};
use crate::timeouts::{ResourceTimeout, TIMEOUTS_CONFIG_KEY};
use crate::types::Type;
use crate::value::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Bool,
    Int,
    Float,
    #[default]
    String,
    List,
    Set,
    Map,
}

impl ValueType {
    pub fn is_primitive(self) -> bool {
        matches!(
            self,
            ValueType::Bool | ValueType::Int | ValueType::Float | ValueType::String
        )
    }

    /// Value a primitive takes when it is dropped from configuration.
    pub(crate) fn zero(self) -> &'static str {
        match self {
            ValueType::Bool => "false",
            ValueType::Int | ValueType::Float => "0",
            _ => "",
        }
    }
}

/// Transforms a configured value into the value stored in state.
#[derive(Clone)]
pub struct StateFunc(Arc<dyn Fn(&str) -> String + Send + Sync>);

impl StateFunc {
    pub fn new(f: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        StateFunc(Arc::new(f))
    }

    pub fn call(&self, value: &str) -> String {
        (self.0)(value)
    }
}

impl fmt::Debug for StateFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StateFunc(..)")
    }
}

/// Schema of one attribute.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schema {
    #[serde(rename = "type")]
    pub value_type: ValueType,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub computed: bool,
    /// Changing the value forces a new resource.
    #[serde(default)]
    pub force_new: bool,
    #[serde(default)]
    pub sensitive: bool,
    /// Element of a list, set or map.
    #[serde(default)]
    pub elem: Option<Elem>,
    #[serde(default)]
    pub min_items: usize,
    #[serde(default)]
    pub max_items: usize,
    #[serde(skip)]
    pub state_func: Option<StateFunc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Elem {
    Schema(Box<Schema>),
    Resource(Box<Resource>),
}

pub type MigrateStateFn = dyn Fn(i64, InstanceState) -> anyhow::Result<InstanceState> + Send + Sync;
pub type StateUpgradeFn =
    dyn Fn(JsonMap<String, JsonValue>) -> anyhow::Result<JsonMap<String, JsonValue>> + Send + Sync;

/// The single legacy migration function for flatmap states.
#[derive(Clone)]
pub struct MigrateState(pub Arc<MigrateStateFn>);

impl MigrateState {
    pub fn new(
        f: impl Fn(i64, InstanceState) -> anyhow::Result<InstanceState> + Send + Sync + 'static,
    ) -> Self {
        MigrateState(Arc::new(f))
    }
}

impl fmt::Debug for MigrateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MigrateState(..)")
    }
}

/// Upgrades a JSON state from `version` to `version + 1`. `r#type` is the
/// shape of states stored at `version`.
#[derive(Clone)]
pub struct StateUpgrader {
    pub version: i64,
    pub r#type: Type,
    pub upgrade: Arc<StateUpgradeFn>,
}

impl StateUpgrader {
    pub fn new(
        version: i64,
        r#type: Type,
        upgrade: impl Fn(JsonMap<String, JsonValue>) -> anyhow::Result<JsonMap<String, JsonValue>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        StateUpgrader {
            version,
            r#type,
            upgrade: Arc::new(upgrade),
        }
    }
}

impl fmt::Debug for StateUpgrader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateUpgrader")
            .field("version", &self.version)
            .field("type", &self.r#type)
            .finish_non_exhaustive()
    }
}

/// A resource type in the legacy schema language.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resource {
    #[serde(default)]
    pub schema: BTreeMap<String, Schema>,
    #[serde(default)]
    pub schema_version: i64,
    #[serde(skip)]
    pub migrate_state: Option<MigrateState>,
    /// Ordered by version, ascending.
    #[serde(skip)]
    pub state_upgraders: Vec<StateUpgrader>,
    #[serde(default)]
    pub timeouts: Option<ResourceTimeout>,
}

impl Schema {
    pub fn new(value_type: ValueType) -> Self {
        Schema {
            value_type,
            ..Default::default()
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn computed(mut self) -> Self {
        self.computed = true;
        self
    }

    pub fn force_new(mut self) -> Self {
        self.force_new = true;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn elem_schema(mut self, elem: Schema) -> Self {
        self.elem = Some(Elem::Schema(Box::new(elem)));
        self
    }

    pub fn elem_resource(mut self, elem: Resource) -> Self {
        self.elem = Some(Elem::Resource(Box::new(elem)));
        self
    }

    pub fn max_items(mut self, n: usize) -> Self {
        self.max_items = n;
        self
    }

    pub fn min_items(mut self, n: usize) -> Self {
        self.min_items = n;
        self
    }

    pub fn state_func(mut self, f: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        self.state_func = Some(StateFunc::new(f));
        self
    }

    fn core_config_schema_type(&self) -> Type {
        match self.value_type {
            ValueType::Bool => Type::Bool,
            ValueType::Int | ValueType::Float => Type::Number,
            ValueType::String => Type::String,
            ValueType::List | ValueType::Set | ValueType::Map => {
                let element = match (&self.elem, self.value_type) {
                    // A map of resources cannot be told apart in flatmap; it is a map of strings.
                    (Some(Elem::Resource(_)), ValueType::Map) => Type::String,
                    (Some(Elem::Resource(r)), _) => r.nested_config_schema().implied_type(),
                    (Some(Elem::Schema(s)), _) => s.core_config_schema_type(),
                    (None, _) => Type::String,
                };
                match self.value_type {
                    ValueType::List => Type::list(element),
                    ValueType::Set => Type::set(element),
                    _ => Type::map(element),
                }
            }
        }
    }

    fn core_config_schema_attribute(&self) -> Attribute {
        Attribute {
            optional: self.optional,
            required: self.required,
            computed: self.computed,
            sensitive: self.sensitive,
            ..Attribute::new(self.core_config_schema_type())
        }
    }

    fn core_config_schema_block(&self, resource: &Resource) -> NestedBlock {
        let nesting = match self.value_type {
            ValueType::Set => NestingMode::Set,
            _ => NestingMode::List,
        };
        let mut nested = NestedBlock::new(nesting, resource.nested_config_schema());
        nested.min_items = self.min_items;
        nested.max_items = self.max_items;
        if self.required && self.min_items == 0 {
            // A required block is one that must appear at least once.
            nested.min_items = 1;
        }
        if self.optional && self.min_items > 0 {
            nested.min_items = 0;
        }
        if self.computed && !self.optional {
            nested.min_items = 0;
            nested.max_items = 0;
        }
        nested
    }

    fn as_block(&self) -> Option<&Resource> {
        match (&self.elem, self.value_type) {
            (Some(Elem::Resource(r)), ValueType::List | ValueType::Set)
                if !(self.computed && !self.optional) =>
            {
                Some(r)
            }
            _ => None,
        }
    }
}

impl Resource {
    pub fn new(schema: impl IntoIterator<Item = (&'static str, Schema)>) -> Self {
        Resource {
            schema: schema
                .into_iter()
                .map(|(k, s)| (k.to_string(), s))
                .collect(),
            ..Default::default()
        }
    }

    /// The configuration schema of this resource type, including the implicit
    /// `id` attribute and, when timeouts are supported, the `timeouts` block.
    pub fn core_config_schema(&self) -> Block {
        let mut block = self.nested_config_schema();
        if !block.attributes.contains_key("id") {
            let mut id = Attribute::new(Type::String);
            id.optional = true;
            id.computed = true;
            block.attributes.insert("id".to_string(), id);
        }
        if let Some(timeouts) = &self.timeouts {
            if !block.block_types.contains_key(TIMEOUTS_CONFIG_KEY) {
                let mut tb = Block::default();
                for (key, d) in timeouts.entries() {
                    if d.is_some() {
                        let mut a = Attribute::new(Type::String);
                        a.optional = true;
                        tb.attributes.insert(key.to_string(), a);
                    }
                }
                block.block_types.insert(
                    TIMEOUTS_CONFIG_KEY.to_string(),
                    NestedBlock::new(NestingMode::Single, tb),
                );
            }
        }
        block
    }

    fn nested_config_schema(&self) -> Block {
        let mut block = Block::default();
        for (name, s) in &self.schema {
            match s.as_block() {
                Some(r) => {
                    block
                        .block_types
                        .insert(name.clone(), s.core_config_schema_block(r));
                }
                None => {
                    block
                        .attributes
                        .insert(name.clone(), s.core_config_schema_attribute());
                }
            }
        }
        block
    }

    pub fn implied_type(&self) -> Type {
        self.core_config_schema().implied_type()
    }

    /// Shim a structural state value into the legacy instance state. Null
    /// shims to the empty state.
    pub fn shim_instance_state_from_value(&self, value: &Value) -> Result<InstanceState> {
        let attrs = flatmap_from_value(value, &self.implied_type())?;
        let attributes = self.rehash_sets(&attrs);
        let mut meta = Meta::new();
        meta.insert(
            SCHEMA_VERSION_META_KEY.to_string(),
            JsonValue::String(self.schema_version.to_string()),
        );
        Ok(InstanceState {
            id: attributes.get("id").cloned().unwrap_or_default(),
            attributes,
            meta,
        })
    }

    /// Re-key set elements by a digest of their configurable content.
    ///
    /// Computed-only fields do not take part in the digest, so an element
    /// whose computed fields are not yet known keeps the key of its stored
    /// counterpart. Keys outside the schema are kept as they are.
    pub fn rehash_sets(&self, attrs: &Flatmap) -> Flatmap {
        let mut out = Flatmap::new();
        rekey_fields(&self.schema, "", attrs, &mut out);
        for (k, v) in attrs {
            let root = k.split('.').next().unwrap_or(k);
            if !self.schema.contains_key(root) {
                out.insert(k.clone(), v.clone());
            }
        }
        out
    }
}

pub(crate) fn element_indexes<'a>(src: &'a Flatmap, prefix: &'a str) -> BTreeSet<&'a str> {
    keys_under(src, prefix)
        .map(|(k, _)| {
            let sub = &k[prefix.len()..];
            sub.split('.').next().unwrap_or(sub)
        })
        .filter(|idx| *idx != "#")
        .collect()
}

fn copy_key(src: &Flatmap, key: &str, out: &mut Flatmap) {
    if let Some(v) = src.get(key) {
        out.insert(key.to_string(), v.clone());
    }
}

fn rekey_fields(schema: &BTreeMap<String, Schema>, prefix: &str, src: &Flatmap, out: &mut Flatmap) {
    for (name, s) in schema {
        rekey_attr(s, &format!("{}{}", prefix, name), src, out);
    }
}

fn rekey_attr(s: &Schema, key: &str, src: &Flatmap, out: &mut Flatmap) {
    match s.value_type {
        ValueType::Bool | ValueType::Int | ValueType::Float | ValueType::String => {
            copy_key(src, key, out)
        }
        ValueType::Map => {
            copy_key(src, key, out);
            let prefix = format!("{}.", key);
            for (k, v) in keys_under(src, &prefix) {
                out.insert(k.clone(), v.clone());
            }
        }
        ValueType::List => {
            copy_key(src, key, out);
            copy_key(src, &format!("{}.#", key), out);
            let prefix = format!("{}.", key);
            for idx in element_indexes(src, &prefix) {
                rekey_element(s, &format!("{}{}", prefix, idx), src, out);
            }
        }
        ValueType::Set => {
            copy_key(src, key, out);
            copy_key(src, &format!("{}.#", key), out);
            let prefix = format!("{}.", key);
            for idx in element_indexes(src, &prefix) {
                let old_key = format!("{}{}", prefix, idx);
                let new_key = format!("{}{}", prefix, set_code(s, &old_key, src));
                let mut element = Flatmap::new();
                rekey_element(s, &old_key, src, &mut element);
                for (k, v) in element {
                    out.insert(format!("{}{}", new_key, &k[old_key.len()..]), v);
                }
            }
        }
    }
}

fn rekey_element(s: &Schema, key: &str, src: &Flatmap, out: &mut Flatmap) {
    match &s.elem {
        Some(Elem::Resource(r)) => rekey_fields(&r.schema, &format!("{}.", key), src, out),
        Some(Elem::Schema(es)) => rekey_attr(es, key, src, out),
        None => copy_key(src, key, out),
    }
}

fn has_value(src: &Flatmap, key: &str) -> bool {
    src.contains_key(key) || keys_under(src, &format!("{}.", key)).next().is_some()
}

fn set_code(s: &Schema, key: &str, src: &Flatmap) -> String {
    let mut buf = String::new();
    serialize_element(s, key, src, &mut buf);
    // Only fields that take part in the digest can make the element unknown.
    let unknown = buf.contains(UNKNOWN_VARIABLE_VALUE);
    let code = hash_code(&buf);
    if unknown {
        format!("~{}", code)
    } else {
        code.to_string()
    }
}

fn serialize_element(s: &Schema, key: &str, src: &Flatmap, buf: &mut String) {
    match &s.elem {
        Some(Elem::Resource(r)) => {
            for (name, field) in &r.schema {
                if field.computed && !field.optional {
                    continue;
                }
                let field_key = format!("{}.{}", key, name);
                if !has_value(src, &field_key) {
                    continue;
                }
                buf.push_str(name);
                buf.push(':');
                serialize_value(field, &field_key, src, buf);
                buf.push(';');
            }
        }
        Some(Elem::Schema(es)) => serialize_value(es, key, src, buf),
        None => buf.push_str(src.get(key).map(String::as_str).unwrap_or("")),
    }
}

fn serialize_value(s: &Schema, key: &str, src: &Flatmap, buf: &mut String) {
    match s.value_type {
        ValueType::Bool | ValueType::Int | ValueType::Float | ValueType::String => {
            buf.push_str(src.get(key).map(String::as_str).unwrap_or(""));
        }
        ValueType::Map => {
            let prefix = format!("{}.", key);
            buf.push('[');
            for (k, v) in keys_under(src, &prefix) {
                let sub = &k[prefix.len()..];
                if sub != "%" {
                    buf.push_str(&format!("{}:{};", sub, v));
                }
            }
            buf.push(']');
        }
        ValueType::List => {
            let prefix = format!("{}.", key);
            let count: usize = src
                .get(&format!("{}.#", key))
                .and_then(|c| c.parse().ok())
                .unwrap_or(0);
            buf.push('(');
            for i in 0..count {
                serialize_element(s, &format!("{}{}", prefix, i), src, buf);
                buf.push(';');
            }
            buf.push(')');
        }
        ValueType::Set => {
            let prefix = format!("{}.", key);
            let codes: BTreeSet<String> = element_indexes(src, &prefix)
                .into_iter()
                .map(|idx| set_code(s, &format!("{}{}", prefix, idx), src))
                .collect();
            buf.push('(');
            for code in codes {
                buf.push_str(&code);
                buf.push(';');
            }
            buf.push(')');
        }
    }
}
