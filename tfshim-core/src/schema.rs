use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Result, ShimError};
use crate::paths::AttributePath;
use crate::types::Type;
use crate::value::Value;

/// A configuration block containing attributes and nested blocks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Map of attribute names to their schemas
    #[serde(default)]
    pub attributes: BTreeMap<String, Attribute>,
    /// Map of nested block type names to their schemas
    #[serde(default)]
    pub block_types: BTreeMap<String, NestedBlock>,
    /// Human-readable description of this block
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub description_kind: DescriptionKind,
}

/// Schema for a single configuration attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub r#type: Type,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub description_kind: DescriptionKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub optional: bool,
    /// Whether this attribute is computed (output-only unless also optional)
    #[serde(default)]
    pub computed: bool,
    #[serde(default)]
    pub sensitive: bool,
}

/// Schema for a nested configuration block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedBlock {
    pub block: Block,
    pub nesting: NestingMode,
    /// Zero means unconstrained
    #[serde(default)]
    pub min_items: usize,
    #[serde(default)]
    pub max_items: usize,
}

/// How nested blocks can be structured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NestingMode {
    /// Single instance: block { }, null when absent
    Single,
    /// Like `Single`, but never null: absent means all attributes null
    Group,
    List,
    Set,
    /// Multiple named instances: block "name" { }
    Map,
}

/// How descriptions should be interpreted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DescriptionKind {
    #[default]
    Plain,
    Markdown,
}

impl Attribute {
    pub fn new(r#type: Type) -> Self {
        Attribute {
            r#type,
            description: None,
            description_kind: DescriptionKind::Plain,
            required: false,
            optional: false,
            computed: false,
            sensitive: false,
        }
    }
}

impl Block {
    /// The object type that values conforming to this block have.
    pub fn implied_type(&self) -> Type {
        let mut attrs: BTreeMap<String, Type> = self
            .attributes
            .iter()
            .map(|(name, a)| (name.clone(), a.r#type.clone()))
            .collect();
        for (name, nested) in &self.block_types {
            attrs.insert(name.clone(), nested.implied_type());
        }
        Type::Object(attrs)
    }

    /// A value with every attribute null and every nested collection empty.
    pub fn empty_value(&self) -> Value {
        let mut attrs: BTreeMap<String, Value> = self
            .attributes
            .keys()
            .map(|name| (name.clone(), Value::Null))
            .collect();
        for (name, nested) in &self.block_types {
            attrs.insert(name.clone(), nested.empty_value());
        }
        Value::Object(attrs)
    }

    /// Conform `value` to this block: fill absent optional attributes with null,
    /// absent nested collections with empty ones, convert attribute values to
    /// their declared types and check nested item counts.
    pub fn coerce_value(&self, value: &Value) -> Result<Value> {
        self.coerce_at(value, &AttributePath::default())
    }

    fn coerce_at(&self, value: &Value, path: &AttributePath) -> Result<Value> {
        let input = match value {
            Value::Null | Value::Unknown => return Ok(value.clone()),
            Value::Object(m) | Value::Map(m) => m,
            other => {
                return Err(ShimError::coercion(
                    path,
                    format!("an object is required, found {}", other.kind()),
                ))
            }
        };
        if let Some(name) = input
            .keys()
            .find(|k| !self.attributes.contains_key(*k) && !self.block_types.contains_key(*k))
        {
            return Err(ShimError::coercion(
                path,
                format!("unexpected attribute {:?}", name),
            ));
        }

        let mut out = BTreeMap::new();
        for (name, attr) in &self.attributes {
            let attr_path = path.attr(name);
            let v = match input.get(name) {
                Some(v) => v.convert(&attr.r#type, &attr_path)?,
                None if attr.computed || attr.optional => Value::Null,
                None => {
                    return Err(ShimError::coercion(
                        path,
                        format!("attribute {:?} is required", name),
                    ))
                }
            };
            out.insert(name.clone(), v);
        }

        for (name, nested) in &self.block_types {
            let block_path = path.attr(name);
            let v = match (nested.nesting, input.get(name)) {
                (NestingMode::Single | NestingMode::Group, Some(v)) => {
                    nested.block.coerce_at(v, &block_path)?
                }
                (NestingMode::Single | NestingMode::Group, None) => {
                    if nested.min_items == 1 || nested.max_items == 1 {
                        return Err(ShimError::coercion(
                            path,
                            format!("attribute {:?} is required", name),
                        ));
                    }
                    nested.empty_value()
                }
                (_, Some(Value::Null)) => Value::Null,
                (_, Some(Value::Unknown)) => Value::Unknown,
                (_, Some(v)) => nested.coerce_collection(name, v, &block_path)?,
                (_, None) if nested.min_items == 0 => nested.empty_value(),
                (_, None) => {
                    return Err(ShimError::coercion(
                        path,
                        format!("attribute {:?} is required", name),
                    ))
                }
            };
            out.insert(name.clone(), v);
        }
        Ok(Value::Object(out))
    }
}

impl NestedBlock {
    pub fn new(nesting: NestingMode, block: Block) -> Self {
        NestedBlock {
            block,
            nesting,
            min_items: 0,
            max_items: 0,
        }
    }

    pub fn implied_type(&self) -> Type {
        let element = self.block.implied_type();
        match self.nesting {
            NestingMode::Single | NestingMode::Group => element,
            NestingMode::List => Type::list(element),
            NestingMode::Set => Type::set(element),
            NestingMode::Map => Type::map(element),
        }
    }

    /// Value of the block type when the configuration omits it.
    pub fn empty_value(&self) -> Value {
        match self.nesting {
            NestingMode::Single => Value::Null,
            NestingMode::Group => self.block.empty_value(),
            NestingMode::List => Value::List(vec![]),
            NestingMode::Set => Value::Set(vec![]),
            NestingMode::Map => Value::Map(BTreeMap::new()),
        }
    }

    fn coerce_collection(&self, name: &str, value: &Value, path: &AttributePath) -> Result<Value> {
        let len = match (self.nesting, value) {
            (NestingMode::List | NestingMode::Set, Value::List(vs) | Value::Set(vs)) => vs.len(),
            (NestingMode::Map, Value::Map(m) | Value::Object(m)) => m.len(),
            (_, other) => {
                return Err(ShimError::coercion(
                    path,
                    format!("a collection is required, found {}", other.kind()),
                ))
            }
        };
        if len < self.min_items {
            return Err(ShimError::coercion(
                path,
                format!(
                    "insufficient items for attribute {:?}; must have at least {}",
                    name, self.min_items
                ),
            ));
        }
        if self.max_items > 0 && len > self.max_items {
            return Err(ShimError::coercion(
                path,
                format!(
                    "too many items for attribute {:?}; cannot have more than {}",
                    name, self.max_items
                ),
            ));
        }
        match value {
            Value::List(vs) | Value::Set(vs) => {
                let elems = vs
                    .iter()
                    .enumerate()
                    .map(|(i, v)| self.block.coerce_at(v, &path.index(i as i64)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(match self.nesting {
                    NestingMode::Set => Value::set(elems),
                    _ => Value::List(elems),
                })
            }
            Value::Map(m) | Value::Object(m) => {
                let mut out = BTreeMap::new();
                for (k, v) in m {
                    out.insert(k.clone(), self.block.coerce_at(v, &path.key(k))?);
                }
                Ok(Value::Map(out))
            }
            _ => Ok(value.clone()),
        }
    }
}
