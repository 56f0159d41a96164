//! The legacy flat attribute-bag encoding.
//!
//! A structural object value is flattened into a `key -> string` map with
//! dotted paths. Lists and sets carry a `<path>.#` element count, maps carry
//! `<path>.%`. Unknown values are written as [`UNKNOWN_VARIABLE_VALUE`] and
//! null values are omitted, so "absent" and "empty" stay distinguishable only
//! through the presence of the count key.

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Result, ShimError};
use crate::types::Type;
use crate::value::{format_number, parse_number, Value};

pub type Flatmap = BTreeMap<String, String>;

/// Sentinel stored in place of a value that is not known until apply.
pub const UNKNOWN_VARIABLE_VALUE: &str = "74D93920-ED26-11E3-AC10-0800200C9A66";

/// Flatten an object value. A null object flattens to an empty map.
pub fn flatmap_from_value(value: &Value, ty: &Type) -> Result<Flatmap> {
    let attrs = ty
        .attribute_types()
        .ok_or_else(|| ShimError::encoding(format!("cannot flatten a value of type {}", ty)))?;
    let mut out = Flatmap::new();
    match value {
        Value::Null => {}
        Value::Unknown => {
            for (name, at) in attrs {
                write_value(&Value::Unknown, at, name, &mut out)?;
            }
        }
        Value::Object(m) => {
            for (name, at) in attrs {
                let v = m.get(name).unwrap_or(&Value::Null);
                write_value(v, at, name, &mut out)?;
            }
        }
        other => {
            return Err(ShimError::encoding(format!(
                "cannot flatten {} as an object",
                other.kind()
            )))
        }
    }
    Ok(out)
}

fn write_value(value: &Value, ty: &Type, key: &str, out: &mut Flatmap) -> Result<()> {
    match (ty, value) {
        (_, Value::Null) => {}
        (Type::List(_) | Type::Set(_), Value::Unknown) => {
            out.insert(format!("{}.#", key), UNKNOWN_VARIABLE_VALUE.to_string());
        }
        (Type::Map(_), Value::Unknown) => {
            out.insert(format!("{}.%", key), UNKNOWN_VARIABLE_VALUE.to_string());
        }
        (Type::Object(attrs), Value::Unknown) => {
            for (name, at) in attrs {
                write_value(&Value::Unknown, at, &format!("{}.{}", key, name), out)?;
            }
        }
        (_, Value::Unknown) => {
            out.insert(key.to_string(), UNKNOWN_VARIABLE_VALUE.to_string());
        }
        (Type::Bool, Value::Bool(b)) => {
            out.insert(key.to_string(), b.to_string());
        }
        (Type::Number, Value::Number(n)) => {
            out.insert(key.to_string(), format_number(n));
        }
        (Type::String, Value::String(s)) => {
            out.insert(key.to_string(), s.clone());
        }
        (Type::List(et), Value::List(vs)) => {
            out.insert(format!("{}.#", key), vs.len().to_string());
            for (i, v) in vs.iter().enumerate() {
                write_value(v, et, &format!("{}.{}", key, i), out)?;
            }
        }
        (Type::Set(et), Value::Set(vs) | Value::List(vs)) => {
            out.insert(format!("{}.#", key), vs.len().to_string());
            for v in vs {
                write_value(v, et, &format!("{}.{}", key, set_element_key(v)), out)?;
            }
        }
        (Type::Map(et), Value::Map(m) | Value::Object(m)) => {
            out.insert(format!("{}.%", key), m.len().to_string());
            for (k, v) in m {
                write_value(v, et, &format!("{}.{}", key, k), out)?;
            }
        }
        (Type::Object(attrs), Value::Object(m)) => {
            for (name, at) in attrs {
                let v = m.get(name).unwrap_or(&Value::Null);
                write_value(v, at, &format!("{}.{}", key, name), out)?;
            }
        }
        (ty, v) => {
            return Err(ShimError::encoding(format!(
                "{}: {} does not conform to {}",
                key,
                v.kind(),
                ty
            )))
        }
    }
    Ok(())
}

/// Content-derived index of a set element. Elements that are not wholly
/// known are marked with a leading `~`.
pub fn set_element_key(value: &Value) -> String {
    let code = hash_code(&value.canonical_key());
    if value.is_wholly_known() {
        code.to_string()
    } else {
        format!("~{}", code)
    }
}

/// Non-negative 31-bit digest, the shape legacy set codes have always had.
pub(crate) fn hash_code(s: &str) -> u32 {
    let digest = Sha256::digest(s.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) & 0x7fff_ffff
}

/// Rebuild an object value from its flattened form.
pub fn value_from_flatmap(m: &Flatmap, ty: &Type) -> Result<Value> {
    let attrs = ty
        .attribute_types()
        .ok_or_else(|| ShimError::decoding(format!("cannot decode a flatmap as {}", ty)))?;
    object_from_flatmap(m, "", attrs)
}

fn object_from_flatmap(m: &Flatmap, prefix: &str, attrs: &BTreeMap<String, Type>) -> Result<Value> {
    let mut out = BTreeMap::new();
    for (name, at) in attrs {
        let key = format!("{}{}", prefix, name);
        out.insert(name.clone(), value_at(m, &key, at, false)?);
    }
    Ok(Value::Object(out))
}

pub(crate) fn keys_under<'a>(m: &'a Flatmap, prefix: &'a str) -> impl Iterator<Item = (&'a String, &'a String)> {
    m.range(prefix.to_string()..)
        .take_while(move |(k, _)| k.starts_with(prefix))
}

/// `element` is set for values inside a collection: objects there always
/// decode as objects, while an attribute-level object with no keys is null.
fn value_at(m: &Flatmap, key: &str, ty: &Type, element: bool) -> Result<Value> {
    match ty {
        Type::Bool | Type::Number | Type::String => match m.get(key) {
            None => Ok(Value::Null),
            Some(raw) if raw == UNKNOWN_VARIABLE_VALUE => Ok(Value::Unknown),
            Some(raw) => primitive_from_string(raw, ty, key),
        },
        Type::Object(attrs) => {
            let prefix = format!("{}.", key);
            if !element && keys_under(m, &prefix).next().is_none() {
                return Ok(Value::Null);
            }
            object_from_flatmap(m, &prefix, attrs)
        }
        Type::List(et) => {
            let count = match container_count(m, key, "#")? {
                ContainerCount::Null => return Ok(Value::Null),
                ContainerCount::Unknown => return Ok(Value::Unknown),
                ContainerCount::Known(n) => n,
            };
            let mut vs = Vec::with_capacity(count);
            for i in 0..count {
                vs.push(value_at(m, &format!("{}.{}", key, i), et, true)?);
            }
            Ok(Value::List(vs))
        }
        Type::Set(et) => {
            let count = match container_count(m, key, "#")? {
                ContainerCount::Null => return Ok(Value::Null),
                ContainerCount::Unknown => return Ok(Value::Unknown),
                ContainerCount::Known(n) => n,
            };
            let prefix = format!("{}.", key);
            let indexes: BTreeSet<&str> = keys_under(m, &prefix)
                .map(|(k, _)| first_segment(&k[prefix.len()..]))
                .filter(|seg| *seg != "#")
                .collect();
            let mut vs = Vec::with_capacity(indexes.len());
            for idx in indexes {
                vs.push(value_at(m, &format!("{}{}", prefix, idx), et, true)?);
            }
            if vs.is_empty() && count == 1 {
                // A single block with every attribute empty leaves nothing but the count.
                vs.push(empty_element(et));
            }
            Ok(Value::set(vs))
        }
        Type::Map(et) => {
            match container_count(m, key, "%")? {
                ContainerCount::Null => return Ok(Value::Null),
                ContainerCount::Unknown => return Ok(Value::Unknown),
                ContainerCount::Known(_) => {}
            }
            let prefix = format!("{}.", key);
            let mut out = BTreeMap::new();
            for (full, raw) in keys_under(m, &prefix) {
                let sub = &full[prefix.len()..];
                if sub == "%" {
                    continue;
                }
                if et.is_primitive() {
                    // Map keys may contain dots: the whole remainder is the key.
                    let v = if raw == UNKNOWN_VARIABLE_VALUE {
                        Value::Unknown
                    } else {
                        primitive_from_string(raw, et, full)?
                    };
                    out.insert(sub.to_string(), v);
                } else {
                    let k = first_segment(sub);
                    if !out.contains_key(k) {
                        out.insert(
                            k.to_string(),
                            value_at(m, &format!("{}{}", prefix, k), et, true)?,
                        );
                    }
                }
            }
            Ok(Value::Map(out))
        }
    }
}

enum ContainerCount {
    Null,
    Unknown,
    Known(usize),
}

fn container_count(m: &Flatmap, key: &str, marker: &str) -> Result<ContainerCount> {
    // An unknown container may also be recorded at the container key itself.
    if m.get(key).map(String::as_str) == Some(UNKNOWN_VARIABLE_VALUE) {
        return Ok(ContainerCount::Unknown);
    }
    match m.get(&format!("{}.{}", key, marker)) {
        None => Ok(ContainerCount::Null),
        Some(raw) if raw == UNKNOWN_VARIABLE_VALUE => Ok(ContainerCount::Unknown),
        Some(raw) => raw.parse::<usize>().map(ContainerCount::Known).map_err(|_| {
            ShimError::decoding(format!("invalid count value for {:?}: {:?}", key, raw))
        }),
    }
}

fn first_segment(s: &str) -> &str {
    match s.find('.') {
        Some(dot) => &s[..dot],
        None => s,
    }
}

fn empty_element(ty: &Type) -> Value {
    match ty {
        Type::List(_) => Value::List(vec![]),
        Type::Set(_) => Value::Set(vec![]),
        Type::Map(_) => Value::Map(BTreeMap::new()),
        Type::Object(attrs) => Value::Object(
            attrs
                .keys()
                .map(|name| (name.clone(), Value::Null))
                .collect(),
        ),
        _ => Value::Null,
    }
}

fn primitive_from_string(raw: &str, ty: &Type, key: &str) -> Result<Value> {
    match ty {
        Type::String => Ok(Value::String(raw.to_string())),
        Type::Bool => match raw {
            "true" | "True" | "TRUE" | "t" | "T" | "1" => Ok(Value::Bool(true)),
            "false" | "False" | "FALSE" | "f" | "F" | "0" => Ok(Value::Bool(false)),
            _ => Err(ShimError::encoding(format!(
                "invalid value for {:?}: {:?} is not a bool",
                key, raw
            ))),
        },
        Type::Number => parse_number(raw).map(Value::Number).ok_or_else(|| {
            ShimError::encoding(format!(
                "invalid value for {:?}: {:?} is not a number",
                key, raw
            ))
        }),
        other => Err(ShimError::decoding(format!(
            "{:?} holds a primitive, but the type is {}",
            key, other
        ))),
    }
}

/// Whether `key` is the count entry of a list, set or map.
pub fn is_count_key(key: &str) -> bool {
    key.len() >= 3 && (key.ends_with(".#") || key.ends_with(".%"))
}

/// Number of distinct direct children of the container whose count key is `key`.
pub fn count_flatmap_container_values(key: &str, attrs: &Flatmap) -> String {
    debug_assert!(is_count_key(key), "invalid index key {:?}", key);
    let prefix = &key[..key.len() - 1];
    let items: BTreeSet<&str> = keys_under(attrs, prefix)
        .filter(|(k, _)| k.as_str() != key)
        .map(|(k, _)| first_segment(&k[prefix.len()..]))
        .collect();
    items.len().to_string()
}
