//! JSON form of structural values, used for persisted state and the
//! upgrade hand-off between state upgraders.

use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::BTreeMap;

use crate::error::{Result, ShimError};
use crate::schema::Block;
use crate::types::Type;
use crate::value::{format_number, parse_number, Value};

/// Unknown values have no JSON form.
pub fn value_to_json(value: &Value) -> Result<JsonValue> {
    Ok(match value {
        Value::Null => JsonValue::Null,
        Value::Unknown => {
            return Err(ShimError::encoding(
                "unknown values cannot be represented in JSON",
            ))
        }
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Number(n) => JsonValue::Number(n.clone()),
        Value::String(s) => JsonValue::String(s.clone()),
        Value::List(vs) | Value::Set(vs) => {
            JsonValue::Array(vs.iter().map(value_to_json).collect::<Result<_>>()?)
        }
        Value::Map(m) | Value::Object(m) => {
            let mut out = JsonMap::new();
            for (k, v) in m {
                out.insert(k.clone(), value_to_json(v)?);
            }
            JsonValue::Object(out)
        }
    })
}

pub fn value_from_json(json: &JsonValue, ty: &Type) -> Result<Value> {
    let mismatch = || ShimError::decoding(format!("JSON: {} required, found {}", ty, json));
    Ok(match (ty, json) {
        (_, JsonValue::Null) => Value::Null,
        (Type::Bool, JsonValue::Bool(b)) => Value::Bool(*b),
        (Type::Bool, JsonValue::String(s)) => match s.as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => return Err(mismatch()),
        },
        (Type::Number, JsonValue::Number(n)) => match n.as_f64() {
            Some(f) if n.is_f64() => Value::float(f),
            _ => Value::Number(n.clone()),
        },
        (Type::Number, JsonValue::String(s)) => {
            Value::Number(parse_number(s).ok_or_else(mismatch)?)
        }
        (Type::String, JsonValue::String(s)) => Value::String(s.clone()),
        (Type::String, JsonValue::Bool(b)) => Value::String(b.to_string()),
        (Type::String, JsonValue::Number(n)) => Value::String(format_number(n)),
        (Type::List(et), JsonValue::Array(items)) => Value::List(
            items
                .iter()
                .map(|item| value_from_json(item, et))
                .collect::<Result<_>>()?,
        ),
        (Type::Set(et), JsonValue::Array(items)) => Value::set(
            items
                .iter()
                .map(|item| value_from_json(item, et))
                .collect::<Result<_>>()?,
        ),
        (Type::Map(et), JsonValue::Object(m)) => {
            let mut out = BTreeMap::new();
            for (k, v) in m {
                out.insert(k.clone(), value_from_json(v, et)?);
            }
            Value::Map(out)
        }
        (Type::Object(attrs), JsonValue::Object(m)) => {
            let mut out: BTreeMap<String, Value> =
                attrs.keys().map(|k| (k.clone(), Value::Null)).collect();
            for (k, v) in m {
                let at = attrs.get(k).ok_or_else(|| {
                    ShimError::decoding(format!("JSON: unsupported attribute {:?}", k))
                })?;
                out.insert(k.clone(), value_from_json(v, at)?);
            }
            Value::Object(out)
        }
        _ => return Err(mismatch()),
    })
}

/// Decode a JSON state object against `block` and coerce it to the block's shape.
/// `None` decodes to null.
pub fn json_map_to_state_value(map: Option<&JsonMap<String, JsonValue>>, block: &Block) -> Result<Value> {
    let Some(map) = map else {
        return Ok(Value::Null);
    };
    let value = value_from_json(&JsonValue::Object(map.clone()), &block.implied_type())?;
    block.coerce_value(&value)
}

/// Encode an object value as a JSON state map. Null encodes to `None`.
pub fn state_value_to_json_map(value: &Value) -> Result<Option<JsonMap<String, JsonValue>>> {
    match value_to_json(value)? {
        JsonValue::Null => Ok(None),
        JsonValue::Object(m) => Ok(Some(m)),
        other => Err(ShimError::encoding(format!(
            "state must be an object, found {}",
            other
        ))),
    }
}
