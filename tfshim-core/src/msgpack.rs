//! MessagePack encoding of structural values, as exchanged with the host.
//!
//! The type is not carried on the wire; both sides use the resource's implied
//! type. Unknown values are the extension `fixext1` of type 0.

use rmpv::Value as RawValue;
use std::collections::BTreeMap;

use crate::error::{Result, ShimError};
use crate::types::Type;
use crate::value::{canonical_float, format_number, parse_number, Value};

const UNKNOWN_EXT_TYPE: i8 = 0;

pub fn marshal(value: &Value, ty: &Type) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_value(&mut buf, value, ty)?;
    Ok(buf)
}

fn write_err<E: std::fmt::Debug>(e: E) -> ShimError {
    ShimError::encoding(format!("msgpack: {:?}", e))
}

fn write_value(buf: &mut Vec<u8>, value: &Value, ty: &Type) -> Result<()> {
    match (ty, value) {
        (_, Value::Null) => {
            rmp::encode::write_nil(buf).map_err(write_err)?;
        }
        (_, Value::Unknown) => {
            rmp::encode::write_ext_meta(buf, 1, UNKNOWN_EXT_TYPE).map_err(write_err)?;
            buf.push(0);
        }
        (Type::Bool, Value::Bool(b)) => {
            rmp::encode::write_bool(buf, *b).map_err(write_err)?;
        }
        (Type::Number, Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                rmp::encode::write_sint(buf, i).map_err(write_err)?;
            } else if let Some(u) = n.as_u64() {
                rmp::encode::write_uint(buf, u).map_err(write_err)?;
            } else {
                rmp::encode::write_f64(buf, n.as_f64().unwrap_or(0.0)).map_err(write_err)?;
            }
        }
        (Type::String, Value::String(s)) => {
            rmp::encode::write_str(buf, s).map_err(write_err)?;
        }
        (Type::List(et) | Type::Set(et), Value::List(vs) | Value::Set(vs)) => {
            rmp::encode::write_array_len(buf, vs.len() as u32).map_err(write_err)?;
            for v in vs {
                write_value(buf, v, et)?;
            }
        }
        (Type::Map(et), Value::Map(m) | Value::Object(m)) => {
            rmp::encode::write_map_len(buf, m.len() as u32).map_err(write_err)?;
            for (k, v) in m {
                rmp::encode::write_str(buf, k).map_err(write_err)?;
                write_value(buf, v, et)?;
            }
        }
        (Type::Object(attrs), Value::Object(m)) => {
            rmp::encode::write_map_len(buf, attrs.len() as u32).map_err(write_err)?;
            for (name, at) in attrs {
                rmp::encode::write_str(buf, name).map_err(write_err)?;
                write_value(buf, m.get(name).unwrap_or(&Value::Null), at)?;
            }
        }
        (ty, v) => {
            return Err(ShimError::encoding(format!(
                "cannot encode {} as {}",
                v.kind(),
                ty
            )))
        }
    }
    Ok(())
}

pub fn unmarshal(bytes: &[u8], ty: &Type) -> Result<Value> {
    let mut rd = bytes;
    let raw = rmpv::decode::read_value(&mut rd)
        .map_err(|e| ShimError::decoding(format!("msgpack: {}", e)))?;
    if !rd.is_empty() {
        return Err(ShimError::decoding(format!(
            "msgpack: {} trailing bytes",
            rd.len()
        )));
    }
    typed(raw, ty)
}

fn typed(raw: RawValue, ty: &Type) -> Result<Value> {
    let mismatch = |found: &str| ShimError::decoding(format!("msgpack: {} required, found {}", ty, found));
    match (ty, raw) {
        (_, RawValue::Nil) => Ok(Value::Null),
        (_, RawValue::Ext(UNKNOWN_EXT_TYPE, payload)) => {
            if payload != [0] {
                return Err(ShimError::decoding(format!(
                    "msgpack: malformed unknown value payload {:?}",
                    payload
                )));
            }
            Ok(Value::Unknown)
        }
        (_, RawValue::Ext(t, _)) => Err(ShimError::decoding(format!(
            "msgpack: unsupported extension type {}",
            t
        ))),
        (Type::Bool, RawValue::Boolean(b)) => Ok(Value::Bool(b)),
        (Type::Number, RawValue::Integer(i)) => match (i.as_i64(), i.as_u64()) {
            (Some(i), _) => Ok(Value::int(i)),
            (None, Some(u)) => Ok(Value::Number(u.into())),
            (None, None) => Err(mismatch("an out of range integer")),
        },
        (Type::Number, RawValue::F32(f)) => float_value(f as f64).ok_or_else(|| mismatch("a non-finite float")),
        (Type::Number, RawValue::F64(f)) => float_value(f).ok_or_else(|| mismatch("a non-finite float")),
        // Numbers beyond 64 bits travel as decimal strings.
        (Type::Number, RawValue::String(s)) => s
            .as_str()
            .and_then(parse_number)
            .map(Value::Number)
            .ok_or_else(|| mismatch("a non-numeric string")),
        (Type::String, RawValue::String(s)) => s
            .into_str()
            .map(Value::String)
            .ok_or_else(|| mismatch("invalid UTF-8")),
        (Type::String, RawValue::Binary(b)) => String::from_utf8(b)
            .map(Value::String)
            .map_err(|_| mismatch("invalid UTF-8")),
        (Type::String, RawValue::Boolean(b)) => Ok(Value::String(b.to_string())),
        (Type::String, RawValue::Integer(i)) => Ok(Value::String(i.to_string())),
        (Type::String, RawValue::F32(f)) => Ok(Value::String(float_text(f as f64))),
        (Type::String, RawValue::F64(f)) => Ok(Value::String(float_text(f))),
        (Type::List(et), RawValue::Array(items)) => Ok(Value::List(
            items
                .into_iter()
                .map(|item| typed(item, et))
                .collect::<Result<_>>()?,
        )),
        (Type::Set(et), RawValue::Array(items)) => Ok(Value::set(
            items
                .into_iter()
                .map(|item| typed(item, et))
                .collect::<Result<_>>()?,
        )),
        (Type::Map(et), RawValue::Map(entries)) => {
            let mut out = BTreeMap::new();
            for (k, v) in entries {
                out.insert(map_key(k)?, typed(v, et)?);
            }
            Ok(Value::Map(out))
        }
        (Type::Object(attrs), RawValue::Map(entries)) => {
            let mut out: BTreeMap<String, Value> =
                attrs.keys().map(|k| (k.clone(), Value::Null)).collect();
            for (k, v) in entries {
                let name = map_key(k)?;
                let at = attrs.get(&name).ok_or_else(|| {
                    ShimError::decoding(format!("msgpack: unsupported attribute {:?}", name))
                })?;
                out.insert(name, typed(v, at)?);
            }
            Ok(Value::Object(out))
        }
        (_, RawValue::Boolean(_)) => Err(mismatch("bool")),
        (_, RawValue::Integer(_) | RawValue::F32(_) | RawValue::F64(_)) => Err(mismatch("number")),
        (_, RawValue::String(_) | RawValue::Binary(_)) => Err(mismatch("string")),
        (_, RawValue::Array(_)) => Err(mismatch("array")),
        (_, RawValue::Map(_)) => Err(mismatch("map")),
    }
}

fn float_value(f: f64) -> Option<Value> {
    canonical_float(f).map(Value::Number)
}

fn float_text(f: f64) -> String {
    canonical_float(f)
        .map(|n| format_number(&n))
        .unwrap_or_else(|| f.to_string())
}

fn map_key(raw: RawValue) -> Result<String> {
    match raw {
        RawValue::String(s) => s
            .into_str()
            .ok_or_else(|| ShimError::decoding("msgpack: map key is not valid UTF-8")),
        _ => Err(ShimError::decoding("msgpack: map keys must be strings")),
    }
}
