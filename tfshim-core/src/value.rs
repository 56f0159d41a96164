use serde_json::Number;
use std::collections::BTreeMap;

use crate::error::{Result, ShimError};
use crate::paths::AttributePath;
use crate::types::Type;

/// A structural value. The type lives beside the value, not inside it:
/// operations that depend on the type take a `&Type`.
///
/// Sets are kept canonical (ordered by content, wholly-known duplicates
/// removed), so derived equality is content equality.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Unknown,
    Bool(bool),
    Number(Number),
    String(String),
    List(Vec<Value>),
    Set(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Value {
        Value::String(s.into())
    }

    pub fn int(i: i64) -> Value {
        Value::Number(Number::from(i))
    }

    /// Non-finite floats have no structural representation and become null.
    pub fn float(f: f64) -> Value {
        match canonical_float(f) {
            Some(n) => Value::Number(n),
            None => Value::Null,
        }
    }

    pub fn set(elements: Vec<Value>) -> Value {
        let mut keyed: Vec<(String, Value)> = elements
            .into_iter()
            .map(|v| (v.canonical_key(), v))
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        let mut out: Vec<(String, Value)> = Vec::with_capacity(keyed.len());
        for (key, v) in keyed {
            if let Some((last_key, last)) = out.last() {
                if *last_key == key && last.is_wholly_known() && v.is_wholly_known() {
                    continue;
                }
            }
            out.push((key, v));
        }
        Value::Set(out.into_iter().map(|(_, v)| v).collect())
    }

    pub fn object<K: Into<String>>(attributes: impl IntoIterator<Item = (K, Value)>) -> Value {
        Value::Object(
            attributes
                .into_iter()
                .map(|(k, v)| (k.into(), v))
                .collect(),
        )
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Value::Unknown)
    }

    pub fn is_wholly_known(&self) -> bool {
        match self {
            Value::Unknown => false,
            Value::List(vs) | Value::Set(vs) => vs.iter().all(Value::is_wholly_known),
            Value::Map(m) | Value::Object(m) => m.values().all(Value::is_wholly_known),
            _ => true,
        }
    }

    /// Number of elements of a known collection.
    pub fn length(&self) -> Option<usize> {
        match self {
            Value::List(vs) | Value::Set(vs) => Some(vs.len()),
            Value::Map(m) => Some(m.len()),
            _ => None,
        }
    }

    pub fn attr(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Object(m) => m.get(name),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Deterministic serialization used to order set elements and derive set keys.
    pub fn canonical_key(&self) -> String {
        let mut out = String::new();
        self.write_canonical(&mut out);
        out
    }

    fn write_canonical(&self, out: &mut String) {
        match self {
            Value::Null => out.push_str("null"),
            Value::Unknown => out.push('?'),
            Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Value::Number(n) => out.push_str(&format_number(n)),
            Value::String(s) => out.push_str(&format!("{:?}", s)),
            Value::List(vs) | Value::Set(vs) => {
                out.push(if matches!(self, Value::Set(_)) { '<' } else { '[' });
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    v.write_canonical(out);
                }
                out.push(if matches!(self, Value::Set(_)) { '>' } else { ']' });
            }
            Value::Map(m) | Value::Object(m) => {
                out.push('{');
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&format!("{:?}:", k));
                    v.write_canonical(out);
                }
                out.push('}');
            }
        }
    }

    /// Convert to `ty`, applying the same lenient primitive conversions the
    /// legacy type system allowed ("true" to bool, "12" to number, numbers to strings).
    pub fn convert(&self, ty: &Type, path: &AttributePath) -> Result<Value> {
        if matches!(self, Value::Null | Value::Unknown) {
            return Ok(self.clone());
        }
        match (ty, self) {
            (Type::Bool, Value::Bool(_)) => Ok(self.clone()),
            (Type::Bool, Value::String(s)) => match s.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(ShimError::coercion(path, format!("cannot convert {:?} to bool", s))),
            },
            (Type::Number, Value::Number(_)) => Ok(self.clone()),
            (Type::Number, Value::String(s)) => parse_number(s)
                .map(Value::Number)
                .ok_or_else(|| ShimError::coercion(path, format!("cannot convert {:?} to number", s))),
            (Type::String, Value::String(_)) => Ok(self.clone()),
            (Type::String, Value::Bool(b)) => Ok(Value::String(b.to_string())),
            (Type::String, Value::Number(n)) => Ok(Value::String(format_number(n))),
            (Type::List(et), Value::List(vs) | Value::Set(vs)) => Ok(Value::List(
                vs.iter()
                    .enumerate()
                    .map(|(i, v)| v.convert(et, &path.index(i as i64)))
                    .collect::<Result<_>>()?,
            )),
            (Type::Set(et), Value::List(vs) | Value::Set(vs)) => Ok(Value::set(
                vs.iter()
                    .map(|v| v.convert(et, path))
                    .collect::<Result<_>>()?,
            )),
            (Type::Map(et), Value::Map(m) | Value::Object(m)) => Ok(Value::Map(
                m.iter()
                    .map(|(k, v)| -> Result<(String, Value)> {
                        Ok((k.clone(), v.convert(et, &path.key(k))?))
                    })
                    .collect::<Result<_>>()?,
            )),
            (Type::Object(attrs), Value::Object(m) | Value::Map(m)) => {
                if let Some(extra) = m.keys().find(|k| !attrs.contains_key(*k)) {
                    return Err(ShimError::coercion(
                        path,
                        format!("unsupported attribute {:?}", extra),
                    ));
                }
                let mut out = BTreeMap::new();
                for (name, at) in attrs {
                    let v = m.get(name).unwrap_or(&Value::Null);
                    out.insert(name.clone(), v.convert(at, &path.attr(name))?);
                }
                Ok(Value::Object(out))
            }
            (ty, v) => Err(ShimError::coercion(
                path,
                format!("{} required, found {}", ty, v.kind()),
            )),
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Unknown => "unknown",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Map(_) => "map",
            Value::Object(_) => "object",
        }
    }
}

/// Parse a decimal number; integral values are stored as integers.
pub fn parse_number(s: &str) -> Option<Number> {
    let s = s.trim();
    if let Ok(i) = s.parse::<i64>() {
        return Some(Number::from(i));
    }
    if let Ok(u) = s.parse::<u64>() {
        return Some(Number::from(u));
    }
    s.parse::<f64>().ok().and_then(canonical_float)
}

pub(crate) fn canonical_float(f: f64) -> Option<Number> {
    if f.fract() == 0.0 && f.abs() < 9.0e15 {
        return Some(Number::from(f as i64));
    }
    Number::from_f64(f)
}

/// Canonical decimal text: integers without fraction, floats without exponent.
pub fn format_number(n: &Number) -> String {
    if let Some(i) = n.as_i64() {
        i.to_string()
    } else if let Some(u) = n.as_u64() {
        u.to_string()
    } else {
        format!("{}", n.as_f64().unwrap_or(0.0))
    }
}

pub(crate) fn number_as_f64(n: &Number) -> f64 {
    n.as_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_is_canonical() {
        let a = Value::set(vec![Value::string("b"), Value::string("a"), Value::string("b")]);
        let b = Value::set(vec![Value::string("a"), Value::string("b")]);
        assert_eq!(a, b);
        assert_eq!(a.length(), Some(2));
    }

    #[test]
    fn test_set_keeps_unknown_elements() {
        let s = Value::set(vec![Value::Unknown, Value::Unknown]);
        assert_eq!(s.length(), Some(2));
        assert!(!s.is_wholly_known());
    }

    #[test]
    fn test_numbers() {
        assert_eq!(parse_number("42"), Some(Number::from(42)));
        assert_eq!(parse_number("42.0"), Some(Number::from(42)));
        assert_eq!(format_number(&parse_number("1.5").unwrap()), "1.5");
        assert_eq!(format_number(&parse_number("-7").unwrap()), "-7");
        assert_eq!(parse_number("x"), None);
        assert_eq!(Value::float(3.0), Value::int(3));
    }

    #[test]
    fn test_convert_lenient_primitives() {
        let root = AttributePath::default();
        assert_eq!(
            Value::string("true").convert(&Type::Bool, &root).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            Value::int(3).convert(&Type::String, &root).unwrap(),
            Value::string("3")
        );
        assert!(Value::string("maybe").convert(&Type::Bool, &root).is_err());
    }

    #[test]
    fn test_convert_object_fills_missing_attributes() {
        let ty = Type::object([("a", Type::String), ("b", Type::Number)]);
        let v = Value::object([("a", Value::string("x"))]);
        let converted = v.convert(&ty, &AttributePath::default()).unwrap();
        assert_eq!(converted.attr("b"), Some(&Value::Null));

        let extra = Value::object([("c", Value::string("x"))]);
        let err = extra.convert(&ty, &AttributePath::default()).unwrap_err();
        assert!(err.to_string().contains("unsupported attribute"));
    }
}
