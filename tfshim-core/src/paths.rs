use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, ShimError};
use crate::types::Type;

/// One step of an [`AttributePath`], shaped like the steps of the hosting protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathStep {
    AttributeName(String),
    ElementKeyString(String),
    ElementKeyInt(i64),
}

/// Address of a value inside a structural value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributePath {
    pub steps: Vec<PathStep>,
}

impl AttributePath {
    pub fn root_attr(name: &str) -> Self {
        AttributePath::default().attr(name)
    }

    pub fn attr(&self, name: &str) -> Self {
        self.with(PathStep::AttributeName(name.to_string()))
    }

    pub fn key(&self, key: &str) -> Self {
        self.with(PathStep::ElementKeyString(key.to_string()))
    }

    pub fn index(&self, index: i64) -> Self {
        self.with(PathStep::ElementKeyInt(index))
    }

    fn with(&self, step: PathStep) -> Self {
        let mut steps = self.steps.clone();
        steps.push(step);
        AttributePath { steps }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Drop trailing index steps; only an attribute can require replacement.
    fn trimmed(mut self) -> Self {
        while let Some(last) = self.steps.last() {
            if matches!(last, PathStep::AttributeName(_)) {
                break;
            }
            self.steps.pop();
        }
        self
    }
}

impl fmt::Display for AttributePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.steps.is_empty() {
            return write!(f, "(root)");
        }
        for (i, step) in self.steps.iter().enumerate() {
            match step {
                PathStep::AttributeName(name) if i == 0 => write!(f, "{}", name)?,
                PathStep::AttributeName(name) => write!(f, ".{}", name)?,
                PathStep::ElementKeyString(key) => write!(f, "[{:?}]", key)?,
                PathStep::ElementKeyInt(index) => write!(f, "[{}]", index)?,
            }
        }
        Ok(())
    }
}

/// Convert flatmap keys flagged as requiring a new resource into attribute paths.
///
/// Count keys address their container, anything inside a set addresses the
/// set itself, trailing index steps are dropped and duplicates removed.
pub fn requires_replace<'a>(
    keys: impl IntoIterator<Item = &'a str>,
    ty: &Type,
) -> Result<Vec<AttributePath>> {
    let attrs = ty
        .attribute_types()
        .ok_or_else(|| ShimError::decoding(format!("expected an object type, got {}", ty)))?;
    let mut paths: Vec<AttributePath> = Vec::new();
    for key in keys {
        if key.is_empty() {
            continue;
        }
        let path = path_from_object_key(key, attrs, AttributePath::default())
            .map_err(|e| ShimError::decoding(format!("[{}] {}", key, e)))?
            .trimmed();
        if !path.is_empty() && !paths.contains(&path) {
            paths.push(path);
        }
    }
    Ok(paths)
}

fn split_key(key: &str) -> (&str, &str) {
    match key.split_once('.') {
        Some((head, rest)) => (head, rest),
        None => (key, ""),
    }
}

fn path_from_object_key(
    key: &str,
    attrs: &std::collections::BTreeMap<String, Type>,
    path: AttributePath,
) -> std::result::Result<AttributePath, String> {
    let (name, rest) = split_key(key);
    let path = path.attr(name);
    let ty = attrs
        .get(name)
        .ok_or_else(|| format!("attribute {:?} not found", name))?;
    if rest.is_empty() {
        return Ok(path);
    }
    path_from_value_key(rest, ty, path)
}

fn path_from_value_key(
    key: &str,
    ty: &Type,
    path: AttributePath,
) -> std::result::Result<AttributePath, String> {
    match ty {
        Type::Bool | Type::Number | Type::String => {
            Err(format!("invalid step {:?} with type {}", key, ty))
        }
        Type::Object(attrs) => path_from_object_key(key, attrs, path),
        Type::Map(et) => {
            let (k, rest) = if et.is_primitive() {
                (key, "")
            } else {
                split_key(key)
            };
            if k == "%" {
                return Ok(path);
            }
            let path = path.key(k);
            if rest.is_empty() {
                return Ok(path);
            }
            path_from_value_key(rest, et, path)
        }
        Type::List(et) => {
            if key == "#" {
                return Ok(path);
            }
            let (k, rest) = split_key(key);
            let index: i64 = k
                .parse()
                .map_err(|_| format!("invalid list index {:?}", k))?;
            let path = path.index(index);
            if rest.is_empty() {
                return Ok(path);
            }
            path_from_value_key(rest, et, path)
        }
        // Set elements have no stable address.
        Type::Set(_) => Ok(path),
    }
}
