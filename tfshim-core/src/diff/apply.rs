//! Applying a legacy diff to a flatmap, driven by the configuration schema.

use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

use super::InstanceDiff;
use crate::error::{Result, ShimError};
use crate::flatmap::{count_flatmap_container_values, is_count_key, keys_under, Flatmap, UNKNOWN_VARIABLE_VALUE};
use crate::schema::{Attribute, Block, NestedBlock, NestingMode};
use crate::types::Type;

impl InstanceDiff {
    /// Produce the attributes that result from applying this diff to `attrs`.
    ///
    /// The result is always built fresh from the schema, so stale keys in
    /// `attrs` that the schema does not describe are dropped.
    pub fn apply(&self, attrs: &Flatmap, block: &Block) -> Result<Flatmap> {
        if self.destroy {
            return Ok(Flatmap::new());
        }
        self.apply_block_diff(&[], attrs, block)
    }

    fn apply_block_diff(&self, path: &[String], attrs: &Flatmap, block: &Block) -> Result<Flatmap> {
        let mut result = Flatmap::new();
        let local_prefix = match path.last() {
            Some(name) => format!("{}.", name),
            None => String::new(),
        };

        for (n, attr) in &block.attributes {
            for (k, v) in self.apply_attr_diff(&extend(path, n), attrs, attr)? {
                result.insert(format!("{}{}", local_prefix, k), v);
            }
        }
        for (n, nested) in &block.block_types {
            self.apply_nested_block(path, n, nested, attrs, &local_prefix, &mut result)?;
        }
        Ok(result)
    }

    fn apply_nested_block(
        &self,
        path: &[String],
        n: &str,
        nested: &NestedBlock,
        attrs: &Flatmap,
        local_prefix: &str,
        result: &mut Flatmap,
    ) -> Result<()> {
        let block_key = format!("{}{}.", join_prefix(path), n);
        let local_block_prefix = format!("{}{}.", local_prefix, n);

        if matches!(nested.nesting, NestingMode::Single | NestingMode::Group) {
            let present = keys_under(attrs, &block_key).next().is_some()
                || self.attributes.keys().any(|k| k.starts_with(&block_key));
            if present {
                for (k, v) in self.apply_block_diff(&extend(path, n), attrs, &nested.block)? {
                    result.insert(format!("{}{}", local_prefix, k), v);
                }
            }
            return Ok(());
        }

        // Set element keys change with their content, so only the diff can
        // name the elements of a set. Anything kept unchanged is caught below.
        let mut candidates = BTreeSet::new();
        if nested.nesting != NestingMode::Set {
            for (k, _) in keys_under(attrs, &block_key) {
                if let Some(idx) = first_step(&k[block_key.len()..]) {
                    candidates.insert(idx.to_string());
                }
            }
        }
        for (k, d) in &self.attributes {
            let Some(rest) = k.strip_prefix(block_key.as_str()) else {
                continue;
            };
            if d.new_removed {
                continue;
            }
            if let Some(idx) = first_step(rest) {
                candidates.insert(idx.to_string());
            }
        }

        if nested.nesting == NestingMode::Set {
            // Elements whose diffs only clear old values are being dropped.
            candidates.retain(|idx| {
                let index_prefix = format!("{}{}.", block_key, idx);
                self.attributes.iter().any(|(k, d)| {
                    k.starts_with(&index_prefix)
                        && !d.new_removed
                        && !(is_count_key(k) && d.new == "0")
                })
            });
        }

        let element_path = extend(path, n);
        for idx in &candidates {
            for (k, v) in self.apply_block_diff(&extend(&element_path, idx), attrs, &nested.block)? {
                result.insert(format!("{}{}", local_block_prefix, k), v);
            }
        }

        let marker = if nested.nesting == NestingMode::Map { "%" } else { "#" };
        let count_addr = format!("{}{}", block_key, marker);
        let keep_block = match self.attributes.get(&count_addr) {
            Some(d) => !(d.new == "0" || d.new_removed),
            None => true,
        };

        if candidates.is_empty() && keep_block {
            for (k, v) in keys_under(attrs, &block_key) {
                result.insert(
                    format!("{}{}", local_block_prefix, &k[block_key.len()..]),
                    v.clone(),
                );
            }
        }

        let local_count = format!("{}{}", local_block_prefix, marker);
        match (self.attributes.get(&count_addr), attrs.get(&count_addr)) {
            (Some(count_diff), _) if count_diff.new_computed => {
                result.insert(local_count, UNKNOWN_VARIABLE_VALUE.to_string());
            }
            (Some(count_diff), _) if count_diff.new_removed => {
                result.insert(local_count, "0".to_string());
            }
            (Some(count_diff), _) => {
                result.insert(local_count, count_diff.new.clone());
                // Lists are not complete in the diff: drop elements past the new length.
                if nested.nesting == NestingMode::List
                    && !count_diff.new.is_empty()
                    && count_diff.new != UNKNOWN_VARIABLE_VALUE
                {
                    let length = count_diff.new.parse().unwrap_or(0);
                    truncate_list(result, &local_block_prefix, length, true);
                }
            }
            (None, Some(orig)) if keep_block => {
                result.insert(local_count, orig.clone());
            }
            _ => {
                let count = count_flatmap_container_values(&local_count, result);
                result.insert(local_count, count);
            }
        }
        Ok(())
    }

    fn apply_attr_diff(&self, path: &[String], attrs: &Flatmap, attr: &Attribute) -> Result<Flatmap> {
        match &attr.r#type {
            Type::List(_) | Type::Map(_) => self.apply_collection_diff(path, attrs, attr),
            Type::Set(et) => match et.attribute_types() {
                Some(fields) => {
                    self.apply_object_as_block(path, attrs, NestingMode::Set, fields)
                }
                None => self.apply_collection_diff(path, attrs, attr),
            },
            Type::Object(fields) => {
                self.apply_object_as_block(path, attrs, NestingMode::Single, fields)
            }
            _ => self.apply_single_attr_diff(path, attrs, attr),
        }
    }

    /// Object-typed attributes keep their fields under the attribute's key,
    /// exactly like nested blocks do.
    fn apply_object_as_block(
        &self,
        path: &[String],
        attrs: &Flatmap,
        nesting: NestingMode,
        fields: &BTreeMap<String, Type>,
    ) -> Result<Flatmap> {
        let mut block = Block::default();
        for (name, ty) in fields {
            let mut a = Attribute::new(ty.clone());
            a.optional = true;
            block.attributes.insert(name.clone(), a);
        }
        let (name, parent) = match path.split_last() {
            Some(split) => split,
            None => return Ok(Flatmap::new()),
        };
        let mut result = Flatmap::new();
        self.apply_nested_block(
            parent,
            name,
            &NestedBlock::new(nesting, block),
            attrs,
            "",
            &mut result,
        )?;
        Ok(result)
    }

    fn apply_single_attr_diff(&self, path: &[String], attrs: &Flatmap, attr: &Attribute) -> Result<Flatmap> {
        let current_key = path.join(".");
        let name = path.last().cloned().unwrap_or_default();
        let mut result = Flatmap::new();

        let diff = self.attributes.get(&current_key);
        let old = attrs.get(&current_key);

        if diff.is_some_and(|d| d.new_computed) {
            result.insert(name, UNKNOWN_VARIABLE_VALUE.to_string());
            return Ok(result);
        }

        // A top-level id is either set or about to be computed.
        if name == "id" && path.len() == 1 {
            let id = match old {
                Some(o) if !o.is_empty() => o.clone(),
                _ => UNKNOWN_VARIABLE_VALUE.to_string(),
            };
            result.insert(name, id);
            return Ok(result);
        }

        let Some(diff) = diff else {
            match old {
                Some(o) => {
                    result.insert(name, o.clone());
                }
                // Required values are in the configuration, so a missing one
                // can only be the empty string.
                None if attr.required && attr.r#type == Type::String => {
                    result.insert(name, String::new());
                }
                None => {}
            }
            return Ok(result);
        };

        if let Some(old) = old {
            if *old != diff.old && old != UNKNOWN_VARIABLE_VALUE && diff.old != UNKNOWN_VARIABLE_VALUE {
                return Err(ShimError::ApplyConflict {
                    key: current_key,
                    expected: diff.old.clone(),
                    actual: old.clone(),
                });
            }
        }

        if diff.new_removed {
            return Ok(Flatmap::new());
        }

        if diff.old == diff.new && diff.new.is_empty() {
            if attr.r#type == Type::String {
                result.insert(name, String::new());
            }
            return Ok(result);
        }

        result.insert(name, diff.new.clone());
        Ok(result)
    }

    fn apply_collection_diff(&self, path: &[String], attrs: &Flatmap, attr: &Attribute) -> Result<Flatmap> {
        let current_key = path.join(".");
        let name = path.last().cloned().unwrap_or_default();
        let marker = if matches!(attr.r#type, Type::Map(_)) { "%" } else { "#" };
        let count_key = format!("{}.{}", name, marker);
        let full_count_key = format!("{}.{}", current_key, marker);
        let mut result = Flatmap::new();

        if let Some(d) = self.attributes.get(&full_count_key) {
            if d.new_computed {
                result.insert(count_key, UNKNOWN_VARIABLE_VALUE.to_string());
                return Ok(result);
            }
            if d.new == "0" {
                result.insert(count_key, "0".to_string());
                return Ok(result);
            }
        }

        let prefix = format!("{}.", current_key);
        let mut keys: BTreeSet<&str> = self
            .attributes
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .map(String::as_str)
            .collect();
        keys.extend(keys_under(attrs, &prefix).map(|(k, _)| k.as_str()));
        // Neither a diff nor a value: the collection is null.
        if keys.is_empty() {
            return Ok(result);
        }

        let element = Attribute::new(attr.r#type.element_type().cloned().unwrap_or(Type::String));
        for k in &keys {
            let sub = extend(path, &k[prefix.len()..]);
            for (rk, v) in self.apply_single_attr_diff(&sub, attrs, &element)? {
                result.insert(format!("{}.{}", name, rk), v);
            }
        }

        let count = result.get(&count_key).cloned().unwrap_or_default();
        let length: usize = count.parse().unwrap_or(0);
        let known_count = !count.is_empty() && count != UNKNOWN_VARIABLE_VALUE;
        if known_count && attr.r#type == Type::list(Type::String) {
            // Empty strings leave no key behind.
            for i in 0..length {
                result.entry(format!("{}.{}", name, i)).or_default();
            }
        }

        if matches!(attr.r#type, Type::List(_)) {
            truncate_list(&mut result, &format!("{}.", name), length, false);
        }

        let count_diff = self.attributes.contains_key(&full_count_key);
        if count.is_empty() || (!count_diff && keys.len() != result.len()) {
            let count = count_flatmap_container_values(&count_key, &result);
            result.insert(count_key, count);
        }
        Ok(result)
    }
}

fn extend(path: &[String], step: &str) -> Vec<String> {
    let mut p = path.to_vec();
    p.push(step.to_string());
    p
}

fn join_prefix(path: &[String]) -> String {
    path.iter().map(|p| format!("{}.", p)).collect()
}

/// The element index in `rest`, when `rest` addresses something inside an element.
fn first_step(rest: &str) -> Option<&str> {
    rest.find('.').map(|dot| &rest[..dot])
}

/// Drop list elements at or past `length`. Count keys are kept. With
/// `nested`, only keys inside an element are considered.
fn truncate_list(result: &mut Flatmap, prefix: &str, length: usize, nested: bool) {
    result.retain(|k, _| {
        let Some(rest) = k.strip_prefix(prefix) else {
            return true;
        };
        if is_count_key(k) && !rest.contains('.') {
            return true;
        }
        let index = match rest.find('.') {
            Some(dot) if dot > 0 => &rest[..dot],
            Some(_) => return true,
            None if nested => return true,
            None => rest,
        };
        match index.parse::<usize>() {
            Ok(i) => i < length,
            Err(e) => {
                warn!(key = %k, error = %e, "bad list index");
                true
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::ResourceAttrDiff;
    use serde_json::json;

    fn fm(pairs: &[(&str, &str)]) -> Flatmap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn change(old: &str, new: &str) -> ResourceAttrDiff {
        ResourceAttrDiff {
            old: old.to_string(),
            new: new.to_string(),
            ..Default::default()
        }
    }

    fn computed() -> ResourceAttrDiff {
        ResourceAttrDiff {
            new_computed: true,
            ..Default::default()
        }
    }

    fn removed(old: &str) -> ResourceAttrDiff {
        ResourceAttrDiff {
            old: old.to_string(),
            new_removed: true,
            ..Default::default()
        }
    }

    fn diff(entries: &[(&str, ResourceAttrDiff)]) -> InstanceDiff {
        InstanceDiff {
            attributes: entries
                .iter()
                .map(|(k, d)| (k.to_string(), d.clone()))
                .collect(),
            ..Default::default()
        }
    }

    fn block() -> Block {
        serde_json::from_value(json!({
            "attributes": {
                "id": {"type": "string", "optional": true, "computed": true},
                "name": {"type": "string", "required": true},
                "size": {"type": "number", "optional": true},
                "arn": {"type": "string", "computed": true},
                "zones": {"type": ["list", "string"], "optional": true},
                "tags": {"type": ["map", "string"], "optional": true}
            },
            "block_types": {
                "disk": {
                    "nesting": "List",
                    "block": {
                        "attributes": {
                            "size": {"type": "number", "optional": true}
                        }
                    }
                },
                "rule": {
                    "nesting": "Set",
                    "block": {
                        "attributes": {
                            "name": {"type": "string", "optional": true}
                        }
                    }
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_destroy_is_empty() {
        let attrs = fm(&[("id", "i-1"), ("name", "web")]);
        assert!(InstanceDiff::destroy().apply(&attrs, &block()).unwrap().is_empty());
    }

    #[test]
    fn test_new_instance() {
        let d = diff(&[
            ("id", computed()),
            ("arn", computed()),
            ("name", change("", "web")),
        ]);
        let out = d.apply(&Flatmap::new(), &block()).unwrap();
        assert_eq!(out["id"], UNKNOWN_VARIABLE_VALUE);
        assert_eq!(out["arn"], UNKNOWN_VARIABLE_VALUE);
        assert_eq!(out["name"], "web");
        assert!(!out.contains_key("size"));
        assert_eq!(out["disk.#"], "0");
    }

    #[test]
    fn test_missing_diff_keeps_old_values() {
        let attrs = fm(&[("id", "i-1"), ("name", "web"), ("size", "2"), ("arn", "a")]);
        let d = diff(&[("size", change("2", "3"))]);
        let out = d.apply(&attrs, &block()).unwrap();
        assert_eq!(out["id"], "i-1");
        assert_eq!(out["arn"], "a");
        assert_eq!(out["size"], "3");
        assert_eq!(out["name"], "web");
    }

    #[test]
    fn test_required_string_defaults_to_empty() {
        let out = InstanceDiff::new()
            .apply(&fm(&[("id", "i-1")]), &block())
            .unwrap();
        assert_eq!(out["name"], "");
    }

    #[test]
    fn test_removed_attribute_vanishes() {
        let attrs = fm(&[("id", "i-1"), ("name", "web"), ("size", "2")]);
        let out = diff(&[("size", removed("2"))]).apply(&attrs, &block()).unwrap();
        assert!(!out.contains_key("size"));
    }

    #[test]
    fn test_conflict() {
        let attrs = fm(&[("id", "i-1"), ("name", "web")]);
        let err = diff(&[("name", change("db", "x"))])
            .apply(&attrs, &block())
            .unwrap_err();
        assert!(matches!(err, ShimError::ApplyConflict { ref key, .. } if key == "name"));
    }

    #[test]
    fn test_list_attribute_truncation() {
        let attrs = fm(&[
            ("id", "i-1"),
            ("zones.#", "3"),
            ("zones.0", "a"),
            ("zones.1", "b"),
            ("zones.2", "c"),
        ]);
        let d = diff(&[("zones.#", change("3", "1")), ("zones.1", removed("b"))]);
        let out = d.apply(&attrs, &block()).unwrap();
        assert_eq!(out["zones.#"], "1");
        assert_eq!(out["zones.0"], "a");
        assert!(!out.contains_key("zones.1"));
        assert!(!out.contains_key("zones.2"));
    }

    #[test]
    fn test_list_of_strings_fills_empty_elements() {
        let d = diff(&[("zones.#", change("", "2")), ("zones.1", change("", "b"))]);
        let out = d.apply(&fm(&[("id", "i-1")]), &block()).unwrap();
        assert_eq!(out["zones.0"], "");
        assert_eq!(out["zones.1"], "b");
    }

    #[test]
    fn test_emptied_collection() {
        let attrs = fm(&[("id", "i-1"), ("tags.%", "1"), ("tags.a", "b")]);
        let d = diff(&[("tags.%", change("1", "0")), ("tags.a", removed("b"))]);
        let out = d.apply(&attrs, &block()).unwrap();
        assert_eq!(out["tags.%"], "0");
        assert!(!out.contains_key("tags.a"));
    }

    #[test]
    fn test_map_keys_with_dots() {
        let d = diff(&[("tags.%", change("", "1")), ("tags.a.b", change("", "c"))]);
        let out = d.apply(&fm(&[("id", "i-1")]), &block()).unwrap();
        assert_eq!(out["tags.%"], "1");
        assert_eq!(out["tags.a.b"], "c");
    }

    #[test]
    fn test_nested_list_block_truncation() {
        let attrs = fm(&[
            ("id", "i-1"),
            ("disk.#", "2"),
            ("disk.0.size", "10"),
            ("disk.1.size", "20"),
        ]);
        let d = diff(&[("disk.#", change("2", "1")), ("disk.1.size", removed("20"))]);
        let out = d.apply(&attrs, &block()).unwrap();
        assert_eq!(out["disk.#"], "1");
        assert_eq!(out["disk.0.size"], "10");
        assert!(!out.contains_key("disk.1.size"));
    }

    #[test]
    fn test_unchanged_blocks_are_kept() {
        let attrs = fm(&[
            ("id", "i-1"),
            ("rule.#", "1"),
            ("rule.123.name", "a"),
            ("disk.#", "1"),
            ("disk.0.size", "10"),
        ]);
        let out = InstanceDiff::new().apply(&attrs, &block()).unwrap();
        assert_eq!(out["rule.#"], "1");
        assert_eq!(out["rule.123.name"], "a");
        assert_eq!(out["disk.0.size"], "10");
    }

    #[test]
    fn test_set_element_replacement() {
        let attrs = fm(&[("id", "i-1"), ("rule.#", "1"), ("rule.123.name", "a")]);
        let d = diff(&[
            ("rule.123.name", removed("a")),
            ("rule.456.name", change("", "b")),
        ]);
        let out = d.apply(&attrs, &block()).unwrap();
        assert_eq!(out["rule.#"], "1");
        assert_eq!(out["rule.456.name"], "b");
        assert!(!out.contains_key("rule.123.name"));
    }

    #[test]
    fn test_single_block_applies_as_object() {
        let block: Block = serde_json::from_value(json!({
            "block_types": {
                "timeouts": {
                    "nesting": "Single",
                    "block": {"attributes": {"create": {"type": "string", "optional": true}}}
                }
            }
        }))
        .unwrap();
        let out = InstanceDiff::new()
            .apply(&fm(&[("timeouts.create", "1m")]), &block)
            .unwrap();
        assert_eq!(out, fm(&[("timeouts.create", "1m")]));
        let out = InstanceDiff::new().apply(&Flatmap::new(), &block).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_computed_count() {
        let d = diff(&[("zones.#", computed())]);
        let out = d.apply(&fm(&[("id", "i-1")]), &block()).unwrap();
        assert_eq!(out["zones.#"], UNKNOWN_VARIABLE_VALUE);
    }
}
