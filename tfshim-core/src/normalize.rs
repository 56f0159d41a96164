//! Reconciling what the legacy layer produced with what the caller expects:
//! the flatmap and the diff lose the difference between null and empty, and
//! the legacy layer fills values the new protocol would leave alone.

use std::collections::{BTreeMap, BTreeSet};

use crate::flatmap::{is_count_key, keys_under, Flatmap, UNKNOWN_VARIABLE_VALUE};
use crate::schema::{Block, NestingMode};
use crate::timeouts::TIMEOUTS_CONFIG_KEY;
use crate::types::Type;
use crate::value::{number_as_f64, Value};

/// Restore container counts in `candidate` that the legacy layer dropped or
/// miscounted, using `reference` to tell empty containers from absent ones.
pub fn normalize_flatmap_containers(reference: &Flatmap, candidate: &Flatmap, apply: bool) -> Flatmap {
    let mut attrs = candidate.clone();

    // Containers the reference knows to be empty (or not yet known).
    let mut zeros: BTreeSet<String> = reference
        .iter()
        .filter(|(k, v)| is_count_key(k) && (*v == "0" || *v == UNKNOWN_VARIABLE_VALUE))
        .map(|(k, _)| k.clone())
        .collect();

    if apply {
        // An empty block reported back as a zero count.
        for (k, v) in reference {
            if is_count_key(k) && v == "1" && attrs.get(k).map(String::as_str) == Some("0") {
                attrs.insert(k.clone(), "1".to_string());
            }
        }
    }

    // A count of one with nothing under it is an empty block.
    let mut ones = BTreeSet::new();
    for (k, v) in &attrs {
        if is_count_key(k) && v == "1" {
            ones.insert(k.clone());
            zeros.remove(k);
        }
    }
    let expected_empty: Vec<String> = ones
        .iter()
        .filter(|one| {
            let prefix = &one[..one.len() - 1];
            !keys_under(&attrs, prefix).any(|(k, _)| !is_count_key(k))
        })
        .cloned()
        .collect();

    let mut keys: Vec<String> = attrs
        .iter()
        .filter(|(k, v)| is_count_key(k) && *v != UNKNOWN_VARIABLE_VALUE)
        .map(|(k, _)| k.clone())
        .collect();
    for z in &zeros {
        if !attrs.contains_key(z) && parent_exists(z, &attrs) {
            keys.push(z.clone());
        }
    }
    // Reverse order visits nested containers before the ones holding them.
    keys.sort_by(|a, b| b.cmp(a));
    keys.dedup();

    for k in keys {
        let prefix = &k[..k.len() - 1];
        let count = keys_under(&attrs, prefix)
            .filter(|(cand, _)| **cand != k)
            .map(|(cand, _)| {
                let idx = &cand[prefix.len()..];
                match idx.find('.') {
                    Some(dot) if dot > 0 => &idx[..dot],
                    _ => idx,
                }
            })
            .collect::<BTreeSet<&str>>()
            .len();

        if count > 0 {
            attrs.insert(k, count.to_string());
        } else if zeros.contains(&k) {
            attrs.insert(k, "0".to_string());
        } else if ones.contains(&k) {
            attrs.insert(k, "1".to_string());
        } else {
            attrs.remove(&k);
        }
    }

    for k in expected_empty {
        attrs.entry(k).or_insert_with(|| "1".to_string());
    }
    attrs
}

/// Whether the element or object holding the container of `count_key` is
/// present in `attrs`. Top-level containers always have a parent.
fn parent_exists(count_key: &str, attrs: &Flatmap) -> bool {
    let container = &count_key[..count_key.len() - 2];
    match container.rfind('.') {
        Some(dot) => keys_under(attrs, &container[..dot + 1]).next().is_some(),
        None => true,
    }
}

/// Carry null-versus-empty and unknown information from `src` into `dst`,
/// both of type `ty`.
///
/// In both modes a collection that is null on one side and empty on the
/// other takes the form `src` has.
///
/// During plan (`apply == false`) `src` is the proposed value: unknowns it
/// holds are kept where the planned value lost them. During apply and read
/// `src` is the planned or prior value, whose collections and known values
/// win over empty or null results.
pub fn normalize_null_values(dst: &Value, src: &Value, ty: &Type, apply: bool) -> Value {
    if !src.is_known() {
        if dst.is_null() && !apply {
            return src.clone();
        }
        return dst.clone();
    }

    if ty.is_collection() {
        let dst_empty = dst.length() == Some(0);
        let src_empty = src.length() == Some(0);
        if (src.is_null() && dst_empty) || (src_empty && dst.is_null()) {
            return src.clone();
        }
    }

    if src.is_null() || !dst.is_known() {
        return dst.clone();
    }

    match ty {
        Type::Map(_) | Type::Object(_) => normalize_mapping(dst, src, ty, apply),
        Type::Set(_) => {
            // The applied set cannot be reliably rebuilt from the flatmap.
            if src.is_wholly_known() && apply {
                return src.clone();
            }
            dst.clone()
        }
        Type::List(et) => match (dst, src) {
            (Value::Null, Value::List(ss)) => {
                // Elements that were unknown during plan vanish from the flatmap.
                if !apply && ss.iter().all(|v| !v.is_known()) {
                    return src.clone();
                }
                dst.clone()
            }
            (Value::List(ds), Value::List(ss)) if ds.len() == ss.len() && !ss.is_empty() => {
                Value::List(
                    ds.iter()
                        .zip(ss)
                        .map(|(d, s)| normalize_null_values(d, s, et, apply))
                        .collect(),
                )
            }
            _ => dst.clone(),
        },
        _ => {
            if dst.is_null() && src.is_wholly_known() && apply {
                return src.clone();
            }
            dst.clone()
        }
    }
}

fn normalize_mapping(dst: &Value, src: &Value, ty: &Type, apply: bool) -> Value {
    let is_map = matches!(ty, Type::Map(_));
    let src_map = match src {
        Value::Map(m) | Value::Object(m) => m,
        _ => return dst.clone(),
    };
    let mut dst_map = match dst {
        Value::Map(m) | Value::Object(m) => m.clone(),
        _ => BTreeMap::new(),
    };

    for (key, sv) in src_map {
        let elem_ty = match ty {
            Type::Map(et) => et.as_ref(),
            Type::Object(attrs) => match attrs.get(key) {
                Some(t) => t,
                None => continue,
            },
            _ => continue,
        };
        let dv = match dst_map.get(key) {
            Some(dv) => dv.clone(),
            // Map entries are owned by the destination: don't resurrect old
            // ones on apply, and let plan shape the map.
            None if is_map => continue,
            None => Value::Null,
        };
        dst_map.insert(key.clone(), normalize_null_values(&dv, sv, elem_ty, apply));
    }

    if dst_map.is_empty() {
        if dst.is_null() && src.is_wholly_known() && apply {
            return src.clone();
        }
        return dst.clone();
    }

    if is_map {
        // Optional+computed maps come back from the legacy layer with
        // unknowns where the source already had values.
        for (k, sv) in src_map {
            if sv.is_null() || !sv.is_known() {
                continue;
            }
            if let Some(dv) = dst_map.get_mut(k) {
                if !dv.is_known() {
                    *dv = sv.clone();
                }
            }
        }
        return Value::Map(dst_map);
    }
    Value::Object(dst_map)
}

/// Replace the `timeouts` block of `to` with the one in `from`. The flatmap
/// cannot tell a missing timeouts block from an empty one, so the value in
/// `to` is never trusted.
pub fn copy_timeout_values(to: &Value, from: &Value) -> Value {
    let Value::Object(to_attrs) = to else {
        return to.clone();
    };
    if !to_attrs.contains_key(TIMEOUTS_CONFIG_KEY) {
        return to.clone();
    }
    let mut out = to_attrs.clone();
    let timeouts = match from.attr(TIMEOUTS_CONFIG_KEY) {
        Some(t) if !t.is_null() && t.is_wholly_known() => t.clone(),
        _ => Value::Null,
    };
    out.insert(TIMEOUTS_CONFIG_KEY.to_string(), timeouts);
    Value::Object(out)
}

/// Fill null computed attributes with unknowns, descending into nested
/// blocks. A null object stays null unless the block has computed attributes.
pub fn set_unknowns(val: &Value, block: &Block) -> Value {
    match val {
        Value::Null => {
            if !block.attributes.values().any(|a| a.computed) {
                return Value::Null;
            }
            let mut out: BTreeMap<String, Value> = block
                .attributes
                .iter()
                .map(|(name, a)| {
                    let v = if a.computed { Value::Unknown } else { Value::Null };
                    (name.clone(), v)
                })
                .collect();
            for name in block.block_types.keys() {
                out.insert(name.clone(), Value::Null);
            }
            Value::Object(out)
        }
        Value::Object(obj) => {
            let mut out = obj.clone();
            for (name, a) in &block.attributes {
                if a.computed && obj.get(name).map_or(true, Value::is_null) {
                    out.insert(name.clone(), Value::Unknown);
                }
            }
            for (name, nested) in &block.block_types {
                let Some(bv) = obj.get(name) else {
                    continue;
                };
                if bv.is_null() || !bv.is_known() {
                    continue;
                }
                let inner = |v: &Value| set_unknowns(v, &nested.block);
                let nv = match (nested.nesting, bv) {
                    (NestingMode::Single | NestingMode::Group, _) => inner(bv),
                    (_, Value::List(vs)) => Value::List(vs.iter().map(inner).collect()),
                    (_, Value::Set(vs)) => Value::set(vs.iter().map(inner).collect()),
                    (_, Value::Map(m)) => {
                        Value::Map(m.iter().map(|(k, v)| (k.clone(), inner(v))).collect())
                    }
                    (_, Value::Object(m)) => {
                        Value::Object(m.iter().map(|(k, v)| (k.clone(), inner(v))).collect())
                    }
                    _ => bv.clone(),
                };
                out.insert(name.clone(), nv);
            }
            Value::Object(out)
        }
        _ => val.clone(),
    }
}

/// Whether two values are the same as far as the legacy layer can tell:
/// null and zero values are interchangeable, numbers compare as floats and
/// set elements only need some equivalent partner.
///
/// This is an approximation. It is only used to suppress changes that the
/// legacy layer itself would not consider significant.
pub fn values_sdk_equivalent(a: &Value, b: &Value) -> bool {
    if !a.is_known() || !b.is_known() {
        return a.is_known() == b.is_known();
    }
    let (a_zero, b_zero) = (is_null_or_zero(a), is_null_or_zero(b));
    if a_zero || b_zero {
        return a_zero == b_zero;
    }
    match (a, b) {
        (Value::Set(xs), Value::Set(ys)) => sets_equivalent(xs, ys),
        (Value::List(xs), Value::List(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_sdk_equivalent(x, y))
        }
        (Value::Map(xs), Value::Map(ys)) | (Value::Object(xs), Value::Object(ys)) => {
            mappings_equivalent(xs, ys)
        }
        (Value::Number(x), Value::Number(y)) => x == y || number_as_f64(x) == number_as_f64(y),
        _ => a == b,
    }
}

fn is_null_or_zero(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Unknown => false,
        Value::List(vs) | Value::Set(vs) => vs.is_empty(),
        Value::Map(m) | Value::Object(m) => m.is_empty(),
        Value::String(s) => s.is_empty(),
        Value::Number(n) => number_as_f64(n) == 0.0,
        Value::Bool(b) => !b,
    }
}

fn sets_equivalent(xs: &[Value], ys: &[Value]) -> bool {
    if xs.len() != ys.len() {
        return false;
    }
    // Set elements have no identity, so each one only needs an equivalent
    // somewhere on the other side.
    let mut x_matched = vec![false; xs.len()];
    let mut y_matched = vec![false; ys.len()];
    for (i, x) in xs.iter().enumerate() {
        for (j, y) in ys.iter().enumerate() {
            if values_sdk_equivalent(x, y) {
                x_matched[i] = true;
                y_matched[j] = true;
            }
        }
    }
    x_matched.into_iter().chain(y_matched).all(|m| m)
}

fn mappings_equivalent(xs: &BTreeMap<String, Value>, ys: &BTreeMap<String, Value>) -> bool {
    let keys: BTreeSet<&String> = xs.keys().chain(ys.keys()).collect();
    keys.into_iter().all(|k| {
        values_sdk_equivalent(
            xs.get(k).unwrap_or(&Value::Null),
            ys.get(k).unwrap_or(&Value::Null),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fm(pairs: &[(&str, &str)]) -> Flatmap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_recount_containers() {
        let candidate = fm(&[
            ("l.#", "5"),
            ("l.0", "a"),
            ("l.1", "b"),
            ("m.%", "0"),
            ("m.x", "y"),
            ("gone.#", "2"),
        ]);
        let out = normalize_flatmap_containers(&Flatmap::new(), &candidate, false);
        assert_eq!(out["l.#"], "2");
        assert_eq!(out["m.%"], "1");
        assert!(!out.contains_key("gone.#"));
    }

    #[test]
    fn test_known_zero_is_kept() {
        let reference = fm(&[("l.#", "0"), ("blk.#", "1"), ("blk.0.inner.#", "0")]);
        let candidate = fm(&[("l.#", "3"), ("blk.#", "1"), ("blk.0.name", "a")]);
        let out = normalize_flatmap_containers(&reference, &candidate, false);
        assert_eq!(out["l.#"], "0");
        // The element holding `inner` is still there, so its empty list is too.
        assert_eq!(out["blk.0.inner.#"], "0");
        assert_eq!(out["blk.#"], "1");
    }

    #[test]
    fn test_zero_restored_only_with_parent() {
        let reference = fm(&[("tags.%", "0"), ("blk.0.inner.#", "0")]);
        let out = normalize_flatmap_containers(&reference, &Flatmap::new(), false);
        assert_eq!(out, fm(&[("tags.%", "0")]));
    }

    #[test]
    fn test_empty_block_is_one() {
        let candidate = fm(&[("blk.#", "1")]);
        let out = normalize_flatmap_containers(&Flatmap::new(), &candidate, false);
        assert_eq!(out, candidate);
    }

    #[test]
    fn test_apply_restores_empty_block() {
        let reference = fm(&[("blk.#", "1")]);
        let candidate = fm(&[("blk.#", "0")]);
        assert_eq!(
            normalize_flatmap_containers(&reference, &candidate, true),
            reference
        );
        // Planning has nothing to restore it from.
        assert_eq!(
            normalize_flatmap_containers(&reference, &candidate, false),
            Flatmap::new()
        );
    }

    #[test]
    fn test_unknown_counts_untouched() {
        let candidate = fm(&[("l.#", UNKNOWN_VARIABLE_VALUE)]);
        assert_eq!(
            normalize_flatmap_containers(&Flatmap::new(), &candidate, false),
            candidate
        );
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let reference = fm(&[("l.#", "0"), ("s.#", "1"), ("m.%", "0")]);
        let candidate = fm(&[
            ("s.#", "0"),
            ("n.#", "4"),
            ("n.0.x.#", "1"),
            ("n.0.x.0", "v"),
            ("n.1.x.#", "0"),
        ]);
        for apply in [false, true] {
            let once = normalize_flatmap_containers(&reference, &candidate, apply);
            let twice = normalize_flatmap_containers(&reference, &once, apply);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_null_values_plan_keeps_proposed_unknowns() {
        let ty = Type::object([("a", Type::String), ("l", Type::list(Type::String))]);
        let dst = Value::object([("a", Value::Null), ("l", Value::Null)]);
        let src = Value::object([("a", Value::Unknown), ("l", Value::List(vec![Value::Unknown]))]);
        let out = normalize_null_values(&dst, &src, &ty, false);
        assert_eq!(out, src);
    }

    #[test]
    fn test_null_values_apply_prefers_planned_empties() {
        let ty = Type::object([
            ("l", Type::list(Type::String)),
            ("m", Type::map(Type::String)),
            ("s", Type::String),
        ]);
        let dst = Value::object([("l", Value::Null), ("m", Value::Map(BTreeMap::new())), ("s", Value::Null)]);
        let src = Value::object([
            ("l", Value::List(vec![])),
            ("m", Value::Null),
            ("s", Value::string("x")),
        ]);
        let out = normalize_null_values(&dst, &src, &ty, true);
        assert_eq!(out.attr("l"), Some(&Value::List(vec![])));
        assert_eq!(out.attr("m"), Some(&Value::Null));
        assert_eq!(out.attr("s"), Some(&Value::string("x")));

        // Plan mode leaves null primitives alone but still settles
        // null against empty collections.
        let out = normalize_null_values(&dst, &src, &ty, false);
        assert_eq!(out.attr("l"), Some(&Value::List(vec![])));
        assert_eq!(out.attr("m"), Some(&Value::Null));
        assert_eq!(out.attr("s"), Some(&Value::Null));
    }

    #[test]
    fn test_null_values_map_unknown_fixup() {
        let ty = Type::object([("m", Type::map(Type::String))]);
        let dst = Value::object([(
            "m",
            Value::Map([("a".to_string(), Value::Unknown)].into()),
        )]);
        let src = Value::object([(
            "m",
            Value::Map([("a".to_string(), Value::string("1")), ("b".to_string(), Value::string("2"))].into()),
        )]);
        let out = normalize_null_values(&dst, &src, &ty, false);
        assert_eq!(
            out.attr("m"),
            Some(&Value::Map([("a".to_string(), Value::string("1"))].into()))
        );
    }

    #[test]
    fn test_copy_timeouts() {
        let to = Value::object([
            ("id", Value::string("x")),
            ("timeouts", Value::object([("create", Value::string("stale"))])),
        ]);
        let from = Value::object([("timeouts", Value::object([("create", Value::string("5m"))]))]);
        let out = copy_timeout_values(&to, &from);
        assert_eq!(out.attr("timeouts"), from.attr("timeouts"));

        let out = copy_timeout_values(&to, &Value::Null);
        assert_eq!(out.attr("timeouts"), Some(&Value::Null));
    }

    #[test]
    fn test_set_unknowns() {
        let block: Block = serde_json::from_value(json!({
            "attributes": {
                "id": {"type": "string", "computed": true},
                "name": {"type": "string", "optional": true}
            },
            "block_types": {
                "disk": {
                    "nesting": "List",
                    "block": {
                        "attributes": {
                            "size": {"type": "number", "optional": true},
                            "serial": {"type": "string", "computed": true}
                        }
                    }
                }
            }
        }))
        .unwrap();
        let v = Value::object([
            ("id", Value::Null),
            ("name", Value::string("n")),
            (
                "disk",
                Value::List(vec![Value::object([("size", Value::int(1)), ("serial", Value::Null)])]),
            ),
        ]);
        let out = set_unknowns(&v, &block);
        assert_eq!(out.attr("id"), Some(&Value::Unknown));
        assert_eq!(out.attr("name"), Some(&Value::string("n")));
        assert_eq!(
            out.attr("disk"),
            Some(&Value::List(vec![Value::object([
                ("size", Value::int(1)),
                ("serial", Value::Unknown)
            ])]))
        );

        let null = set_unknowns(&Value::Null, &block);
        assert_eq!(null.attr("id"), Some(&Value::Unknown));
        assert_eq!(null.attr("name"), Some(&Value::Null));
    }

    #[test]
    fn test_sdk_equivalence() {
        assert!(values_sdk_equivalent(&Value::Null, &Value::string("")));
        assert!(values_sdk_equivalent(&Value::Null, &Value::List(vec![])));
        assert!(values_sdk_equivalent(&Value::int(0), &Value::Bool(false)));
        assert!(!values_sdk_equivalent(&Value::string("a"), &Value::Null));
        assert!(values_sdk_equivalent(&Value::int(2), &Value::float(2.0)));
        assert!(!values_sdk_equivalent(&Value::Unknown, &Value::Null));
        assert!(values_sdk_equivalent(&Value::Unknown, &Value::Unknown));

        let a = Value::object([("a", Value::string("x")), ("b", Value::Null)]);
        let b = Value::object([("a", Value::string("x")), ("b", Value::string(""))]);
        assert!(values_sdk_equivalent(&a, &b));

        let s1 = Value::set(vec![
            Value::object([("n", Value::string("a")), ("t", Value::Null)]),
            Value::object([("n", Value::string("b")), ("t", Value::Null)]),
        ]);
        let s2 = Value::set(vec![
            Value::object([("n", Value::string("b")), ("t", Value::List(vec![]))]),
            Value::object([("n", Value::string("a")), ("t", Value::List(vec![]))]),
        ]);
        assert!(values_sdk_equivalent(&s1, &s2));
        let s3 = Value::set(vec![Value::object([("n", Value::string("c"))])]);
        assert!(!values_sdk_equivalent(&s1, &s3));
    }
}
