use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

use super::{InstanceDiff, ResourceAttrDiff};
use crate::error::Result;
use crate::flatmap::{keys_under, Flatmap, UNKNOWN_VARIABLE_VALUE};
use crate::resource::{element_indexes, Elem, Resource, Schema, ValueType};
use crate::state::{InstanceState, ResourceConfig};
use crate::timeouts::{ResourceTimeout, TIMEOUTS_CONFIG_KEY};
use crate::value::Value;

impl Resource {
    /// Diff `config` against `prior`. A missing prior is a new instance, whose
    /// `id` is always computed.
    ///
    /// Returns `None` when nothing changes.
    pub fn diff(
        &self,
        prior: Option<&InstanceState>,
        config: &ResourceConfig,
    ) -> Result<Option<InstanceDiff>> {
        let mut diff = self.schema_diff(prior, config, true)?;
        if prior.is_none() {
            diff.attributes.insert(
                "id".to_string(),
                ResourceAttrDiff {
                    new_computed: true,
                    ..Default::default()
                },
            );
        }
        Ok(non_empty(diff))
    }

    /// Like [`Resource::diff`], without the new-instance rule.
    pub fn simple_diff(
        &self,
        prior: Option<&InstanceState>,
        config: &ResourceConfig,
    ) -> Result<Option<InstanceDiff>> {
        Ok(non_empty(self.schema_diff(prior, config, true)?))
    }

    fn schema_diff(
        &self,
        prior: Option<&InstanceState>,
        config: &ResourceConfig,
        state_funcs: bool,
    ) -> Result<InstanceDiff> {
        let timeouts = ResourceTimeout::config_decode(self, &config.raw)?;

        let prior_attrs = prior
            .map(|s| self.rehash_sets(&s.attributes))
            .unwrap_or_default();
        let config_attrs = self.rehash_sets(&config.config);

        let mut differ = Differ {
            prior: &prior_attrs,
            config: &config_attrs,
            has_id: prior.is_some_and(|s| !s.id.is_empty()),
            state_funcs,
            attributes: BTreeMap::new(),
        };
        for (name, schema) in &self.schema {
            differ.diff(name, schema, false);
        }
        let mut attributes = differ.attributes;

        // Attributes the schema no longer knows about.
        for (k, v) in &prior_attrs {
            let root = k.split('.').next().unwrap_or(k);
            if root == "id" || root == TIMEOUTS_CONFIG_KEY || self.schema.contains_key(root) {
                continue;
            }
            attributes
                .entry(k.clone())
                .or_insert_with(|| ResourceAttrDiff {
                    old: v.clone(),
                    new_removed: true,
                    ..Default::default()
                });
        }

        if prior.is_some() {
            for (k, d) in attributes.iter_mut() {
                d.old = prior_attrs.get(k).cloned().unwrap_or_default();
            }
        }

        let mut diff = InstanceDiff {
            attributes,
            ..Default::default()
        };
        timeouts.meta_encode(&mut diff.meta);
        trace!(entries = diff.attributes.len(), "computed legacy diff");
        Ok(diff)
    }
}

/// Diff a planned value against its prior value, the way apply sees it:
/// unknowns left in the plan are only known to the resource, and state
/// functions already ran during plan.
pub fn diff_from_values(
    prior: &Value,
    planned: &Value,
    resource: &Resource,
) -> Result<Option<InstanceDiff>> {
    let prior_state = resource.shim_instance_state_from_value(prior)?;
    let mut config = ResourceConfig::new_shimmed(planned, &resource.core_config_schema())?;
    config.remove_unknowns();
    Ok(non_empty(resource.schema_diff(
        Some(&prior_state),
        &config,
        false,
    )?))
}

fn non_empty(diff: InstanceDiff) -> Option<InstanceDiff> {
    if diff.attributes.is_empty() {
        None
    } else {
        Some(diff)
    }
}

struct Differ<'a> {
    prior: &'a Flatmap,
    config: &'a Flatmap,
    has_id: bool,
    state_funcs: bool,
    attributes: BTreeMap<String, ResourceAttrDiff>,
}

impl Differ<'_> {
    fn diff(&mut self, k: &str, schema: &Schema, all: bool) {
        match schema.value_type {
            ValueType::Bool | ValueType::Int | ValueType::Float | ValueType::String => {
                self.diff_string(k, schema, all)
            }
            ValueType::List => self.diff_list(k, schema, all),
            ValueType::Set => self.diff_set(k, schema, all),
            ValueType::Map => self.diff_map(k, schema, all),
        }
    }

    fn config_computed(&self, key: &str) -> bool {
        self.config.get(key).map(String::as_str) == Some(UNKNOWN_VARIABLE_VALUE)
    }

    fn finalize(&mut self, k: &str, d: ResourceAttrDiff, schema: &Schema) {
        if let Some(d) = finalize_diff(d, schema) {
            self.attributes.insert(k.to_string(), d);
        }
    }

    fn diff_string(&mut self, k: &str, schema: &Schema, all: bool) {
        let o = self.prior.get(k);
        let computed = self.config_computed(k);
        let mut n = if computed {
            None
        } else {
            self.config.get(k).cloned()
        };

        let mut original = None;
        if let (true, Some(f)) = (self.state_funcs, &schema.state_func) {
            if let Some(raw) = n.take() {
                n = Some(f.call(&raw));
                original = Some(raw);
            }
        }

        let os = o.cloned().unwrap_or_default();
        let ns = match (&n, o) {
            (Some(n), _) => n.clone(),
            (None, Some(_)) if !computed => schema.value_type.zero().to_string(),
            (None, _) => String::new(),
        };

        if os == ns && !all && !computed {
            if !os.is_empty() || self.has_id {
                return;
            }
            if !schema.computed {
                return;
            }
        }

        let removed = o.is_some() && n.is_none() && !computed;
        if removed && schema.computed {
            return;
        }

        self.finalize(
            k,
            ResourceAttrDiff {
                old: os,
                new: ns,
                new_extra: original.map(JsonValue::String),
                new_removed: removed,
                new_computed: computed,
                ..Default::default()
            },
            schema,
        );
    }

    fn diff_list(&mut self, k: &str, schema: &Schema, all: bool) {
        let count_key = format!("{}.#", k);
        let prefix = format!("{}.", k);
        let computed_list = self.config_computed(&count_key) || self.config_computed(k);

        let o = self.prior.get(&count_key).map(|c| parse_count(c));
        let n = if computed_list {
            None
        } else {
            self.config.get(&count_key).map(|c| parse_count(c))
        };

        if o.is_some() && n.is_none() && !computed_list && schema.computed {
            return;
        }

        let old_len = o.unwrap_or(0);
        let new_len = n.unwrap_or(0);
        if !all
            && n.is_some()
            && old_len == new_len
            && elements(self.prior, &prefix, &count_key).eq(elements(self.config, &prefix, &count_key))
        {
            return;
        }

        if computed_list {
            self.attributes.insert(
                count_key,
                ResourceAttrDiff {
                    old: old_len.to_string(),
                    new_computed: true,
                    requires_new: schema.force_new,
                    ..Default::default()
                },
            );
            return;
        }

        let changed = old_len != new_len;
        let computed = old_len == 0 && new_len == 0 && schema.computed;
        if changed || computed || all {
            let (old, new) = if computed {
                (String::new(), String::new())
            } else {
                (old_len.to_string(), new_len.to_string())
            };
            self.finalize(
                &count_key,
                ResourceAttrDiff {
                    old,
                    new,
                    ..Default::default()
                },
                &count_schema(schema, false),
            );
        }

        let indexes = (0..old_len.max(new_len)).map(|i| i.to_string());
        self.diff_elements(k, schema, indexes, all);
    }

    fn diff_set(&mut self, k: &str, schema: &Schema, all: bool) {
        let count_key = format!("{}.#", k);
        let prefix = format!("{}.", k);
        let computed_set = self.config_computed(&count_key) || self.config_computed(k);

        let o_exists = self.prior.contains_key(&count_key);
        let n_set = !computed_set && self.config.contains_key(&count_key);
        if o_exists && !n_set && !computed_set && schema.computed {
            return;
        }

        let old_codes = owned(element_indexes(self.prior, &prefix));
        let new_codes = if n_set {
            owned(element_indexes(self.config, &prefix))
        } else {
            BTreeSet::new()
        };
        let old_len = self.prior.get(&count_key).map_or(0, |c| parse_count(c));
        let new_len = if n_set {
            self.config.get(&count_key).map_or(0, |c| parse_count(c))
        } else {
            0
        };

        if !all && n_set && old_len == new_len && old_codes == new_codes {
            return;
        }

        let count_schema = count_schema(schema, false);
        if computed_set || (schema.computed && !n_set) {
            let old = self
                .prior
                .get(&count_key)
                .filter(|c| c.as_str() != "0")
                .cloned()
                .unwrap_or_default();
            self.finalize(
                &count_key,
                ResourceAttrDiff {
                    old,
                    new_computed: true,
                    ..Default::default()
                },
                &count_schema,
            );
            return;
        }

        if old_len != new_len || all {
            self.finalize(
                &count_key,
                ResourceAttrDiff {
                    old: old_len.to_string(),
                    new: new_len.to_string(),
                    ..Default::default()
                },
                &count_schema,
            );
        }

        // Removed elements first, then everything in the new set.
        let removed: Vec<String> = old_codes.difference(&new_codes).cloned().collect();
        self.diff_elements(k, schema, removed.into_iter().chain(new_codes), true);
    }

    fn diff_elements(
        &mut self,
        k: &str,
        schema: &Schema,
        indexes: impl IntoIterator<Item = String>,
        all: bool,
    ) {
        for idx in indexes {
            let sub = format!("{}.{}", k, idx);
            match &schema.elem {
                Some(Elem::Resource(r)) => {
                    for (name, field) in &r.schema {
                        self.diff(&format!("{}.{}", sub, name), field, all);
                    }
                }
                Some(Elem::Schema(es)) => {
                    let mut es = (**es).clone();
                    es.force_new = schema.force_new;
                    self.diff(&sub, &es, all);
                }
                None => {
                    let es = Schema {
                        force_new: schema.force_new,
                        ..Schema::new(ValueType::String)
                    };
                    self.diff(&sub, &es, all);
                }
            }
        }
    }

    fn diff_map(&mut self, k: &str, schema: &Schema, all: bool) {
        let prefix = format!("{}.", k);
        let count_key = format!("{}.%", k);

        let mut state_map = map_entries(self.prior, &prefix);
        let config_map = map_entries(self.config, &prefix);
        let state_exists = self.prior.contains_key(&count_key) || !state_map.is_empty();
        let whole_unknown = self.config_computed(&count_key) || self.config_computed(k);
        let n_computed =
            whole_unknown || config_map.values().any(|v| v == UNKNOWN_VARIABLE_VALUE);
        let n_exists =
            !whole_unknown && (self.config.contains_key(&count_key) || !config_map.is_empty());

        let old_len = state_map.len();
        let new_len = config_map.len();
        let mut changed = old_len != new_len;
        if old_len != 0 && new_len == 0 && schema.computed {
            changed = false;
        }
        let computed = old_len == 0 && new_len == 0 && schema.computed && !state_exists;

        if changed || computed || n_computed {
            let (old, new) = if computed || n_computed {
                (String::new(), String::new())
            } else {
                (old_len.to_string(), new_len.to_string())
            };
            self.finalize(
                &count_key,
                ResourceAttrDiff {
                    old,
                    new,
                    ..Default::default()
                },
                &count_schema(schema, n_computed),
            );
        }

        if !n_exists && schema.computed {
            return;
        }

        for (key, v) in config_map {
            let old = state_map.remove(&key);
            if old.as_deref() == Some(v.as_str()) && !all {
                continue;
            }
            self.finalize(
                &format!("{}{}", prefix, key),
                ResourceAttrDiff {
                    old: old.unwrap_or_default(),
                    new: v,
                    ..Default::default()
                },
                schema,
            );
        }
        for (key, v) in state_map {
            self.finalize(
                &format!("{}{}", prefix, key),
                ResourceAttrDiff {
                    old: v,
                    new_removed: true,
                    ..Default::default()
                },
                schema,
            );
        }
    }
}

fn finalize_diff(mut d: ResourceAttrDiff, schema: &Schema) -> Option<ResourceAttrDiff> {
    if schema.value_type == ValueType::Bool {
        d.old = normalize_bool(d.old);
        d.new = normalize_bool(d.new);
    }

    if schema.computed && !d.new_removed && d.new.is_empty() {
        d.new_computed = true;
    }

    if schema.force_new {
        d.requires_new = d.old != d.new || d.new_computed;
    }

    if d.new_removed {
        return Some(d);
    }

    if schema.computed {
        // Computed and already set: leave it alone.
        if !d.old.is_empty() && d.new.is_empty() {
            return None;
        }
        if d.new.is_empty() && !d.new_computed {
            d.new_computed = true;
        }
    }

    if schema.sensitive {
        d.sensitive = true;
    }
    Some(d)
}

fn normalize_bool(s: String) -> String {
    match s.as_str() {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => "true".to_string(),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => "false".to_string(),
        _ => s,
    }
}

fn count_schema(schema: &Schema, computed: bool) -> Schema {
    Schema {
        computed: schema.computed || computed,
        force_new: schema.force_new,
        ..Schema::new(ValueType::Int)
    }
}

fn parse_count(c: &str) -> usize {
    c.parse().unwrap_or(0)
}

fn owned(set: BTreeSet<&str>) -> BTreeSet<String> {
    set.into_iter().map(str::to_string).collect()
}

fn elements<'a>(
    m: &'a Flatmap,
    prefix: &'a str,
    count_key: &'a str,
) -> impl Iterator<Item = (&'a String, &'a String)> {
    keys_under(m, prefix).filter(move |(k, _)| k.as_str() != count_key)
}

fn map_entries(m: &Flatmap, prefix: &str) -> BTreeMap<String, String> {
    keys_under(m, prefix)
        .filter(|(k, _)| &k[prefix.len()..] != "%")
        .map(|(k, v)| (k[prefix.len()..].to_string(), v.clone()))
        .collect()
}
