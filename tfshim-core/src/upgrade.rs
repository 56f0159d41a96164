//! Bringing a persisted state up to the current schema version.
//!
//! Old states may be stored in the flatmap form, which only the legacy
//! migrate function understands. Once a state has been lifted out of that
//! form it travels as a JSON map through the ordered state upgraders, and is
//! finally decoded against the current schema.

use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::{debug, warn};

use crate::error::{Result, ShimError};
use crate::flatmap::{value_from_flatmap, Flatmap};
use crate::json::{json_map_to_state_value, state_value_to_json_map};
use crate::resource::Resource;
use crate::state::{InstanceState, Meta, SCHEMA_VERSION_META_KEY};
use crate::types::Type;
use crate::value::Value;

pub type JsonMapState = JsonMap<String, JsonValue>;

/// A state as persisted by the host. At most one form is expected; when both
/// are present the flatmap is used.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawState {
    pub json: Option<Vec<u8>>,
    pub flatmap: Option<Flatmap>,
}

impl RawState {
    pub fn from_json(json: impl Into<Vec<u8>>) -> Self {
        RawState {
            json: Some(json.into()),
            flatmap: None,
        }
    }

    pub fn from_flatmap(flatmap: Flatmap) -> Self {
        RawState {
            json: None,
            flatmap: Some(flatmap),
        }
    }
}

/// Upgrade a raw state to the JSON map form of the current schema version.
/// `None` means there was no state at all.
pub fn upgrade_json_map(
    resource: &Resource,
    stored_version: i64,
    raw: &RawState,
) -> Result<Option<JsonMapState>> {
    let flatmap = raw.flatmap.as_ref().filter(|m| !m.is_empty());
    let json = raw.json.as_deref().filter(|j| !j.is_empty());

    let (map, version) = match (flatmap, json) {
        (Some(flatmap), json) => {
            if json.is_some() {
                warn!("state has both a JSON and a flatmap form; using the flatmap");
            }
            let (map, version) = upgrade_flatmap_state(resource, stored_version, flatmap)?;
            match map {
                Some(map) => (map, version),
                None => return Ok(None),
            }
        }
        (None, Some(json)) => {
            let map: JsonMapState = serde_json::from_slice(json)
                .map_err(|e| ShimError::decoding(format!("state JSON: {}", e)))?;
            (map, stored_version)
        }
        (None, None) => {
            debug!("no state provided to upgrade");
            return Ok(None);
        }
    };
    upgrade_json_state(resource, version, map).map(Some)
}

/// Upgrade a raw state and decode it against the current schema. No state
/// decodes to null.
pub fn upgrade_resource_state(resource: &Resource, stored_version: i64, raw: &RawState) -> Result<Value> {
    let block = resource.core_config_schema();
    let mut map = upgrade_json_map(resource, stored_version, raw)?;
    if let Some(map) = &mut map {
        // Upgraders are not required to clean out attributes the schema dropped.
        remove_attributes(map, &block.implied_type());
    }
    json_map_to_state_value(map.as_ref(), &block)
}

/// Lift a flatmap state into the JSON form, running the legacy migrate
/// function when the state predates the first state upgrader. Returns the
/// map together with the version it is now at.
fn upgrade_flatmap_state(
    resource: &Resource,
    version: i64,
    flatmap: &Flatmap,
) -> Result<(Option<JsonMapState>, i64)> {
    let first_upgrader = resource.state_upgraders.first();
    let requires_migrate = match first_upgrader {
        Some(u) => version < u.version,
        None => version < resource.schema_version,
    };

    let mut ty = resource.implied_type();
    let mut version = version;
    let mut attrs = flatmap.clone();

    if requires_migrate {
        let migrate = resource.migrate_state.as_ref().ok_or_else(|| {
            ShimError::Migration("missing MigrateState function".to_string())
        })?;
        let mut meta = Meta::new();
        meta.insert(
            SCHEMA_VERSION_META_KEY.to_string(),
            JsonValue::String(version.to_string()),
        );
        let state = InstanceState {
            id: attrs.get("id").cloned().unwrap_or_default(),
            attributes: attrs,
            meta,
        };
        debug!(from = version, "migrating legacy flatmap state");
        let migrated = (migrate.0)(version, state).map_err(|e| ShimError::MigrateFunction(e.into()))?;
        attrs = migrated.attributes;
        attrs.insert("id".to_string(), migrated.id);

        // The migrate function only brings the state as far as the first upgrader.
        if let Some(u) = first_upgrader {
            ty = u.r#type.clone();
            version = u.version;
        }
    } else if let Some(u) = resource
        .state_upgraders
        .iter()
        .find(|u| u.version == version)
    {
        // Newer than what the migrate function handles, older than current,
        // but still stored as a flatmap.
        ty = u.r#type.clone();
    }

    let value = value_from_flatmap(&attrs, &ty)?;
    Ok((state_value_to_json_map(&value)?, version))
}

/// Run every upgrader from `version` on, in order.
fn upgrade_json_state(resource: &Resource, mut version: i64, mut map: JsonMapState) -> Result<JsonMapState> {
    for upgrader in &resource.state_upgraders {
        if upgrader.version != version {
            continue;
        }
        debug!(from = version, to = version + 1, "upgrading state");
        map = (upgrader.upgrade)(map).map_err(|e| ShimError::StateUpgrade {
            version,
            source: e.into(),
        })?;
        version += 1;
    }
    Ok(map)
}

/// Drop JSON attributes that `ty` does not have, recursing into nested
/// objects and collections of objects.
fn remove_attributes(map: &mut JsonMapState, ty: &Type) {
    let Some(attrs) = ty.attribute_types() else {
        return;
    };
    map.retain(|k, _| {
        let keep = attrs.contains_key(k);
        if !keep {
            debug!(attribute = %k, "removing attribute no longer in the schema");
        }
        keep
    });
    for (k, v) in map.iter_mut() {
        if let Some(at) = attrs.get(k) {
            remove_attributes_value(v, at);
        }
    }
}

fn remove_attributes_value(v: &mut JsonValue, ty: &Type) {
    match (ty, v) {
        (Type::Object(_), JsonValue::Object(m)) => remove_attributes(m, ty),
        (Type::List(et) | Type::Set(et), JsonValue::Array(items)) => {
            for item in items {
                remove_attributes_value(item, et);
            }
        }
        (Type::Map(et), JsonValue::Object(m)) => {
            for item in m.values_mut() {
                remove_attributes_value(item, et);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{MigrateState, Schema, StateUpgrader, ValueType};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn fm(pairs: &[(&str, &str)]) -> Flatmap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn object(v: JsonValue) -> JsonMapState {
        match v {
            JsonValue::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    /// v0 stored `name` as a flatmap, the v1 upgrader renames it to `label`,
    /// the v2 upgrader adds `size`, giving the current v3.
    fn chained_resource() -> Resource {
        let mut r = Resource::new([
            ("label", Schema::new(ValueType::String).optional()),
            ("size", Schema::new(ValueType::Int).optional()),
        ]);
        r.schema_version = 3;
        r.migrate_state = Some(MigrateState::new(|v, mut s| {
            assert_eq!(v, 0);
            assert_eq!(s.meta.get(SCHEMA_VERSION_META_KEY), Some(&json!("0")));
            if let Some(name) = s.attributes.remove("name") {
                s.attributes.insert("name".to_string(), name.to_uppercase());
            }
            Ok(s)
        }));
        r.state_upgraders = vec![
            StateUpgrader::new(
                1,
                Type::object([("id", Type::String), ("name", Type::String)]),
                |mut m| {
                    let name = m.remove("name").unwrap_or(JsonValue::Null);
                    m.insert("label".to_string(), name);
                    Ok(m)
                },
            ),
            StateUpgrader::new(
                2,
                Type::object([("id", Type::String), ("label", Type::String)]),
                |mut m| {
                    m.insert("size".to_string(), json!(3));
                    Ok(m)
                },
            ),
        ];
        r
    }

    #[test]
    fn test_no_state() {
        let r = chained_resource();
        assert_eq!(upgrade_json_map(&r, 0, &RawState::default()).unwrap(), None);
        assert_eq!(
            upgrade_resource_state(&r, 0, &RawState::default()).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_flatmap_migrate_then_upgrade() {
        let r = chained_resource();
        let raw = RawState::from_flatmap(fm(&[("id", "i-1"), ("name", "web")]));
        let map = upgrade_json_map(&r, 0, &raw).unwrap().unwrap();
        assert_eq!(
            JsonValue::Object(map),
            json!({"id": "i-1", "label": "WEB", "size": 3})
        );
    }

    #[test]
    fn test_flatmap_at_upgrader_version() {
        let r = chained_resource();
        // Already past the migrate function, but still in flatmap form.
        let raw = RawState::from_flatmap(fm(&[("id", "i-1"), ("label", "web")]));
        let v = upgrade_resource_state(&r, 2, &raw).unwrap();
        assert_eq!(v.attr("label"), Some(&Value::string("web")));
        assert_eq!(v.attr("size"), Some(&Value::int(3)));
    }

    #[test]
    fn test_json_state_chain() {
        let r = chained_resource();
        let raw = RawState::from_json(br#"{"id":"i-1","name":"web"}"#.to_vec());
        let v = upgrade_resource_state(&r, 1, &raw).unwrap();
        assert_eq!(v.attr("id"), Some(&Value::string("i-1")));
        assert_eq!(v.attr("label"), Some(&Value::string("web")));
        assert_eq!(v.attr("size"), Some(&Value::int(3)));
        assert_eq!(v.attr("name"), None);
    }

    fn recording_resource(calls: &Arc<Mutex<Vec<i64>>>) -> Resource {
        let mut r = Resource::new([("name", Schema::new(ValueType::String).optional())]);
        r.schema_version = 3;
        r.state_upgraders = (0..3)
            .map(|version| {
                let calls = calls.clone();
                StateUpgrader::new(
                    version,
                    Type::object([("id", Type::String), ("name", Type::String)]),
                    move |m| {
                        calls.lock().unwrap().push(version);
                        Ok(m)
                    },
                )
            })
            .collect();
        r
    }

    #[test]
    fn test_each_upgrader_runs_once_in_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let r = recording_resource(&calls);
        let raw = RawState::from_json(br#"{"id":"i-1","name":"a"}"#.to_vec());

        upgrade_json_map(&r, 0, &raw).unwrap();
        assert_eq!(*calls.lock().unwrap(), vec![0, 1, 2]);

        calls.lock().unwrap().clear();
        upgrade_json_map(&r, 2, &raw).unwrap();
        assert_eq!(*calls.lock().unwrap(), vec![2]);

        calls.lock().unwrap().clear();
        upgrade_json_map(&r, 3, &raw).unwrap();
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_current_version_is_untouched() {
        let r = chained_resource();
        let raw = RawState::from_json(br#"{"id":"i-1","label":"x","size":1}"#.to_vec());
        let map = upgrade_json_map(&r, 3, &raw).unwrap().unwrap();
        assert_eq!(map, object(json!({"id": "i-1", "label": "x", "size": 1})));
    }

    #[test]
    fn test_flatmap_wins_over_json() {
        let r = chained_resource();
        let raw = RawState {
            json: Some(br#"{"id":"from-json","label":"j"}"#.to_vec()),
            flatmap: Some(fm(&[("id", "from-flatmap"), ("label", "f")])),
        };
        let v = upgrade_resource_state(&r, 2, &raw).unwrap();
        assert_eq!(v.attr("id"), Some(&Value::string("from-flatmap")));
    }

    #[test]
    fn test_missing_migrate_function() {
        let mut r = chained_resource();
        r.migrate_state = None;
        let raw = RawState::from_flatmap(fm(&[("id", "i-1")]));
        assert!(matches!(
            upgrade_json_map(&r, 0, &raw),
            Err(ShimError::Migration(_))
        ));
    }

    #[test]
    fn test_failing_migrate_function() {
        let mut r = chained_resource();
        r.migrate_state = Some(MigrateState::new(|_, _| anyhow::bail!("nope")));
        let raw = RawState::from_flatmap(fm(&[("id", "i-1")]));
        assert!(matches!(
            upgrade_json_map(&r, 0, &raw),
            Err(ShimError::MigrateFunction(_))
        ));
    }

    #[test]
    fn test_failing_upgrader() {
        let mut r = chained_resource();
        r.state_upgraders[1].upgrade = Arc::new(|_: JsonMapState| -> anyhow::Result<JsonMapState> {
            anyhow::bail!("broken")
        });
        let raw = RawState::from_json(br#"{"id":"i-1","name":"web"}"#.to_vec());
        let err = upgrade_json_map(&r, 1, &raw).unwrap_err();
        assert!(matches!(err, ShimError::StateUpgrade { version: 2, .. }));
    }

    #[test]
    fn test_migrate_without_upgraders() {
        let mut r = Resource::new([("name", Schema::new(ValueType::String).optional())]);
        r.schema_version = 1;
        r.migrate_state = Some(MigrateState::new(|_, mut s| {
            s.id = "renamed".to_string();
            Ok(s)
        }));
        let raw = RawState::from_flatmap(fm(&[("id", "i-1"), ("name", "a")]));
        let v = upgrade_resource_state(&r, 0, &raw).unwrap();
        assert_eq!(v.attr("id"), Some(&Value::string("renamed")));
        assert_eq!(v.attr("name"), Some(&Value::string("a")));
    }

    #[test]
    fn test_invalid_json() {
        let r = chained_resource();
        let raw = RawState::from_json(b"{not json".to_vec());
        assert!(matches!(
            upgrade_json_map(&r, 3, &raw),
            Err(ShimError::Decoding(_))
        ));
    }
}
