//! Protocol-facing entry points of the shim.
//!
//! Each operation decodes the packed values it receives, runs the legacy
//! machinery and the [`ResourceProvider`] against them, and encodes the
//! result. Transport framing is left to the caller.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::fmt;
use tracing::{debug, warn};

use crate::apply::apply_change;
use crate::diff::{diff_from_values, InstanceDiff};
use crate::error::{Result, ShimError};
use crate::flatmap::value_from_flatmap;
use crate::json::value_from_json;
use crate::msgpack;
use crate::normalize::{copy_timeout_values, normalize_flatmap_containers, normalize_null_values};
use crate::paths::AttributePath;
use crate::plan::plan_change;
use crate::resource::Resource;
use crate::state::{InstanceInfo, InstanceState, Meta, ResourceConfig};
use crate::types::Type;
use crate::upgrade::{upgrade_resource_state, RawState};
use crate::value::Value;

/// A value as exchanged with the host: MessagePack, or JSON for older hosts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DynamicValue {
    pub msgpack: Vec<u8>,
    pub json: Vec<u8>,
}

impl DynamicValue {
    pub fn encode(value: &Value, ty: &Type) -> Result<Self> {
        Ok(DynamicValue {
            msgpack: msgpack::marshal(value, ty)?,
            json: Vec::new(),
        })
    }

    pub fn null(ty: &Type) -> Result<Self> {
        Self::encode(&Value::Null, ty)
    }

    /// Decode against `ty`. MessagePack is preferred; with neither form
    /// present the value is null.
    pub fn decode(&self, ty: &Type) -> Result<Value> {
        if !self.msgpack.is_empty() {
            return msgpack::unmarshal(&self.msgpack, ty);
        }
        if !self.json.is_empty() {
            let json: JsonValue = serde_json::from_slice(&self.json)
                .map_err(|e| ShimError::decoding(format!("dynamic value JSON: {}", e)))?;
            return value_from_json(&json, ty);
        }
        Ok(Value::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub summary: String,
    pub detail: String,
    pub attribute: Option<AttributePath>,
}

impl Diagnostic {
    pub fn error(err: &anyhow::Error) -> Self {
        Diagnostic {
            severity: Severity::Error,
            summary: err.to_string(),
            detail: format!("{:#}", err),
            attribute: None,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{}: {}", level, self.summary)?;
        if let Some(path) = &self.attribute {
            write!(f, " (at {})", path)?;
        }
        Ok(())
    }
}

/// What a resource reports after applying a diff. A failed apply may still
/// leave an instance behind, so the state is kept next to the error.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    pub state: Option<InstanceState>,
    pub error: Option<anyhow::Error>,
}

impl ApplyOutcome {
    pub fn ok(state: Option<InstanceState>) -> Self {
        ApplyOutcome { state, error: None }
    }

    pub fn failed(state: Option<InstanceState>, error: anyhow::Error) -> Self {
        ApplyOutcome {
            state,
            error: Some(error),
        }
    }
}

impl From<anyhow::Result<Option<InstanceState>>> for ApplyOutcome {
    fn from(result: anyhow::Result<Option<InstanceState>>) -> Self {
        match result {
            Ok(state) => ApplyOutcome::ok(state),
            Err(e) => ApplyOutcome::failed(None, e),
        }
    }
}

/// The resource implementations behind the shim.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// The legacy schema of a resource type.
    fn resource(&self, type_name: &str) -> Option<&Resource>;

    /// Read the remote object. `None`, or a state with an empty id, means the
    /// object no longer exists.
    async fn refresh(
        &self,
        info: &InstanceInfo,
        state: InstanceState,
    ) -> anyhow::Result<Option<InstanceState>>;

    async fn apply(&self, info: &InstanceInfo, prior: InstanceState, diff: &InstanceDiff)
        -> ApplyOutcome;

    /// States for an existing remote object. By default only the id is known
    /// and a later read fills in the rest.
    async fn import_state(&self, _info: &InstanceInfo, id: &str) -> anyhow::Result<Vec<InstanceState>> {
        Ok(vec![InstanceState::new(id)])
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpgradeResourceStateRequest {
    pub type_name: String,
    pub version: i64,
    pub raw_state: RawState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpgradeResourceStateResponse {
    pub upgraded_state: DynamicValue,
}

#[derive(Debug, Clone, Default)]
pub struct ReadResourceRequest {
    pub type_name: String,
    pub current_state: DynamicValue,
    pub private: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadResourceResponse {
    pub new_state: DynamicValue,
    pub private: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct PlanResourceChangeRequest {
    pub type_name: String,
    pub prior_state: DynamicValue,
    pub proposed_new_state: DynamicValue,
    pub prior_private: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanResourceChangeResponse {
    pub planned_state: DynamicValue,
    pub requires_replace: Vec<AttributePath>,
    pub planned_private: Vec<u8>,
    pub legacy_type_system: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ApplyResourceChangeRequest {
    pub type_name: String,
    pub prior_state: DynamicValue,
    pub planned_state: DynamicValue,
    pub planned_private: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApplyResourceChangeResponse {
    pub new_state: DynamicValue,
    pub private: Vec<u8>,
    pub diagnostics: Vec<Diagnostic>,
    pub legacy_type_system: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportedResource {
    pub type_name: String,
    pub state: DynamicValue,
    pub private: Vec<u8>,
}

pub struct ShimServer<P> {
    provider: P,
}

impl<P: ResourceProvider> ShimServer<P> {
    pub fn new(provider: P) -> Self {
        ShimServer { provider }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    fn resource(&self, type_name: &str) -> Result<&Resource> {
        self.provider
            .resource(type_name)
            .ok_or_else(|| ShimError::UnknownResourceType(type_name.to_string()))
    }

    pub async fn upgrade_resource_state(
        &self,
        request: UpgradeResourceStateRequest,
    ) -> Result<UpgradeResourceStateResponse> {
        let res = self.resource(&request.type_name)?;
        let value = upgrade_resource_state(res, request.version, &request.raw_state)?;
        Ok(UpgradeResourceStateResponse {
            upgraded_state: DynamicValue::encode(&value, &res.implied_type())?,
        })
    }

    pub async fn read_resource(&self, request: ReadResourceRequest) -> Result<ReadResourceResponse> {
        let res = self.resource(&request.type_name)?;
        let ty = res.implied_type();
        let current = request.current_state.decode(&ty)?;
        if current.is_null() {
            debug!(type_name = %request.type_name, "nothing to read");
            return Ok(ReadResourceResponse {
                new_state: DynamicValue::null(&ty)?,
                private: request.private,
            });
        }

        let mut state = res.shim_instance_state_from_value(&current)?;
        state.meta = decode_private(&request.private)?;
        let info = InstanceInfo {
            type_name: request.type_name.clone(),
        };
        let current_attrs = state.attributes.clone();
        let refreshed = self
            .provider
            .refresh(&info, state)
            .await
            .map_err(|e| ShimError::Provider(e.into()))?;

        let new_state = match refreshed {
            Some(new) if !new.id.is_empty() => {
                let mut attrs = new.attributes;
                attrs.insert("id".to_string(), new.id);
                let attrs = normalize_flatmap_containers(&current_attrs, &attrs, true);
                let value = value_from_flatmap(&attrs, &ty)?;
                let value = normalize_null_values(&value, &current, &ty, false);
                copy_timeout_values(&value, &current)
            }
            // An empty id is how the legacy layer reports a deleted object.
            _ => {
                debug!(type_name = %request.type_name, "remote object is gone");
                Value::Null
            }
        };

        Ok(ReadResourceResponse {
            new_state: DynamicValue::encode(&new_state, &ty)?,
            private: request.private,
        })
    }

    pub async fn plan_resource_change(
        &self,
        request: PlanResourceChangeRequest,
    ) -> Result<PlanResourceChangeResponse> {
        let res = self.resource(&request.type_name)?;
        let block = res.core_config_schema();
        let ty = block.implied_type();

        let prior = request.prior_state.decode(&ty)?;
        let proposed = request.proposed_new_state.decode(&ty)?;

        // Destroy plans need no diff.
        if proposed.is_null() {
            return Ok(PlanResourceChangeResponse {
                planned_state: request.proposed_new_state,
                requires_replace: Vec::new(),
                planned_private: request.prior_private,
                legacy_type_system: true,
            });
        }

        let mut prior_state = res.shim_instance_state_from_value(&prior)?;
        prior_state.meta = decode_private(&request.prior_private)?;
        let config = ResourceConfig::new_shimmed(&proposed, &block)?;
        let diff = res.diff((!prior.is_null()).then_some(&prior_state), &config)?;

        let planned = plan_change(&prior, &proposed, &prior_state.attributes, diff.as_ref(), &block)?;
        let planned_private = match &diff {
            Some(diff) if !diff.is_empty() => {
                let mut private = diff.meta.clone();
                diff.fold_new_extras(&mut private);
                encode_private(&private)?
            }
            _ => request.prior_private,
        };

        Ok(PlanResourceChangeResponse {
            planned_state: DynamicValue::encode(&planned.planned_state, &ty)?,
            requires_replace: planned.requires_replace,
            planned_private,
            legacy_type_system: true,
        })
    }

    pub async fn apply_resource_change(
        &self,
        request: ApplyResourceChangeRequest,
    ) -> Result<ApplyResourceChangeResponse> {
        let res = self.resource(&request.type_name)?;
        let block = res.core_config_schema();
        let ty = block.implied_type();

        let prior = request.prior_state.decode(&ty)?;
        let planned = request.planned_state.decode(&ty)?;
        let mut prior_state = res.shim_instance_state_from_value(&prior)?;

        let mut diff = if planned.is_null() {
            InstanceDiff::destroy()
        } else {
            diff_from_values(&prior, &planned, res)?.unwrap_or_default()
        };
        diff.restore_new_extras(decode_private(&request.planned_private)?);
        prior_state.meta = diff.meta.clone();

        // Replacement was decided during plan; here it would only drop the state.
        for d in diff.attributes.values_mut() {
            d.requires_new = false;
        }
        diff.attributes
            .retain(|k, d| !d.new_removed || prior_state.attributes.contains_key(k));

        let info = InstanceInfo {
            type_name: request.type_name.clone(),
        };
        let outcome = self.provider.apply(&info, prior_state, &diff).await;
        let mut diagnostics = Vec::new();
        if let Some(err) = &outcome.error {
            warn!(type_name = %request.type_name, "apply failed: {:#}", err);
            diagnostics.push(Diagnostic::error(err));
        }

        let applied = apply_change(&planned, &diff, outcome.state.as_ref(), diff.destroy, &block)?;
        Ok(ApplyResourceChangeResponse {
            new_state: DynamicValue::encode(&applied.new_state, &ty)?,
            private: encode_private(&applied.private)?,
            diagnostics,
            legacy_type_system: true,
        })
    }

    pub async fn import_resource_state(&self, type_name: &str, id: &str) -> Result<Vec<ImportedResource>> {
        let res = self.resource(type_name)?;
        let block = res.core_config_schema();
        let ty = block.implied_type();
        let info = InstanceInfo {
            type_name: type_name.to_string(),
        };
        let states = self
            .provider
            .import_state(&info, id)
            .await
            .map_err(|e| ShimError::Provider(e.into()))?;

        states
            .into_iter()
            .map(|mut s| {
                s.attributes.insert("id".to_string(), s.id.clone());
                let value = value_from_flatmap(&s.attributes, &ty)?;
                let value = block.coerce_value(&value)?;
                Ok(ImportedResource {
                    type_name: type_name.to_string(),
                    state: DynamicValue::encode(&value, &ty)?,
                    private: encode_private(&s.meta)?,
                })
            })
            .collect()
    }
}

/// Private data is a JSON object; none at all is an empty one.
fn decode_private(private: &[u8]) -> Result<Meta> {
    if private.is_empty() {
        return Ok(Meta::new());
    }
    serde_json::from_slice(private).map_err(|e| ShimError::decoding(format!("private data: {}", e)))
}

fn encode_private(meta: &Meta) -> Result<Vec<u8>> {
    if meta.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::to_vec(meta).map_err(|e| ShimError::encoding(format!("private data: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::NEW_EXTRA_KEY;
    use crate::resource::{Schema, ValueType};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    const TYPE_NAME: &str = "test_thing";

    struct TestProvider {
        resource: Resource,
        seen_extra: Mutex<Option<JsonValue>>,
    }

    impl TestProvider {
        fn new() -> Self {
            TestProvider {
                resource: Resource::new([
                    (
                        "name",
                        Schema::new(ValueType::String)
                            .required()
                            .force_new()
                            .state_func(|s| s.to_lowercase()),
                    ),
                    ("size", Schema::new(ValueType::Int).optional()),
                    ("arn", Schema::new(ValueType::String).computed()),
                    (
                        "tags",
                        Schema::new(ValueType::Map)
                            .optional()
                            .elem_schema(Schema::new(ValueType::String)),
                    ),
                ]),
                seen_extra: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl ResourceProvider for TestProvider {
        fn resource(&self, type_name: &str) -> Option<&Resource> {
            (type_name == TYPE_NAME).then_some(&self.resource)
        }

        async fn refresh(
            &self,
            _info: &InstanceInfo,
            mut state: InstanceState,
        ) -> anyhow::Result<Option<InstanceState>> {
            if state.id == "gone" {
                return Ok(None);
            }
            state.attributes.insert("arn".to_string(), "arn:2".to_string());
            Ok(Some(state))
        }

        async fn apply(
            &self,
            _info: &InstanceInfo,
            prior: InstanceState,
            diff: &InstanceDiff,
        ) -> ApplyOutcome {
            if diff.destroy {
                return ApplyOutcome::ok(None);
            }
            *self.seen_extra.lock().unwrap() =
                diff.attributes.get("name").and_then(|d| d.new_extra.clone());
            let block = self.resource.core_config_schema();
            let mut attrs = match diff.apply(&prior.attributes, &block) {
                Ok(attrs) => attrs,
                Err(e) => return ApplyOutcome::failed(None, e.into()),
            };
            let id = if prior.id.is_empty() {
                "i-1".to_string()
            } else {
                prior.id
            };
            attrs.insert("id".to_string(), id.clone());
            attrs.insert("arn".to_string(), "arn:1".to_string());
            let failed = attrs.get("name").map(String::as_str) == Some("fail");
            let state = InstanceState {
                id,
                attributes: attrs,
                meta: Meta::new(),
            };
            if failed {
                return ApplyOutcome::failed(Some(state), anyhow::anyhow!("remote API refused"));
            }
            ApplyOutcome::ok(Some(state))
        }
    }

    fn ty() -> Type {
        TestProvider::new().resource.implied_type()
    }

    fn thing(id: Value, name: &str, arn: Value) -> Value {
        Value::object([
            ("id", id),
            ("name", Value::string(name)),
            ("size", Value::int(2)),
            ("arn", arn),
            ("tags", Value::Null),
        ])
    }

    fn dv(v: &Value) -> DynamicValue {
        DynamicValue::encode(v, &ty()).unwrap()
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let server = ShimServer::new(TestProvider::new());

        // Create.
        let proposed = thing(Value::Unknown, "WEB", Value::Unknown);
        let plan = server
            .plan_resource_change(PlanResourceChangeRequest {
                type_name: TYPE_NAME.to_string(),
                prior_state: DynamicValue::null(&ty()).unwrap(),
                proposed_new_state: dv(&proposed),
                prior_private: Vec::new(),
            })
            .await
            .unwrap();
        assert!(plan.legacy_type_system);
        let planned = plan.planned_state.decode(&ty()).unwrap();
        assert_eq!(planned, thing(Value::Unknown, "web", Value::Unknown));
        assert!(plan.requires_replace.contains(&AttributePath::root_attr("id")));
        let planned_private: Meta = serde_json::from_slice(&plan.planned_private).unwrap();
        assert_eq!(planned_private[NEW_EXTRA_KEY], json!({"name": "WEB"}));

        let applied = server
            .apply_resource_change(ApplyResourceChangeRequest {
                type_name: TYPE_NAME.to_string(),
                prior_state: DynamicValue::null(&ty()).unwrap(),
                planned_state: plan.planned_state,
                planned_private: plan.planned_private,
            })
            .await
            .unwrap();
        assert!(applied.diagnostics.is_empty());
        assert_eq!(
            *server.provider().seen_extra.lock().unwrap(),
            Some(json!("WEB"))
        );
        let created = applied.new_state.decode(&ty()).unwrap();
        assert_eq!(created, thing(Value::string("i-1"), "web", Value::string("arn:1")));

        // Refresh.
        let read = server
            .read_resource(ReadResourceRequest {
                type_name: TYPE_NAME.to_string(),
                current_state: applied.new_state.clone(),
                private: applied.private.clone(),
            })
            .await
            .unwrap();
        let current = read.new_state.decode(&ty()).unwrap();
        assert_eq!(current, thing(Value::string("i-1"), "web", Value::string("arn:2")));
        assert_eq!(read.private, applied.private);

        // The configured spelling goes through the state function again: no changes.
        let replan = server
            .plan_resource_change(PlanResourceChangeRequest {
                type_name: TYPE_NAME.to_string(),
                prior_state: read.new_state.clone(),
                proposed_new_state: dv(&thing(Value::string("i-1"), "WEB", Value::string("arn:2"))),
                prior_private: read.private.clone(),
            })
            .await
            .unwrap();
        assert_eq!(replan.planned_state.decode(&ty()).unwrap(), current);
        assert!(replan.requires_replace.is_empty());
        assert_eq!(replan.planned_private, read.private);
    }

    #[tokio::test]
    async fn test_destroy() {
        let server = ShimServer::new(TestProvider::new());
        let prior = dv(&thing(Value::string("i-1"), "web", Value::string("arn:1")));
        let null = DynamicValue::null(&ty()).unwrap();

        let plan = server
            .plan_resource_change(PlanResourceChangeRequest {
                type_name: TYPE_NAME.to_string(),
                prior_state: prior.clone(),
                proposed_new_state: null.clone(),
                prior_private: b"{\"k\":1}".to_vec(),
            })
            .await
            .unwrap();
        assert_eq!(plan.planned_state, null);
        assert_eq!(plan.planned_private, b"{\"k\":1}".to_vec());

        let applied = server
            .apply_resource_change(ApplyResourceChangeRequest {
                type_name: TYPE_NAME.to_string(),
                prior_state: prior,
                planned_state: null,
                planned_private: plan.planned_private,
            })
            .await
            .unwrap();
        assert_eq!(applied.new_state.decode(&ty()).unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_apply_error_is_a_diagnostic() {
        let server = ShimServer::new(TestProvider::new());
        let planned = thing(Value::Unknown, "fail", Value::Unknown);
        let applied = server
            .apply_resource_change(ApplyResourceChangeRequest {
                type_name: TYPE_NAME.to_string(),
                prior_state: DynamicValue::null(&ty()).unwrap(),
                planned_state: dv(&planned),
                planned_private: Vec::new(),
            })
            .await
            .unwrap();
        assert_eq!(applied.diagnostics.len(), 1);
        assert_eq!(applied.diagnostics[0].severity, Severity::Error);
        assert_eq!(applied.diagnostics[0].summary, "remote API refused");
        // The partially created instance is still recorded.
        let state = applied.new_state.decode(&ty()).unwrap();
        assert_eq!(state.attr("id"), Some(&Value::string("i-1")));
    }

    #[tokio::test]
    async fn test_read_deleted() {
        let server = ShimServer::new(TestProvider::new());
        let read = server
            .read_resource(ReadResourceRequest {
                type_name: TYPE_NAME.to_string(),
                current_state: dv(&thing(Value::string("gone"), "web", Value::string("arn:1"))),
                private: Vec::new(),
            })
            .await
            .unwrap();
        assert_eq!(read.new_state.decode(&ty()).unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_read_keeps_empty_map() {
        let server = ShimServer::new(TestProvider::new());
        let Value::Object(mut current) = thing(Value::string("i-1"), "web", Value::string("arn:2")) else {
            unreachable!()
        };
        current.insert("tags".to_string(), Value::Map(BTreeMap::new()));
        let current = Value::Object(current);
        let read = server
            .read_resource(ReadResourceRequest {
                type_name: TYPE_NAME.to_string(),
                current_state: dv(&current),
                private: Vec::new(),
            })
            .await
            .unwrap();
        assert_eq!(read.new_state.decode(&ty()).unwrap(), current);
    }

    #[tokio::test]
    async fn test_unknown_type() {
        let server = ShimServer::new(TestProvider::new());
        let err = server
            .read_resource(ReadResourceRequest {
                type_name: "nope".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ShimError::UnknownResourceType(t) if t == "nope"));
    }

    #[tokio::test]
    async fn test_import() {
        let server = ShimServer::new(TestProvider::new());
        let imported = server.import_resource_state(TYPE_NAME, "i-9").await.unwrap();
        assert_eq!(imported.len(), 1);
        assert_eq!(imported[0].type_name, TYPE_NAME);
        let v = imported[0].state.decode(&ty()).unwrap();
        assert_eq!(v.attr("id"), Some(&Value::string("i-9")));
        assert_eq!(v.attr("name"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn test_upgrade() {
        let server = ShimServer::new(TestProvider::new());
        let resp = server
            .upgrade_resource_state(UpgradeResourceStateRequest {
                type_name: TYPE_NAME.to_string(),
                version: 0,
                raw_state: RawState::from_json(
                    br#"{"id":"i-1","name":"web","size":2,"arn":"arn:1","dropped":true}"#.to_vec(),
                ),
            })
            .await
            .unwrap();
        assert_eq!(
            resp.upgraded_state.decode(&ty()).unwrap(),
            thing(Value::string("i-1"), "web", Value::string("arn:1"))
        );
    }

    #[test]
    fn test_dynamic_value_forms() {
        let ty = ty();
        assert_eq!(DynamicValue::default().decode(&ty).unwrap(), Value::Null);
        let json = DynamicValue {
            msgpack: Vec::new(),
            json: br#"{"id":"i-1","name":"web","size":2}"#.to_vec(),
        };
        let v = json.decode(&ty).unwrap();
        assert_eq!(v.attr("size"), Some(&Value::int(2)));
        assert_eq!(v.attr("arn"), Some(&Value::Null));
    }
}
