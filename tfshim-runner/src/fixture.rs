use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use tracing::debug;
use tfshim_core::flatmap::UNKNOWN_VARIABLE_VALUE;
use tfshim_core::server::{ApplyOutcome, ResourceProvider};
use tfshim_core::{InstanceDiff, InstanceInfo, InstanceState, Resource};

/// A single resource type loaded from a JSON schema file. There is no remote
/// side: reads echo the state and applies take the diff at face value.
pub(crate) struct FixtureProvider {
    type_name: String,
    resource: Resource,
}

impl FixtureProvider {
    pub(crate) fn new(type_name: impl Into<String>, resource: Resource) -> Self {
        FixtureProvider {
            type_name: type_name.into(),
            resource,
        }
    }

    pub(crate) fn load(type_name: &str, path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read resource schema {}", path.display()))?;
        let resource: Resource = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse resource schema {}", path.display()))?;
        Ok(Self::new(type_name, resource))
    }

    pub(crate) fn type_name(&self) -> &str {
        &self.type_name
    }
}

#[async_trait]
impl ResourceProvider for FixtureProvider {
    fn resource(&self, type_name: &str) -> Option<&Resource> {
        (type_name == self.type_name).then_some(&self.resource)
    }

    async fn refresh(&self, _info: &InstanceInfo, state: InstanceState) -> Result<Option<InstanceState>> {
        Ok(Some(state))
    }

    async fn apply(&self, info: &InstanceInfo, prior: InstanceState, diff: &InstanceDiff) -> ApplyOutcome {
        if diff.destroy {
            return ApplyOutcome::ok(None);
        }
        debug!(
            type_name = %info.type_name,
            entries = diff.attributes.len(),
            "applying diff to fixture state"
        );
        let block = self.resource.core_config_schema();
        let mut attributes = match diff.apply(&prior.attributes, &block) {
            Ok(attributes) => attributes,
            Err(e) => return ApplyOutcome::failed(None, e.into()),
        };
        // Computed values stay unknown in a fixture; give them a placeholder.
        for v in attributes.values_mut() {
            if v == UNKNOWN_VARIABLE_VALUE {
                *v = String::new();
            }
        }
        let id = if prior.id.is_empty() {
            format!("{}-fixture", info.type_name)
        } else {
            prior.id
        };
        attributes.insert("id".to_string(), id.clone());
        ApplyOutcome::ok(Some(InstanceState {
            id,
            attributes,
            meta: diff.meta.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tfshim_core::{Schema, ValueType};

    #[test]
    fn test_load_schema_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"schema": {{"name": {{"type": "string", "required": true}}}}, "schema_version": 2}}"#
        )
        .unwrap();
        let provider = FixtureProvider::load("thing", file.path()).unwrap();
        assert_eq!(provider.type_name(), "thing");
        let resource = provider.resource("thing").unwrap();
        assert_eq!(resource.schema_version, 2);
        assert!(resource.schema["name"].required);
        assert!(provider.resource("other").is_none());
    }

    #[tokio::test]
    async fn test_apply_assigns_id() {
        let provider = FixtureProvider::new(
            "thing",
            Resource::new([
                ("name", Schema::new(ValueType::String).required()),
                ("arn", Schema::new(ValueType::String).computed()),
            ]),
        );
        let mut diff = InstanceDiff::new();
        diff.attributes.insert(
            "name".to_string(),
            tfshim_core::ResourceAttrDiff {
                new: "web".to_string(),
                ..Default::default()
            },
        );
        diff.attributes.insert(
            "arn".to_string(),
            tfshim_core::ResourceAttrDiff {
                new_computed: true,
                ..Default::default()
            },
        );
        let info = InstanceInfo {
            type_name: "thing".to_string(),
        };
        let outcome = provider.apply(&info, InstanceState::default(), &diff).await;
        assert!(outcome.error.is_none());
        let state = outcome.state.unwrap();
        assert_eq!(state.id, "thing-fixture");
        assert_eq!(state.attributes["name"], "web");
        assert_eq!(state.attributes["arn"], "");
    }
}
