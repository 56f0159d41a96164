//! Turning the state a resource returned from apply into the new state value.

use tracing::debug;

use crate::diff::InstanceDiff;
use crate::error::Result;
use crate::flatmap::{flatmap_from_value, value_from_flatmap};
use crate::normalize::{copy_timeout_values, normalize_flatmap_containers, normalize_null_values};
use crate::schema::Block;
use crate::state::{InstanceState, Meta};
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct AppliedChange {
    pub new_state: Value,
    pub private: Meta,
}

/// Reconcile the state returned by the resource with the planned value.
///
/// A destroyed instance, a missing state and a state without id all mean the
/// instance is gone, and produce a null state. The prior state is not an
/// input: whether the instance survives is decided by `destroyed` and by
/// `new_state` alone.
pub fn apply_change(
    planned: &Value,
    diff: &InstanceDiff,
    new_state: Option<&InstanceState>,
    destroyed: bool,
    block: &Block,
) -> Result<AppliedChange> {
    let state = match new_state {
        Some(s) if !destroyed && !s.id.is_empty() => s,
        _ => {
            debug!(destroyed, "instance is gone after apply");
            return Ok(AppliedChange {
                new_state: Value::Null,
                private: Meta::new(),
            });
        }
    };
    let ty = block.implied_type();

    // The planned value knows which containers are empty rather than absent.
    let planned_attrs = flatmap_from_value(planned, &ty)?;
    let mut attrs = normalize_flatmap_containers(&planned_attrs, &state.attributes, true);
    attrs.insert("id".to_string(), state.id.clone());

    let new_state = value_from_flatmap(&attrs, &ty)?;
    let new_state = normalize_null_values(&new_state, planned, &ty, true);
    let new_state = copy_timeout_values(&new_state, planned);

    let mut private = state.meta.clone();
    if diff.attributes.values().any(|d| d.new_extra.is_some()) {
        diff.fold_new_extras(&mut private);
    }

    Ok(AppliedChange { new_state, private })
}
