//! Turning a legacy diff into a planned state.

use tracing::debug;

use crate::diff::InstanceDiff;
use crate::error::Result;
use crate::flatmap::{value_from_flatmap, Flatmap};
use crate::normalize::{
    copy_timeout_values, normalize_flatmap_containers, normalize_null_values, set_unknowns,
    values_sdk_equivalent,
};
use crate::paths::{requires_replace, AttributePath};
use crate::schema::Block;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedChange {
    pub planned_state: Value,
    pub requires_replace: Vec<AttributePath>,
    /// The plan is the prior state, either because the diff was empty or
    /// because the planned state only differed in ways the legacy layer
    /// ignores.
    pub no_changes: bool,
}

/// Compute the planned state from the prior state, the proposed state and
/// the legacy diff between them. `prior_attrs` is the flatmap form of
/// `prior` that the diff was computed against.
pub fn plan_change(
    prior: &Value,
    proposed: &Value,
    prior_attrs: &Flatmap,
    diff: Option<&InstanceDiff>,
    block: &Block,
) -> Result<PlannedChange> {
    let Some(diff) = diff.filter(|d| !d.is_empty()) else {
        debug!("no changes planned");
        return Ok(PlannedChange {
            planned_state: prior.clone(),
            requires_replace: Vec::new(),
            no_changes: true,
        });
    };
    let ty = block.implied_type();

    let planned_attrs = diff.apply(prior_attrs, block)?;
    let planned_attrs = normalize_flatmap_containers(prior_attrs, &planned_attrs, false);
    let planned = value_from_flatmap(&planned_attrs, &ty)?;
    let planned = block.coerce_value(&planned)?;
    let planned = normalize_null_values(&planned, proposed, &ty, false);
    let mut planned = copy_timeout_values(&planned, proposed);

    let mut no_changes = false;
    if planned != *prior && values_sdk_equivalent(prior, &planned) {
        debug!("planned state is equivalent to the prior state, keeping the prior state");
        planned = prior.clone();
        no_changes = true;
    }

    if prior.is_null() {
        planned = set_unknowns(&planned, block);
    }

    let mut keys: Vec<&str> = if no_changes {
        Vec::new()
    } else {
        diff.requires_new_keys().collect()
    };
    // A new id means a new instance, even if all other changes are ignored.
    let id_unknown = match planned.attr("id") {
        None | Some(Value::Null) | Some(Value::Unknown) => true,
        Some(_) => false,
    };
    if !keys.is_empty() || id_unknown {
        keys.push("id");
    }
    let requires_replace = requires_replace(keys, &ty)?;

    Ok(PlannedChange {
        planned_state: planned,
        requires_replace,
        no_changes,
    })
}
