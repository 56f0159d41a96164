//! Legacy attribute-bag shim for resource providers.
//!
//! Resources written against the old per-attribute schema keep their state
//! as a flat `key -> string` map and compute changes with the legacy diff
//! algorithm. This crate translates between that world and typed structural
//! values, so such resources can be planned, applied, read and upgraded
//! through a protocol that speaks structural values.

pub mod apply;
pub mod diff;
pub mod error;
pub mod flatmap;
pub mod json;
pub mod msgpack;
pub mod normalize;
pub mod paths;
pub mod plan;
pub mod resource;
pub mod schema;
pub mod server;
pub mod state;
pub mod timeouts;
pub mod types;
pub mod upgrade;
pub mod value;

pub use apply::{apply_change, AppliedChange};
pub use diff::{diff_from_values, InstanceDiff, ResourceAttrDiff};
pub use error::{Result, ShimError};
pub use flatmap::{flatmap_from_value, value_from_flatmap, Flatmap, UNKNOWN_VARIABLE_VALUE};
pub use plan::{plan_change, PlannedChange};
pub use resource::{Resource, Schema, ValueType};
pub use schema::{Attribute, Block, NestedBlock, NestingMode};
pub use server::{DynamicValue, ResourceProvider, ShimServer};
pub use state::{InstanceInfo, InstanceState, ResourceConfig};
pub use types::Type;
pub use upgrade::{upgrade_resource_state, RawState};
pub use value::Value;
