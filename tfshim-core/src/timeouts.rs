use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;

use crate::error::{Result, ShimError};
use crate::resource::Resource;
use crate::state::Meta;
use crate::value::Value;

/// Meta key under which operation timeouts travel with diffs and states.
pub const TIMEOUT_KEY: &str = "e2bfb730-ecaa-11e6-8f88-34363bc7c4c0";
/// Name of the configuration block holding timeouts.
pub const TIMEOUTS_CONFIG_KEY: &str = "timeouts";

pub const TIMEOUT_CREATE: &str = "create";
pub const TIMEOUT_READ: &str = "read";
pub const TIMEOUT_UPDATE: &str = "update";
pub const TIMEOUT_DELETE: &str = "delete";
pub const TIMEOUT_DEFAULT: &str = "default";

/// Per-operation timeouts a resource supports. Only operations with a
/// default here may be set in configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTimeout {
    #[serde(default, with = "duration_text")]
    pub create: Option<Duration>,
    #[serde(default, with = "duration_text")]
    pub read: Option<Duration>,
    #[serde(default, with = "duration_text")]
    pub update: Option<Duration>,
    #[serde(default, with = "duration_text")]
    pub delete: Option<Duration>,
    #[serde(default, with = "duration_text")]
    pub default: Option<Duration>,
}

impl ResourceTimeout {
    pub(crate) fn entries(&self) -> [(&'static str, Option<Duration>); 5] {
        [
            (TIMEOUT_CREATE, self.create),
            (TIMEOUT_READ, self.read),
            (TIMEOUT_UPDATE, self.update),
            (TIMEOUT_DELETE, self.delete),
            (TIMEOUT_DEFAULT, self.default),
        ]
    }

    fn slot_mut(&mut self, key: &str) -> Option<&mut Option<Duration>> {
        match key {
            TIMEOUT_CREATE => Some(&mut self.create),
            TIMEOUT_READ => Some(&mut self.read),
            TIMEOUT_UPDATE => Some(&mut self.update),
            TIMEOUT_DELETE => Some(&mut self.delete),
            TIMEOUT_DEFAULT => Some(&mut self.default),
            _ => None,
        }
    }

    /// Start from the resource's defaults and apply the `timeouts` block of `config`.
    pub fn config_decode(resource: &Resource, config: &Value) -> Result<ResourceTimeout> {
        let mut timeouts = resource.timeouts.clone().unwrap_or_default();
        let Some(Value::Object(values)) = config.attr(TIMEOUTS_CONFIG_KEY) else {
            return Ok(timeouts);
        };
        for (key, value) in values {
            let raw = match value {
                Value::String(s) => s,
                // Not yet known, or not set: the default stays.
                _ => continue,
            };
            let slot = timeouts.slot_mut(key).ok_or_else(|| {
                ShimError::InvalidTimeout(format!(
                    "unsupported timeout configuration key found ({})",
                    key
                ))
            })?;
            if slot.is_none() {
                return Err(ShimError::InvalidTimeout(format!(
                    "timeout is not supported for {:?} on this resource",
                    key
                )));
            }
            let parsed = parse_duration(raw).map_err(|e| {
                ShimError::InvalidTimeout(format!("error parsing {:?} timeout: {}", key, e))
            })?;
            *slot = Some(parsed);
        }
        Ok(timeouts)
    }

    /// Record the timeouts as nanoseconds in `meta`. Nothing is written when no timeout is set.
    pub fn meta_encode(&self, meta: &mut Meta) {
        let mut m = serde_json::Map::new();
        for (key, d) in self.entries() {
            if let Some(d) = d {
                m.insert(key.to_string(), JsonValue::from(d.as_nanos() as u64));
            }
        }
        if !m.is_empty() {
            meta.insert(TIMEOUT_KEY.to_string(), JsonValue::Object(m));
        }
    }

    pub fn meta_decode(meta: &Meta) -> Option<ResourceTimeout> {
        let m = meta.get(TIMEOUT_KEY)?.as_object()?;
        let mut timeouts = ResourceTimeout::default();
        for (key, nanos) in m {
            let nanos = nanos
                .as_u64()
                .or_else(|| nanos.as_f64().map(|f| f as u64))
                .or_else(|| nanos.as_str().and_then(|s| s.parse().ok()));
            if let (Some(slot), Some(nanos)) = (timeouts.slot_mut(key), nanos) {
                *slot = Some(Duration::from_nanos(nanos));
            }
        }
        Some(timeouts)
    }
}

/// Parse a duration such as `"20m"`, `"1h30m"` or `"1.5s"`.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    let mut rest = s;
    let mut total = 0f64;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration {:?}", s))?;
        if num_len == 0 {
            return Err(format!("invalid duration {:?}", s));
        }
        let number: f64 = rest[..num_len]
            .parse()
            .map_err(|_| format!("invalid duration {:?}", s))?;
        rest = &rest[num_len..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            unit => return Err(format!("unknown unit {:?} in duration {:?}", unit, s)),
        };
        rest = &rest[unit_len..];
        total += number * scale;
    }
    Duration::try_from_secs_f64(total).map_err(|e| format!("duration {:?} out of range: {}", s, e))
}

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let nanos = d.subsec_nanos();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let mut out = String::new();
    if h > 0 {
        out.push_str(&format!("{}h", h));
    }
    if h > 0 || m > 0 {
        out.push_str(&format!("{}m", m));
    }
    if nanos == 0 {
        out.push_str(&format!("{}s", s));
    } else {
        let frac = format!("{:09}", nanos);
        out.push_str(&format!("{}.{}s", s, frac.trim_end_matches('0')));
    }
    out
}

mod duration_text {
    use super::{format_duration, parse_duration};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => serializer.serialize_str(&format_duration(*d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| parse_duration(&s).map_err(D::Error::custom))
            .transpose()
    }
}
