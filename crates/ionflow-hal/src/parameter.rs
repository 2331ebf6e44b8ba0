//! Parameter identifiers and scalar values.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{HalError, HalResult};

/// Separator between device name and access path in a parameter key.
pub const DEVICE_KEY_SEPARATOR: char = ':';

/// Relative tolerance used when comparing floating point read-backs.
const FLOAT_TOLERANCE: f64 = 1e-9;

/// A scalar parameter value.
///
/// Scan values, snapshot entries and device read-backs all use this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    /// Boolean flag.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Floating point value.
    Float(f64),
    /// Free text.
    Text(String),
}

impl ParameterValue {
    /// Name of the scalar kind, used in validation messages.
    pub fn kind(&self) -> &'static str {
        match self {
            ParameterValue::Bool(_) => "bool",
            ParameterValue::Int(_) | ParameterValue::Float(_) => "number",
            ParameterValue::Text(_) => "string",
        }
    }

    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Int(v) => Some(*v as f64),
            ParameterValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Compare a written value against a device read-back.
    ///
    /// Numbers compare across integer/float representations with a small
    /// relative tolerance; other kinds compare exactly.
    pub fn matches(&self, readback: &ParameterValue) -> bool {
        match (self.as_f64(), readback.as_f64()) {
            (Some(a), Some(b)) => {
                let scale = a.abs().max(b.abs()).max(1.0);
                (a - b).abs() <= FLOAT_TOLERANCE * scale
            }
            _ => self == readback,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Bool(v) => write!(f, "{v}"),
            ParameterValue::Int(v) => write!(f, "{v}"),
            ParameterValue::Float(v) => write!(f, "{v}"),
            ParameterValue::Text(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for ParameterValue {
    fn from(v: bool) -> Self {
        ParameterValue::Bool(v)
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        ParameterValue::Int(v)
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        ParameterValue::Float(v)
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        ParameterValue::Text(v.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(v: String) -> Self {
        ParameterValue::Text(v)
    }
}

/// Mapping of parameter key to value.
///
/// Ordered so that generated programs and archived payloads are stable.
pub type ParameterMap = BTreeMap<String, ParameterValue>;

/// Identifier of a scannable parameter.
///
/// Resolved once when a job is submitted; stages never re-parse keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum ParameterId {
    /// A value living on an external device, reached through `path`.
    DeviceScoped { device: String, path: String },
    /// A value in the shared parameter store.
    Shared { id: String },
}

impl ParameterId {
    /// Create a shared parameter identifier.
    pub fn shared(id: impl Into<String>) -> Self {
        ParameterId::Shared { id: id.into() }
    }

    /// Create a device-scoped parameter identifier.
    pub fn device_scoped(device: impl Into<String>, path: impl Into<String>) -> Self {
        ParameterId::DeviceScoped {
            device: device.into(),
            path: path.into(),
        }
    }

    /// Build an identifier from a submitted variable id and optional device.
    pub fn from_parts(variable_id: &str, device: Option<&str>) -> HalResult<Self> {
        let variable_id = variable_id.trim();
        if variable_id.is_empty() {
            return Err(HalError::InvalidParameter(
                "variable identifier must not be empty".to_string(),
            ));
        }
        match device.map(str::trim) {
            Some("") => Err(HalError::InvalidParameter(format!(
                "device name for '{variable_id}' must not be empty"
            ))),
            Some(device) => Ok(Self::device_scoped(device, variable_id)),
            None => Ok(Self::shared(variable_id)),
        }
    }

    /// Parse a snapshot key back into an identifier.
    ///
    /// Keys of the form `device:path` are device scoped, anything else is
    /// shared.
    pub fn parse_key(key: &str) -> HalResult<Self> {
        match key.split_once(DEVICE_KEY_SEPARATOR) {
            Some((device, path)) => Self::from_parts(path, Some(device)),
            None => Self::from_parts(key, None),
        }
    }

    /// Owning device, if any.
    pub fn device(&self) -> Option<&str> {
        match self {
            ParameterId::DeviceScoped { device, .. } => Some(device),
            ParameterId::Shared { .. } => None,
        }
    }

    /// Key under which this parameter appears in a snapshot.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ParameterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterId::DeviceScoped { device, path } => {
                write!(f, "{device}{DEVICE_KEY_SEPARATOR}{path}")
            }
            ParameterId::Shared { id } => write!(f, "{id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_untagged_serde() {
        let values: Vec<ParameterValue> = serde_json::from_str(r#"[true, 3, 2.5, "x"]"#).unwrap();
        assert_eq!(
            values,
            vec![
                ParameterValue::Bool(true),
                ParameterValue::Int(3),
                ParameterValue::Float(2.5),
                ParameterValue::Text("x".to_string()),
            ]
        );
    }

    #[test]
    fn test_value_matches() {
        assert!(ParameterValue::Int(3).matches(&ParameterValue::Float(3.0)));
        assert!(ParameterValue::Float(1e6).matches(&ParameterValue::Float(1e6 + 1e-5)));
        assert!(!ParameterValue::Float(1.0).matches(&ParameterValue::Float(1.1)));
        assert!(!ParameterValue::Bool(true).matches(&ParameterValue::Int(1)));
        assert!(ParameterValue::from("on").matches(&ParameterValue::from("on")));
    }

    #[test]
    fn test_parameter_id_parts() {
        let id = ParameterId::from_parts("channel_1.frequency", Some("rf_source")).unwrap();
        assert_eq!(id.device(), Some("rf_source"));
        assert_eq!(id.key(), "rf_source:channel_1.frequency");
        assert_eq!(ParameterId::parse_key(&id.key()).unwrap(), id);

        let shared = ParameterId::from_parts("detection_time", None).unwrap();
        assert_eq!(shared.device(), None);
        assert_eq!(shared.key(), "detection_time");

        assert!(ParameterId::from_parts("  ", None).is_err());
        assert!(ParameterId::from_parts("x", Some("")).is_err());
    }
}
