use serde::{Deserialize, Serialize};

/// Scalar values that flow between block ports.
///
/// Block outputs are loosely typed maps of `output_key -> ScalarValue`;
/// serialization is untagged so the wire shape is the plain JSON scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Str(String),
    Number(f64),
    Bool(bool),
}

impl ScalarValue {
    /// Ingest a JSON value produced by a block runner. Non-scalar shapes
    /// (arrays, objects, null) are dropped rather than coerced.
    pub fn from_json(value: &serde_json::Value) -> Option<ScalarValue> {
        match value {
            serde_json::Value::String(s) => Some(ScalarValue::Str(s.clone())),
            serde_json::Value::Number(n) => n.as_f64().map(ScalarValue::Number),
            serde_json::Value::Bool(b) => Some(ScalarValue::Bool(*b)),
            _ => None,
        }
    }

    /// Text coercion used when a cached output feeds a downstream block
    /// input (block inputs are string maps).
    pub fn to_text(&self) -> String {
        match self {
            ScalarValue::Str(s) => s.clone(),
            ScalarValue::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() && n.abs() < i64::MAX as f64 {
                    format!("{}", *n as i64)
                } else {
                    format!("{n}")
                }
            }
            ScalarValue::Bool(b) => b.to_string(),
        }
    }
}

impl From<String> for ScalarValue {
    fn from(value: String) -> Self {
        ScalarValue::Str(value)
    }
}

impl From<&str> for ScalarValue {
    fn from(value: &str) -> Self {
        ScalarValue::Str(value.to_string())
    }
}

impl From<f64> for ScalarValue {
    fn from(value: f64) -> Self {
        ScalarValue::Number(value)
    }
}

impl From<bool> for ScalarValue {
    fn from(value: bool) -> Self {
        ScalarValue::Bool(value)
    }
}
