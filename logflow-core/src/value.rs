use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Heterogeneous map used for results and status payloads.
pub type ValueMap = BTreeMap<String, Value>;

/// A dynamically typed value. Numeric variants keep their width so the serialized form stays
/// self-describing, `{"int": 3}` and `{"long": 3}` do not decode to the same value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    BigInt(i128),
    #[serde(with = "float")]
    Float(f32),
    #[serde(with = "double")]
    Double(f64),
    String(String),
    List(Vec<Value>),
    Map(ValueMap),
}

/// Non-finite floats are written as `"NaN"`, `"Infinity"` and `"-Infinity"`, JSON numbers
/// cannot hold them.
#[derive(Deserialize)]
#[serde(untagged)]
enum FloatRepr {
    Number(f64),
    Text(String),
}

impl FloatRepr {
    fn from_f64(value: f64) -> Self {
        if value.is_nan() {
            FloatRepr::Text("NaN".to_string())
        } else if value == f64::INFINITY {
            FloatRepr::Text("Infinity".to_string())
        } else if value == f64::NEG_INFINITY {
            FloatRepr::Text("-Infinity".to_string())
        } else {
            FloatRepr::Number(value)
        }
    }

    fn into_f64<E: serde::de::Error>(self) -> Result<f64, E> {
        match self {
            FloatRepr::Number(value) => Ok(value),
            FloatRepr::Text(text) => match text.as_str() {
                "NaN" => Ok(f64::NAN),
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                other => Err(E::custom(format!("{other:?} is not a number"))),
            },
        }
    }
}

mod double {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::FloatRepr;

    pub(super) fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        match FloatRepr::from_f64(*value) {
            FloatRepr::Number(value) => serializer.serialize_f64(value),
            FloatRepr::Text(text) => serializer.serialize_str(&text),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        FloatRepr::deserialize(deserializer)?.into_f64()
    }
}

mod float {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::FloatRepr;

    pub(super) fn serialize<S: Serializer>(value: &f32, serializer: S) -> Result<S::Ok, S::Error> {
        match FloatRepr::from_f64(f64::from(*value)) {
            FloatRepr::Number(_) => serializer.serialize_f32(*value),
            FloatRepr::Text(text) => serializer.serialize_str(&text),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f32, D::Error> {
        FloatRepr::deserialize(deserializer)?
            .into_f64()
            .map(|value| value as f32)
    }
}

impl Value {
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Value::Int(_) | Value::Long(_) | Value::BigInt(_) | Value::Float(_) | Value::Double(_)
        )
    }

    /// Narrowest integer variant holding `value`.
    pub fn integer(value: i128) -> Self {
        if let Ok(int) = i32::try_from(value) {
            Value::Int(int)
        } else if let Ok(long) = i64::try_from(value) {
            Value::Long(long)
        } else {
            Value::BigInt(value)
        }
    }

    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Value::Int(v) => Some(i128::from(*v)),
            Value::Long(v) => Some(i128::from(*v)),
            Value::BigInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(f64::from(*v)),
            Value::Double(v) => Some(*v),
            other => other.as_i128().map(|v| v as f64),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<ValueMap> for Value {
    fn from(v: ValueMap) -> Self {
        Value::Map(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}
