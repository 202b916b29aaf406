//! Filter normalisation and fingerprinting.
//!
//! Two filter objects that are equal after normalisation always share a
//! fingerprint, whatever order their keys were written in. Normalisation:
//!
//! - object keys are sorted (recursively)
//! - integral floats are written as integers (`1.0` and `1` are the same)
//! - array order is significant
//! - an explicit `null` is kept and differs from an absent key

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

const FINGERPRINT_VERSION: &str = "v1";
const FINGERPRINT_HEX_LEN: usize = 32;
const MAX_DEPTH: usize = 8;
const MAX_KEY_LEN: usize = 128;

/// Stable hash of normalised filter parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validated, normalised filters handed to the data source.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterSet {
    values: Map<String, Value>,
    canonical: String,
}

impl FilterSet {
    /// Validate and normalise raw filters. Returns the rejection reason for
    /// malformed input.
    pub fn normalize(raw: &Value) -> Result<Self, String> {
        let object = match raw {
            Value::Object(object) => object,
            Value::Null => return Ok(Self::empty()),
            other => {
                return Err(format!(
                    "filters must be an object, got {}",
                    json_kind(other)
                ));
            }
        };

        let values = normalize_object(object, 1)?;
        let mut canonical = String::new();
        write_canonical(&Value::Object(values.clone()), &mut canonical);
        Ok(Self { values, canonical })
    }

    pub fn empty() -> Self {
        Self {
            values: Map::new(),
            canonical: "{}".to_string(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Canonical text form the fingerprint is computed over.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_VERSION.as_bytes());
        hasher.update(b"|");
        hasher.update(self.canonical.as_bytes());
        let digest = hex::encode(hasher.finalize().to_vec());
        Fingerprint(digest[..FINGERPRINT_HEX_LEN].to_string())
    }
}

/// Fingerprint raw filters in one step.
pub fn fingerprint(raw: &Value) -> Result<Fingerprint, String> {
    FilterSet::normalize(raw).map(|filters| filters.fingerprint())
}

fn normalize_object(object: &Map<String, Value>, depth: usize) -> Result<Map<String, Value>, String> {
    if depth > MAX_DEPTH {
        return Err(format!("filters nest deeper than {MAX_DEPTH} levels"));
    }

    let mut entries: Vec<(&String, &Value)> = object.iter().collect();
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));

    let mut normalized = Map::new();
    for (key, value) in entries {
        if key.trim().is_empty() {
            return Err("filter keys must not be blank".to_string());
        }
        if key.len() > MAX_KEY_LEN {
            return Err(format!("filter key longer than {MAX_KEY_LEN} bytes"));
        }
        normalized.insert(key.clone(), normalize_value(value, depth)?);
    }
    Ok(normalized)
}

fn normalize_value(value: &Value, depth: usize) -> Result<Value, String> {
    Ok(match value {
        Value::Object(object) => Value::Object(normalize_object(object, depth + 1)?),
        Value::Array(items) => {
            if depth + 1 > MAX_DEPTH {
                return Err(format!("filters nest deeper than {MAX_DEPTH} levels"));
            }
            Value::Array(
                items
                    .iter()
                    .map(|item| normalize_value(item, depth + 1))
                    .collect::<Result<_, _>>()?,
            )
        }
        Value::Number(number) => Value::Number(normalize_number(number)),
        other => other.clone(),
    })
}

fn normalize_number(number: &Number) -> Number {
    if number.is_i64() || number.is_u64() {
        return number.clone();
    }
    match number.as_f64() {
        Some(float) if float.fract() == 0.0 && float.abs() < i64::MAX as f64 => {
            Number::from(float as i64)
        }
        _ => number.clone(),
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(object) => {
            let mut keys: Vec<&String> = object.keys().collect();
            keys.sort();
            out.push('{');
            for (position, key) in keys.into_iter().enumerate() {
                if position > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(inner) = object.get(key) {
                    write_canonical(inner, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (position, item) in items.iter().enumerate() {
                if position > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
