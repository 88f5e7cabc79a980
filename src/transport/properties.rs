//! Message property values and header-map conversions.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{Headers, Message};

/// Scalar message property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    String(String),
}

impl HeaderValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HeaderValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(i) => Some(i64::from(*i)),
            HeaderValue::Long(l) => Some(*l),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HeaderValue::Double(d) => Some(*d),
            _ => None,
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Bool(b) => write!(f, "{b}"),
            HeaderValue::Int(i) => write!(f, "{i}"),
            HeaderValue::Long(l) => write!(f, "{l}"),
            HeaderValue::Double(d) => write!(f, "{d}"),
            HeaderValue::String(s) => f.write_str(s),
        }
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<i32> for HeaderValue {
    fn from(value: i32) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Long(value)
    }
}

impl From<f64> for HeaderValue {
    fn from(value: f64) -> Self {
        HeaderValue::Double(value)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl Message {
    /// Copy every header onto this message's properties, overwriting keys
    /// that are already set.
    pub fn set_properties(&mut self, headers: &Headers) {
        for (key, value) in headers {
            self.properties.insert(key.clone(), value.clone());
        }
    }

    /// Enumerate all properties into a fresh header map.
    pub fn properties_map(&self) -> Headers {
        self.properties
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Property as a string, or `None` when absent or not a string.
    pub fn string_property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(HeaderValue::as_str)
    }
}
