//! Text ⇄ object codec.
//!
//! The codec is a collaborator: it only maps between wire text and a
//! `serde_json::Value` tree. Typed conversion on either side of it goes
//! through serde, so any `Serialize`/`DeserializeOwned` type can travel.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

use crate::types::Result;

/// Wire text codec.
pub trait Codec: Send + Sync + fmt::Debug {
    fn to_text(&self, value: &Value) -> Result<String>;

    fn from_text(&self, text: &str) -> Result<Value>;
}

/// JSON codec (the default).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn to_text(&self, value: &Value) -> Result<String> {
        Ok(serde_json::to_string(value)?)
    }

    fn from_text(&self, text: &str) -> Result<Value> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Serialize a typed value to wire text.
pub fn serialize<T: Serialize + ?Sized>(codec: &dyn Codec, value: &T) -> Result<String> {
    codec.to_text(&serde_json::to_value(value)?)
}

/// Deserialize wire text into `T`. Absent or empty text reads as `null`,
/// which is valid for `()` and `Option<_>` targets only.
pub fn deserialize<T: DeserializeOwned>(codec: &dyn Codec, text: Option<&str>) -> Result<T> {
    let value = match text {
        Some(text) if !text.is_empty() => codec.from_text(text)?,
        _ => Value::Null,
    };
    Ok(serde_json::from_value(value)?)
}
