//! Binary-safe text codec for protocol structures.
//!
//! Credentials and key material are trees that mix ordinary JSON data with raw
//! byte buffers. The store only holds text, so buffers are written as a tagged
//! object `{"$bytes": "<base64>"}`. Object keys that already start with `$`
//! get one extra `$` on the way out and lose it on the way back, so a user
//! object can never be mistaken for a buffer tag.

use std::collections::BTreeMap;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde_json::{Map, Number};
use thiserror::Error;

const BYTES_TAG: &str = "$bytes";

/// Structured value that may carry raw byte buffers.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

/// Codec error.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Malformed encoded text: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid buffer payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Malformed buffer tag: {0}")]
    Tag(String),
}

impl Value {
    /// An empty object.
    #[must_use]
    pub fn object() -> Self {
        Self::Object(BTreeMap::new())
    }

    /// Look up a field when this is an object.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Self> {
        match self {
            Self::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Insert a field, turning `Null` into an object first. Other variants are
    /// left untouched and the value is returned to the caller.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Self>) -> Option<Self> {
        if matches!(self, Self::Null) {
            *self = Self::object();
        }
        match self {
            Self::Object(map) => {
                map.insert(key.into(), value.into());
                None
            }
            _ => Some(value.into()),
        }
    }

    /// Borrow the buffer when this is `Bytes`.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Borrow the text when this is `String`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Convert into the tagged JSON representation.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Number(n) => serde_json::Value::Number(n.clone()),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Bytes(b) => {
                let mut tag = Map::with_capacity(1);
                tag.insert(BYTES_TAG.to_string(), serde_json::Value::String(BASE64.encode(b)));
                serde_json::Value::Object(tag)
            }
            Self::Array(items) => serde_json::Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (escape_key(k), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Rebuild a value from its tagged JSON representation.
    ///
    /// # Errors
    /// Returns error if a buffer tag is malformed or an unescaped `$` key appears.
    pub fn from_json(json: serde_json::Value) -> Result<Self, CodecError> {
        Ok(match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => Self::Array(
                items
                    .into_iter()
                    .map(Self::from_json)
                    .collect::<Result<_, _>>()?,
            ),
            serde_json::Value::Object(map) => {
                if let Some(tagged) = map.get(BYTES_TAG) {
                    if map.len() != 1 {
                        return Err(CodecError::Tag("buffer tag with sibling fields".into()));
                    }
                    let data = tagged
                        .as_str()
                        .ok_or_else(|| CodecError::Tag("buffer payload is not a string".into()))?;
                    return Ok(Self::Bytes(BASE64.decode(data)?));
                }
                let mut out = BTreeMap::new();
                for (k, v) in map {
                    out.insert(unescape_key(k)?, Self::from_json(v)?);
                }
                Self::Object(out)
            }
        })
    }
}

fn escape_key(key: &str) -> String {
    if key.starts_with('$') { format!("${key}") } else { key.to_string() }
}

fn unescape_key(key: String) -> Result<String, CodecError> {
    if let Some(rest) = key.strip_prefix("$$") {
        Ok(format!("${rest}"))
    } else if key.starts_with('$') {
        Err(CodecError::Tag(format!("unknown tag {key:?}")))
    } else {
        Ok(key)
    }
}

/// Encode a value as text.
#[must_use]
pub fn encode(value: &Value) -> String {
    value.to_json().to_string()
}

/// Decode text produced by [`encode`].
///
/// # Errors
/// Returns error if the text is not valid tagged JSON.
pub fn decode(text: &str) -> Result<Value, CodecError> {
    Value::from_json(serde_json::from_str(text)?)
}

impl From<serde_json::Value> for Value {
    /// Plain JSON never carries buffers; `$` keys are taken literally.
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            serde_json::Value::Object(map) => {
                Self::Object(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Self {
        Self::Bytes(bytes.to_vec())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Self::Number(n.into())
    }
}

impl<V: Into<Value>> FromIterator<(String, V)> for Value {
    fn from_iter<I: IntoIterator<Item = (String, V)>>(iter: I) -> Self {
        Self::Object(iter.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}
