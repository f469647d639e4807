use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Type id of plain string values.
pub const STRING_TYPE_ID: u8 = 0;

/// Type id of structured (JSON document) values.
pub const STRUCTURED_TYPE_ID: u8 = 1;

/// A value to be stored against a reference data key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RefDataValue {
    /// No value. Putting a null removes an existing entry (when overwriting)
    /// and is otherwise ignored.
    Null,
    String(String),
    Structured(serde_json::Value),
}

impl RefDataValue {
    pub fn string(value: impl Into<String>) -> Self {
        Self::String(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Type id of the serialized form, `None` for [`RefDataValue::Null`].
    pub fn type_id(&self) -> Option<u8> {
        match self {
            Self::Null => None,
            Self::String(_) => Some(STRING_TYPE_ID),
            Self::Structured(_) => Some(STRUCTURED_TYPE_ID),
        }
    }

    /// Serialize to the `{type_id, bytes}` form held by the value store.
    pub fn to_typed_bytes(&self) -> Result<Option<TypedBytes>, TypeError> {
        let typed = match self {
            Self::Null => return Ok(None),
            Self::String(s) => TypedBytes::new(STRING_TYPE_ID, s.as_bytes().to_vec()),
            Self::Structured(doc) => TypedBytes::new(
                STRUCTURED_TYPE_ID,
                serde_json::to_vec(doc).map_err(|e| TypeError::Serialization(e.to_string()))?,
            ),
        };
        Ok(Some(typed))
    }
}

impl From<&str> for RefDataValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for RefDataValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<serde_json::Value> for RefDataValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Structured(value)
    }
}

/// Serialized value payload tagged with its type id.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypedBytes {
    pub type_id: u8,
    pub bytes: Vec<u8>,
}

impl TypedBytes {
    pub fn new(type_id: u8, bytes: Vec<u8>) -> Self {
        Self { type_id, bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::fmt::Debug for TypedBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TypedBytes(type {}, {} bytes)", self.type_id, self.bytes.len())
    }
}
