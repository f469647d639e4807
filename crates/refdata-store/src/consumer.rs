use std::collections::BTreeMap;
use std::fmt;

use refdata_types::{RefDataValue, TypedBytes, STRING_TYPE_ID, STRUCTURED_TYPE_ID};

use crate::error::{StoreError, StoreResult};

/// Decoder for one stored value type.
pub trait ValueConsumer: Send + Sync {
    /// The type id this consumer decodes.
    fn type_id(&self) -> u8;

    fn name(&self) -> &str;

    /// Turn stored bytes back into a value.
    fn decode(&self, bytes: &[u8]) -> StoreResult<RefDataValue>;

    /// Append the value's text form to `out`.
    fn consume(&self, bytes: &[u8], out: &mut String) -> StoreResult<()>;
}

/// Plain UTF-8 string values.
#[derive(Clone, Copy, Debug, Default)]
pub struct StringValueConsumer;

impl ValueConsumer for StringValueConsumer {
    fn type_id(&self) -> u8 {
        STRING_TYPE_ID
    }

    fn name(&self) -> &str {
        "string"
    }

    fn decode(&self, bytes: &[u8]) -> StoreResult<RefDataValue> {
        Ok(RefDataValue::String(utf8(bytes)?.to_string()))
    }

    fn consume(&self, bytes: &[u8], out: &mut String) -> StoreResult<()> {
        out.push_str(utf8(bytes)?);
        Ok(())
    }
}

/// Structured values held as JSON documents.
#[derive(Clone, Copy, Debug, Default)]
pub struct StructuredValueConsumer;

impl ValueConsumer for StructuredValueConsumer {
    fn type_id(&self) -> u8 {
        STRUCTURED_TYPE_ID
    }

    fn name(&self) -> &str {
        "structured"
    }

    fn decode(&self, bytes: &[u8]) -> StoreResult<RefDataValue> {
        let document =
            serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(RefDataValue::Structured(document))
    }

    fn consume(&self, bytes: &[u8], out: &mut String) -> StoreResult<()> {
        // Stored documents are already compact JSON text.
        out.push_str(utf8(bytes)?);
        Ok(())
    }
}

fn utf8(bytes: &[u8]) -> StoreResult<&str> {
    std::str::from_utf8(bytes).map_err(|e| StoreError::Serialization(format!("value is not UTF-8: {e}")))
}

/// Registry of consumers keyed by type id.
///
/// Each type id has exactly one consumer. Reading a value whose type id has
/// no consumer is an error.
pub struct ValueConsumerRegistry {
    consumers: BTreeMap<u8, Box<dyn ValueConsumer>>,
}

impl ValueConsumerRegistry {
    pub fn empty() -> Self {
        Self {
            consumers: BTreeMap::new(),
        }
    }

    /// Registry with the built-in string and structured consumers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.consumers.insert(STRING_TYPE_ID, Box::new(StringValueConsumer));
        registry
            .consumers
            .insert(STRUCTURED_TYPE_ID, Box::new(StructuredValueConsumer));
        registry
    }

    pub fn register(&mut self, consumer: Box<dyn ValueConsumer>) -> StoreResult<()> {
        let type_id = consumer.type_id();
        if let Some(existing) = self.consumers.get(&type_id) {
            return Err(StoreError::InvalidArgument(format!(
                "type id {type_id} already has consumer '{}'",
                existing.name()
            )));
        }
        self.consumers.insert(type_id, consumer);
        Ok(())
    }

    pub fn get(&self, type_id: u8) -> StoreResult<&dyn ValueConsumer> {
        self.consumers
            .get(&type_id)
            .map(|consumer| consumer.as_ref())
            .ok_or(StoreError::UnknownValueType(type_id))
    }

    pub fn decode(&self, value: &TypedBytes) -> StoreResult<RefDataValue> {
        self.get(value.type_id)?.decode(&value.bytes)
    }

    pub fn consume(&self, value: &TypedBytes, out: &mut String) -> StoreResult<()> {
        self.get(value.type_id)?.consume(&value.bytes, out)
    }

    pub fn type_ids(&self) -> Vec<u8> {
        self.consumers.keys().copied().collect()
    }
}

impl Default for ValueConsumerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for ValueConsumerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.consumers.iter().map(|(id, c)| (id, c.name())))
            .finish()
    }
}
