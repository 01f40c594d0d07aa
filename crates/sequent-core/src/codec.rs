//! Schema-unaware byte (de)serialization. The `Schema` layer wraps this
//! with structural assertion; the codec itself knows nothing about types.

use anyhow::{Context, Result};
use serde_json::Value;

/// Serializes/deserializes a structured value to/from bytes. Implementations
/// are free to choose any wire format; the default here is a human-readable
/// text encoding (JSON) matching §4.2's "default implementation uses a
/// human-readable structured format" note.
pub trait Codec: Send + Sync {
    fn serialize(&self, value: &Value) -> Result<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> Result<Value>;
}

/// Default [`Codec`] encoding values as UTF-8 JSON text.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn serialize(&self, value: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value).context("serializing event payload to JSON")
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value> {
        serde_json::from_slice(bytes).context("deserializing event payload from JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_codec_round_trips() {
        let codec = JsonCodec;
        let value = json!({"id": "a", "title": "A"});
        let bytes = codec.serialize(&value).unwrap();
        let back = codec.deserialize(&bytes).unwrap();
        assert_eq!(value, back);
    }
}
