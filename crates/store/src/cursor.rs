//! Opaque keyset cursor for thread listing.
//!
//! The cursor encodes `(updated_at_ms, thread_id)` as hex-encoded JSON so
//! callers cannot depend on its shape.

use serde::{Deserialize, Serialize};

use strand_domain::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadCursor {
    pub updated_at_ms: i64,
    pub thread_id: String,
}

impl ThreadCursor {
    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).expect("cursor serializes");
        hex::encode(json)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        let bytes = hex::decode(raw)
            .map_err(|e| Error::InvalidArgument(format!("malformed cursor: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::InvalidArgument(format!("malformed cursor: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let cursor = ThreadCursor {
            updated_at_ms: 1_700_000_000_123,
            thread_id: "th-42".into(),
        };
        let decoded = ThreadCursor::decode(&cursor.encode()).unwrap();
        assert_eq!(decoded, cursor);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(ThreadCursor::decode("not-hex!").is_err());
        assert!(ThreadCursor::decode("deadbeef").is_err());
    }
}
