//! Encodings for typed job bodies.
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{QueueError, Result};

/// How typed values are written into job bodies and read back out. Byte
/// bodies passed to `write` are never re-encoded.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// Bodies are plain text. Only string values can be encoded.
    #[default]
    Raw,
    /// Bodies are JSON documents.
    Json,
}

impl Format {
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Bytes> {
        match self {
            Self::Json => Ok(serde_json::to_vec(value)?.into()),
            Self::Raw => match serde_json::to_value(value)? {
                Value::String(text) => Ok(text.into()),
                other => Err(QueueError::Encoding(format!(
                    "raw bodies hold strings, not {other}"
                ))),
            },
        }
    }

    pub fn decode<T: DeserializeOwned>(self, data: &[u8]) -> Result<T> {
        match self {
            Self::Json => Ok(serde_json::from_slice(data)?),
            Self::Raw => {
                let text = std::str::from_utf8(data)
                    .map_err(|e| QueueError::Encoding(e.to_string()))?;
                Ok(serde_json::from_value(Value::String(text.to_owned()))?)
            },
        }
    }
}
