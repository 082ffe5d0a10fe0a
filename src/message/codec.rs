//! Payload codecs.
//!
//! Bodies are encoded by a codec chosen per message type
//! ([`Message::CODEC`](super::Message::CODEC)). Bincode is the default; JSON
//! is handy for messages that tooling or humans need to read.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Bincode failure.
    #[error("bincode: {0}")]
    Bincode(#[from] bincode::Error),
    /// JSON failure.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a value to bytes and back.
pub trait Codec {
    /// Serialize `value`.
    fn encode<T: Serialize>(value: &T) -> Result<Bytes, CodecError>;
    /// Deserialize a `T` from `data`.
    fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, CodecError>;
}

/// Compact binary codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    fn encode<T: Serialize>(value: &T) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(bincode::serialize(value)?))
    }

    fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, CodecError> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Text codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(value: &T) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, CodecError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Codec selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecKind {
    /// [`BincodeCodec`].
    #[default]
    Bincode,
    /// [`JsonCodec`].
    Json,
}

impl CodecKind {
    /// Encode with the selected codec.
    pub fn encode<T: Serialize>(self, value: &T) -> Result<Bytes, CodecError> {
        match self {
            CodecKind::Bincode => BincodeCodec::encode(value),
            CodecKind::Json => JsonCodec::encode(value),
        }
    }

    /// Decode with the selected codec.
    pub fn decode<T: DeserializeOwned>(self, data: &[u8]) -> Result<T, CodecError> {
        match self {
            CodecKind::Bincode => BincodeCodec::decode(data),
            CodecKind::Json => JsonCodec::decode(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Login {
        user_name: String,
        password: String,
    }

    #[test]
    fn test_json_is_readable() {
        let login = Login {
            user_name: "a".into(),
            password: "b".into(),
        };
        let bytes = CodecKind::Json.encode(&login).unwrap();
        assert_eq!(&bytes[..], br#"{"user_name":"a","password":"b"}"#);
        assert_eq!(CodecKind::Json.decode::<Login>(&bytes).unwrap(), login);
    }

    #[test]
    fn test_bincode_rejects_garbage() {
        assert!(CodecKind::Bincode.decode::<Login>(&[0xff; 3]).is_err());
    }
}
