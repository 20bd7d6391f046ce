//! Self-describing message envelope.
//!
//! An [`Envelope`] carries a payload's stable type tag alongside its
//! serialized bytes, so heterogeneous payload types can travel over one
//! channel. Decoding requires compiled-in knowledge of the tagged type:
//! either statically via [`Envelope::decode`], or through a
//! [`PayloadRegistry`] that maps tags to decode functions.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A plain-data type that can travel inside an [`Envelope`].
///
/// `TYPE_TAG` must be stable across releases; it is the only thing a
/// receiver uses to pick a schema.
pub trait Payload: Serialize + DeserializeOwned + Send + 'static {
    const TYPE_TAG: &'static str;
}

/// Errors raised while decoding an envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown payload type tag '{0}'")]
    UnknownTag(String),

    #[error("payload type tag mismatch: expected '{expected}', found '{found}'")]
    TagMismatch { expected: String, found: String },

    #[error("corrupt payload for tag '{tag}': {message}")]
    Corrupt { tag: String, message: String },

    #[error("malformed envelope: {0}")]
    Malformed(String),
}

/// Errors raised while encoding a payload.
#[derive(Debug, thiserror::Error)]
#[error("failed to encode payload '{tag}': {source}")]
pub struct EncodeError {
    pub tag: String,
    #[source]
    pub source: serde_json::Error,
}

/// Transport-opaque wrapper around one serialized payload.
///
/// Wire shape: `{ "payload_type_tag": string, "data": base64 }`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    payload_type_tag: String,
    #[serde(with = "base64_bytes")]
    data: Vec<u8>,
}

impl Envelope {
    /// Encode a payload, recording its type tag.
    pub fn encode<P: Payload>(payload: &P) -> Result<Self, EncodeError> {
        let data = serde_json::to_vec(payload).map_err(|source| EncodeError {
            tag: P::TYPE_TAG.to_string(),
            source,
        })?;
        Ok(Self {
            payload_type_tag: P::TYPE_TAG.to_string(),
            data,
        })
    }

    /// Build an envelope from already-serialized parts.
    pub fn from_parts(payload_type_tag: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            payload_type_tag: payload_type_tag.into(),
            data,
        }
    }

    pub fn payload_type_tag(&self) -> &str {
        &self.payload_type_tag
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Decode as `P`. Fails unless the envelope's tag is exactly `P::TYPE_TAG`.
    pub fn decode<P: Payload>(&self) -> Result<P, DecodeError> {
        if self.payload_type_tag != P::TYPE_TAG {
            return Err(DecodeError::TagMismatch {
                expected: P::TYPE_TAG.to_string(),
                found: self.payload_type_tag.clone(),
            });
        }
        serde_json::from_slice(&self.data).map_err(|e| DecodeError::Corrupt {
            tag: self.payload_type_tag.clone(),
            message: e.to_string(),
        })
    }

    /// Serialize the whole envelope for a byte-oriented transport.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        serde_json::to_vec(self).map_err(|source| EncodeError {
            tag: self.payload_type_tag.clone(),
            source,
        })
    }

    /// Parse an envelope previously produced by [`Envelope::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("payload_type_tag", &self.payload_type_tag)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// A decoded payload whose concrete type is known only by its tag.
pub type DecodedPayload = Box<dyn Any + Send>;

type DecodeFn = fn(&Envelope) -> Result<DecodedPayload, DecodeError>;

fn decode_erased<P: Payload>(envelope: &Envelope) -> Result<DecodedPayload, DecodeError> {
    envelope.decode::<P>().map(|p| Box::new(p) as DecodedPayload)
}

/// Explicit tag → decoder table.
///
/// Stands in for runtime type reflection: only registered types can be
/// decoded, and an unknown tag is always a [`DecodeError::UnknownTag`].
#[derive(Default, Clone)]
pub struct PayloadRegistry {
    decoders: HashMap<&'static str, DecodeFn>,
}

impl PayloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `P` under its `TYPE_TAG`. Re-registering a tag replaces it.
    pub fn register<P: Payload>(&mut self) -> &mut Self {
        self.decoders.insert(P::TYPE_TAG, decode_erased::<P>);
        self
    }

    pub fn with<P: Payload>(mut self) -> Self {
        self.register::<P>();
        self
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.decoders.contains_key(tag)
    }

    pub fn tags(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.decoders.keys().copied()
    }

    /// Decode an envelope using the decoder registered for its tag.
    pub fn decode(&self, envelope: &Envelope) -> Result<DecodedPayload, DecodeError> {
        let decode = self
            .decoders
            .get(envelope.payload_type_tag())
            .ok_or_else(|| DecodeError::UnknownTag(envelope.payload_type_tag().to_string()))?;
        decode(envelope)
    }
}

impl fmt::Debug for PayloadRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<_> = self.decoders.keys().collect();
        tags.sort();
        f.debug_struct("PayloadRegistry").field("tags", &tags).finish()
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
