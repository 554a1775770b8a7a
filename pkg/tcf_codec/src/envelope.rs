use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CodecError;
use crate::verifier::Verifier;
use crate::Result;

/// Wire encoding used both for the envelope's `inner` payload and for the
/// envelope itself: the whole envelope is serialized with the same codec
/// used for `inner`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Json,
    Msgpack,
    None,
}

/// Self-describing frame wrapping a user message on the pub/sub bus:
/// `{topic, sender-id, created-at, encoding, signature, inner}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub topic: String,
    pub sender_id: String,
    pub created_at: i64,
    pub encoding: Encoding,
    #[serde(with = "serde_bytes_vec")]
    pub signature: Vec<u8>,
    #[serde(with = "serde_bytes_vec")]
    pub inner: Vec<u8>,
}

/// `serde_bytes`-equivalent helpers kept local so this crate doesn't need an
/// extra dependency purely for `Vec<u8>` (de)serialization.
mod serde_bytes_vec {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> std::result::Result<S::Ok, S::Error> {
        bytes.to_vec().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<u8>, D::Error> {
        Vec::<u8>::deserialize(d)
    }
}

impl Envelope {
    /// Creates an empty envelope with a fresh UUID and no inner payload yet.
    pub fn new(
        topic: impl Into<String>,
        sender_id: impl Into<String>,
        encoding: Encoding,
        created_at: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            sender_id: sender_id.into(),
            created_at,
            encoding,
            signature: Vec::new(),
            inner: Vec::new(),
        }
    }

    /// Fixes the envelope's id, used for idempotent repeated broadcasts
    /// where the receiver should treat re-delivery of the same id as a
    /// duplicate rather than a new event.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Serializes `payload` with `self.encoding` into `inner` and signs it.
    /// `Encoding::None` is rejected here; use [`Envelope::encode_raw`] for
    /// already-opaque payloads instead.
    pub fn encode<T: Serialize>(&mut self, payload: &T, verifier: &dyn Verifier) -> Result<()> {
        let inner = match self.encoding {
            Encoding::Json => serde_json::to_vec(payload)?,
            Encoding::Msgpack => rmp_serde::to_vec(payload)?,
            Encoding::None => return Err(CodecError::UnsupportedEncoding(self.encoding)),
        };
        self.signature = verifier.sign(&inner);
        self.inner = inner;
        Ok(())
    }

    /// Sets `inner` directly from already-encoded bytes, for the `none`
    /// encoding where the caller's payload is opaque to this crate.
    pub fn encode_raw(&mut self, bytes: Vec<u8>, verifier: &dyn Verifier) {
        self.signature = verifier.sign(&bytes);
        self.inner = bytes;
    }

    /// Validates `inner` against `signature` under `verifier`.
    pub fn verify(&self, verifier: &dyn Verifier) -> Result<()> {
        if verifier.verify(&self.inner, &self.signature) {
            Ok(())
        } else {
            Err(CodecError::VerificationFailed)
        }
    }

    /// Deserializes `inner` into `T` using `self.encoding`.
    pub fn decode_message<T: DeserializeOwned>(&self) -> Result<T> {
        match self.encoding {
            Encoding::Json => Ok(serde_json::from_slice(&self.inner)?),
            Encoding::Msgpack => Ok(rmp_serde::from_slice(&self.inner)?),
            Encoding::None => Err(CodecError::MissingInner(self.encoding)),
        }
    }

    /// Serializes the whole envelope (outer frame) with `self.encoding`.
    /// `none` falls back to msgpack for the outer frame since the envelope
    /// itself is never opaque, only its `inner` payload is.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self.encoding {
            Encoding::Json => Ok(serde_json::to_vec(self)?),
            Encoding::Msgpack | Encoding::None => Ok(rmp_serde::to_vec(self)?),
        }
    }

    /// Deserializes an envelope previously written by [`Envelope::to_bytes`].
    /// The caller must know the baseline wire encoding out of band (it is
    /// fixed per bus connection), mirroring the original client's
    /// `baselineEncoding` configuration.
    pub fn from_bytes(wire_encoding: Encoding, bytes: &[u8]) -> Result<Self> {
        match wire_encoding {
            Encoding::Json => Ok(serde_json::from_slice(bytes)?),
            Encoding::Msgpack | Encoding::None => Ok(rmp_serde::from_slice(bytes)?),
        }
    }
}
