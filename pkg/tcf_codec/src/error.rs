use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encoding is not supported for this operation: {0:?}")]
    UnsupportedEncoding(crate::Encoding),

    #[error("json encode/decode failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("msgpack encode failed: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),

    #[error("msgpack decode failed: {0}")]
    MsgpackDecode(#[from] rmp_serde::decode::Error),

    #[error("envelope signature verification failed")]
    VerificationFailed,

    #[error("inner payload was never set for encoding {0:?}")]
    MissingInner(crate::Encoding),
}
