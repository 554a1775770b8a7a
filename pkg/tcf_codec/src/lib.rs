//! Self-describing payload envelope and pluggable codec used by the pub/sub
//! bus: every message on the wire is an [`Envelope`] wrapping an
//! application payload, tagged with the [`Encoding`] it was serialized
//! with and signed by a [`Verifier`].

mod envelope;
mod error;
mod verifier;

pub use envelope::{Encoding, Envelope};
pub use error::CodecError;
pub use verifier::{HmacVerifier, NoopVerifier, Verifier};

pub type Result<T> = std::result::Result<T, CodecError>;
