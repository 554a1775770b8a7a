use thiserror::Error;

use crate::cluster::NodeAddr;

/// Taxonomy from `spec.md` §7. Variants map onto the node binary's HTTP
/// status codes at the `axum` boundary, never before.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("key not found")]
    NotFound,

    #[error("key exists")]
    KeyExists,

    #[error("not leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeAddr> },

    #[error("forwarding to leader failed: {0}")]
    ForwardFailed(String),

    #[error("could not decode stored value: {0}")]
    DecodeError(String),

    #[error("could not encode value for storage: {0}")]
    EncodeError(String),

    #[error("consensus did not commit within the allotted window")]
    ConsensusTimeout,

    #[error("start index is after end")]
    RangeStartAfterEnd,

    #[error("start index larger than length of list")]
    RangeStartBeyondLength,

    #[error("key cannot be empty")]
    EmptyKey,

    #[error(transparent)]
    Consensus(#[from] tcf_consensus::ConsensusError),
}

impl KvError {
    /// HTTP status code for this error per `spec.md` §6/§7.
    pub fn status_code(&self) -> u16 {
        match self {
            KvError::NotFound => 404,
            KvError::KeyExists => 400,
            KvError::NotLeader { .. } => 400,
            KvError::ForwardFailed(_) => 500,
            KvError::DecodeError(_) => 400,
            KvError::EncodeError(_) => 500,
            KvError::ConsensusTimeout => 500,
            KvError::RangeStartAfterEnd | KvError::RangeStartBeyondLength => 400,
            KvError::EmptyKey => 400,
            KvError::Consensus(tcf_consensus::ConsensusError::NotLeader { .. }) => 400,
            KvError::Consensus(tcf_consensus::ConsensusError::Timeout(_)) => 500,
            KvError::Consensus(_) => 500,
        }
    }

    /// Reserved error code per `spec.md` §6 ("100 Key not found", "101
    /// Application error", "102 Key Exists").
    pub fn error_code(&self) -> (u16, &'static str) {
        match self {
            KvError::NotFound => (100, "Key not found"),
            KvError::KeyExists => (102, "Key Exists"),
            _ => (101, "Application error"),
        }
    }
}
