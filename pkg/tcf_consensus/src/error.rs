use thiserror::Error;

use crate::types::NodeId;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("not leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },

    #[error("proposal did not commit within {0:?}")]
    Timeout(std::time::Duration),

    #[error("transport error talking to {peer}: {source}")]
    Transport {
        peer: NodeId,
        #[source]
        source: TransportError,
    },

    #[error("unrecognised state machine operation, replica state is desynchronized")]
    UnrecognisedOp,

    #[error("state machine apply failed: {0}")]
    Apply(String),
}

#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    #[error("peer rejected request: {0}")]
    Rejected(String),
}
