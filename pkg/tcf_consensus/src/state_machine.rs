use async_trait::async_trait;

use crate::types::LogIndex;

/// Deterministically reduces the committed command stream onto whatever
/// storage the implementor owns. Grounded on
/// `examples/dennisss-dacha/pkg/datastore/src/meta/state_machine.rs`'s
/// `raft::StateMachine` trait, simplified since this crate has no on-disk
/// WAL: `apply` is the only call on the hot path, `snapshot`/`restore` exist
/// purely for catching up a replica that fell behind.
#[async_trait]
pub trait StateMachine: Send + Sync + 'static {
    /// Applies a single committed command at `index`. Errors here do not
    /// desynchronize replicas: the error is surfaced to whoever proposed
    /// the command, but the log still advances identically everywhere.
    async fn apply(&self, index: LogIndex, command: &[u8]) -> Result<(), String>;

    /// Clones the current state into a single encoded document.
    async fn snapshot(&self) -> Vec<u8>;

    /// Replaces the entire state from a document produced by `snapshot`.
    async fn restore(&self, snapshot: &[u8]) -> Result<(), String>;
}
