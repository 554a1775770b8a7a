mod error;
mod node;
mod rpc;
mod state_machine;
mod types;

pub use error::{ConsensusError, TransportError};
pub use node::ConsensusNode;
pub use rpc::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse, Transport,
};
pub use state_machine::StateMachine;
pub use types::{LogEntry, LogIndex, NodeId, Role, Term};

pub type Result<T> = std::result::Result<T, ConsensusError>;

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    /// Routes RPCs directly between in-process nodes, bypassing the wire.
    struct LoopbackTransport {
        nodes: Mutex<HashMap<NodeId, Arc<ConsensusNode<LoopbackTransport, CountingMachine>>>>,
    }

    impl LoopbackTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                nodes: Mutex::new(HashMap::new()),
            })
        }

        async fn register(&self, id: NodeId, node: Arc<ConsensusNode<LoopbackTransport, CountingMachine>>) {
            self.nodes.lock().await.insert(id, node);
        }
    }

    #[async_trait]
    impl Transport for LoopbackTransport {
        async fn request_vote(
            &self,
            peer: &NodeId,
            request: RequestVoteRequest,
        ) -> std::result::Result<RequestVoteResponse, TransportError> {
            let node = self
                .nodes
                .lock()
                .await
                .get(peer)
                .cloned()
                .ok_or_else(|| TransportError::Unreachable(peer.clone()))?;
            Ok(node.handle_request_vote(request).await)
        }

        async fn append_entries(
            &self,
            peer: &NodeId,
            request: AppendEntriesRequest,
        ) -> std::result::Result<AppendEntriesResponse, TransportError> {
            let node = self
                .nodes
                .lock()
                .await
                .get(peer)
                .cloned()
                .ok_or_else(|| TransportError::Unreachable(peer.clone()))?;
            Ok(node.handle_append_entries(request).await)
        }
    }

    #[derive(Default)]
    struct CountingMachine {
        applied: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl StateMachine for CountingMachine {
        async fn apply(&self, _index: LogIndex, command: &[u8]) -> std::result::Result<(), String> {
            self.applied.lock().await.push(command.to_vec());
            Ok(())
        }

        async fn snapshot(&self) -> Vec<u8> {
            Vec::new()
        }

        async fn restore(&self, _snapshot: &[u8]) -> std::result::Result<(), String> {
            Ok(())
        }
    }

    async fn build_cluster(ids: &[&str]) -> (Arc<LoopbackTransport>, Vec<Arc<ConsensusNode<LoopbackTransport, CountingMachine>>>) {
        let transport = LoopbackTransport::new();
        let mut nodes = Vec::new();
        for id in ids {
            let peers = ids
                .iter()
                .filter(|p| *p != id)
                .map(|p| p.to_string())
                .collect();
            let node = ConsensusNode::new(
                id.to_string(),
                peers,
                transport.clone(),
                Arc::new(CountingMachine::default()),
            );
            transport.register(id.to_string(), node.clone()).await;
            nodes.push(node);
        }
        (transport, nodes)
    }

    #[tokio::test]
    async fn single_node_commits_immediately() {
        let (_transport, nodes) = build_cluster(&["a"]).await;
        nodes[0].become_single_server_leader().await;
        assert!(nodes[0].is_leader().await);
        let index = nodes[0].propose(b"hello".to_vec()).await.unwrap();
        assert_eq!(index, LogIndex(1));
    }

    #[tokio::test]
    async fn three_node_cluster_elects_a_leader_and_replicates() {
        let (_transport, nodes) = build_cluster(&["a", "b", "c"]).await;
        let cancel = CancellationToken::new();
        for node in &nodes {
            tokio::spawn(node.clone().run(cancel.clone()));
        }

        let mut leader = None;
        for _ in 0..200 {
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
            for node in &nodes {
                if node.is_leader().await {
                    leader = Some(node.clone());
                    break;
                }
            }
            if leader.is_some() {
                break;
            }
        }
        let leader = leader.expect("a leader should have emerged");

        let index = leader.propose(b"set x=1".to_vec()).await.unwrap();
        assert_eq!(index, LogIndex(1));

        cancel.cancel();
    }

    #[tokio::test]
    async fn non_leader_rejects_proposals() {
        let (_transport, nodes) = build_cluster(&["a", "b"]).await;
        let err = nodes[0].propose(b"nope".to_vec()).await.unwrap_err();
        assert!(matches!(err, ConsensusError::NotLeader { .. }));
    }
}
