use std::path::{Path, PathBuf};
use std::sync::Arc;

use tcf_consensus::{ConsensusNode, StateMachine, Transport};
use tokio::fs;

use crate::error::KvError;

/// A consensus peer address, e.g. `10.0.0.4:9090`.
pub type NodeAddr = String;

/// Membership surface over a [`ConsensusNode`]: `Join`/`RemovePeer`/
/// `SetPeers`/`Leader`/`IsLeader` per `spec.md` §4.3, plus the `peers.json`
/// persistence and reset-on-load/single-server bootstrap flags from
/// `examples/original_source/distributed_store/rafty/store/store.go`.
pub struct Cluster<T: Transport, M: StateMachine> {
    node: Arc<ConsensusNode<T, M>>,
    peers_path: PathBuf,
}

impl<T: Transport, M: StateMachine> Cluster<T, M> {
    pub fn new(node: Arc<ConsensusNode<T, M>>, raft_dir: impl AsRef<Path>) -> Self {
        Self {
            node,
            peers_path: raft_dir.as_ref().join("peers.json"),
        }
    }

    /// Loads `peers.json`, optionally rewriting it to contain only `self_addr`
    /// first (the "reset-on-load" flag), then either joins the existing
    /// cluster's peer set into the consensus node or elects itself leader if
    /// `single_server_mode` is set and at most one peer is known.
    pub async fn open(
        &self,
        self_addr: &NodeAddr,
        reset_peers_on_load: bool,
        single_server_mode: bool,
    ) -> std::io::Result<()> {
        if reset_peers_on_load {
            self.reset_peers_json(self_addr).await?;
        }

        let persisted = self.read_peers_json().await?;
        let peers: Vec<NodeAddr> = persisted.into_iter().filter(|p| p != self_addr).collect();
        self.node.set_peers(peers.clone()).await;

        if single_server_mode && peers.is_empty() {
            self.node.become_single_server_leader().await;
        }

        Ok(())
    }

    pub async fn read_peers_json(&self) -> std::io::Result<Vec<NodeAddr>> {
        match fs::read(&self.peers_path).await {
            Ok(bytes) if !bytes.is_empty() => {
                Ok(serde_json::from_slice(&bytes).unwrap_or_default())
            }
            Ok(_) => Ok(Vec::new()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn write_peers_json(&self, peers: &[NodeAddr]) -> std::io::Result<()> {
        let encoded = serde_json::to_vec(peers).expect("Vec<String> is always serializable");
        if let Some(parent) = self.peers_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.peers_path, encoded).await
    }

    /// Reclaims a node stranded as the sole member of a dead majority: keeps
    /// only `self_addr` in the persisted peer list.
    async fn reset_peers_json(&self, self_addr: &NodeAddr) -> std::io::Result<()> {
        let peers = self.read_peers_json().await?;
        if peers.len() > 1 {
            self.write_peers_json(&[self_addr.clone()]).await?;
        }
        Ok(())
    }

    pub async fn join(&self, addr: NodeAddr) -> Result<(), KvError> {
        if !self.node.is_leader().await {
            return Err(KvError::NotLeader {
                leader_hint: self.node.leader_id().await,
            });
        }
        self.node.add_peer(addr).await;
        let peers = self.node.peers().await;
        let mut with_self = peers.clone();
        with_self.push(self.node.id().clone());
        self.write_peers_json(&with_self)
            .await
            .map_err(|e| KvError::EncodeError(e.to_string()))
    }

    pub async fn remove_peer(&self, addr: &NodeAddr) -> Result<(), KvError> {
        if !self.node.is_leader().await {
            return Err(KvError::NotLeader {
                leader_hint: self.node.leader_id().await,
            });
        }
        self.node.remove_peer(addr).await;
        let peers = self.node.peers().await;
        let mut with_self = peers.clone();
        with_self.push(self.node.id().clone());
        self.write_peers_json(&with_self)
            .await
            .map_err(|e| KvError::EncodeError(e.to_string()))
    }

    pub async fn set_peers(&self, peers: Vec<NodeAddr>) -> Result<(), KvError> {
        self.node.set_peers(peers.clone()).await;
        self.write_peers_json(&peers)
            .await
            .map_err(|e| KvError::EncodeError(e.to_string()))
    }

    pub async fn leader(&self) -> Option<NodeAddr> {
        self.node.leader_id().await
    }

    pub async fn is_leader(&self) -> bool {
        self.node.is_leader().await
    }

    pub fn node(&self) -> &Arc<ConsensusNode<T, M>> {
        &self.node
    }
}

/// Derives a node's KV HTTP address from its consensus address: the HTTP
/// port is always the consensus port minus 100. Grounded verbatim on
/// `GetHttpAPIFromRaftURL` in
/// `examples/original_source/distributed_store/rafty/store/store.go`.
pub fn http_api_from_raft_addr(raft_addr: &str) -> Option<String> {
    let (host, port) = raft_addr.rsplit_once(':')?;
    let port: u32 = port.parse().ok()?;
    Some(format!("{host}:{}", port.saturating_sub(100)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_http_port_from_raft_port() {
        assert_eq!(
            http_api_from_raft_addr("10.0.0.4:9090"),
            Some("10.0.0.4:8990".to_string())
        );
    }

    #[test]
    fn rejects_addresses_without_a_port() {
        assert_eq!(http_api_from_raft_addr("10.0.0.4"), None);
    }
}
