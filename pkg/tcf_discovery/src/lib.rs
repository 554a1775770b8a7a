//! Leader-change discovery bus: the reserved topic new
//! nodes subscribe to in order to learn the current KV leader's HTTP
//! address, and that every leader broadcasts on while it holds office.
//! Built on [`tcf_pubsub::Client`] (§4.5) and [`tcf_codec::Envelope`]
//! (§4.6), grounded on `examples/original_source/distributed_store/rafty/server.go`'s
//! `startBroadcast`/`startListeningForMasterChange`/`masterListener`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tcf_codec::{Encoding, Envelope, Verifier};
use tcf_consensus::{Role, StateMachine, Transport};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Reserved topic every leader broadcasts on and every joining node
/// subscribes to.
pub const LEADER_TOPIC: &str = "tcf.cluster.distributed_store.leader";

/// How often a leader (re-)announces itself.
pub const BROADCAST_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaderAnnouncement {
    leader_ha: String,
}

/// Drives the "every leader, every ~5s, publishes `{leaderHA}`" half of
/// leader discovery: subscribes to a node's consensus role transitions and
/// starts/stops a [`tcf_pubsub::Client`] broadcast accordingly, upholding
/// the "at most one node broadcasts on this topic at any given moment"
/// invariant by only ever broadcasting while `is_leader()` holds.
pub struct LeaderBroadcaster<T: Transport, M: StateMachine> {
    client: Arc<tcf_pubsub::Client>,
    node: Arc<tcf_consensus::ConsensusNode<T, M>>,
    leader_http_addr: String,
    verifier: Arc<dyn Verifier>,
}

impl<T: Transport, M: StateMachine> LeaderBroadcaster<T, M> {
    pub fn new(
        client: Arc<tcf_pubsub::Client>,
        node: Arc<tcf_consensus::ConsensusNode<T, M>>,
        leader_http_addr: impl Into<String>,
        verifier: Arc<dyn Verifier>,
    ) -> Self {
        Self {
            client,
            node,
            leader_http_addr: leader_http_addr.into(),
            verifier,
        }
    }

    fn envelope_bytes(&self) -> Vec<u8> {
        let mut envelope = Envelope::new(LEADER_TOPIC, self.client.sender_id(), Encoding::Json, now_unix());
        envelope
            .encode(&LeaderAnnouncement { leader_ha: self.leader_http_addr.clone() }, self.verifier.as_ref())
            .expect("announcement always serializes");
        envelope.to_bytes().expect("envelope always serializes")
    }

    /// Runs until `cancel` fires, starting a broadcast on becoming leader
    /// and stopping it immediately on step-down.
    pub async fn run(self, cancel: CancellationToken) {
        let mut role_rx = self.node.subscribe_role();
        let mut is_broadcasting = false;

        if self.node.is_leader().await {
            self.start(&mut is_broadcasting).await;
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = role_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let role = *role_rx.borrow();
                    if role == Role::Leader && !is_broadcasting {
                        self.start(&mut is_broadcasting).await;
                    } else if role != Role::Leader && is_broadcasting {
                        self.stop(&mut is_broadcasting).await;
                    }
                }
            }
        }

        if is_broadcasting {
            self.stop(&mut is_broadcasting).await;
        }
    }

    async fn start(&self, is_broadcasting: &mut bool) {
        tracing::info!(leader_http_addr = %self.leader_http_addr, "starting leader discovery broadcast");
        if let Err(e) = self.client.broadcast(LEADER_TOPIC, self.envelope_bytes(), BROADCAST_INTERVAL).await {
            tracing::warn!(error = %e, "failed to start leader broadcast");
            return;
        }
        *is_broadcasting = true;
    }

    async fn stop(&self, is_broadcasting: &mut bool) {
        tracing::info!("stopping leader discovery broadcast (stepped down)");
        let _ = self.client.stop_broadcast(LEADER_TOPIC).await;
        *is_broadcasting = false;
    }
}

/// Result of a join-side discovery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// The HTTP address of the first leader observed; the join target.
    Found(String),
    /// No announcement arrived within `JoinTimeout`; caller should fall back
    /// to single-server mode.
    TimedOut,
}

/// Subscribes to [`LEADER_TOPIC`] once and resolves to the *first*
/// `leaderHA` observed; subsequent messages only update an observational
/// "current leader" log, with no re-join. Falls back to
/// [`DiscoveryOutcome::TimedOut`] if nothing arrives within `join_timeout`.
pub async fn discover_leader(
    client: &Arc<tcf_pubsub::Client>,
    verifier: Arc<dyn Verifier>,
    join_timeout: Duration,
) -> DiscoveryOutcome {
    let (tx, rx) = oneshot::channel();
    let tx = std::sync::Mutex::new(Some(tx));
    let resolved = Arc::new(AtomicBool::new(false));
    let resolved_handler = resolved.clone();

    let handler_result = client
        .subscribe(
            LEADER_TOPIC,
            Arc::new(move |frame: tcf_pubsub::Frame| {
                let envelope = match Envelope::from_bytes(Encoding::Json, &frame.envelope) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        tracing::warn!(error = %e, "discarding malformed discovery envelope");
                        return;
                    }
                };
                if envelope.verify(verifier.as_ref()).is_err() {
                    tracing::warn!("discarding discovery envelope with invalid signature");
                    return;
                }
                let announcement: LeaderAnnouncement = match envelope.decode_message() {
                    Ok(a) => a,
                    Err(e) => {
                        tracing::warn!(error = %e, "discarding undecodable discovery envelope");
                        return;
                    }
                };

                if !resolved_handler.swap(true, Ordering::SeqCst) {
                    if let Some(tx) = tx.lock().unwrap().take() {
                        let _ = tx.send(announcement.leader_ha.clone());
                    }
                } else {
                    tracing::info!(leader_http_addr = %announcement.leader_ha, "observed leader announcement");
                }
            }),
        )
        .await;

    if let Err(e) = handler_result {
        tracing::warn!(error = %e, "failed to subscribe to discovery topic");
        return DiscoveryOutcome::TimedOut;
    }

    match tokio::time::timeout(join_timeout, rx).await {
        Ok(Ok(leader_ha)) => DiscoveryOutcome::Found(leader_ha),
        _ => DiscoveryOutcome::TimedOut,
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use tcf_codec::NoopVerifier;
    use tcf_consensus::{
        AppendEntriesRequest, AppendEntriesResponse, ConsensusNode, RequestVoteRequest, RequestVoteResponse,
        TransportError,
    };
    use tcf_pubsub::Broker;

    struct NoopTransport;

    #[async_trait]
    impl Transport for NoopTransport {
        async fn request_vote(
            &self,
            _peer: &tcf_consensus::NodeId,
            _request: RequestVoteRequest,
        ) -> Result<RequestVoteResponse, TransportError> {
            Err(TransportError::Unreachable("no peers".into()))
        }

        async fn append_entries(
            &self,
            _peer: &tcf_consensus::NodeId,
            _request: AppendEntriesRequest,
        ) -> Result<AppendEntriesResponse, TransportError> {
            Err(TransportError::Unreachable("no peers".into()))
        }
    }

    async fn spawn_broker() -> (SocketAddr, CancellationToken) {
        let broker = Broker::new(false);
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        let bound = listener.local_addr().unwrap();
        drop(listener);

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move { broker.listen(bound, cancel_clone).await.unwrap() });
        tokio::time::sleep(Duration::from_millis(50)).await;
        (bound, cancel)
    }

    #[tokio::test]
    async fn leader_broadcast_is_discovered_by_a_joining_node() {
        let (addr, broker_cancel) = spawn_broker().await;

        let fsm = noop_state_machine::CountingMachine::default();
        let node = ConsensusNode::new("leader".to_string(), Vec::new(), Arc::new(NoopTransport), Arc::new(fsm));
        node.become_single_server_leader().await;

        let leader_client = tcf_pubsub::Client::new(addr, "leader", false);
        let broadcaster = LeaderBroadcaster::new(leader_client, node, "10.0.0.1:8080", Arc::new(NoopVerifier));
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move { broadcaster.run(cancel_clone).await });

        let joiner_client = tcf_pubsub::Client::new(addr, "joiner", false);
        let outcome = discover_leader(&joiner_client, Arc::new(NoopVerifier), Duration::from_secs(5)).await;
        assert_eq!(outcome, DiscoveryOutcome::Found("10.0.0.1:8080".to_string()));

        cancel.cancel();
        broker_cancel.cancel();
    }

    #[tokio::test]
    async fn discovery_times_out_when_no_leader_announces() {
        let (addr, broker_cancel) = spawn_broker().await;
        let client = tcf_pubsub::Client::new(addr, "lonely", false);
        let outcome = discover_leader(&client, Arc::new(NoopVerifier), Duration::from_millis(100)).await;
        assert_eq!(outcome, DiscoveryOutcome::TimedOut);
        broker_cancel.cancel();
    }

    mod noop_state_machine {
        use async_trait::async_trait;
        use tcf_consensus::{LogIndex, StateMachine};
        use tokio::sync::Mutex;

        #[derive(Default)]
        pub struct CountingMachine {
            applied: Mutex<Vec<Vec<u8>>>,
        }

        #[async_trait]
        impl StateMachine for CountingMachine {
            async fn apply(&self, _index: LogIndex, command: &[u8]) -> Result<(), String> {
                self.applied.lock().await.push(command.to_vec());
                Ok(())
            }

            async fn snapshot(&self) -> Vec<u8> {
                Vec::new()
            }

            async fn restore(&self, _snapshot: &[u8]) -> Result<(), String> {
                Ok(())
            }
        }
    }
}
