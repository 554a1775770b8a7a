use std::time::Duration;

use async_trait::async_trait;
use tcf_consensus::{
    AppendEntriesRequest, AppendEntriesResponse, NodeId, RequestVoteRequest, RequestVoteResponse, Transport,
    TransportError,
};

const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Carries consensus RPCs over plain HTTP to a peer's consensus bind
/// address: the concrete binding a node binary needs, implementing
/// `tcf_consensus::Transport` against a peer's `/raft/request-vote` and
/// `/raft/append-entries` endpoints.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request_vote(
        &self,
        peer: &NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, TransportError> {
        let resp = self
            .client
            .post(format!("http://{peer}/raft/request-vote"))
            .json(&request)
            .timeout(RPC_TIMEOUT)
            .send()
            .await
            .map_err(|e| TransportError::Unreachable(format!("{peer}: {e}")))?;

        resp.json::<RequestVoteResponse>()
            .await
            .map_err(|e| TransportError::Unreachable(format!("{peer}: malformed response: {e}")))
    }

    async fn append_entries(
        &self,
        peer: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        let resp = self
            .client
            .post(format!("http://{peer}/raft/append-entries"))
            .json(&request)
            .timeout(RPC_TIMEOUT)
            .send()
            .await
            .map_err(|e| TransportError::Unreachable(format!("{peer}: {e}")))?;

        resp.json::<AppendEntriesResponse>()
            .await
            .map_err(|e| TransportError::Unreachable(format!("{peer}: malformed response: {e}")))
    }
}
