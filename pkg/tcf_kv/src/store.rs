use std::sync::Arc;
use std::time::Duration;

use tcf_consensus::{ConsensusNode, Transport};

use crate::cluster::{http_api_from_raft_addr, Cluster, NodeAddr};
use crate::collections::{EncodedList, EncodedSet, EncodedSortedSet};
use crate::command::Command;
use crate::error::KvError;
use crate::fsm::Fsm;
use crate::record::NodeRecord;
use crate::ttl::{now_unix, TtlIndex, TtlProcessor};
use crate::wire::{ActionType, ErrorBody, KeyValueResponse};

/// `spec.md` §5: "Forwarded HTTP calls carry a 10 s request timeout."
const FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

/// The typed KV operations from `spec.md` §4.2, layered on [`Fsm`] and
/// [`tcf_consensus::ConsensusNode`]: reads are served locally, mutations go
/// through consensus on the leader or are forwarded to it over HTTP.
/// Grounded on `examples/original_source/distributed_store/rafty/http/embedded_service.go`
/// (`CreateKey`/`UpdateKey`/`GetKey`/`DeleteKey`/`forwardCommand`) and
/// `.../rafty/store/store.go` for the rest of the typed surface.
pub struct KvStore<T: Transport> {
    fsm: Arc<Fsm>,
    node: Arc<ConsensusNode<T, Fsm>>,
    cluster: Cluster<T, Fsm>,
    ttl_processor: Arc<TtlProcessor<T, Fsm>>,
    http: reqwest::Client,
}

impl<T: Transport> KvStore<T> {
    pub fn new(node: Arc<ConsensusNode<T, Fsm>>, fsm: Arc<Fsm>, raft_dir: impl AsRef<std::path::Path>) -> Arc<Self> {
        Self::new_with_ttl_tuning(node, fsm, raft_dir, crate::ttl::DEFAULT_CHUNK_SIZE, crate::ttl::DEFAULT_TICK)
    }

    /// As [`KvStore::new`], but lets the caller override the TTL
    /// processor's chunk size and tick interval instead of taking the defaults.
    pub fn new_with_ttl_tuning(
        node: Arc<ConsensusNode<T, Fsm>>,
        fsm: Arc<Fsm>,
        raft_dir: impl AsRef<std::path::Path>,
        ttl_chunk_size: usize,
        ttl_tick: Duration,
    ) -> Arc<Self> {
        let index = TtlIndex::new();
        let ttl_processor = Arc::new(
            TtlProcessor::new(index, fsm.clone(), node.clone())
                .with_chunk_size(ttl_chunk_size)
                .with_tick(ttl_tick),
        );
        Arc::new(Self {
            cluster: Cluster::new(node.clone(), raft_dir),
            fsm,
            node,
            ttl_processor,
            http: reqwest::Client::new(),
        })
    }

    pub fn cluster(&self) -> &Cluster<T, Fsm> {
        &self.cluster
    }

    pub fn ttl_processor(&self) -> Arc<TtlProcessor<T, Fsm>> {
        self.ttl_processor.clone()
    }

    pub async fn is_leader(&self) -> bool {
        self.node.is_leader().await
    }

    pub async fn leader(&self) -> Option<NodeAddr> {
        self.cluster.leader().await
    }

    async fn propose(&self, command: Command) -> Result<(), KvError> {
        self.node.propose(command.encode()).await?;
        Ok(())
    }

    // --- string keys ---------------------------------------------------

    pub async fn create_key(&self, key: &str, value: &str, ttl: i64) -> Result<KeyValueResponse, KvError> {
        if key.is_empty() {
            return Err(KvError::EmptyKey);
        }
        if !self.is_leader().await {
            return self.forward_create(key, value, ttl).await;
        }

        let now = now_unix();
        if let Some(bytes) = self.fsm.get(key) {
            if let Ok(existing) = NodeRecord::decode(&bytes) {
                if !existing.is_expired(now) {
                    return Err(KvError::KeyExists);
                }
            }
        }

        let record = NodeRecord::new(key, value, ttl, now);
        let encoded = record.encode().map_err(|e| KvError::EncodeError(e.to_string()))?;
        self.propose(Command::Set { key: key.to_string(), value: encoded }).await?;
        if record.ttl > 0 {
            self.ttl_processor.track_ttl_for_key(key, record.expiration).await;
        }
        Ok(KeyValueResponse::new(ActionType::Created).with_node(record))
    }

    pub async fn update_key(&self, key: &str, value: &str, ttl: i64) -> Result<KeyValueResponse, KvError> {
        if key.is_empty() {
            return Err(KvError::EmptyKey);
        }
        if !self.is_leader().await {
            return self.forward_update(key, value, ttl).await;
        }

        let now = now_unix();
        let bytes = self.fsm.get(key).ok_or(KvError::NotFound)?;
        let mut record = NodeRecord::decode(&bytes).map_err(|e| KvError::DecodeError(e.to_string()))?;
        if record.ttl != ttl {
            record.ttl = ttl;
            record.recalculate_expiry(now);
        }
        record.value = value.to_string();
        record.last_updated = now;

        let encoded = record.encode().map_err(|e| KvError::EncodeError(e.to_string()))?;
        self.propose(Command::Set { key: key.to_string(), value: encoded }).await?;
        if record.ttl > 0 {
            self.ttl_processor.track_ttl_for_key(key, record.expiration).await;
        }
        Ok(KeyValueResponse::new(ActionType::Modified).with_node(record))
    }

    /// Served locally per `spec.md` §4.2: "Reads are served locally on any
    /// node without consensus."
    pub fn get_key(&self, key: &str) -> Result<KeyValueResponse, KvError> {
        if key.is_empty() {
            return Err(KvError::EmptyKey);
        }
        let bytes = self.fsm.get(key).ok_or(KvError::NotFound)?;
        let record = NodeRecord::decode(&bytes).map_err(|_| KvError::NotFound)?;
        if record.is_expired(now_unix()) {
            return Err(KvError::NotFound);
        }
        Ok(KeyValueResponse::new(ActionType::Requested).with_node(record))
    }

    pub async fn delete_key(&self, key: &str) -> Result<KeyValueResponse, KvError> {
        if key.is_empty() {
            return Err(KvError::EmptyKey);
        }
        if !self.is_leader().await {
            return self.forward_delete(key).await;
        }
        self.propose(Command::Delete { key: key.to_string() }).await?;
        Ok(KeyValueResponse::new(ActionType::Deleted))
    }

    // --- sets ------------------------------------------------------------

    pub async fn add_to_set(&self, key: &str, value: &str) -> Result<KeyValueResponse, KvError> {
        if !self.is_leader().await {
            return self.forward_add_to_set(key, value).await;
        }
        self.propose(Command::AddToSet { key: key.to_string(), value: value.as_bytes().to_vec() }).await?;
        Ok(KeyValueResponse::new(ActionType::SetAdded))
    }

    pub fn get_set(&self, key: &str) -> Vec<String> {
        match self.fsm.get(key) {
            Some(bytes) => EncodedSet::decode(&bytes)
                .values()
                .into_iter()
                .map(|v| String::from_utf8_lossy(&v).into_owned())
                .collect(),
            None => Vec::new(),
        }
    }

    // --- lists -------------------------------------------------------------

    pub async fn lpush(&self, key: &str, values: Vec<String>) -> Result<KeyValueResponse, KvError> {
        if !self.is_leader().await {
            return self.forward_lpush(key, &values).await;
        }
        let encoded = values.iter().map(|v| v.as_bytes().to_vec()).collect();
        self.propose(Command::LPush { key: key.to_string(), values: encoded }).await?;
        Ok(KeyValueResponse::new(ActionType::ListPush))
    }

    pub fn llen(&self, key: &str) -> i64 {
        match self.fsm.get(key) {
            Some(bytes) => EncodedList::decode(&bytes).len() as i64,
            None => 0,
        }
    }

    pub async fn lrem(&self, key: &str, count: i64, value: &str) -> Result<KeyValueResponse, KvError> {
        if !self.is_leader().await {
            return self.forward_lrem(key, count, value).await;
        }
        self.propose(Command::LRem { key: key.to_string(), count, value: value.as_bytes().to_vec() }).await?;
        Ok(KeyValueResponse::new(ActionType::ListRemove))
    }

    pub fn lrange(&self, key: &str, from: i64, to: i64) -> Result<Vec<String>, KvError> {
        // `store.go`'s `LRange` returns `[]` for an absent key without
        // running the index math at all; an existing-but-empty list still
        // goes through `EncodedList::range` and can error on bad indices.
        let Some(bytes) = self.fsm.get(key) else {
            return Ok(Vec::new());
        };
        let list = EncodedList::decode(&bytes);
        let items = list.range(from, to).map_err(|e| {
            if e.contains("after end") {
                KvError::RangeStartAfterEnd
            } else {
                KvError::RangeStartBeyondLength
            }
        })?;
        Ok(items.into_iter().map(|v| String::from_utf8_lossy(&v).into_owned()).collect())
    }

    // --- sorted sets -----------------------------------------------------

    pub async fn zadd(&self, key: &str, score: f64, value: &str) -> Result<KeyValueResponse, KvError> {
        if !self.is_leader().await {
            return self.forward_zadd(key, score, value).await;
        }
        self.propose(Command::ZAdd { key: key.to_string(), score, value: value.as_bytes().to_vec() }).await?;
        Ok(KeyValueResponse::new(ActionType::ZsetAdd))
    }

    pub fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Vec<String> {
        match self.fsm.get(key) {
            Some(bytes) => EncodedSortedSet::decode(&bytes)
                .range_by_score(min, max)
                .into_iter()
                .map(|v| String::from_utf8_lossy(&v).into_owned())
                .collect(),
            None => Vec::new(),
        }
    }

    pub async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<KeyValueResponse, KvError> {
        if !self.is_leader().await {
            return self.forward_zremrangebyscore(key, min, max).await;
        }
        self.propose(Command::ZRemRangeByScore { key: key.to_string(), min, max }).await?;
        Ok(KeyValueResponse::new(ActionType::ZsetRemrangebyscore))
    }

    // --- forwarding --------------------------------------------------------

    async fn leader_http_base(&self) -> Result<String, KvError> {
        let leader_raft_addr = self.leader().await.ok_or_else(|| KvError::ForwardFailed("leader unknown".into()))?;
        let http_addr = http_api_from_raft_addr(&leader_raft_addr)
            .ok_or_else(|| KvError::ForwardFailed(format!("could not derive HTTP address from {leader_raft_addr}")))?;
        Ok(format!("http://{http_addr}"))
    }

    async fn parse_response(resp: reqwest::Response) -> Result<KeyValueResponse, KvError> {
        let status = resp.status();
        if status.is_success() {
            resp.json::<KeyValueResponse>().await.map_err(|e| KvError::ForwardFailed(e.to_string()))
        } else {
            let body = resp
                .json::<ErrorBody>()
                .await
                .map_err(|e| KvError::ForwardFailed(e.to_string()))?;
            Err(KvError::ForwardFailed(body.cause))
        }
    }

    async fn forward_create(&self, key: &str, value: &str, ttl: i64) -> Result<KeyValueResponse, KvError> {
        let base = self.leader_http_base().await?;
        let resp = self
            .http
            .post(format!("{base}/key/{key}"))
            .form(&[("value", value), ("ttl", &ttl.to_string())])
            .timeout(FORWARD_TIMEOUT)
            .send()
            .await
            .map_err(|e| KvError::ForwardFailed(e.to_string()))?;
        Self::parse_response(resp).await
    }

    async fn forward_update(&self, key: &str, value: &str, ttl: i64) -> Result<KeyValueResponse, KvError> {
        let base = self.leader_http_base().await?;
        let resp = self
            .http
            .put(format!("{base}/key/{key}"))
            .form(&[("value", value), ("ttl", &ttl.to_string())])
            .timeout(FORWARD_TIMEOUT)
            .send()
            .await
            .map_err(|e| KvError::ForwardFailed(e.to_string()))?;
        Self::parse_response(resp).await
    }

    async fn forward_delete(&self, key: &str) -> Result<KeyValueResponse, KvError> {
        let base = self.leader_http_base().await?;
        let resp = self
            .http
            .delete(format!("{base}/key/{key}"))
            .timeout(FORWARD_TIMEOUT)
            .send()
            .await
            .map_err(|e| KvError::ForwardFailed(e.to_string()))?;
        Self::parse_response(resp).await
    }

    async fn forward_add_to_set(&self, key: &str, value: &str) -> Result<KeyValueResponse, KvError> {
        let base = self.leader_http_base().await?;
        let resp = self
            .http
            .put(format!("{base}/key/sadd/{key}"))
            .form(&[("value", value)])
            .timeout(FORWARD_TIMEOUT)
            .send()
            .await
            .map_err(|e| KvError::ForwardFailed(e.to_string()))?;
        Self::parse_response(resp).await
    }

    async fn forward_lpush(&self, key: &str, values: &[String]) -> Result<KeyValueResponse, KvError> {
        let base = self.leader_http_base().await?;
        let encoded = serde_json::to_string(values).map_err(|e| KvError::EncodeError(e.to_string()))?;
        let resp = self
            .http
            .put(format!("{base}/key/lpush/{key}"))
            .form(&[("value", encoded)])
            .timeout(FORWARD_TIMEOUT)
            .send()
            .await
            .map_err(|e| KvError::ForwardFailed(e.to_string()))?;
        Self::parse_response(resp).await
    }

    async fn forward_lrem(&self, key: &str, count: i64, value: &str) -> Result<KeyValueResponse, KvError> {
        let base = self.leader_http_base().await?;
        let resp = self
            .http
            .delete(format!("{base}/key/lrem/{key}"))
            .form(&[("value", value), ("count", &count.to_string())])
            .timeout(FORWARD_TIMEOUT)
            .send()
            .await
            .map_err(|e| KvError::ForwardFailed(e.to_string()))?;
        Self::parse_response(resp).await
    }

    async fn forward_zadd(&self, key: &str, score: f64, value: &str) -> Result<KeyValueResponse, KvError> {
        let base = self.leader_http_base().await?;
        let resp = self
            .http
            .put(format!("{base}/key/zadd/{key}"))
            .form(&[("value", value), ("score", &score.to_string())])
            .timeout(FORWARD_TIMEOUT)
            .send()
            .await
            .map_err(|e| KvError::ForwardFailed(e.to_string()))?;
        Self::parse_response(resp).await
    }

    async fn forward_zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<KeyValueResponse, KvError> {
        let base = self.leader_http_base().await?;
        let resp = self
            .http
            .put(format!("{base}/key/zremrangebyscore/{key}"))
            .form(&[("min", &min.to_string()), ("max", &max.to_string())])
            .timeout(FORWARD_TIMEOUT)
            .send()
            .await
            .map_err(|e| KvError::ForwardFailed(e.to_string()))?;
        Self::parse_response(resp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tcf_consensus::{
        AppendEntriesRequest, AppendEntriesResponse, ConsensusError, RequestVoteRequest, RequestVoteResponse,
        TransportError,
    };

    struct NoopTransport;

    #[async_trait]
    impl Transport for NoopTransport {
        async fn request_vote(
            &self,
            _peer: &tcf_consensus::NodeId,
            _request: RequestVoteRequest,
        ) -> Result<RequestVoteResponse, TransportError> {
            Err(TransportError::Unreachable("no peers in this test".into()))
        }

        async fn append_entries(
            &self,
            _peer: &tcf_consensus::NodeId,
            _request: AppendEntriesRequest,
        ) -> Result<AppendEntriesResponse, TransportError> {
            Err(TransportError::Unreachable("no peers in this test".into()))
        }
    }

    async fn single_node_store() -> (Arc<KvStore<NoopTransport>>, tempfile::TempDir) {
        let fsm = Fsm::new();
        let node = ConsensusNode::new("self".to_string(), Vec::new(), Arc::new(NoopTransport), fsm.clone());
        node.become_single_server_leader().await;
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::new(node, fsm, dir.path());
        (store, dir)
    }

    #[tokio::test]
    async fn create_then_get_scenario() {
        let (store, _dir) = single_node_store().await;
        let created = store.create_key("k1", "v1", 999).await.unwrap();
        assert_eq!(created.node.as_ref().unwrap().value, "v1");

        let fetched = store.get_key("k1").unwrap();
        assert_eq!(fetched.node.unwrap().value, "v1");
    }

    #[tokio::test]
    async fn create_twice_without_expiry_is_key_exists() {
        let (store, _dir) = single_node_store().await;
        store.create_key("k1", "v1", 0).await.unwrap();
        let err = store.create_key("k1", "v2", 0).await.unwrap_err();
        assert!(matches!(err, KvError::KeyExists));
    }

    #[tokio::test]
    async fn update_recomputes_expiry_only_when_ttl_changes() {
        let (store, _dir) = single_node_store().await;
        store.create_key("k1", "v1", 100).await.unwrap();
        let updated = store.update_key("k1", "v2", 200).await.unwrap();
        let node = updated.node.unwrap();
        assert_eq!(node.value, "v2");
        assert_eq!(node.ttl, 200);
    }

    #[tokio::test]
    async fn delete_then_get_is_not_found() {
        let (store, _dir) = single_node_store().await;
        store.create_key("k1", "v1", 0).await.unwrap();
        store.delete_key("k1").await.unwrap();
        assert!(matches!(store.get_key("k1").unwrap_err(), KvError::NotFound));
    }

    #[tokio::test]
    async fn set_add_and_get_set() {
        let (store, _dir) = single_node_store().await;
        store.add_to_set("s", "a").await.unwrap();
        store.add_to_set("s", "a").await.unwrap();
        store.add_to_set("s", "b").await.unwrap();
        let mut values = store.get_set("s");
        values.sort();
        assert_eq!(values, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn list_push_len_rem_range_scenario() {
        let (store, _dir) = single_node_store().await;
        store
            .lpush("L", vec!["foo".into(), "bar".into(), "baz".into(), "foo".into()])
            .await
            .unwrap();
        assert_eq!(store.llen("L"), 4);

        store.lrem("L", 2, "foo").await.unwrap();
        assert_eq!(store.lrange("L", 0, -1).unwrap(), vec!["baz".to_string(), "bar".to_string()]);

        store
            .lpush("L", vec!["fee".into(), "fie".into(), "foe".into(), "fum".into()])
            .await
            .unwrap();
        assert_eq!(store.lrange("L", 0, -1).unwrap().len(), 6);
        assert_eq!(store.lrange("L", 0, -3).unwrap().len(), 4);
        assert_eq!(store.lrange("L", -3, -1).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn lrange_on_an_absent_key_is_empty_not_an_error() {
        let (store, _dir) = single_node_store().await;
        assert_eq!(store.lrange("nope", 0, -1).unwrap(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn zset_scenario() {
        let (store, _dir) = single_node_store().await;
        store.zadd("Z", 1.0, "foo").await.unwrap();
        store.zadd("Z", 2.0, "bar").await.unwrap();
        store.zadd("Z", 3.0, "baz").await.unwrap();
        store.zadd("Z", 4.0, "bim").await.unwrap();
        assert_eq!(store.zrange_by_score("Z", 3.0, 5.0).len(), 2);

        store.zadd("Z", 5.0, "boo").await.unwrap();
        store.zadd("Z", 5.0, "borp").await.unwrap();
        assert_eq!(store.zrange_by_score("Z", 3.0, 5.0).len(), 4);

        store.zrem_range_by_score("Z", 3.0, 5.0).await.unwrap();
        assert_eq!(store.zrange_by_score("Z", 0.0, 100.0), vec!["foo".to_string(), "bar".to_string()]);
    }

    #[tokio::test]
    async fn forwarding_without_a_known_leader_fails_fast() {
        let fsm = Fsm::new();
        let node = ConsensusNode::new("follower".to_string(), vec!["leader".into()], Arc::new(NoopTransport), fsm.clone());
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::new(node, fsm, dir.path());
        let err = store.create_key("k1", "v1", 0).await.unwrap_err();
        assert!(matches!(err, KvError::ForwardFailed(_)));
    }

    #[test]
    fn error_status_codes_match_spec() {
        assert_eq!(KvError::NotFound.status_code(), 404);
        assert_eq!(KvError::KeyExists.status_code(), 400);
        let _ = ConsensusError::NotLeader { leader_hint: None };
    }
}
