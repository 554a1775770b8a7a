use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tcf_consensus::{LogIndex, StateMachine};

use crate::collections::{EncodedList, EncodedSet, EncodedSortedSet};
use crate::command::Command;

/// Deterministically reduces the committed command stream onto an in-memory
/// `key -> bytes` map. Grounded on
/// `examples/original_source/distributed_store/rafty/store/fsm.go`'s `fsm`
/// type; the map is guarded by a single `parking_lot::Mutex` held only for
/// the duration of decode-mutate-encode, matching `spec.md` §5's "one mutex
/// guarding encode/decode of a key's blob" resource model.
pub struct Fsm {
    map: Mutex<HashMap<String, Vec<u8>>>,
}

impl Fsm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            map: Mutex::new(HashMap::new()),
        })
    }

    /// Local, consensus-free read. `spec.md` §4.2: "Reads are served
    /// locally on any node without consensus."
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.map.lock().get(key).cloned()
    }

    fn apply_command(&self, command: Command) -> Result<(), String> {
        let mut map = self.map.lock();
        match command {
            Command::Set { key, value } => {
                map.insert(key, value);
            }
            Command::Delete { key } => {
                map.remove(&key);
            }
            Command::AddToSet { key, value } => {
                let mut set = match map.get(&key) {
                    Some(bytes) => EncodedSet::decode(bytes),
                    None => EncodedSet::default(),
                };
                set.insert(value);
                map.insert(key, set.encode());
            }
            Command::LPush { key, values } => {
                let mut list = match map.get(&key) {
                    Some(bytes) => EncodedList::decode(bytes),
                    None => EncodedList::default(),
                };
                list.lpush(values);
                map.insert(key, list.encode());
            }
            Command::LRem { key, count, value } => {
                if let Some(bytes) = map.get(&key) {
                    let mut list = EncodedList::decode(bytes);
                    list.lrem(count, &value);
                    map.insert(key, list.encode());
                }
            }
            Command::ZAdd { key, score, value } => {
                let mut zset = match map.get(&key) {
                    Some(bytes) => EncodedSortedSet::decode(bytes),
                    None => EncodedSortedSet::default(),
                };
                zset.upsert(score, value);
                map.insert(key, zset.encode());
            }
            Command::ZRemRangeByScore { key, min, max } => {
                if let Some(bytes) = map.get(&key) {
                    let mut zset = EncodedSortedSet::decode(bytes);
                    zset.remove_range_by_score(min, max);
                    map.insert(key, zset.encode());
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StateMachine for Fsm {
    async fn apply(&self, _index: LogIndex, command: &[u8]) -> Result<(), String> {
        let command = Command::decode(command).map_err(|e| {
            format!("unrecognised or corrupt state machine operation: {e}")
        })?;
        self.apply_command(command)
    }

    async fn snapshot(&self) -> Vec<u8> {
        let map = self.map.lock();
        rmp_serde::to_vec(&*map).expect("map of byte blobs is always serializable")
    }

    async fn restore(&self, snapshot: &[u8]) -> Result<(), String> {
        let restored: HashMap<String, Vec<u8>> =
            rmp_serde::from_slice(snapshot).map_err(|e| e.to_string())?;
        *self.map.lock() = restored;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get() {
        let fsm = Fsm::new();
        fsm.apply(LogIndex(1), &Command::Set { key: "k".into(), value: b"v".to_vec() }.encode())
            .await
            .unwrap();
        assert_eq!(fsm.get("k"), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let fsm = Fsm::new();
        fsm.apply(LogIndex(1), &Command::Delete { key: "missing".into() }.encode())
            .await
            .unwrap();
        assert_eq!(fsm.get("missing"), None);
    }

    #[tokio::test]
    async fn snapshot_restore_round_trips() {
        let fsm = Fsm::new();
        fsm.apply(LogIndex(1), &Command::Set { key: "k".into(), value: b"v".to_vec() }.encode())
            .await
            .unwrap();
        let snap = fsm.snapshot().await;

        let restored = Fsm::new();
        restored.restore(&snap).await.unwrap();
        assert_eq!(restored.get("k"), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn unrecognised_op_is_an_error() {
        let fsm = Fsm::new();
        let result = fsm.apply(LogIndex(1), b"not a valid command").await;
        assert!(result.is_err());
    }
}
