use serde::{Deserialize, Serialize};

/// The value stored at a key. Grounded on
/// `examples/original_source/distributed_store/rafty/objects/rafty_types.go`'s
/// `NodeValue`; encoded with `rmp-serde` (msgpack) the same way the original
/// calls `msgpack.Marshal` before handing the blob to the consensus log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub key: String,
    pub value: String,
    /// Seconds; `0` means "never expires".
    pub ttl: i64,
    /// Unix seconds; meaningless when `ttl == 0`.
    pub expiration: i64,
    pub created: i64,
    pub last_updated: i64,
}

impl NodeRecord {
    pub fn new(key: impl Into<String>, value: impl Into<String>, ttl: i64, now: i64) -> Self {
        let mut record = NodeRecord {
            key: key.into(),
            value: value.into(),
            ttl,
            expiration: 0,
            created: now,
            last_updated: now,
        };
        record.recalculate_expiry(now);
        record
    }

    pub fn recalculate_expiry(&mut self, now: i64) {
        if self.ttl > 0 {
            self.expiration = now + self.ttl;
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.ttl != 0 && now > self.expiration
    }

    pub fn encode(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_msgpack() {
        let record = NodeRecord::new("k1", "v1", 999, 1_000);
        let encoded = record.encode().unwrap();
        let decoded = NodeRecord::decode(&encoded).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn zero_ttl_never_expires() {
        let record = NodeRecord::new("k1", "v1", 0, 1_000);
        assert!(!record.is_expired(i64::MAX));
    }

    #[test]
    fn positive_ttl_expires_after_window() {
        let record = NodeRecord::new("k1", "v1", 10, 1_000);
        assert_eq!(record.expiration, 1_010);
        assert!(!record.is_expired(1_010));
        assert!(record.is_expired(1_011));
    }
}
