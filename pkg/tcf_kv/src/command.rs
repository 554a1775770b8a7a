use serde::{Deserialize, Serialize};

/// A single FSM mutation. Grounded on
/// `examples/original_source/distributed_store/rafty/store/store.go`'s
/// `command` struct; encoded with `rmp-serde` before being handed to
/// `tcf_consensus::ConsensusNode::propose`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Command {
    #[serde(rename = "set")]
    Set { key: String, value: Vec<u8> },
    #[serde(rename = "delete")]
    Delete { key: String },
    #[serde(rename = "addToSet")]
    AddToSet { key: String, value: Vec<u8> },
    #[serde(rename = "lpush")]
    LPush { key: String, values: Vec<Vec<u8>> },
    #[serde(rename = "lrem")]
    LRem { key: String, count: i64, value: Vec<u8> },
    #[serde(rename = "zadd")]
    ZAdd { key: String, score: f64, value: Vec<u8> },
    #[serde(rename = "zremrangebyscore")]
    ZRemRangeByScore { key: String, min: f64, max: f64 },
}

impl Command {
    pub fn encode(&self) -> Vec<u8> {
        rmp_serde::to_vec_named(self).expect("Command is always serializable")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trips() {
        let cmd = Command::ZAdd {
            key: "z".into(),
            score: 1.5,
            value: b"v".to_vec(),
        };
        let encoded = cmd.encode();
        let decoded = Command::decode(&encoded).unwrap();
        match decoded {
            Command::ZAdd { key, score, value } => {
                assert_eq!(key, "z");
                assert_eq!(score, 1.5);
                assert_eq!(value, b"v");
            }
            _ => panic!("wrong variant"),
        }
    }
}
