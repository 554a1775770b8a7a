mod cluster;
mod collections;
mod command;
mod error;
mod fsm;
mod record;
mod store;
mod ttl;
mod wire;

pub use cluster::{http_api_from_raft_addr, Cluster, NodeAddr};
pub use command::Command;
pub use error::KvError;
pub use fsm::Fsm;
pub use record::NodeRecord;
pub use store::KvStore;
pub use ttl::{TtlIndex, TtlProcessor, TTL_SNAPSHOT_KEY};
pub use wire::{ActionType, ErrorBody, ErrorCode, KeyValueResponse};

pub type Result<T> = std::result::Result<T, KvError>;
