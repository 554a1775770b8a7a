//! Topic-filtered pub/sub broker and client: the
//! transport the KV cluster uses for leader discovery and that a node's
//! `tcf_kv::Cluster` join flow bootstraps from.

mod broker;
mod client;
mod connstring;
mod error;
mod frame;

pub use broker::{Broker, OnPublish};
pub use client::{Client, Handler};
pub use connstring::ConnectionString;
pub use error::PubSubError;
pub use frame::Frame;

pub type Result<T> = std::result::Result<T, PubSubError>;
