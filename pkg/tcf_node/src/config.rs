use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Per-instance node configuration, built via `clap::Parser` with env-var
/// fallback. Constructed once at startup and threaded explicitly through
/// every component, rather than living behind a process-wide singleton.
#[derive(Debug, Clone, Parser)]
#[command(name = "tcf-node", about = "A replicated KV cluster node")]
pub struct NodeConfig {
    /// Directory holding the consensus log, peers.json, and snapshots.
    #[arg(long, env = "TCF_RAFT_DIR")]
    pub raft_dir: PathBuf,

    /// This node's consensus (Raft) bind address.
    #[arg(long, env = "TCF_RAFT_ADDR")]
    pub raft_addr: SocketAddr,

    /// Address of an existing cluster member to join at startup. Omit to
    /// rely on discovery or `--single-server-mode`.
    #[arg(long, env = "TCF_JOIN_ADDR")]
    pub join_addr: Option<SocketAddr>,

    /// Connection string for the discovery pub/sub broker, e.g.
    /// `mangos://10.0.0.1:9100?interval=5`.
    #[arg(long, env = "TCF_DISCOVERY_ADDR")]
    pub discovery_addr: Option<String>,

    /// Bind and host the discovery pub/sub broker on this address (and its
    /// relay port, `addr`'s port + 1) from this process, per `spec.md`
    /// §4.4/§4.7. Set on exactly one node per cluster (or run a standalone
    /// process with only this flag set); every node, including this one,
    /// still points `--discovery-addr` at wherever the broker is reachable.
    #[arg(long, env = "TCF_BROKER_ADDR")]
    pub broker_addr: Option<SocketAddr>,

    /// Shared HMAC key used to sign/verify discovery envelopes. Omitted
    /// means envelope verification is disabled (`NoopVerifier`).
    #[arg(long, env = "TCF_HMAC_KEY")]
    pub hmac_key: Option<String>,

    #[arg(long, env = "TCF_TTL_TICK_SECS", default_value_t = 5)]
    pub ttl_tick_secs: u64,

    #[arg(long, env = "TCF_TTL_CHUNK_SIZE", default_value_t = 100)]
    pub ttl_chunk_size: usize,

    /// How long a joining node waits for a discovery announcement before
    /// falling back to single-server mode.
    #[arg(long, env = "TCF_JOIN_TIMEOUT_SECS", default_value_t = 60)]
    pub join_timeout_secs: u64,

    /// Rewrite `peers.json` to contain only this node before opening the
    /// consensus log.
    #[arg(long, env = "TCF_RESET_PEERS_ON_LOAD", default_value_t = false)]
    pub reset_peers_on_load: bool,

    /// Elect self immediately if the persisted peer set has at most one
    /// entry.
    #[arg(long, env = "TCF_SINGLE_SERVER_MODE", default_value_t = false)]
    pub single_server_mode: bool,

    /// Refuse inbound relay connections from this process's own interface
    /// IPs.
    #[arg(long, env = "TCF_DISABLE_LOOPBACK", default_value_t = false)]
    pub disable_loopback: bool,

    /// Skip creating an outbound pub/sub publish channel.
    #[arg(long, env = "TCF_DISABLE_PUBLISHER", default_value_t = false)]
    pub disable_publisher: bool,
}

impl NodeConfig {
    /// KV HTTP address derived from `raft_addr`: consensus port minus 100.
    pub fn http_addr(&self) -> SocketAddr {
        let mut addr = self.raft_addr;
        addr.set_port(addr.port().saturating_sub(100));
        addr
    }

    pub fn ttl_tick(&self) -> Duration {
        Duration::from_secs(self.ttl_tick_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_addr_is_consensus_port_minus_100() {
        let config = NodeConfig {
            raft_dir: PathBuf::from("/tmp/x"),
            raft_addr: "10.0.0.4:9090".parse().unwrap(),
            join_addr: None,
            discovery_addr: None,
            broker_addr: None,
            hmac_key: None,
            ttl_tick_secs: 5,
            ttl_chunk_size: 100,
            join_timeout_secs: 60,
            reset_peers_on_load: false,
            single_server_mode: false,
            disable_loopback: false,
            disable_publisher: false,
        };
        assert_eq!(config.http_addr(), "10.0.0.4:8990".parse().unwrap());
    }
}
