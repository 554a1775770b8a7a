mod config;
mod http;
mod transport;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tcf_codec::{HmacVerifier, NoopVerifier, Verifier};
use tcf_consensus::ConsensusNode;
use tcf_discovery::{discover_leader, DiscoveryOutcome, LeaderBroadcaster};
use tcf_kv::{Fsm, KvStore};
use tcf_pubsub::{Broker, Client as PubSubClient, ConnectionString};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use config::NodeConfig;
use transport::HttpTransport;

/// Entry point. Wires the consensus, KV/TTL, discovery and REST layers
/// together the way `examples/original_source/distributed_store/rafty/server.go`'s
/// `NewServer`/`Start` do, then runs every long-lived component under one
/// `CancellationToken` until SIGINT/SIGTERM.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = NodeConfig::parse();
    run(config).await
}

async fn run(config: NodeConfig) -> Result<()> {
    let self_addr = config.raft_addr.to_string();

    let verifier: Arc<dyn Verifier> = match &config.hmac_key {
        Some(key) => Arc::new(HmacVerifier::new(key.clone().into_bytes())),
        None => Arc::new(NoopVerifier),
    };

    let fsm = Fsm::new();
    let transport = Arc::new(HttpTransport::new());
    let node = ConsensusNode::new(self_addr.clone(), Vec::new(), transport, fsm.clone());

    let store = KvStore::new_with_ttl_tuning(
        node.clone(),
        fsm.clone(),
        &config.raft_dir,
        config.ttl_chunk_size,
        config.ttl_tick(),
    );

    store
        .cluster()
        .open(&self_addr, config.reset_peers_on_load, config.single_server_mode)
        .await
        .context("failed to load peers.json")?;

    let discovery = match &config.discovery_addr {
        Some(raw) => {
            let conn = ConnectionString::parse(raw).context("invalid --discovery-addr")?;
            Some(PubSubClient::new(conn.addr, self_addr.clone(), conn.disable_publisher()))
        }
        None => None,
    };

    join_cluster(&config, &store, discovery.as_ref(), &verifier).await?;

    let cancel = CancellationToken::new();
    let mut tasks = tokio::task::JoinSet::new();

    if let Some(broker_addr) = config.broker_addr {
        let broker = Broker::new(config.disable_loopback);
        let cancel = cancel.clone();
        tasks.spawn(async move {
            if let Err(e) = broker.listen(broker_addr, cancel).await {
                tracing::error!(error = %e, "discovery broker failed");
            }
        });
    }

    {
        let node = node.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move { node.run(cancel).await });
    }
    {
        let ttl = store.ttl_processor();
        let cancel = cancel.clone();
        tasks.spawn(async move { ttl.run(cancel).await });
    }
    if let Some(client) = discovery.clone() {
        let broadcaster = LeaderBroadcaster::new(client, node.clone(), config.http_addr().to_string(), verifier.clone());
        let cancel = cancel.clone();
        tasks.spawn(async move { broadcaster.run(cancel).await });
    }

    let consensus_listener = TcpListener::bind(config.raft_addr)
        .await
        .with_context(|| format!("failed to bind consensus address {}", config.raft_addr))?;
    {
        let router = http::consensus_router(node.clone());
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let _ = axum::serve(consensus_listener, router)
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await;
        });
    }

    let kv_listener = TcpListener::bind(config.http_addr())
        .await
        .with_context(|| format!("failed to bind HTTP address {}", config.http_addr()))?;
    {
        let router = http::kv_router(http::AppState { store: store.clone() });
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let _ = axum::serve(kv_listener, router)
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await;
        });
    }

    tracing::info!(raft_addr = %config.raft_addr, http_addr = %config.http_addr(), "node started");

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received, stopping");
    cancel.cancel();

    while tasks.join_next().await.is_some() {}

    if let Some(client) = discovery {
        client.stop().await;
    }

    Ok(())
}

/// Resolves who to join before bringing consensus up: an explicit
/// `--join-addr` wins, otherwise discovery is consulted. A discovery timeout
/// falls back to single-server mode and elects this node regardless of
/// `--single-server-mode` (`spec.md` §4.7's "the node falls back to
/// single-server mode and attempts to elect itself"); with no `--join-addr`
/// and no discovery bus configured, the node relies on whatever
/// `Cluster::open` already applied from `--single-server-mode`.
async fn join_cluster(
    config: &NodeConfig,
    store: &Arc<KvStore<HttpTransport>>,
    discovery: Option<&Arc<PubSubClient>>,
    verifier: &Arc<dyn Verifier>,
) -> Result<()> {
    if store.cluster().node().peers().await.iter().any(|p| p != &config.raft_addr.to_string()) {
        return Ok(());
    }

    let leader_http_addr = if let Some(join_addr) = config.join_addr {
        let mut http = join_addr;
        http.set_port(http.port().saturating_sub(100));
        Some(http.to_string())
    } else if let Some(client) = discovery {
        match discover_leader(client, verifier.clone(), config.join_timeout()).await {
            DiscoveryOutcome::Found(addr) => Some(addr),
            DiscoveryOutcome::TimedOut => {
                tracing::info!("no leader discovered within the join timeout, electing self as single-server");
                store.cluster().node().become_single_server_leader().await;
                None
            }
        }
    } else {
        None
    };

    let Some(leader_http_addr) = leader_http_addr else {
        return Ok(());
    };

    let client = reqwest::Client::new();
    let body = serde_json::json!({ "addr": config.raft_addr.to_string() });
    client
        .post(format!("http://{leader_http_addr}/join"))
        .json(&body)
        .send()
        .await
        .context("failed to contact leader to join cluster")?
        .error_for_status()
        .context("leader rejected join request")?;

    Ok(())
}
