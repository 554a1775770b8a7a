use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::PubSubError;
use crate::frame::Frame;

/// Hook fired for every relayed message, per `spec.md` §4.4: "Relayed
/// messages also fire a user-supplied `OnPublish(topic,bytes)` hook."
pub type OnPublish = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

type SubscriberId = u64;

struct Subscriber {
    remote_addr: SocketAddr,
    filter: String,
    sender: mpsc::Sender<Frame>,
}

/// Single-server, topic-filtered fan-out broker. Two
/// listeners, mirroring the `mangos` pub-socket/bus-socket split in
/// `examples/original_source/server/mangos_server.go` and
/// `examples/original_source/bus/bus.go`:
/// - the *publish* port: subscribers connect and register a prefix filter,
///   then receive every matching `Frame` the broker emits.
/// - the *relay* port (publish port + 1, `spec.md` §6): external clients
///   connect and push `Frame`s for the broker to fan out to subscribers,
///   the "pull endpoint for external clients to inject messages" from
///   `spec.md` §4.4.
pub struct Broker {
    id: String,
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
    next_id: AtomicU64,
    on_publish: RwLock<Option<OnPublish>>,
    disable_loopback: bool,
    local_ips: Vec<IpAddr>,
}

impl Broker {
    pub fn new(disable_loopback: bool) -> Arc<Self> {
        let local_ips = if disable_loopback {
            if_addrs::get_if_addrs()
                .map(|addrs| addrs.into_iter().map(|a| a.ip()).collect())
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            on_publish: RwLock::new(None),
            disable_loopback,
            local_ips,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn set_on_publish(&self, hook: OnPublish) {
        *self.on_publish.write().await = Some(hook);
    }

    /// Binds the publish listener on `addr` and the relay listener on
    /// `addr`'s port + 1, running both accept loops until
    /// `cancel` fires.
    pub async fn listen(self: Arc<Self>, addr: SocketAddr, cancel: CancellationToken) -> Result<(), PubSubError> {
        let publish_listener = TcpListener::bind(addr).await?;
        let relay_addr = SocketAddr::new(addr.ip(), addr.port() + 1);
        let relay_listener = TcpListener::bind(relay_addr).await?;

        tracing::info!(%addr, %relay_addr, "broker listening");

        let subscriber_loop = {
            let broker = self.clone();
            let cancel = cancel.clone();
            async move { broker.accept_subscribers(publish_listener, cancel).await }
        };
        let relay_loop = {
            let broker = self.clone();
            async move { broker.accept_relays(relay_listener, cancel).await }
        };

        tokio::join!(subscriber_loop, relay_loop);
        Ok(())
    }

    async fn accept_subscribers(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to accept subscriber connection");
                            continue;
                        }
                    };
                    let broker = self.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        broker.serve_subscriber(stream, remote_addr, cancel).await;
                    });
                }
            }
        }
    }

    async fn serve_subscriber(self: Arc<Self>, mut stream: TcpStream, remote_addr: SocketAddr, cancel: CancellationToken) {
        let filter = match Frame::read_from(&mut stream).await {
            Ok(frame) => frame.topic,
            Err(e) => {
                tracing::debug!(%remote_addr, error = %e, "subscriber handshake failed");
                return;
            }
        };

        let (tx, mut rx) = mpsc::channel::<Frame>(128);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().await.insert(
            id,
            Subscriber {
                remote_addr,
                filter: filter.clone(),
                sender: tx,
            },
        );
        tracing::debug!(%remote_addr, %filter, "subscriber registered");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => {
                        if frame.write_to(&mut stream).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }

        self.subscribers.write().await.remove(&id);
        tracing::debug!(%remote_addr, "subscriber dropped");
    }

    async fn accept_relays(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to accept relay connection");
                            continue;
                        }
                    };

                    if self.disable_loopback && self.local_ips.contains(&remote_addr.ip()) {
                        tracing::debug!(%remote_addr, "refusing loopback relay connection");
                        continue;
                    }

                    let broker = self.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        broker.serve_relay(stream, remote_addr, cancel).await;
                    });
                }
            }
        }
    }

    async fn serve_relay(self: Arc<Self>, mut stream: TcpStream, remote_addr: SocketAddr, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                frame = Frame::read_from(&mut stream) => match frame {
                    Ok(frame) => {
                        if let Some(hook) = self.on_publish.read().await.as_ref() {
                            hook(&frame.topic, &frame.envelope);
                        }
                        self.fan_out(frame).await;
                    }
                    Err(_) => {
                        tracing::debug!(%remote_addr, "relay connection closed");
                        return;
                    }
                }
            }
        }
    }

    /// Delivers `frame` to every subscriber whose filter prefix-matches its
    /// topic. Best-effort: a full channel or a dropped connection is
    /// silently skipped, matching `spec.md` §4.4's "pub/sub is lossy".
    async fn fan_out(&self, frame: Frame) {
        let subscribers = self.subscribers.read().await;
        for subscriber in subscribers.values() {
            if frame.matches(&subscriber.filter) {
                let _ = subscriber.sender.try_send(frame.clone());
            }
        }
    }

    /// Publishes `envelope` on `topic`, indistinguishable from an external
    /// relay publish except no remote connection is involved. This is the
    /// "publish endpoint for in-process use" `spec.md` §4.4 asks for.
    pub async fn publish(&self, topic: impl Into<String>, envelope: Vec<u8>) {
        self.fan_out(Frame::new(topic, envelope)).await;
    }

    /// Remote addresses of every currently connected subscriber.
    pub async fn connections(&self) -> Vec<String> {
        self.subscribers.read().await.values().map(|s| s.remote_addr.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn connect_subscriber(addr: SocketAddr, filter: &str) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        Frame::new(filter, Vec::new()).write_to(&mut stream).await.unwrap();
        stream
    }

    #[tokio::test]
    async fn fans_out_to_matching_subscribers_only() {
        let broker = Broker::new(false);
        let cancel = CancellationToken::new();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        let bound = listener.local_addr().unwrap();
        drop(listener);

        let broker_clone = broker.clone();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move { broker_clone.listen(bound, cancel_clone).await.unwrap() });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut matching = connect_subscriber(bound, "tcf.cluster").await;
        let mut other = connect_subscriber(bound, "tcf.other").await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        broker.publish("tcf.cluster.leader", b"hello".to_vec()).await;

        let received = Frame::read_from(&mut matching).await.unwrap();
        assert_eq!(received.envelope, b"hello");

        other.write_u8(0).await.ok();
        let mut buf = [0u8; 1];
        let result = tokio::time::timeout(std::time::Duration::from_millis(100), other.read(&mut buf)).await;
        assert!(result.is_err() || matches!(result, Ok(Ok(0))));

        cancel.cancel();
    }

    #[tokio::test]
    async fn relay_connections_fire_on_publish_hook() {
        let broker = Broker::new(false);
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        broker
            .set_on_publish(Arc::new(move |_topic, _bytes| {
                fired_clone.store(true, Ordering::SeqCst);
            }))
            .await;

        let cancel = CancellationToken::new();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        let bound = listener.local_addr().unwrap();
        drop(listener);

        let broker_clone = broker.clone();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move { broker_clone.listen(bound, cancel_clone).await.unwrap() });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let relay_addr = SocketAddr::new(bound.ip(), bound.port() + 1);
        let mut relay = TcpStream::connect(relay_addr).await.unwrap();
        Frame::new("tcf.cluster.leader", b"hi".to_vec()).write_to(&mut relay).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert!(fired.load(Ordering::SeqCst));
        cancel.cancel();
    }
}
