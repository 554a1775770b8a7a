use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::PubSubError;
use crate::frame::Frame;

/// Invoked for every message delivered to a subscription. Per `spec.md`
/// §4.5 ("must not block indefinitely"), handlers run on the connection's
/// receive task; anything that wants real concurrency should hand the
/// payload off to its own worker pool rather than await inside the handler.
pub type Handler = Arc<dyn Fn(Frame) + Send + Sync>;

struct Subscription {
    #[allow(dead_code)]
    task: tokio::task::JoinHandle<()>,
}

struct Broadcast {
    stop: oneshot::Sender<()>,
}

/// Connects to a [`crate::broker::Broker`], subscribes per topic with a
/// per-topic handler, publishes, and runs periodic broadcasts. Grounded on
/// `examples/original_source/client/mangos_client.go`'s `MangosClient`
/// (`socketMap`, `Subscribe`/`Publish`/`Broadcast`/`StopBroadcast`), adapted
/// from a `mangos` pub/sub socket pair to this crate's length-prefixed TCP
/// `Frame`s on the broker's publish/relay port pair.
pub struct Client {
    broker_addr: SocketAddr,
    sender_id: String,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    broadcasts: Mutex<HashMap<String, Broadcast>>,
    publisher: Mutex<Option<TcpStream>>,
    disable_publisher: bool,
}

impl Client {
    pub fn new(broker_addr: SocketAddr, sender_id: impl Into<String>, disable_publisher: bool) -> Arc<Self> {
        Arc::new(Self {
            broker_addr,
            sender_id: sender_id.into(),
            subscriptions: Mutex::new(HashMap::new()),
            broadcasts: Mutex::new(HashMap::new()),
            publisher: Mutex::new(None),
            disable_publisher,
        })
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    fn relay_addr(&self) -> SocketAddr {
        SocketAddr::new(self.broker_addr.ip(), self.broker_addr.port() + 1)
    }

    async fn publisher_stream(&self) -> Result<(), PubSubError> {
        if self.disable_publisher {
            return Ok(());
        }
        let mut guard = self.publisher.lock().await;
        if guard.is_none() {
            *guard = Some(TcpStream::connect(self.relay_addr()).await?);
        }
        Ok(())
    }

    /// Starts a receiver for `filter`, invoking `handler` for every message
    /// whose topic prefix-matches it. Multiple subscribes open independent
    /// connections to the broker's publish port, mirroring the one
    /// `sub.NewSocket()` per filter in the original client.
    pub async fn subscribe(self: &Arc<Self>, filter: impl Into<String>, handler: Handler) -> Result<(), PubSubError> {
        let filter = filter.into();
        let mut stream = TcpStream::connect(self.broker_addr).await?;
        Frame::new(filter.clone(), Vec::new()).write_to(&mut stream).await?;

        let task = tokio::spawn(async move {
            loop {
                match Frame::read_from(&mut stream).await {
                    Ok(frame) => handler(frame),
                    Err(_) => break,
                }
            }
        });

        self.subscriptions.lock().await.insert(filter, Subscription { task });
        Ok(())
    }

    /// Publishes `envelope` on `topic` over the relay port. At-most-once,
    /// no persistence.
    pub async fn publish(&self, topic: impl Into<String>, envelope: Vec<u8>) -> Result<(), PubSubError> {
        if self.disable_publisher {
            return Ok(());
        }
        self.publisher_stream().await?;
        let mut guard = self.publisher.lock().await;
        let stream = guard.as_mut().expect("publisher_stream ensures Some");
        if let Err(e) = Frame::new(topic, envelope).write_to(stream).await {
            *guard = None;
            return Err(e);
        }
        Ok(())
    }

    /// Republishes `envelope` on `topic` every `interval` until
    /// [`Client::stop_broadcast`] is called for the same topic.
    pub async fn broadcast(
        self: &Arc<Self>,
        topic: impl Into<String>,
        envelope: Vec<u8>,
        interval: Duration,
    ) -> Result<(), PubSubError> {
        let topic = topic.into();
        let mut broadcasts = self.broadcasts.lock().await;
        if broadcasts.contains_key(&topic) {
            return Err(PubSubError::AlreadyBroadcasting(topic));
        }

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let client = self.clone();
        let loop_topic = topic.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it per spec's "every N seconds"
            loop {
                tokio::select! {
                    _ = &mut stop_rx => return,
                    _ = ticker.tick() => {
                        if let Err(e) = client.publish(loop_topic.clone(), envelope.clone()).await {
                            tracing::warn!(topic = %loop_topic, error = %e, "broadcast publish failed");
                        }
                    }
                }
            }
        });

        broadcasts.insert(topic, Broadcast { stop: stop_tx });
        Ok(())
    }

    pub async fn stop_broadcast(&self, topic: &str) -> Result<(), PubSubError> {
        let broadcast = self
            .broadcasts
            .lock()
            .await
            .remove(topic)
            .ok_or_else(|| PubSubError::NotBroadcasting(topic.to_string()))?;
        let _ = broadcast.stop.send(());
        Ok(())
    }

    /// Tears down all subscriptions and broadcasts. Idempotent.
    pub async fn stop(&self) {
        for (_, broadcast) in self.broadcasts.lock().await.drain() {
            let _ = broadcast.stop.send(());
        }
        for (_, subscription) in self.subscriptions.lock().await.drain() {
            subscription.task.abort();
        }
        *self.publisher.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    async fn spawn_broker() -> (SocketAddr, CancellationToken) {
        let broker = Broker::new(false);
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        let bound = listener.local_addr().unwrap();
        drop(listener);

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move { broker.listen(bound, cancel_clone).await.unwrap() });
        tokio::time::sleep(Duration::from_millis(50)).await;
        (bound, cancel)
    }

    #[tokio::test]
    async fn subscribe_then_publish_delivers_message() {
        let (addr, cancel) = spawn_broker().await;
        let client = Client::new(addr, "node-1", false);

        let received = Arc::new(AtomicUsize::new(0));
        let received_clone = received.clone();
        client
            .subscribe("tcf.cluster", Arc::new(move |_frame| {
                received_clone.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        client.publish("tcf.cluster.leader", b"hi".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(received.load(Ordering::SeqCst), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn broadcast_repeats_until_stopped() {
        let (addr, cancel) = spawn_broker().await;
        let publisher = Client::new(addr, "leader", false);
        let subscriber = Client::new(addr, "joiner", false);

        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        subscriber
            .subscribe("tcf.cluster.leader", Arc::new(move |_frame| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        publisher
            .broadcast("tcf.cluster.leader", b"leader-addr".to_vec(), Duration::from_millis(30))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        publisher.stop_broadcast("tcf.cluster.leader").await.unwrap();
        let seen_before = count.load(Ordering::SeqCst);
        assert!(seen_before >= 2);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen_before);

        cancel.cancel();
    }

    #[tokio::test]
    async fn stopping_an_unknown_broadcast_is_an_error() {
        let (addr, cancel) = spawn_broker().await;
        let client = Client::new(addr, "node", false);
        let err = client.stop_broadcast("nowhere").await.unwrap_err();
        assert!(matches!(err, PubSubError::NotBroadcasting(_)));
        cancel.cancel();
    }

    #[tokio::test]
    async fn broadcasting_twice_on_the_same_topic_is_rejected() {
        let (addr, cancel) = spawn_broker().await;
        let client = Client::new(addr, "node", false);
        client.broadcast("t", Vec::new(), Duration::from_secs(10)).await.unwrap();
        let err = client.broadcast("t", Vec::new(), Duration::from_secs(10)).await.unwrap_err();
        assert!(matches!(err, PubSubError::AlreadyBroadcasting(_)));
        cancel.cancel();
    }
}
