//! Change feed client
//!
//! One websocket connection to the broker carries every topic. The client
//! sends `{"subscribe": [topic]}` once per new topic and the broker pushes
//! `{"topic": ..., "data": ...}` frames. The reader task only routes frames:
//! each topic has its own worker task draining a queue, so handlers see the
//! events of a topic in send order and a handler stuck on one topic does not
//! hold up the others.
//!
//! There is no reconnection: once the connection drops the subscriber keeps
//! serving from its cache.

use async_trait::async_trait;
use dshare_core::DatasetMeta;
use futures::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_websockets::{ClientBuilder, Message, WebSocketStream};

use crate::error::{Result, SyncError};

/// Topic on which the broker announces new roots
pub const NEW_ROOT_TOPIC: &str = "@new";

/// Client → broker subscription request
#[derive(Debug, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub subscribe: Vec<String>,
}

/// Broker → client message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedFrame {
    pub topic: String,
    pub data: serde_json::Value,
}

/// Payload of a root topic: upsert when `metadata` is set, delete otherwise
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetEvent {
    pub path: String,
    #[serde(default)]
    pub metadata: Option<DatasetMeta>,
    #[serde(default)]
    pub etag: Option<String>,
}

impl DatasetEvent {
    pub fn is_delete(&self) -> bool {
        self.metadata.is_none()
    }
}

/// Receives the payloads of the topics it was subscribed to
#[async_trait]
pub trait FeedHandler: Send + Sync {
    async fn handle(&self, topic: &str, payload: serde_json::Value);
}

type WsSink = Pin<Box<dyn Sink<Message, Error = tokio_websockets::Error> + Send>>;
type HandlerList = Arc<RwLock<Vec<Arc<dyn FeedHandler>>>>;
type Topics = Arc<Mutex<HashMap<String, Topic>>>;

/// Handlers of one topic and the worker delivering to them
struct Topic {
    handlers: HandlerList,
    queue: mpsc::UnboundedSender<serde_json::Value>,
    worker: JoinHandle<()>,
}

impl Topic {
    fn spawn(name: &str, handler: Arc<dyn FeedHandler>) -> Self {
        let handlers: HandlerList = Arc::new(RwLock::new(vec![handler]));
        let (queue, mut rx) = mpsc::unbounded_channel::<serde_json::Value>();
        let deliver_to = handlers.clone();
        let name = name.to_string();

        let worker = tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                let targets = deliver_to.read().unwrap_or_else(PoisonError::into_inner).clone();
                for handler in targets {
                    handler.handle(&name, payload.clone()).await;
                }
            }
            tracing::trace!("Feed worker for {} stopped", name);
        });

        Self {
            handlers,
            queue,
            worker,
        }
    }
}

pub struct FeedClient {
    sink: tokio::sync::Mutex<WsSink>,
    topics: Topics,
    reader: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    abort: AbortHandle,
}

impl FeedClient {
    /// Connect to a broker websocket URL (`ws://host:port/pubsub`)
    pub async fn connect(url: &str) -> Result<Self> {
        let uri: hyper::Uri = url
            .parse()
            .map_err(|e| SyncError::Feed(format!("bad feed url {:?}: {}", url, e)))?;
        let (ws, _response) = ClientBuilder::from_uri(uri).connect().await?;
        tracing::info!("Connected to feed at {}", url);
        Ok(Self::from_stream(ws))
    }

    /// Run the client over an established websocket
    pub fn from_stream<S>(ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, mut stream) = ws.split();
        let topics = Topics::default();
        let route_to = topics.clone();

        let reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(msg) if msg.is_close() => break,
                    Ok(msg) => {
                        if let Some(text) = msg.as_text() {
                            route(&route_to, text);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Feed connection failed: {}", e);
                        break;
                    }
                }
            }
            tracing::info!("Feed closed, no further change events this session");
        });

        Self {
            sink: tokio::sync::Mutex::new(Box::pin(sink)),
            topics,
            abort: reader.abort_handle(),
            reader: tokio::sync::Mutex::new(Some(reader)),
        }
    }

    /// Invoke `handler` for every future message on `topic`
    pub async fn subscribe(&self, topic: &str, handler: Arc<dyn FeedHandler>) -> Result<()> {
        let first = {
            let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
            match topics.get(topic) {
                Some(existing) => {
                    existing
                        .handlers
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(handler);
                    false
                }
                None => {
                    topics.insert(topic.to_string(), Topic::spawn(topic, handler));
                    true
                }
            }
        };
        if first {
            let request = serde_json::to_string(&SubscribeRequest {
                subscribe: vec![topic.to_string()],
            })
            .map_err(|e| SyncError::Feed(e.to_string()))?;
            self.sink.lock().await.send(Message::text(request)).await?;
            tracing::debug!("Subscribed to topic {}", topic);
        }
        Ok(())
    }

    /// Topics with at least one handler, sorted
    pub fn topics(&self) -> Vec<String> {
        let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = topics.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether the connection is still being read
    pub fn is_connected(&self) -> bool {
        !self.abort.is_finished()
    }

    /// Close the connection and let the topic workers drain, waiting at
    /// most `timeout`
    ///
    /// Exceeding the timeout is logged and the reader and workers are aborted.
    pub async fn disconnect(&self, timeout: Duration) {
        let mut tasks = vec![self.abort.clone()];
        tasks.extend(
            self.topics
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .map(|t| t.worker.abort_handle()),
        );

        let close = async {
            if let Err(e) = self.sink.lock().await.close().await {
                tracing::debug!("Feed close frame not sent: {}", e);
            }
            if let Some(reader) = self.reader.lock().await.take() {
                let _ = reader.await;
            }
            // dropping the queues ends each worker once it is drained
            let workers: Vec<JoinHandle<()>> = self
                .topics
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain()
                .map(|(_, t)| t.worker)
                .collect();
            for worker in workers {
                let _ = worker.await;
            }
        };
        if tokio::time::timeout(timeout, close).await.is_err() {
            tracing::warn!("Feed disconnect did not complete within {:?}", timeout);
            for task in tasks {
                task.abort();
            }
        }
    }
}

/// Queue a frame for its topic's worker; never waits on a handler
fn route(topics: &Topics, text: &str) {
    let frame: FeedFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!("Ignoring malformed feed frame: {}", e);
            return;
        }
    };
    let topics = topics.lock().unwrap_or_else(PoisonError::into_inner);
    match topics.get(&frame.topic) {
        Some(topic) => {
            if topic.queue.send(frame.data).is_err() {
                tracing::debug!("Feed worker for {} is gone, dropping event", frame.topic);
            }
        }
        None => tracing::debug!("No handler for topic {}", frame.topic),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_websockets::ServerBuilder;

    struct Collect(mpsc::UnboundedSender<(String, serde_json::Value)>);

    #[async_trait]
    impl FeedHandler for Collect {
        async fn handle(&self, topic: &str, payload: serde_json::Value) {
            let _ = self.0.send((topic.to_string(), payload));
        }
    }

    fn pair() -> (FeedClient, WebSocketStream<tokio::io::DuplexStream>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let client = FeedClient::from_stream(ClientBuilder::new().take_over(client));
        (client, ServerBuilder::new().serve(server))
    }

    async fn next_text(ws: &mut WebSocketStream<tokio::io::DuplexStream>) -> String {
        loop {
            let msg = ws.next().await.unwrap().unwrap();
            if let Some(text) = msg.as_text() {
                return text.to_string();
            }
        }
    }

    #[tokio::test]
    async fn test_subscribe_and_dispatch_in_order() {
        let (client, mut broker) = pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.subscribe("foo", Arc::new(Collect(tx.clone()))).await.unwrap();
        client.subscribe("foo", Arc::new(Collect(tx))).await.unwrap();

        // second handler on the same topic sends no new request
        let request: SubscribeRequest = serde_json::from_str(&next_text(&mut broker).await).unwrap();
        assert_eq!(request.subscribe, vec!["foo"]);
        assert_eq!(client.topics(), vec!["foo"]);

        for (topic, n) in [("foo", 1), ("bar", 2), ("foo", 3)] {
            let frame = serde_json::json!({"topic": topic, "data": {"n": n}});
            broker.send(Message::text(frame.to_string())).await.unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..4 {
            let (topic, payload) = rx.recv().await.unwrap();
            assert_eq!(topic, "foo");
            seen.push(payload["n"].as_i64().unwrap());
        }
        assert_eq!(seen, vec![1, 1, 3, 3]);
    }

    /// Delivers only while it can take the gate
    struct Gated {
        gate: Arc<tokio::sync::Mutex<()>>,
        tx: mpsc::UnboundedSender<(String, serde_json::Value)>,
    }

    #[async_trait]
    impl FeedHandler for Gated {
        async fn handle(&self, topic: &str, payload: serde_json::Value) {
            let _open = self.gate.lock().await;
            let _ = self.tx.send((topic.to_string(), payload));
        }
    }

    #[tokio::test]
    async fn test_stalled_topic_does_not_block_others() {
        let (client, mut broker) = pair();
        let gate = Arc::new(tokio::sync::Mutex::new(()));
        let closed = gate.clone().lock_owned().await;

        let (slow_tx, mut slow_rx) = mpsc::unbounded_channel();
        let (fast_tx, mut fast_rx) = mpsc::unbounded_channel();
        client
            .subscribe("slow", Arc::new(Gated { gate, tx: slow_tx }))
            .await
            .unwrap();
        client.subscribe("fast", Arc::new(Collect(fast_tx))).await.unwrap();
        next_text(&mut broker).await;
        next_text(&mut broker).await;

        for (topic, n) in [("slow", 1), ("slow", 2), ("fast", 3)] {
            let frame = serde_json::json!({"topic": topic, "data": {"n": n}});
            broker.send(Message::text(frame.to_string())).await.unwrap();
        }

        let (topic, payload) = tokio::time::timeout(Duration::from_secs(5), fast_rx.recv())
            .await
            .expect("fast topic held up by the slow one")
            .unwrap();
        assert_eq!(topic, "fast");
        assert_eq!(payload["n"], 3);
        assert!(slow_rx.try_recv().is_err());

        drop(closed);
        for n in [1, 2] {
            let (topic, payload) = slow_rx.recv().await.unwrap();
            assert_eq!(topic, "slow");
            assert_eq!(payload["n"], n);
        }
    }

    #[tokio::test]
    async fn test_disconnect_drains_queued_events() {
        let (client, mut broker) = pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.subscribe("foo", Arc::new(Collect(tx))).await.unwrap();
        next_text(&mut broker).await;

        for n in 0..3 {
            let frame = serde_json::json!({"topic": "foo", "data": {"n": n}});
            broker.send(Message::text(frame.to_string())).await.unwrap();
        }
        broker.close().await.unwrap();
        drop(broker);
        for _ in 0..100 {
            if !client.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        client.disconnect(Duration::from_secs(5)).await;

        let mut seen = Vec::new();
        while let Ok((_, payload)) = rx.try_recv() {
            seen.push(payload["n"].as_i64().unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2]);
        assert!(client.topics().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skipped() {
        let (client, mut broker) = pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.subscribe("foo", Arc::new(Collect(tx))).await.unwrap();
        next_text(&mut broker).await;

        broker.send(Message::text("not json".to_string())).await.unwrap();
        let frame = serde_json::json!({"topic": "foo", "data": {"path": "a.dsc"}});
        broker.send(Message::text(frame.to_string())).await.unwrap();

        let (_, payload) = rx.recv().await.unwrap();
        let event: DatasetEvent = serde_json::from_value(payload).unwrap();
        assert_eq!(event.path, "a.dsc");
        assert!(event.is_delete());
    }

    #[tokio::test]
    async fn test_disconnect_is_bounded() {
        // the broker side never answers the close handshake
        let (client, _broker) = pair();
        let started = std::time::Instant::now();
        client.disconnect(Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_broker_close_ends_reader() {
        let (client, mut broker) = pair();
        broker.close().await.unwrap();
        drop(broker);
        for _ in 0..100 {
            if !client.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!client.is_connected());
    }
}
