use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use redis::aio::{MultiplexedConnection, PubSubSink};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::reliability::{CircuitBreaker, ExponentialBackoff};
use crate::error::{BrokerError, Result};

/// Receives every message arriving on a subscribed upstream channel.
pub trait UpstreamSink: Send + Sync + 'static {
    fn on_upstream_message(&self, channel: &str, payload: &str);
}

/// Publish/subscribe transport with one logical channel per room.
///
/// Subscribing to an already-held channel and unsubscribing from one that is
/// not held are both harmless.
#[async_trait]
pub trait ChannelBus: Send + Sync + 'static {
    async fn subscribe(&self, channel: &str) -> Result<()>;
    async fn unsubscribe(&self, channel: &str) -> Result<()>;
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

pub(crate) enum BusCommand {
    Subscribe {
        channel: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        channel: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Publish {
        channel: String,
        payload: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct BusMetrics {
    pub messages_received: AtomicU64,
    pub messages_published: AtomicU64,
    pub command_errors: AtomicU64,
    pub reconnect_count: AtomicU64,
}

// ---------------------------------------------------------------------------
// Redis bus
// ---------------------------------------------------------------------------

/// Upstream bus over Redis pub/sub.
///
/// A single listener task owns the subscriber connection; callers talk to it
/// through a command channel and wait on a oneshot reply.
pub struct RedisBus {
    cmd_tx: mpsc::UnboundedSender<BusCommand>,
    metrics: Arc<BusMetrics>,
    op_timeout: Duration,
}

impl RedisBus {
    pub fn spawn(
        url: String,
        sink: Arc<dyn UpstreamSink>,
        op_timeout: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(BusMetrics::default());
        let handle = tokio::spawn(listener_task(url, sink, cmd_rx, metrics.clone()));
        (
            Self {
                cmd_tx,
                metrics,
                op_timeout,
            },
            handle,
        )
    }

    pub fn metrics(&self) -> &BusMetrics {
        &self.metrics
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(BusCommand::Shutdown);
    }

    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<()>>) -> BusCommand,
    ) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply_tx))
            .map_err(|_| BrokerError::BusUnavailable("listener stopped".into()))?;
        match tokio::time::timeout(self.op_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BrokerError::BusUnavailable("listener dropped request".into())),
            Err(_) => Err(BrokerError::BusUnavailable(format!(
                "no reply within {}ms",
                self.op_timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl ChannelBus for RedisBus {
    async fn subscribe(&self, channel: &str) -> Result<()> {
        let channel = channel.to_owned();
        self.request(|reply| BusCommand::Subscribe { channel, reply })
            .await
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        let channel = channel.to_owned();
        self.request(|reply| BusCommand::Unsubscribe { channel, reply })
            .await
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let channel = channel.to_owned();
        let payload = payload.to_owned();
        self.request(|reply| BusCommand::Publish {
            channel,
            payload,
            reply,
        })
        .await
    }
}

fn connection_lost(e: &redis::RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal()
}

enum RunOutcome {
    Shutdown,
    Lost(String),
}

async fn handle_command(
    cmd: BusCommand,
    sub: &mut PubSubSink,
    pub_conn: &mut MultiplexedConnection,
    held: &mut HashSet<String>,
    metrics: &BusMetrics,
) -> Option<RunOutcome> {
    match cmd {
        BusCommand::Subscribe { channel, reply } => match sub.subscribe(&channel).await {
            Ok(()) => {
                held.insert(channel);
                let _ = reply.send(Ok(()));
                None
            }
            Err(e) => {
                metrics.command_errors.fetch_add(1, Ordering::Relaxed);
                let lost = connection_lost(&e).then(|| RunOutcome::Lost(e.to_string()));
                let _ = reply.send(Err(BrokerError::Subscribe {
                    channel,
                    reason: e.to_string(),
                }));
                lost
            }
        },
        BusCommand::Unsubscribe { channel, reply } => match sub.unsubscribe(&channel).await {
            Ok(()) => {
                held.remove(&channel);
                let _ = reply.send(Ok(()));
                None
            }
            Err(e) => {
                metrics.command_errors.fetch_add(1, Ordering::Relaxed);
                let lost = connection_lost(&e).then(|| RunOutcome::Lost(e.to_string()));
                let _ = reply.send(Err(BrokerError::Unsubscribe {
                    channel,
                    reason: e.to_string(),
                }));
                lost
            }
        },
        BusCommand::Publish {
            channel,
            payload,
            reply,
        } => {
            let res = redis::cmd("PUBLISH")
                .arg(&channel)
                .arg(&payload)
                .query_async::<i64>(pub_conn)
                .await;
            match res {
                Ok(receivers) => {
                    metrics.messages_published.fetch_add(1, Ordering::Relaxed);
                    debug!(channel, receivers, "published upstream");
                    let _ = reply.send(Ok(()));
                    None
                }
                Err(e) => {
                    metrics.command_errors.fetch_add(1, Ordering::Relaxed);
                    let lost = connection_lost(&e).then(|| RunOutcome::Lost(e.to_string()));
                    let _ = reply.send(Err(BrokerError::Publish {
                        channel,
                        reason: e.to_string(),
                    }));
                    lost
                }
            }
        }
        BusCommand::Shutdown => Some(RunOutcome::Shutdown),
    }
}

/// One connected session: resubscribe held channels, then serve commands and
/// forward messages until shutdown or connection loss.
async fn connect_and_run(
    url: &str,
    sink: &Arc<dyn UpstreamSink>,
    cmd_rx: &mut mpsc::UnboundedReceiver<BusCommand>,
    held: &mut HashSet<String>,
    metrics: &BusMetrics,
) -> Result<RunOutcome> {
    let bus_err = |e: redis::RedisError| BrokerError::BusUnavailable(e.to_string());
    let client = redis::Client::open(url).map_err(bus_err)?;
    let mut pub_conn = client
        .get_multiplexed_async_connection()
        .await
        .map_err(bus_err)?;
    let pubsub = client.get_async_pubsub().await.map_err(bus_err)?;
    let (mut sub, mut stream) = pubsub.split();

    for channel in held.iter() {
        sub.subscribe(channel).await.map_err(bus_err)?;
    }

    info!(channels = held.len(), "upstream bus connected");

    let outcome = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    break RunOutcome::Shutdown;
                };
                if let Some(outcome) =
                    handle_command(cmd, &mut sub, &mut pub_conn, held, metrics).await
                {
                    break outcome;
                }
            }
            msg = stream.next() => {
                let Some(msg) = msg else {
                    break RunOutcome::Lost("message stream ended".into());
                };
                metrics.messages_received.fetch_add(1, Ordering::Relaxed);
                match msg.get_payload::<String>() {
                    Ok(payload) => sink.on_upstream_message(msg.get_channel_name(), &payload),
                    Err(e) => warn!(
                        channel = msg.get_channel_name(),
                        error = %e,
                        "dropping non-text upstream message"
                    ),
                }
            }
        }
    };

    Ok(outcome)
}

/// Outer reconnect loop. Held channels survive reconnects and are
/// resubscribed on every new session.
pub(crate) async fn listener_task(
    url: String,
    sink: Arc<dyn UpstreamSink>,
    mut cmd_rx: mpsc::UnboundedReceiver<BusCommand>,
    metrics: Arc<BusMetrics>,
) {
    let mut backoff = ExponentialBackoff::default();
    let mut breaker = CircuitBreaker::new(5, Duration::from_secs(30));
    let mut held: HashSet<String> = HashSet::new();

    loop {
        if !breaker.allow() {
            warn!(
                cooldown_secs = breaker.cooldown().as_secs(),
                "upstream circuit open, holding off reconnect"
            );
            if fail_during_backoff(&mut cmd_rx, breaker.cooldown(), &mut held, &metrics).await {
                return;
            }
            continue;
        }

        let err = match connect_and_run(&url, &sink, &mut cmd_rx, &mut held, &metrics).await {
            Ok(RunOutcome::Shutdown) => {
                info!("upstream bus shut down");
                return;
            }
            Ok(RunOutcome::Lost(reason)) => {
                // A session was established before it dropped.
                backoff.reset();
                breaker.on_success();
                reason
            }
            Err(e) => {
                breaker.on_failure();
                e.to_string()
            }
        };

        metrics.reconnect_count.fetch_add(1, Ordering::Relaxed);
        let delay = backoff.next_delay();
        error!(
            error = %err,
            retry_in_ms = delay.as_millis() as u64,
            "upstream bus connection lost"
        );
        if fail_during_backoff(&mut cmd_rx, delay, &mut held, &metrics).await {
            return;
        }
    }
}

/// Answer commands while disconnected. Returns true on shutdown.
async fn fail_during_backoff(
    cmd_rx: &mut mpsc::UnboundedReceiver<BusCommand>,
    delay: Duration,
    held: &mut HashSet<String>,
    metrics: &BusMetrics,
) -> bool {
    let deadline = tokio::time::Instant::now() + delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return false,
            cmd = cmd_rx.recv() => match cmd {
                Some(BusCommand::Shutdown) | None => {
                    info!("upstream bus shut down while disconnected");
                    return true;
                }
                Some(BusCommand::Subscribe { channel, reply }) => {
                    metrics.command_errors.fetch_add(1, Ordering::Relaxed);
                    let _ = reply.send(Err(BrokerError::Subscribe {
                        channel,
                        reason: "upstream disconnected".into(),
                    }));
                }
                Some(BusCommand::Unsubscribe { channel, reply }) => {
                    // Not resubscribed on reconnect, so the release holds.
                    held.remove(&channel);
                    let _ = reply.send(Ok(()));
                }
                Some(BusCommand::Publish { channel, reply, .. }) => {
                    metrics.command_errors.fetch_add(1, Ordering::Relaxed);
                    let _ = reply.send(Err(BrokerError::Publish {
                        channel,
                        reason: "upstream disconnected".into(),
                    }));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// In-process bus
// ---------------------------------------------------------------------------

/// Channel registry shared by every `MemoryBus` attached to it, standing in
/// for the Redis server in single-node mode and simulated fleets.
#[derive(Default)]
pub struct MemoryHub {
    channels: DashMap<String, DashMap<u64, Arc<dyn UpstreamSink>>>,
    next_id: AtomicU64,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of instances currently subscribed to `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map_or(0, |s| s.len())
    }
}

pub struct MemoryBus {
    hub: Arc<MemoryHub>,
    id: u64,
    sink: Arc<dyn UpstreamSink>,
}

impl MemoryBus {
    pub fn attach(hub: Arc<MemoryHub>, sink: Arc<dyn UpstreamSink>) -> Self {
        let id = hub.next_id.fetch_add(1, Ordering::Relaxed);
        Self { hub, id, sink }
    }
}

#[async_trait]
impl ChannelBus for MemoryBus {
    async fn subscribe(&self, channel: &str) -> Result<()> {
        self.hub
            .channels
            .entry(channel.to_owned())
            .or_default()
            .insert(self.id, self.sink.clone());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        if let Some(subs) = self.hub.channels.get(channel) {
            subs.remove(&self.id);
            if subs.is_empty() {
                drop(subs);
                self.hub.channels.remove_if(channel, |_, s| s.is_empty());
            }
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let sinks: Vec<Arc<dyn UpstreamSink>> = match self.hub.channels.get(channel) {
            Some(subs) => subs.iter().map(|s| s.value().clone()).collect(),
            None => Vec::new(),
        };
        for sink in sinks {
            sink.on_upstream_message(channel, payload);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, String)>>,
    }

    impl UpstreamSink for Recorder {
        fn on_upstream_message(&self, channel: &str, payload: &str) {
            self.seen.lock().push((channel.to_owned(), payload.to_owned()));
        }
    }

    #[tokio::test]
    async fn test_memory_bus_delivers_to_subscribed_instances_only() {
        let hub = MemoryHub::new();
        let r1 = Arc::new(Recorder::default());
        let r2 = Arc::new(Recorder::default());
        let bus1 = MemoryBus::attach(hub.clone(), r1.clone());
        let bus2 = MemoryBus::attach(hub.clone(), r2.clone());

        bus1.subscribe("alpha").await.unwrap();
        bus2.publish("alpha", "hi").await.unwrap();
        bus2.publish("beta", "ignored").await.unwrap();

        assert_eq!(*r1.seen.lock(), vec![("alpha".to_string(), "hi".to_string())]);
        assert!(r2.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_memory_bus_duplicate_subscribe_and_unsubscribe_are_harmless() {
        let hub = MemoryHub::new();
        let r = Arc::new(Recorder::default());
        let bus = MemoryBus::attach(hub.clone(), r.clone());

        bus.subscribe("alpha").await.unwrap();
        bus.subscribe("alpha").await.unwrap();
        assert_eq!(hub.subscriber_count("alpha"), 1);

        bus.unsubscribe("alpha").await.unwrap();
        bus.unsubscribe("alpha").await.unwrap();
        assert_eq!(hub.subscriber_count("alpha"), 0);

        bus.publish("alpha", "late").await.unwrap();
        assert!(r.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_redis_bus_reports_unavailable_when_listener_gone() {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        drop(cmd_rx);
        let bus = RedisBus {
            cmd_tx,
            metrics: Arc::new(BusMetrics::default()),
            op_timeout: Duration::from_millis(50),
        };
        let err = bus.subscribe("alpha").await.unwrap_err();
        assert!(matches!(err, BrokerError::BusUnavailable(_)));
    }

    #[tokio::test]
    async fn test_backoff_window_fails_subscribe_and_releases_unsubscribe() {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let metrics = BusMetrics::default();
        let mut held: HashSet<String> = ["alpha".to_string()].into_iter().collect();

        let (sub_tx, sub_rx) = oneshot::channel();
        cmd_tx
            .send(BusCommand::Subscribe {
                channel: "beta".into(),
                reply: sub_tx,
            })
            .unwrap();
        let (unsub_tx, unsub_rx) = oneshot::channel();
        cmd_tx
            .send(BusCommand::Unsubscribe {
                channel: "alpha".into(),
                reply: unsub_tx,
            })
            .unwrap();
        cmd_tx.send(BusCommand::Shutdown).unwrap();

        let stopped =
            fail_during_backoff(&mut cmd_rx, Duration::from_secs(5), &mut held, &metrics).await;
        assert!(stopped);
        assert!(matches!(
            sub_rx.await.unwrap(),
            Err(BrokerError::Subscribe { .. })
        ));
        assert!(unsub_rx.await.unwrap().is_ok());
        assert!(held.is_empty());
        assert_eq!(metrics.command_errors.load(Ordering::Relaxed), 1);
    }
}
