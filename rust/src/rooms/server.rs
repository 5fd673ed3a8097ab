// =============================================================================
// WebSocket transport: tokio + tungstenite.
//
//   - Origin allow-list enforced in the handshake callback
//   - One write task per connection with frame coalescing (feed + try_recv +
//     single flush)
//   - Inbound frames handled in order, so a connection's joins always finish
//     before its disconnect cleanup starts
// =============================================================================

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::broker::RoomBroker;
use super::protocol::{ClientEvent, ServerEvent};
use super::router::FrameSender;
use super::snapshot::SnapshotReader;
use crate::error::Result;

const MAX_COALESCED_FRAMES: usize = 64;

#[derive(Clone, Debug)]
pub struct ServerSettings {
    pub allowed_origins: Vec<String>,
    pub max_connections: usize,
}

struct ServerState {
    broker: Arc<RoomBroker>,
    snapshots: Arc<SnapshotReader>,
    allowed_origins: Arc<Vec<String>>,
    max_connections: usize,
}

pub struct RoomServer {
    state: Arc<ServerState>,
    shutdown: CancellationToken,
}

/// `*` in the allow-list admits any origin.
pub(crate) fn origin_allowed(allowed: &[String], origin: &str) -> bool {
    allowed
        .iter()
        .any(|a| a == "*" || a.trim_end_matches('/') == origin.trim_end_matches('/'))
}

impl RoomServer {
    pub fn new(
        broker: Arc<RoomBroker>,
        snapshots: Arc<SnapshotReader>,
        settings: ServerSettings,
    ) -> Self {
        Self {
            state: Arc::new(ServerState {
                broker,
                snapshots,
                allowed_origins: Arc::new(settings.allowed_origins),
                max_connections: settings.max_connections,
            }),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept connections until the shutdown token fires, then ask every
    /// open connection to close.
    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, origins = ?self.state.allowed_origins, "room server listening");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(%peer, error = %e, "failed to set TCP_NODELAY");
                        }
                        tokio::spawn(handle_connection(stream, peer, self.state.clone()));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }
        let open = self.state.broker.router().connection_count();
        info!(open, "room server stopping");
        self.state.broker.router().close_all();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Connection handler
// ---------------------------------------------------------------------------

async fn handle_connection(stream: TcpStream, peer: SocketAddr, state: Arc<ServerState>) {
    let allowed = state.allowed_origins.clone();
    let ws_stream = match tokio_tungstenite::accept_hdr_async(
        stream,
        move |req: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
            let origin = req.headers().get("origin").and_then(|v| v.to_str().ok());
            match origin {
                Some(origin) if !origin_allowed(&allowed, origin) => {
                    let mut rejection = ErrorResponse::new(Some("origin not allowed".into()));
                    *rejection.status_mut() = StatusCode::FORBIDDEN;
                    Err(rejection)
                }
                _ => Ok(response),
            }
        },
    )
    .await
    {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, error = %e, "websocket handshake rejected");
            return;
        }
    };

    let conn_id = Uuid::now_v7().to_string();
    let (mut write_half, mut read_half) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let router = state.broker.router();
    if !router.register(&conn_id, tx.clone(), state.max_connections) {
        warn!(%peer, max = state.max_connections, "connection limit reached, rejecting");
        let _ = write_half.send(Message::Close(None)).await;
        return;
    }
    debug!(conn_id, %peer, "connection opened");

    // Write task: feed queued frames, coalesce what is already waiting, then
    // flush once.
    let write_task = tokio::spawn(async move {
        while let Some(first) = rx.recv().await {
            let mut closing = matches!(first, Message::Close(_));
            if write_half.feed(first).await.is_err() {
                break;
            }
            let mut batched = 1;
            while !closing && batched < MAX_COALESCED_FRAMES {
                let Ok(next) = rx.try_recv() else {
                    break;
                };
                closing = matches!(next, Message::Close(_));
                if write_half.feed(next).await.is_err() {
                    closing = true;
                    break;
                }
                batched += 1;
            }
            if write_half.flush().await.is_err() || closing {
                break;
            }
        }
        let _ = write_half.close().await;
    });

    while let Some(frame) = read_half.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_text(&state, &conn_id, &tx, text.as_str()).await,
            Ok(Message::Ping(payload)) => {
                let _ = tx.send(Message::Pong(payload));
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => {
                send_event(&tx, &ServerEvent::Error("binary frames are not supported"));
            }
            Ok(Message::Pong(_) | Message::Frame(_)) => {}
            Err(e) => {
                debug!(conn_id, error = %e, "connection read failed");
                break;
            }
        }
    }

    // Disconnect: the only cancellation signal. Runs exactly once per
    // connection; store round-trips inside are individually time-bounded.
    let report = state.broker.leave(&conn_id).await;
    debug!(
        conn_id,
        rooms = report.rooms.len(),
        released = report.released().count(),
        "connection closed"
    );
    drop(tx);
    if let Err(e) = write_task.await {
        error!(conn_id, error = %e, "write task panicked");
    }
}

fn send_event(tx: &FrameSender, event: &ServerEvent<'_>) {
    let _ = tx.send(Message::Text(event.to_text().into()));
}

async fn handle_text(state: &ServerState, conn_id: &str, tx: &FrameSender, text: &str) {
    let event = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => event,
        Err(e) => {
            debug!(conn_id, error = %e, "unrecognized client frame");
            send_event(tx, &ServerEvent::Error("unrecognized event"));
            return;
        }
    };

    match event {
        ClientEvent::JoinRoom(room) if room.is_empty() => {
            send_event(tx, &ServerEvent::Error("room name must not be empty"));
        }
        ClientEvent::JoinRoom(room) => {
            info!(conn_id, room, "connection joining room");
            if let Err(e) = state.broker.join(conn_id, &room).await {
                warn!(conn_id, room, error = %e, "join failed");
                send_event(tx, &ServerEvent::Error("join failed"));
            }
        }
        ClientEvent::Snapshot(room) => match state.snapshots.read(&room).await {
            Ok(entries) => send_event(tx, &ServerEvent::Snapshot(&entries)),
            Err(e) => {
                warn!(conn_id, room, error = %e, "snapshot read failed");
                send_event(tx, &ServerEvent::Error("snapshot unavailable"));
            }
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::Value;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    use super::*;
    use crate::rooms::broker::{Arbitration, RoomState};
    use crate::rooms::bus::{ChannelBus, MemoryBus, MemoryHub};
    use crate::rooms::router::FanoutRouter;
    use crate::rooms::store::{MemoryStore, SharedStore};

    #[test]
    fn test_origin_allowed() {
        let allowed = vec!["http://localhost:3000".to_string()];
        assert!(origin_allowed(&allowed, "http://localhost:3000"));
        assert!(origin_allowed(&allowed, "http://localhost:3000/"));
        assert!(!origin_allowed(&allowed, "http://evil.example"));
        assert!(origin_allowed(&["*".to_string()], "http://anything"));
        assert!(!origin_allowed(&[], "http://localhost:3000"));
    }

    struct Harness {
        addr: SocketAddr,
        broker: Arc<RoomBroker>,
        bus: Arc<MemoryBus>,
        server: Arc<RoomServer>,
    }

    async fn start(origins: Vec<String>) -> Harness {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let hub = MemoryHub::new();
        let router = Arc::new(FanoutRouter::new());
        let bus = Arc::new(MemoryBus::attach(hub, router.clone()));
        let broker = Arc::new(RoomBroker::new(
            store.clone(),
            bus.clone(),
            router,
            Arbitration::Snapshot,
        ));
        let snapshots = Arc::new(SnapshotReader::new(store, 50));
        let server = Arc::new(RoomServer::new(
            broker.clone(),
            snapshots,
            ServerSettings {
                allowed_origins: origins,
                max_connections: 16,
            },
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let srv = server.clone();
        tokio::spawn(async move { srv.run(listener).await });
        Harness {
            addr,
            broker,
            bus,
            server,
        }
    }

    async fn next_json<S>(ws: &mut S) -> Value
    where
        S: StreamExt<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("read error");
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_join_publish_disconnect_end_to_end() {
        let h = start(vec!["http://localhost:3000".into()]).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", h.addr))
            .await
            .unwrap();

        ws.send(Message::Text(
            r#"{"event":"join-room","data":"alpha"}"#.into(),
        ))
        .await
        .unwrap();
        let router = h.broker.router().clone();
        wait_for(|| router.local_members("alpha") == 1).await;
        assert_eq!(
            h.broker.room_state("alpha").await.unwrap(),
            RoomState::Active(1)
        );

        h.bus.publish("alpha", "hello").await.unwrap();
        let frame = next_json(&mut ws).await;
        assert_eq!(frame["event"], "room-update");
        assert_eq!(frame["data"], "hello");

        ws.close(None).await.unwrap();
        wait_for(|| router.connection_count() == 0).await;
        let broker = h.broker.clone();
        for _ in 0..200 {
            if broker.room_state("alpha").await.unwrap() == RoomState::Empty {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(broker.room_state("alpha").await.unwrap(), RoomState::Empty);
        h.server.shutdown_token().cancel();
    }

    #[tokio::test]
    async fn test_unknown_event_gets_error_frame() {
        let h = start(vec!["*".into()]).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", h.addr))
            .await
            .unwrap();
        ws.send(Message::Text(r#"{"event":"shout","data":"x"}"#.into()))
            .await
            .unwrap();
        let frame = next_json(&mut ws).await;
        assert_eq!(frame["event"], "error");
        h.server.shutdown_token().cancel();
    }

    #[tokio::test]
    async fn test_snapshot_request() {
        let h = start(vec!["*".into()]).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", h.addr))
            .await
            .unwrap();
        ws.send(Message::Text(r#"{"event":"snapshot","data":"alpha"}"#.into()))
            .await
            .unwrap();
        let frame = next_json(&mut ws).await;
        assert_eq!(frame["event"], "snapshot");
        assert_eq!(frame["data"], serde_json::json!([]));
        h.server.shutdown_token().cancel();
    }

    #[tokio::test]
    async fn test_disallowed_origin_rejected() {
        let h = start(vec!["http://localhost:3000".into()]).await;
        let mut req = format!("ws://{}", h.addr).into_client_request().unwrap();
        req.headers_mut()
            .insert("origin", "http://evil.example".parse().unwrap());
        assert!(tokio_tungstenite::connect_async(req).await.is_err());
        assert_eq!(h.broker.router().connection_count(), 0);
        h.server.shutdown_token().cancel();
    }
}
