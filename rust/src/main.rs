use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use roomcast::config::{Cli, Command, StoreBackend};
use roomcast::logging;
use roomcast::rooms::broker::RoomBroker;
use roomcast::rooms::bus::{ChannelBus, MemoryBus, MemoryHub, RedisBus};
use roomcast::rooms::router::FanoutRouter;
use roomcast::rooms::server::{RoomServer, ServerSettings};
use roomcast::rooms::snapshot::SnapshotReader;
use roomcast::rooms::store::{MemoryStore, RedisStore, SharedStore};

struct Backends {
    store: Arc<dyn SharedStore>,
    bus: Arc<dyn ChannelBus>,
    listener: Option<(Arc<RedisBus>, JoinHandle<()>)>,
}

impl Backends {
    async fn connect(cli: &Cli, router: Arc<FanoutRouter>) -> anyhow::Result<Self> {
        match cli.store {
            StoreBackend::Memory => {
                warn!("using in-process store; state is not shared with other instances");
                Ok(Self {
                    store: Arc::new(MemoryStore::new()),
                    bus: Arc::new(MemoryBus::attach(MemoryHub::new(), router)),
                    listener: None,
                })
            }
            StoreBackend::Redis => {
                let store = RedisStore::connect(&cli.redis_url, cli.store_timeout())
                    .await
                    .context("connecting shared store")?;
                let (bus, handle) = RedisBus::spawn(cli.redis_url.clone(), router, cli.store_timeout());
                let bus = Arc::new(bus);
                Ok(Self {
                    store: Arc::new(store),
                    bus: bus.clone(),
                    listener: Some((bus, handle)),
                })
            }
        }
    }

    async fn shutdown(self) {
        if let Some((bus, handle)) = self.listener {
            bus.shutdown();
            if let Err(e) = handle.await {
                warn!(error = %e, "upstream listener ended abnormally");
            }
            let m = bus.metrics();
            info!(
                received = m.messages_received.load(Ordering::Relaxed),
                published = m.messages_published.load(Ordering::Relaxed),
                command_errors = m.command_errors.load(Ordering::Relaxed),
                reconnects = m.reconnect_count.load(Ordering::Relaxed),
                "upstream bus stopped"
            );
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init(&cli.log_level, cli.log_format);
    cli.validate()?;

    let router = Arc::new(FanoutRouter::new());
    let backends = Backends::connect(&cli, router.clone()).await?;

    let result = match cli.action() {
        Command::Serve => serve(&cli, &backends, router).await,
        Command::Publish { room, payload } => backends
            .bus
            .publish(&room, &payload)
            .await
            .with_context(|| format!("publishing to {room}")),
        Command::Snapshot { room } => {
            let reader = SnapshotReader::new(backends.store.clone(), cli.serve.snapshot_size);
            let entries = reader.read(&room).await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
            Ok(())
        }
    };

    backends.shutdown().await;
    result
}

async fn serve(cli: &Cli, backends: &Backends, router: Arc<FanoutRouter>) -> anyhow::Result<()> {
    let server_router = router.clone();
    let broker = Arc::new(RoomBroker::new(
        backends.store.clone(),
        backends.bus.clone(),
        router,
        cli.serve.arbitration,
    ));
    let snapshots = Arc::new(SnapshotReader::new(
        backends.store.clone(),
        cli.serve.snapshot_size,
    ));
    let server = RoomServer::new(
        broker,
        snapshots,
        ServerSettings {
            allowed_origins: cli.serve.origins(),
            max_connections: cli.serve.max_connections,
        },
    );

    let addr = cli.serve.listen_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    let token = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            token.cancel();
        }
    });

    server.run(listener).await?;
    let m = server_router.metrics();
    info!(
        routed = m.messages_routed.load(Ordering::Relaxed),
        delivered = m.frames_delivered.load(Ordering::Relaxed),
        dropped = m.frames_dropped.load(Ordering::Relaxed),
        "fan-out totals"
    );
    Ok(())
}
