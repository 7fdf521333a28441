use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use feature_toggles::{router, EventBus, MemStore, NatsBus, NoopBus, Store};

#[derive(Debug, Parser)]
#[command(name = "feature-toggles", about = "Central feature toggle server")]
struct Opts {
    /// Listening address.
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    addr: SocketAddr,

    /// Messaging bus for change fan-out.
    #[arg(short, long, value_enum, default_value = "noop")]
    messaging: MessagingKind,

    /// NATS server address.
    #[arg(long, default_value = "nats://127.0.0.1:4222")]
    nats: String,

    /// Base path of the flag API.
    #[arg(long, default_value = "/flags")]
    api_path: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum MessagingKind {
    Noop,
    Nats,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "feature_toggles=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let opts = Opts::parse();

    let store: Arc<dyn Store> = Arc::new(MemStore::new());
    let bus = messaging_bus(&opts).await;

    let app = router(&opts.api_path, store, bus);
    let listener = tokio::net::TcpListener::bind(opts.addr).await?;
    tracing::info!(addr = %opts.addr, path = %opts.api_path, "starting server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn messaging_bus(opts: &Opts) -> Arc<dyn EventBus> {
    match opts.messaging {
        MessagingKind::Noop => Arc::new(NoopBus),
        MessagingKind::Nats => {
            let connected = match std::env::var("NATS_TOKEN") {
                Ok(token) => NatsBus::connect_with_token(&opts.nats, token).await,
                Err(_) => NatsBus::connect(&opts.nats).await,
            };

            match connected {
                Ok(bus) => Arc::new(bus),
                Err(err) => {
                    tracing::warn!("messaging bus unavailable, proceeding without one: {err}");
                    Arc::new(NoopBus)
                }
            }
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("listening for the shutdown signal: {err}");
        return;
    }
    tracing::info!("shutting down");
}
