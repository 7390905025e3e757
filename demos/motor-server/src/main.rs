//! Motor control and telemetry server.
//!
//! Run with: cargo run -p motor-server -- --device-address 169.254.0.1
//!
//! Observers connect to ws://localhost:3000/ws?user=<id>.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use motorlink_control::DeviceHub;
use motorlink_core::{LinkConfig, PersistenceStore, ProtocolDriver};
use motorlink_driver::{LineCodec, RecordingDriver, TcpDriver};
use motorlink_session::storage::MemoryStore;
use motorlink_transport::AppState;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "motor-server", version, about = "Motor control and telemetry server")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:3000")]
    listen: SocketAddr,

    /// JSON file with link configuration; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Motor controller address
    #[arg(long)]
    device_address: Option<String>,

    /// Motor controller port
    #[arg(long)]
    device_port: Option<u16>,

    /// Low-priority poll period in milliseconds
    #[arg(long)]
    low_priority_ms: Option<u64>,

    /// High-priority poll period in milliseconds
    #[arg(long)]
    high_priority_ms: Option<u64>,

    /// Network adapter used for bring-up
    #[arg(long)]
    adapter: Option<String>,

    /// Consecutive driver errors before the link is declared lost
    #[arg(long)]
    error_threshold: Option<u32>,

    /// Use an in-process recording driver instead of TCP
    #[arg(long, action = ArgAction::SetTrue)]
    mock: bool,
}

impl Args {
    fn link_config(&self) -> Result<LinkConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
            }
            None => LinkConfig::default(),
        };

        if let Some(address) = &self.device_address {
            config.address.clone_from(address);
        }
        if let Some(port) = self.device_port {
            config.port = port;
        }
        if let Some(ms) = self.low_priority_ms {
            config.low_priority_period_ms = ms;
        }
        if let Some(ms) = self.high_priority_ms {
            config.high_priority_period_ms = ms;
        }
        if let Some(adapter) = &self.adapter {
            config.adapter.clone_from(adapter);
        }
        if let Some(threshold) = self.error_threshold {
            config.error_threshold = threshold;
        }

        config.validate().context("invalid link configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = args.link_config()?;
    tracing::info!(
        device = %config.device_key(),
        low_ms = config.low_priority_period_ms,
        high_ms = config.high_priority_period_ms,
        "Link configuration loaded"
    );

    let hub = if args.mock {
        tracing::warn!("Using the recording driver, no device will be contacted");
        DeviceHub::new(
            Arc::new(|| Arc::new(RecordingDriver::new()) as Arc<dyn ProtocolDriver>),
            Arc::new(LineCodec),
        )
    } else {
        DeviceHub::new(
            Arc::new(|| Arc::new(TcpDriver::new()) as Arc<dyn ProtocolDriver>),
            Arc::new(LineCodec),
        )
    };
    let hub = Arc::new(hub);
    let store: Arc<dyn PersistenceStore> = Arc::new(MemoryStore::new());
    let state = AppState::new(Arc::clone(&hub), store, config);

    let app = motorlink_transport::router(state).layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    tracing::info!("Server listening on http://{}", args.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await
        .context("server error")?;

    hub.shutdown().await;
    Ok(())
}
