//! End-to-End Test Framework for Busgate
//!
//! Runs a real [`Gateway`] on a temporary unix socket, in a background task,
//! so tests can talk to it through ordinary socket clients.

use anyhow::{Context, Result};
use busgate::{Gateway, GatewayClient};
use busgate_config::GatewayConfig;
use busgate_network::BusDriver;
use std::path::{Path, PathBuf};
use std::sync::Once;
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::EnvFilter;

static LOGGING: Once = Once::new();

/// Install a test subscriber once; `RUST_LOG` controls verbosity.
pub fn init_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Configuration tuned for fast tests: 1ms ticks, immediate reconnects.
pub fn fast_config(socket: &Path) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.socket.path = socket.to_path_buf();
    config.server.tick_period_ms = 1;
    config.server.reconnect_interval_ms = 0;
    config.server.stats_interval_secs = 0;
    config
}

/// A gateway running in the background on its own socket
pub struct TestGateway<B> {
    socket: PathBuf,
    handle: JoinHandle<Gateway<B>>,
    stop: oneshot::Sender<()>,
    _dir: TempDir,
}

impl<B> TestGateway<B>
where
    B: BusDriver + 'static,
{
    /// Start a gateway. `configure` adjusts the fast defaults before binding.
    pub async fn start<F>(bus: B, configure: F) -> Result<Self>
    where
        F: FnOnce(&mut GatewayConfig),
    {
        init_logging();
        let dir = tempfile::tempdir().context("Failed to create test directory")?;
        let socket = dir.path().join("busgate.sock");
        let mut config = fast_config(&socket);
        configure(&mut config);
        config.validate()?;

        let mut gateway = Gateway::new(&config, bus)?;
        gateway.start().await;

        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            gateway
                .run(async move {
                    let _ = stopped.await;
                })
                .await;
            gateway
        });
        info!(socket = ?config.socket.path, "Test gateway started");

        Ok(Self {
            socket: config.socket.path,
            handle,
            stop,
            _dir: dir,
        })
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Connect a client and complete the handshake
    pub async fn client(&self) -> Result<GatewayClient> {
        Ok(GatewayClient::connect(&self.socket).await?)
    }

    /// Stop the loop and hand back the gateway for inspection
    pub async fn stop(self) -> Result<Gateway<B>> {
        let _ = self.stop.send(());
        let gateway = self.handle.await.context("Gateway task panicked")?;
        Ok(gateway)
    }
}
