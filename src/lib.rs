pub mod config;
pub mod error;
/// Espejo - a mirroring proxy for PostgreSQL
///
/// Clients talk to espejo as if it were their database. Every query runs on a
/// single primary whose results go back to the client, then is replayed
/// out-of-band on any number of mirrors whose results are thrown away.
pub mod core;
pub mod driver;
pub mod frontend;
pub mod utils;

use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

pub use crate::config::Config;
pub use crate::core::{ProxyEngine, QueryReport, ResultWriter};
pub use crate::driver::{Driver, PostgresDriver};
pub use crate::error::{EspejoError, EspejoResult};

use crate::frontend::ProxyServer;
use crate::utils::{normalize_listen_addr, redact_address};

/// Main espejo instance
pub struct Espejo {
    config: Config,
    engine: Option<Arc<ProxyEngine>>,
}

impl Espejo {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            engine: None,
        }
    }

    /// Get the current configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Connect to the primary and every mirror
    pub async fn initialize(&mut self, driver: &dyn Driver) -> EspejoResult<()> {
        info!("Starting espejo on {}", self.config.server.listen_addr);
        info!(
            "Primary {}: {}",
            self.config.primary_name(),
            redact_address(&self.config.primary.address)
        );
        for (name, address) in self.config.named_mirrors() {
            info!("Mirror {}: {}", name, redact_address(&address));
        }

        let engine = ProxyEngine::start(driver, &self.config).await?;
        for status in engine.mirror_status() {
            info!("Mirror status: {}", status);
        }

        self.engine = Some(Arc::new(engine));
        Ok(())
    }

    /// Check if the engine is connected
    pub fn is_initialized(&self) -> bool {
        self.engine.is_some()
    }

    pub fn engine(&self) -> Option<Arc<ProxyEngine>> {
        self.engine.clone()
    }

    /// Serve clients until Ctrl-C
    pub async fn run(&self) -> EspejoResult<()> {
        self.run_until(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl-C, shutting down"),
                Err(e) => {
                    error!("Failed to listen for Ctrl-C: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        })
        .await
    }

    /// Serve clients until `shutdown` resolves, then close every backend connection
    pub async fn run_until<F>(&self, shutdown: F) -> EspejoResult<()>
    where
        F: Future<Output = ()>,
    {
        let engine = self.engine.clone().ok_or_else(|| {
            EspejoError::startup("Server not initialized. Call initialize() first.")
        })?;

        let listen_addr = normalize_listen_addr(&self.config.server.listen_addr);
        let listener = TcpListener::bind(&listen_addr).await.map_err(|e| {
            EspejoError::startup(format!("could not listen on {}: {}", listen_addr, e))
        })?;

        let server = ProxyServer::new(Arc::clone(&engine), self.config.server.max_connections);
        let served = server.serve(listener, shutdown).await;

        engine.shutdown().await;
        served
    }

    /// Close every backend connection
    pub async fn shutdown(&self) {
        if let Some(engine) = &self.engine {
            engine.shutdown().await;
        }
    }
}
