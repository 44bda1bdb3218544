/// Proxy engine: primary execution plus mirror fan-out
use super::backend::BackendConnection;
use super::fanout::{Dispatch, MirrorFanout, MirrorPolicy};
use super::writer::ResultWriter;
use super::Role;
use crate::config::Config;
use crate::driver::{Driver, StatementDescription};
use crate::error::{EspejoError, EspejoResult};
use crate::utils::{format_duration, redact_address};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// State of a configured mirror after startup
#[derive(Debug)]
pub enum MirrorSlot {
    Ready(Arc<BackendConnection>),
    /// Could not be reached at startup; excluded from fan-out
    Degraded {
        identity: String,
        address: String,
        reason: String,
    },
}

impl MirrorSlot {
    pub fn identity(&self) -> &str {
        match self {
            MirrorSlot::Ready(conn) => conn.identity(),
            MirrorSlot::Degraded { identity, .. } => identity,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, MirrorSlot::Ready(_))
    }
}

impl fmt::Display for MirrorSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirrorSlot::Ready(conn) => write!(
                f,
                "{} ({}): ready",
                conn.identity(),
                redact_address(conn.address())
            ),
            MirrorSlot::Degraded {
                identity,
                address,
                reason,
            } => write!(
                f,
                "{} ({}): degraded, {}",
                identity,
                redact_address(address),
                reason
            ),
        }
    }
}

/// What happened to one client query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryReport {
    /// Rows streamed to the client
    pub rows: u64,
    /// Mirrors that queued a replay
    pub mirrors_dispatched: usize,
    /// Mirrors skipped because their queue was full
    pub mirrors_dropped: usize,
}

pub struct ProxyEngine {
    primary: BackendConnection,
    mirrors: Vec<MirrorSlot>,
    fanout: MirrorFanout,
    announced_version: String,
    shutdown: watch::Sender<bool>,
}

impl ProxyEngine {
    /// Connect to the primary, then every mirror in configured order.
    ///
    /// Each connection attempt is bounded by `server.connect_timeout_sec`.
    /// An unreachable primary is fatal. An unreachable mirror is degraded
    /// unless `mirroring.fail_fast` is set.
    pub async fn start(driver: &dyn Driver, config: &Config) -> EspejoResult<Self> {
        let limit = config.server.connect_timeout();
        let primary = connect_within(
            driver,
            Role::Primary,
            &config.primary_name(),
            &config.primary.address,
            limit,
        )
        .await
        .map_err(|e| EspejoError::startup(format!("primary is unreachable: {}", e)))?;

        let policy = MirrorPolicy::from_config(&config.mirroring);
        let mut mirrors = Vec::with_capacity(config.mirrors.len());

        for (identity, address) in config.named_mirrors() {
            match connect_within(driver, Role::Mirror, &identity, &address, limit).await {
                Ok(conn) => mirrors.push(MirrorSlot::Ready(Arc::new(conn))),
                Err(e) if config.mirroring.fail_fast => {
                    close_all(&primary, &mirrors).await;
                    return Err(EspejoError::startup(format!(
                        "mirror {} is unreachable: {}",
                        identity, e
                    )));
                }
                Err(e) => {
                    error!(
                        "Mirror {} at {} is degraded and will not receive queries: {}",
                        identity,
                        redact_address(&address),
                        e
                    );
                    mirrors.push(MirrorSlot::Degraded {
                        identity,
                        address,
                        reason: e.to_string(),
                    });
                }
            }
        }

        let announced_version = primary.server_version().to_string();

        let ready: Vec<Arc<BackendConnection>> = mirrors
            .iter()
            .filter_map(|slot| match slot {
                MirrorSlot::Ready(conn) => Some(Arc::clone(conn)),
                MirrorSlot::Degraded { .. } => None,
            })
            .collect();

        info!(
            "Engine ready: announcing server_version_num {}, {} of {} mirrors ready",
            announced_version,
            ready.len(),
            mirrors.len()
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let fanout = MirrorFanout::new(ready, policy, shutdown_rx);

        Ok(Self {
            primary,
            mirrors,
            fanout,
            announced_version,
            shutdown,
        })
    }

    /// Version advertised to clients; fixed for the engine's lifetime
    pub fn announced_version(&self) -> &str {
        &self.announced_version
    }

    pub fn primary(&self) -> &BackendConnection {
        &self.primary
    }

    pub fn mirrors(&self) -> &[MirrorSlot] {
        &self.mirrors
    }

    /// One line per configured mirror, in configuration order
    pub fn mirror_status(&self) -> Vec<String> {
        self.mirrors.iter().map(ToString::to_string).collect()
    }

    /// Execute on the primary, streaming to `writer`, then replay on every
    /// ready mirror without waiting for them.
    ///
    /// A primary or writer failure is returned and nothing is replayed.
    pub async fn handle(
        &self,
        query: &str,
        params: &[Option<String>],
        writer: &mut dyn ResultWriter,
    ) -> EspejoResult<QueryReport> {
        let rows = self
            .primary
            .execute_for_client(query, params, writer)
            .await?;

        let mut report = QueryReport {
            rows,
            ..Default::default()
        };

        if self.fanout.is_empty() {
            return Ok(report);
        }

        for dispatch in self.fanout.dispatch(Arc::from(query), Arc::from(params)) {
            match dispatch {
                Dispatch::Queued { .. } => report.mirrors_dispatched += 1,
                Dispatch::Dropped { .. } => report.mirrors_dropped += 1,
            }
        }

        debug!(
            "Query served: {} rows, {} mirrors dispatched, {} dropped",
            report.rows, report.mirrors_dispatched, report.mirrors_dropped
        );
        Ok(report)
    }

    /// Parameter and result types of a statement, as the primary sees them.
    /// Nothing runs and nothing is mirrored.
    pub async fn describe(
        &self,
        query: &str,
        param_types: &[u32],
    ) -> EspejoResult<StatementDescription> {
        self.primary.describe(query, param_types).await
    }

    /// Cancel outstanding mirror work and close every connection
    pub async fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!("Shutting down engine");
        close_all(&self.primary, &self.mirrors).await;
    }
}

async fn connect_within(
    driver: &dyn Driver,
    role: Role,
    identity: &str,
    address: &str,
    limit: Duration,
) -> EspejoResult<BackendConnection> {
    match tokio::time::timeout(limit, BackendConnection::connect(driver, role, identity, address))
        .await
    {
        Ok(result) => result,
        Err(_) => {
            error!(
                "Timed out connecting to {} {} at {} after {}",
                role,
                identity,
                redact_address(address),
                format_duration(limit)
            );
            Err(EspejoError::timeout(format!(
                "connecting to {} {} after {}",
                role,
                identity,
                format_duration(limit)
            )))
        }
    }
}

async fn close_all(primary: &BackendConnection, mirrors: &[MirrorSlot]) {
    if let Err(e) = primary.close().await {
        warn!("Error closing primary connection: {}", e);
    }
    for slot in mirrors {
        if let MirrorSlot::Ready(conn) = slot {
            if let Err(e) = conn.close().await {
                warn!("Error closing mirror {}: {}", conn.identity(), e);
            }
        }
    }
}
