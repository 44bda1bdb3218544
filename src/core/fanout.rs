/// Out-of-band replay of client queries against mirrors
///
/// Each mirror owns a bounded queue drained by a single worker task, so a
/// mirror sees queries in the order the primary did. Every replay is bounded
/// by a timeout and cancelled when the engine shuts down. A query is dropped
/// only when its mirror's queue is full. Nothing a mirror does is reported
/// back to the client path; outcomes are logged.
use super::backend::BackendConnection;
use crate::config::MirroringConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Limits applied to every mirror
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MirrorPolicy {
    pub query_timeout: Duration,
    pub queue_capacity: usize,
}

impl Default for MirrorPolicy {
    fn default() -> Self {
        Self::from_config(&MirroringConfig::default())
    }
}

impl MirrorPolicy {
    pub fn from_config(config: &MirroringConfig) -> Self {
        Self {
            query_timeout: config.query_timeout(),
            queue_capacity: config.queue_capacity,
        }
    }
}

/// How a single mirror replay ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorOutcome {
    Completed { rows: u64 },
    Failed(String),
    TimedOut,
    Cancelled,
}

/// Result of offering a query to one mirror
#[derive(Debug)]
pub enum Dispatch {
    /// Waiting in the mirror's queue; the receiver resolves once it has run
    Queued {
        mirror: String,
        outcome: oneshot::Receiver<MirrorOutcome>,
    },
    /// The mirror's queue was full; the query was not sent
    Dropped { mirror: String },
}

impl Dispatch {
    pub fn mirror(&self) -> &str {
        match self {
            Dispatch::Queued { mirror, .. } | Dispatch::Dropped { mirror } => mirror,
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, Dispatch::Queued { .. })
    }

    /// Wait for the replay to finish. A dropped query, or one whose worker is
    /// gone, counts as cancelled.
    pub async fn outcome(self) -> MirrorOutcome {
        match self {
            Dispatch::Queued { outcome, .. } => outcome.await.unwrap_or(MirrorOutcome::Cancelled),
            Dispatch::Dropped { .. } => MirrorOutcome::Cancelled,
        }
    }
}

struct Replay {
    query: Arc<str>,
    params: Arc<[Option<String>]>,
    outcome: oneshot::Sender<MirrorOutcome>,
}

struct MirrorQueue {
    identity: String,
    replays: mpsc::Sender<Replay>,
}

pub struct MirrorFanout {
    queues: Vec<MirrorQueue>,
    policy: MirrorPolicy,
}

impl MirrorFanout {
    /// Start one worker per mirror. Must be called from within a tokio runtime.
    pub fn new(
        mirrors: Vec<Arc<BackendConnection>>,
        policy: MirrorPolicy,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let queues = mirrors
            .into_iter()
            .map(|mirror| {
                let (replays, pending) = mpsc::channel(policy.queue_capacity.max(1));
                let identity = mirror.identity().to_string();
                tokio::spawn(drain(mirror, pending, policy.query_timeout, shutdown.clone()));
                MirrorQueue { identity, replays }
            })
            .collect();

        Self { queues, policy }
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn policy(&self) -> MirrorPolicy {
        self.policy
    }

    /// Queue the query on every mirror in configured order without waiting
    pub fn dispatch(&self, query: Arc<str>, params: Arc<[Option<String>]>) -> Vec<Dispatch> {
        self.queues
            .iter()
            .map(|queue| {
                let mirror = queue.identity.clone();
                let (outcome_tx, outcome) = oneshot::channel();
                let replay = Replay {
                    query: Arc::clone(&query),
                    params: Arc::clone(&params),
                    outcome: outcome_tx,
                };

                match queue.replays.try_send(replay) {
                    Ok(()) => Dispatch::Queued { mirror, outcome },
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            "Mirror {} queue is full ({} pending), dropping query: {}",
                            mirror, self.policy.queue_capacity, query
                        );
                        Dispatch::Dropped { mirror }
                    }
                    Err(TrySendError::Closed(_)) => {
                        warn!("Mirror {} worker has stopped, dropping query: {}", mirror, query);
                        Dispatch::Dropped { mirror }
                    }
                }
            })
            .collect()
    }
}

/// Replay queued queries one at a time until every sender is gone
async fn drain(
    mirror: Arc<BackendConnection>,
    mut pending: mpsc::Receiver<Replay>,
    timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    while let Some(replay) = pending.recv().await {
        let outcome = run_replay(
            &mirror,
            &replay.query,
            &replay.params,
            timeout,
            &mut shutdown,
        )
        .await;
        log_outcome(mirror.identity(), &replay.query, &outcome);
        // nobody waiting is fine
        let _ = replay.outcome.send(outcome);
    }
    debug!("Mirror {} worker stopped", mirror.identity());
}

async fn run_replay(
    mirror: &BackendConnection,
    query: &str,
    params: &[Option<String>],
    timeout: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> MirrorOutcome {
    if *shutdown.borrow() {
        return MirrorOutcome::Cancelled;
    }

    tokio::select! {
        result = tokio::time::timeout(timeout, mirror.execute_and_discard(query, params)) => {
            match result {
                Ok(Ok(rows)) => MirrorOutcome::Completed { rows },
                Ok(Err(e)) => MirrorOutcome::Failed(e.to_string()),
                Err(_) => MirrorOutcome::TimedOut,
            }
        }
        _ = shutdown_signalled(shutdown) => MirrorOutcome::Cancelled,
    }
}

/// Resolves once the engine signals shutdown; never if the sender is gone
async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

fn log_outcome(mirror: &str, query: &str, outcome: &MirrorOutcome) {
    match outcome {
        MirrorOutcome::Completed { rows } => {
            debug!("Mirror {} completed query, discarded {} rows", mirror, rows)
        }
        MirrorOutcome::Failed(reason) => error!(
            "Could not execute query on mirror {}: {} (query: {})",
            mirror, reason, query
        ),
        MirrorOutcome::TimedOut => warn!("Mirror {} timed out on query: {}", mirror, query),
        MirrorOutcome::Cancelled => info!("Mirror {} replay cancelled by shutdown", mirror),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Role;
    use crate::driver::mock::{row, CallKind, MockBackend, MockDriver};
    use crate::driver::types;
    use crate::error::BackendError;
    use crate::utils::logs::CapturedLogs;
    use tracing::Level;

    const M1: &str = "postgresql://mirror-1/app";
    const M2: &str = "postgresql://mirror-2/app";

    async fn mirror(driver: &MockDriver, identity: &str, address: &str) -> Arc<BackendConnection> {
        Arc::new(
            BackendConnection::connect(driver, Role::Mirror, identity, address)
                .await
                .unwrap(),
        )
    }

    fn policy(timeout_ms: u64, queue_capacity: usize) -> MirrorPolicy {
        MirrorPolicy {
            query_timeout: Duration::from_millis(timeout_ms),
            queue_capacity,
        }
    }

    fn no_params() -> Arc<[Option<String>]> {
        Arc::from(Vec::new())
    }

    async fn outcomes(dispatches: Vec<Dispatch>) -> Vec<MirrorOutcome> {
        let mut outcomes = Vec::new();
        for dispatch in dispatches {
            outcomes.push(dispatch.outcome().await);
        }
        outcomes
    }

    #[test]
    fn test_policy_from_config() {
        let config = MirroringConfig {
            query_timeout_ms: 250,
            queue_capacity: 4,
            fail_fast: false,
        };
        let policy = MirrorPolicy::from_config(&config);
        assert_eq!(policy.query_timeout, Duration::from_millis(250));
        assert_eq!(policy.queue_capacity, 4);
    }

    #[tokio::test]
    async fn test_dispatch_reaches_every_mirror_with_same_params() {
        let backend = MockBackend::with_version("150002")
            .returning(&[("n", types::INT4)], vec![row(&["1"]), row(&["2"])]);
        let driver = MockDriver::new()
            .with_backend(M1, backend.clone())
            .with_backend(M2, backend);
        let mirrors = vec![
            mirror(&driver, "mirror-1", M1).await,
            mirror(&driver, "mirror-2", M2).await,
        ];
        let (_tx, rx) = watch::channel(false);
        let fanout = MirrorFanout::new(mirrors, policy(1000, 8), rx);

        let params: Arc<[Option<String>]> = vec![Some("42".to_string()), None].into();
        let dispatches =
            fanout.dispatch(Arc::from("DELETE FROM t WHERE id = $1"), Arc::clone(&params));

        assert_eq!(dispatches.len(), 2);
        assert_eq!(dispatches[0].mirror(), "mirror-1");
        assert_eq!(dispatches[1].mirror(), "mirror-2");
        assert!(dispatches.iter().all(Dispatch::is_queued));

        let outcomes = outcomes(dispatches).await;
        assert_eq!(outcomes, vec![MirrorOutcome::Completed { rows: 2 }; 2]);
        for address in [M1, M2] {
            let calls = driver.calls(address, CallKind::Execute);
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].params, params.to_vec());
        }
    }

    #[tokio::test]
    async fn test_back_to_back_queries_are_replayed_in_order() {
        let backend = MockBackend {
            delay: Some(Duration::from_millis(30)),
            ..MockBackend::with_version("150002")
        };
        let driver = MockDriver::new().with_backend(M1, backend);
        let (_tx, rx) = watch::channel(false);
        let mirrors = vec![mirror(&driver, "mirror-1", M1).await];
        let fanout = MirrorFanout::new(mirrors, policy(1000, 16), rx);

        let mut dispatches = Vec::new();
        for i in 0..5 {
            let sql = format!("INSERT INTO t VALUES ({})", i);
            dispatches.extend(fanout.dispatch(Arc::from(sql), no_params()));
        }
        assert!(dispatches.iter().all(Dispatch::is_queued));

        let outcomes = outcomes(dispatches).await;
        assert_eq!(outcomes, vec![MirrorOutcome::Completed { rows: 0 }; 5]);

        let replayed: Vec<String> = driver
            .calls(M1, CallKind::Execute)
            .into_iter()
            .map(|call| call.sql)
            .collect();
        let expected: Vec<String> = (0..5)
            .map(|i| format!("INSERT INTO t VALUES ({})", i))
            .collect();
        assert_eq!(replayed, expected);
    }

    #[tokio::test]
    async fn test_failing_mirror_is_isolated_and_logged_as_error() {
        let (logs, _guard) = CapturedLogs::install();
        let failing = MockBackend::with_version("150002").failing(BackendError::query("disk full"));
        let driver = MockDriver::new()
            .with_backend(M1, failing)
            .with_backend(M2, MockBackend::with_version("150002"));
        let mirrors = vec![
            mirror(&driver, "mirror-1", M1).await,
            mirror(&driver, "mirror-2", M2).await,
        ];
        let (_tx, rx) = watch::channel(false);
        let fanout = MirrorFanout::new(mirrors, policy(1000, 8), rx);

        let dispatches = fanout.dispatch(Arc::from("INSERT INTO t VALUES (1)"), no_params());
        let outcomes = outcomes(dispatches).await;

        assert!(matches!(
            &outcomes[0],
            MirrorOutcome::Failed(reason) if reason.contains("disk full")
        ));
        assert_eq!(outcomes[1], MirrorOutcome::Completed { rows: 0 });
        assert!(logs.contains(Level::ERROR, "Could not execute query on mirror mirror-1"));
        assert!(!logs.contains(Level::ERROR, "mirror-2"));
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_logs() {
        let (logs, _guard) = CapturedLogs::install();
        let backend = MockBackend {
            hang: true,
            ..MockBackend::with_version("150002")
        };
        let driver = MockDriver::new().with_backend(M1, backend);
        let (tx, rx) = watch::channel(false);
        let mirrors = vec![mirror(&driver, "mirror-1", M1).await];
        let fanout = MirrorFanout::new(mirrors, policy(60_000, 1), rx);

        let running = fanout.dispatch(Arc::from("SELECT 1"), no_params());
        driver.wait_for_calls(M1, CallKind::Execute, 1).await;

        let waiting = fanout.dispatch(Arc::from("SELECT 2"), no_params());
        let overflow = fanout.dispatch(Arc::from("SELECT 3"), no_params());

        assert!(running[0].is_queued());
        assert!(waiting[0].is_queued());
        assert!(matches!(&overflow[0], Dispatch::Dropped { mirror } if mirror == "mirror-1"));
        assert!(logs.contains(Level::WARN, "Mirror mirror-1 queue is full"));

        tx.send(true).unwrap();
        assert_eq!(outcomes(running).await, vec![MirrorOutcome::Cancelled]);
        assert_eq!(outcomes(waiting).await, vec![MirrorOutcome::Cancelled]);
        assert_eq!(driver.calls(M1, CallKind::Execute).len(), 1);
    }

    #[tokio::test]
    async fn test_slow_mirror_times_out() {
        let backend = MockBackend {
            delay: Some(Duration::from_secs(5)),
            ..MockBackend::with_version("150002")
        };
        let driver = MockDriver::new().with_backend(M1, backend);
        let (_tx, rx) = watch::channel(false);
        let mirrors = vec![mirror(&driver, "mirror-1", M1).await];
        let fanout = MirrorFanout::new(mirrors, policy(20, 8), rx);

        let dispatches = fanout.dispatch(Arc::from("SELECT pg_sleep(5)"), no_params());
        assert_eq!(outcomes(dispatches).await, vec![MirrorOutcome::TimedOut]);
    }

    #[tokio::test]
    async fn test_dispatch_after_shutdown_is_cancelled() {
        let driver = MockDriver::new().with_backend(M1, MockBackend::with_version("150002"));
        let (tx, rx) = watch::channel(false);
        let mirrors = vec![mirror(&driver, "mirror-1", M1).await];
        let fanout = MirrorFanout::new(mirrors, policy(1000, 8), rx);
        tx.send(true).unwrap();

        let dispatches = fanout.dispatch(Arc::from("SELECT 1"), no_params());
        assert_eq!(outcomes(dispatches).await, vec![MirrorOutcome::Cancelled]);
        assert!(driver.calls(M1, CallKind::Execute).is_empty());
    }

    #[tokio::test]
    async fn test_no_mirrors_no_dispatches() {
        let (_tx, rx) = watch::channel(false);
        let fanout = MirrorFanout::new(Vec::new(), MirrorPolicy::default(), rx);
        assert!(fanout.is_empty());
        assert!(fanout.dispatch(Arc::from("SELECT 1"), no_params()).is_empty());
    }
}
