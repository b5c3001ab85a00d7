//! Reconciliation scheduler.
//!
//! Drives periodic ("soft") and on-demand ("forced") reconciliation passes:
//! fetch the reservation snapshot, diff it against the previous baseline,
//! apply the corrective actions, and only then replace the baseline.
//!
//! # State machine
//!
//! `Idle -> Running -> Idle`, with pending-trigger coalescing: at most one
//! pass runs at a time system-wide, and triggers arriving while a pass runs
//! are merged into at most one queued pass (a queued forced pass absorbs
//! queued soft ones). Triggering never blocks the caller.
//!
//! # Failure handling
//!
//! A failed fetch or apply aborts the pass without touching the previous
//! baseline, so the next pass retries the same diff; consecutive failures
//! push automatic passes out by the configured backoff curve. Explicit
//! triggers bypass the backoff window. A pass has no internal cancellation
//! point; if the process dies mid-pass, the next pass safely re-runs from
//! the possibly stale baseline.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use nacd_core::backoff::BackoffConfig;
use nacd_core::config::ReconcileConfig;
use nacd_core::reconcile::{self, ReconciliationAction, ReservationSnapshot};
use thiserror::Error;
use tokio::sync::{Notify, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::repository::{ActionSink, RepositoryError, ReservationRepository, SinkError};
use crate::store::{LeaseStore, StoreError};

/// Kind of reconciliation trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    /// Incremental pass against the previous baseline.
    Soft,
    /// Full re-validation that distrusts the previous baseline.
    Forced,
}

/// Why a reconciliation pass failed.
#[derive(Debug, Error)]
enum PassError {
    #[error(transparent)]
    Fetch(#[from] RepositoryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Apply(#[from] SinkError),
}

#[derive(Debug, Default)]
struct Pending {
    queued: bool,
    forced: bool,
}

struct Shared {
    notify: Notify,
    pending: Mutex<Pending>,
}

impl Shared {
    fn queue(&self, refresh: Refresh) {
        {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            pending.queued = true;
            pending.forced |= refresh == Refresh::Forced;
        }
        self.notify.notify_one();
    }

    fn take(&self) -> Option<Refresh> {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !pending.queued {
            return None;
        }
        let refresh = if pending.forced {
            Refresh::Forced
        } else {
            Refresh::Soft
        };
        *pending = Pending::default();
        Some(refresh)
    }
}

/// Fire-and-forget trigger handle for the scheduler.
///
/// Cloneable and cheap; triggering while a pass is running records at most
/// one pending pass and returns immediately.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    /// Request a reconciliation pass.
    pub fn trigger(&self, refresh: Refresh) {
        self.shared.queue(refresh);
    }
}

/// The single runner of reconciliation passes.
pub struct ReconcileScheduler {
    repository: Arc<dyn ReservationRepository>,
    sink: Arc<dyn ActionSink>,
    store: Arc<LeaseStore>,
    interval: Duration,
    backoff: BackoffConfig,
    shared: Arc<Shared>,
    previous: ReservationSnapshot,
    consecutive_failures: u32,
    backoff_until: Option<Instant>,
}

impl ReconcileScheduler {
    /// Create a scheduler and its trigger handle.
    #[must_use]
    pub fn new(
        config: &ReconcileConfig,
        repository: Arc<dyn ReservationRepository>,
        sink: Arc<dyn ActionSink>,
        store: Arc<LeaseStore>,
    ) -> (Self, SchedulerHandle) {
        let shared = Arc::new(Shared {
            notify: Notify::new(),
            pending: Mutex::new(Pending::default()),
        });
        let scheduler = Self {
            repository,
            sink,
            store,
            interval: config.interval,
            backoff: config.backoff.clone(),
            shared: Arc::clone(&shared),
            previous: ReservationSnapshot::empty(),
            consecutive_failures: 0,
            backoff_until: None,
        };
        (scheduler, SchedulerHandle { shared })
    }

    /// Run passes until `shutdown` flips to `true` or its sender drops.
    ///
    /// The first timer tick fires immediately, so the daemon reconciles once
    /// at startup before settling into the configured interval.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if self.in_backoff() {
                        debug!("skipping automatic pass during backoff window");
                    } else {
                        self.shared.queue(Refresh::Soft);
                    }
                },
                () = self.shared.notify.notified() => {},
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                },
            }

            while let Some(refresh) = self.shared.take() {
                self.run_pass(refresh).await;
            }
        }
        info!("reconciliation scheduler stopped");
    }

    fn in_backoff(&self) -> bool {
        self.backoff_until
            .is_some_and(|until| Instant::now() < until)
    }

    async fn run_pass(&mut self, refresh: Refresh) {
        let forced = refresh == Refresh::Forced;
        let started = std::time::Instant::now();

        let repository = Arc::clone(&self.repository);
        let sink = Arc::clone(&self.sink);
        let store = Arc::clone(&self.store);
        let previous = self.previous.clone();

        // The whole fetch -> diff -> apply unit runs on a blocking worker:
        // repository and sink do synchronous database and socket work.
        let result = tokio::task::spawn_blocking(move || {
            run_pass_blocking(&*repository, &*sink, &store, &previous, forced)
        })
        .await;

        match result {
            Ok(Ok(outcome)) => {
                self.previous = outcome.current;
                self.consecutive_failures = 0;
                self.backoff_until = None;
                info!(
                    forced,
                    grants = outcome.grants,
                    revokes = outcome.revokes,
                    anomalies = outcome.anomalies,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "reconciliation pass complete"
                );
            },
            Ok(Err(error)) => self.record_failure(&error.to_string()),
            Err(join_error) => self.record_failure(&join_error.to_string()),
        }
    }

    fn record_failure(&mut self, error: &str) {
        self.consecutive_failures += 1;
        let delay = self.backoff.delay_for_attempt(self.consecutive_failures);
        self.backoff_until = Some(Instant::now() + delay);
        warn!(
            error,
            consecutive_failures = self.consecutive_failures,
            backoff_secs = delay.as_secs(),
            "reconciliation pass failed; keeping previous baseline"
        );
    }
}

struct PassOutcome {
    current: ReservationSnapshot,
    grants: usize,
    revokes: usize,
    anomalies: usize,
}

fn run_pass_blocking(
    repository: &dyn ReservationRepository,
    sink: &dyn ActionSink,
    store: &LeaseStore,
    previous: &ReservationSnapshot,
    forced: bool,
) -> Result<PassOutcome, PassError> {
    let current = repository.fetch_snapshot()?;
    for anomaly in current.anomalies() {
        warn!(%anomaly, "reservation data inconsistency");
    }

    let actions = if forced {
        // A forced pass distrusts the baseline entirely: revoke every lease
        // without a current reservation and re-grant the full snapshot.
        let mut actions: Vec<ReconciliationAction> =
            reconcile::invalid_leases(&current, store.occupancy()?)
                .into_iter()
                .map(|ip| ReconciliationAction::Revoke { ip })
                .collect();
        actions.extend(current.entries().iter().map(|r| {
            ReconciliationAction::Grant {
                mac: r.mac,
                ip: r.ip,
                hostname: r.hostname.clone(),
            }
        }));
        actions
    } else {
        reconcile::diff(previous, &current)
    };

    let revokes = actions
        .iter()
        .filter(|a| matches!(a, ReconciliationAction::Revoke { .. }))
        .count();
    let grants = actions.len() - revokes;

    sink.apply(&actions)?;

    Ok(PassOutcome {
        anomalies: current.anomalies().len(),
        grants,
        revokes,
        current,
    })
}
