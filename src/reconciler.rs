// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The membership reconciliation loop.
//!
//! Each cycle fetches the current membership, compares it with the last
//! snapshot that was successfully applied, and invokes the applier when
//! they differ. Failures never advance the held snapshot:
//!
//! - a failed fetch means "no new information", never "no members";
//! - a failed apply leaves the old snapshot in place, so the next cycle
//!   sees the same difference and retries.
//!
//! Retries happen at the fixed sync period with no backoff.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::applier::{ApplyError, RuleApplier};
use crate::config::GenericSyncConfig;
use crate::membership::{differs, MembershipSnapshot};
use crate::source::{MemberSource, SourceError};

/// Shortest period the loop will tick at; smaller values are raised to it.
pub const MIN_SYNC_PERIOD: Duration = Duration::from_millis(100);

fn checked_period(period: Duration) -> Duration {
    if period < MIN_SYNC_PERIOD {
        tracing::warn!(
            requested = ?period,
            using = ?MIN_SYNC_PERIOD,
            "sync period too short, raising it"
        );
        return MIN_SYNC_PERIOD;
    }
    period
}

/// What a single reconciliation cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Membership matched the held snapshot; nothing was applied.
    Unchanged,
    /// A new snapshot with `members` addresses was applied.
    Applied {
        /// Number of addresses applied.
        members: usize,
    },
    /// The source could not be read; the held snapshot was kept.
    FetchFailed,
    /// The applier failed; the held snapshot was kept.
    ApplyFailed,
}

/// Progress counters shared with the health server.
#[derive(Debug, Default)]
pub struct SyncStatus {
    converged: AtomicBool,
    members: AtomicUsize,
    cycles: AtomicU64,
    failures: AtomicU64,
}

impl SyncStatus {
    /// Returns true once membership has been applied and no apply failure
    /// is pending.
    ///
    /// A failed fetch leaves this unchanged: the artifact still matches the
    /// last membership that could be observed.
    pub fn is_converged(&self) -> bool {
        self.converged.load(Ordering::Relaxed)
    }

    /// Number of addresses in the last applied snapshot.
    pub fn members(&self) -> usize {
        self.members.load(Ordering::Relaxed)
    }

    /// Number of completed cycles.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Number of cycles that ended in a failure.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn record(&self, outcome: CycleOutcome) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        match outcome {
            CycleOutcome::Applied { members } => {
                self.members.store(members, Ordering::Relaxed);
                self.converged.store(true, Ordering::Relaxed);
            }
            CycleOutcome::Unchanged => self.converged.store(true, Ordering::Relaxed),
            CycleOutcome::ApplyFailed => {
                self.converged.store(false, Ordering::Relaxed);
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
            CycleOutcome::FetchFailed => {
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Drives fetch → diff → apply on a fixed period.
///
/// The reconciler is the only writer of its held snapshot and of the
/// applier's artifact; cycles run strictly one after another.
pub struct Reconciler {
    source: Arc<dyn MemberSource>,
    applier: Arc<dyn RuleApplier>,

    /// Last snapshot successfully applied.
    held: MembershipSnapshot,

    /// False until the first successful apply. An empty first fetch must
    /// still converge the artifact, so "never applied" is distinct from
    /// "applied an empty snapshot".
    applied_once: bool,

    sync_period: Duration,
    fetch_timeout: Duration,
    apply_timeout: Duration,
    status: Arc<SyncStatus>,
}

impl Reconciler {
    /// Creates a reconciler with the default period and timeouts.
    pub fn new(source: Arc<dyn MemberSource>, applier: Arc<dyn RuleApplier>) -> Self {
        Self::from_config(source, applier, &GenericSyncConfig::default())
    }

    /// Creates a reconciler using the period and timeouts in `config`.
    ///
    /// A period below [`MIN_SYNC_PERIOD`] is raised to it.
    pub fn from_config(
        source: Arc<dyn MemberSource>,
        applier: Arc<dyn RuleApplier>,
        config: &GenericSyncConfig,
    ) -> Self {
        Self {
            source,
            applier,
            held: MembershipSnapshot::new(),
            applied_once: false,
            sync_period: checked_period(config.sync_period),
            fetch_timeout: config.fetch_timeout,
            apply_timeout: config.apply_timeout,
            status: Arc::new(SyncStatus::default()),
        }
    }

    /// Sets the time between cycles, raised to at least [`MIN_SYNC_PERIOD`].
    pub fn with_sync_period(mut self, period: Duration) -> Self {
        self.sync_period = checked_period(period);
        self
    }

    /// Sets the per-call fetch and apply timeouts.
    pub fn with_timeouts(mut self, fetch: Duration, apply: Duration) -> Self {
        self.fetch_timeout = fetch;
        self.apply_timeout = apply;
        self
    }

    /// Returns the last successfully applied snapshot.
    pub fn held(&self) -> &MembershipSnapshot {
        &self.held
    }

    /// Returns the shared status handle.
    pub fn status(&self) -> Arc<SyncStatus> {
        self.status.clone()
    }

    /// Runs one fetch → diff → apply cycle.
    pub async fn run_once(&mut self) -> CycleOutcome {
        let outcome = self.reconcile().await;
        self.status.record(outcome);
        outcome
    }

    async fn reconcile(&mut self) -> CycleOutcome {
        let fetched = match self.fetch().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "failed to fetch node membership, keeping previous snapshot"
                );
                return CycleOutcome::FetchFailed;
            }
        };

        if self.applied_once && !differs(&self.held, &fetched) {
            tracing::debug!(members = fetched.len(), "no changes detected in kubernetes nodes");
            return CycleOutcome::Unchanged;
        }

        tracing::info!(
            applier = self.applier.name(),
            previous = %self.held,
            current = %fetched,
            "node membership changed"
        );

        match self.apply(&fetched).await {
            Ok(()) => {
                let members = fetched.len();
                self.held = fetched;
                self.applied_once = true;
                tracing::info!(applier = self.applier.name(), members, "applied node membership");
                CycleOutcome::Applied { members }
            }
            Err(e) => {
                tracing::error!(
                    applier = self.applier.name(),
                    error = %e,
                    "failed to apply node membership, will retry"
                );
                CycleOutcome::ApplyFailed
            }
        }
    }

    async fn fetch(&self) -> Result<MembershipSnapshot, SourceError> {
        tokio::time::timeout(self.fetch_timeout, self.source.fetch())
            .await
            .map_err(|_| SourceError::Timeout(self.fetch_timeout))?
    }

    async fn apply(&self, snapshot: &MembershipSnapshot) -> Result<(), ApplyError> {
        tokio::time::timeout(self.apply_timeout, self.applier.apply(snapshot))
            .await
            .map_err(|_| ApplyError::Timeout(self.apply_timeout))?
    }

    /// Runs cycles at a fixed rate until `cancel` fires.
    ///
    /// Cancellation is abrupt: a cycle in flight is dropped where it stands.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(
            applier = self.applier.name(),
            period = ?self.sync_period,
            "starting reconciler"
        );

        let mut ticker = tokio::time::interval(self.sync_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::warn!("shutdown requested during a cycle, abandoning it");
                    break;
                }
                outcome = self.run_once() => {
                    tracing::debug!(?outcome, "cycle finished");
                }
            }
        }

        tracing::info!("reconciler stopped");
    }
}
