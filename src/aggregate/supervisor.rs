// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Snapshot supervision
//!
//! Sits in front of the orchestrator with one TTL'd snapshot per variant,
//! a minimum-interval guard on caller-forced refreshes, and graceful
//! degradation to stale data when a refresh fails. Prefers returning some
//! data (fresh, partial or stale) over an error whenever any aggregation
//! has ever succeeded.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::{AggregateConfig, SourceConfig};
use super::extractor::Extractor;
use super::orchestrator::Orchestrator;
use super::types::{AggregateError, AggregationResult};

/// The refresh operation the supervisor drives
///
/// Implemented by [`FeedAggregator`] in production; tests substitute
/// counting or failing implementations.
#[async_trait]
pub trait Aggregate: Send + Sync {
    /// Produce a complete aggregation result
    async fn aggregate(
        &self,
        include_details: bool,
    ) -> Result<AggregationResult, AggregateError>;
}

/// Binds an [`Orchestrator`] to its configured sources and strategies
pub struct FeedAggregator {
    orchestrator: Orchestrator,
    sources: Vec<SourceConfig>,
    extractors: Vec<Arc<dyn Extractor>>,
}

impl FeedAggregator {
    /// Bundle the orchestrator with its inputs
    pub fn new(
        orchestrator: Orchestrator,
        sources: Vec<SourceConfig>,
        extractors: Vec<Arc<dyn Extractor>>,
    ) -> Self {
        Self {
            orchestrator,
            sources,
            extractors,
        }
    }
}

#[async_trait]
impl Aggregate for FeedAggregator {
    async fn aggregate(
        &self,
        include_details: bool,
    ) -> Result<AggregationResult, AggregateError> {
        self.orchestrator
            .run(&self.sources, &self.extractors, include_details)
            .await
    }
}

/// One cached aggregation result plus when it was taken
pub struct Snapshot {
    /// The aggregation result
    pub value: AggregationResult,
    /// Monotonic capture time, used for freshness checks
    pub taken_at: Instant,
    /// Wall-clock capture time, reported to callers
    pub taken_at_utc: DateTime<Utc>,
    /// Which variant this snapshot belongs to
    pub include_details: bool,
}

/// What a caller gets back from [`SnapshotSupervisor::get`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorResponse {
    /// The served aggregation result
    pub value: AggregationResult,
    /// When the served snapshot was taken
    pub last_updated: DateTime<Utc>,
    /// True when a forced refresh was rejected by the interval guard
    pub rate_limited: bool,
    /// Set when a refresh failed and a stale snapshot is served instead
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_error: Option<String>,
}

/// Snapshot metadata without the payload
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMeta {
    /// When the snapshot was taken
    pub last_updated: DateTime<Utc>,
    /// Which variant it holds
    pub include_details: bool,
}

/// TTL'd snapshot cache over an [`Aggregate`], one slot per variant
pub struct SnapshotSupervisor {
    aggregate: Arc<dyn Aggregate>,
    ttl: Duration,
    min_force_interval: Duration,
    slots: [RwLock<Option<Arc<Snapshot>>>; 2],
    // Process-global on purpose: one caller's forced refresh holds the
    // guard for everyone
    last_force: Mutex<Option<Instant>>,
}

impl SnapshotSupervisor {
    /// Create a supervisor over the given refresh operation
    pub fn new(aggregate: Arc<dyn Aggregate>, config: &AggregateConfig) -> Self {
        Self {
            aggregate,
            ttl: config.snapshot_ttl(),
            min_force_interval: config.min_force_interval(),
            slots: [RwLock::new(None), RwLock::new(None)],
            last_force: Mutex::new(None),
        }
    }

    /// Serve the snapshot for a variant, refreshing it as policy dictates
    ///
    /// A fresh snapshot is served without any fetch. A forced refresh inside
    /// the minimum interval is served the existing snapshot tagged
    /// `rate_limited` — unless no snapshot exists yet, in which case the
    /// guard is bypassed because there is nothing to fall back to. A failed
    /// refresh degrades to the prior snapshot annotated with the error, and
    /// only propagates when no snapshot has ever been taken.
    pub async fn get(
        &self,
        include_details: bool,
        force_refresh: bool,
    ) -> Result<SupervisorResponse, AggregateError> {
        if !force_refresh {
            if let Some(snapshot) = self.read_slot(include_details) {
                if snapshot.taken_at.elapsed() < self.ttl {
                    debug!("Serving fresh snapshot (details={})", include_details);
                    return Ok(Self::respond(&snapshot, false, None));
                }
            }
        }

        if force_refresh {
            let within_guard = self
                .last_force
                .lock()
                .ok()
                .and_then(|guard| *guard)
                .map(|at| at.elapsed() < self.min_force_interval)
                .unwrap_or(false);

            if within_guard {
                if let Some(snapshot) = self.read_slot(include_details) {
                    debug!("Forced refresh rate-limited; serving existing snapshot");
                    return Ok(Self::respond(&snapshot, true, None));
                }
                // Nothing to fall back to: admit the refresh anyway
            }

            if let Ok(mut last_force) = self.last_force.lock() {
                *last_force = Some(Instant::now());
            }
        }

        match self.aggregate.aggregate(include_details).await {
            Ok(value) => {
                let snapshot = Arc::new(Snapshot {
                    value,
                    taken_at: Instant::now(),
                    taken_at_utc: Utc::now(),
                    include_details,
                });
                // Wholesale replacement; concurrent refreshes race safely,
                // last writer wins
                if let Ok(mut slot) = self.slot(include_details).write() {
                    *slot = Some(Arc::clone(&snapshot));
                }
                info!(
                    "Snapshot refreshed (details={}, {} records)",
                    include_details, snapshot.value.total
                );
                Ok(Self::respond(&snapshot, false, None))
            }
            Err(err) => {
                if let Some(snapshot) = self.read_slot(include_details) {
                    warn!("Refresh failed, serving stale snapshot: {}", err);
                    return Ok(Self::respond(&snapshot, false, Some(err.to_string())));
                }
                Err(err)
            }
        }
    }

    /// Metadata of the current snapshot for a variant, if any
    pub fn meta(&self, include_details: bool) -> Option<SnapshotMeta> {
        self.read_slot(include_details).map(|snapshot| SnapshotMeta {
            last_updated: snapshot.taken_at_utc,
            include_details: snapshot.include_details,
        })
    }

    /// Start the background warm task
    ///
    /// Refreshes immediately, then on every `period` tick. Failures are
    /// logged and swallowed so the loop never terminates itself; the task
    /// stops when the returned handle is dropped or
    /// [`stop`](WarmHandle::stop)ped.
    pub fn spawn_warm(self: &Arc<Self>, period: Duration) -> WarmHandle {
        let supervisor = Arc::clone(self);
        let token = CancellationToken::new();
        let task_token = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => {
                        debug!("Warm task stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = supervisor.get(false, false).await {
                            warn!("Warm refresh failed: {}", err);
                        }
                    }
                }
            }
        });

        WarmHandle { token, handle }
    }

    fn slot(&self, include_details: bool) -> &RwLock<Option<Arc<Snapshot>>> {
        &self.slots[include_details as usize]
    }

    fn read_slot(&self, include_details: bool) -> Option<Arc<Snapshot>> {
        self.slot(include_details).read().ok()?.clone()
    }

    fn respond(
        snapshot: &Snapshot,
        rate_limited: bool,
        stale_error: Option<String>,
    ) -> SupervisorResponse {
        SupervisorResponse {
            value: snapshot.value.clone(),
            last_updated: snapshot.taken_at_utc,
            rate_limited,
            stale_error,
        }
    }
}

/// Handle owning the warm task's lifecycle
pub struct WarmHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl WarmHandle {
    /// Ask the warm task to stop at its next tick boundary
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Wait for the task to finish after a stop
    pub async fn stopped(mut self) {
        let _ = (&mut self.handle).await;
    }

    /// Whether the task has exited
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for WarmHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::{advance, sleep};

    struct CountingAggregate {
        calls: AtomicUsize,
        failing: AtomicBool,
    }

    impl CountingAggregate {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failing: AtomicBool::new(false),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Aggregate for CountingAggregate {
        async fn aggregate(
            &self,
            _include_details: bool,
        ) -> Result<AggregationResult, AggregateError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.failing.load(Ordering::SeqCst) {
                return Err(AggregateError::AllSourcesFailed { errors: vec![] });
            }
            Ok(AggregationResult {
                success: true,
                records: vec![],
                // Marks which fetch produced this value
                total: call,
                section_totals: BTreeMap::new(),
                errors: vec![],
            })
        }
    }

    fn config(ttl_ms: u64, min_force_ms: u64) -> AggregateConfig {
        AggregateConfig {
            snapshot_ttl_ms: ttl_ms,
            min_force_interval_ms: min_force_ms,
            ..AggregateConfig::default()
        }
    }

    fn supervisor(aggregate: &Arc<CountingAggregate>) -> SnapshotSupervisor {
        SnapshotSupervisor::new(
            Arc::clone(aggregate) as Arc<dyn Aggregate>,
            &config(60_000, 60_000),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_snapshot_served_without_fetch() {
        let aggregate = Arc::new(CountingAggregate::new());
        let sup = supervisor(&aggregate);

        let first = sup.get(false, false).await.unwrap();
        assert_eq!(aggregate.calls(), 1);
        assert!(!first.rate_limited);

        let second = sup.get(false, false).await.unwrap();
        assert_eq!(aggregate.calls(), 1);
        assert_eq!(second.value.total, first.value.total);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_snapshot_refreshes() {
        let aggregate = Arc::new(CountingAggregate::new());
        let sup = supervisor(&aggregate);

        sup.get(false, false).await.unwrap();
        advance(Duration::from_millis(60_001)).await;

        let result = sup.get(false, false).await.unwrap();
        assert_eq!(aggregate.calls(), 2);
        assert_eq!(result.value.total, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_refresh_rate_limit_scenario() {
        let aggregate = Arc::new(CountingAggregate::new());
        let sup = supervisor(&aggregate);

        // t=0: plain get performs fetch #1
        sup.get(false, false).await.unwrap();
        assert_eq!(aggregate.calls(), 1);

        // t=30s: forced refresh admitted (no prior force recorded)
        advance(Duration::from_millis(30_000)).await;
        let forced = sup.get(false, true).await.unwrap();
        assert_eq!(aggregate.calls(), 2);
        assert!(!forced.rate_limited);
        assert_eq!(forced.value.total, 2);

        // t=31s: forced refresh inside the guard performs zero fetches and
        // serves fetch #2's value tagged rate_limited
        advance(Duration::from_millis(1_000)).await;
        let limited = sup.get(false, true).await.unwrap();
        assert_eq!(aggregate.calls(), 2);
        assert!(limited.rate_limited);
        assert_eq!(limited.value.total, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_refresh_bypasses_guard_without_snapshot() {
        let aggregate = Arc::new(CountingAggregate::new());
        let sup = supervisor(&aggregate);

        // First-ever call is forced: nothing to fall back to, so it runs
        let first = sup.get(false, true).await.unwrap();
        assert_eq!(aggregate.calls(), 1);
        assert!(!first.rate_limited);

        // Immediately forcing again hits the guard, now with a fallback
        let second = sup.get(false, true).await.unwrap();
        assert_eq!(aggregate.calls(), 1);
        assert!(second.rate_limited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_variants_have_independent_slots() {
        let aggregate = Arc::new(CountingAggregate::new());
        let sup = supervisor(&aggregate);

        sup.get(false, false).await.unwrap();
        sup.get(true, false).await.unwrap();
        assert_eq!(aggregate.calls(), 2);

        // Both slots are now fresh
        sup.get(false, false).await.unwrap();
        sup.get(true, false).await.unwrap();
        assert_eq!(aggregate.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_serves_stale_snapshot() {
        let aggregate = Arc::new(CountingAggregate::new());
        let sup = supervisor(&aggregate);

        let fresh = sup.get(false, false).await.unwrap();
        assert_eq!(fresh.value.total, 1);

        aggregate.set_failing(true);
        advance(Duration::from_millis(60_001)).await;

        let stale = sup.get(false, false).await.unwrap();
        assert_eq!(stale.value.total, 1);
        assert!(stale.stale_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_without_snapshot_propagates() {
        let aggregate = Arc::new(CountingAggregate::new());
        aggregate.set_failing(true);
        let sup = supervisor(&aggregate);

        let result = sup.get(false, false).await;
        assert!(matches!(
            result,
            Err(AggregateError::AllSourcesFailed { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_meta_reflects_current_snapshot() {
        let aggregate = Arc::new(CountingAggregate::new());
        let sup = supervisor(&aggregate);

        assert!(sup.meta(false).is_none());
        sup.get(false, false).await.unwrap();

        let meta = sup.meta(false).unwrap();
        assert!(!meta.include_details);
        assert!(sup.meta(true).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_warm_task_refreshes_on_interval() {
        let aggregate = Arc::new(CountingAggregate::new());
        let sup = Arc::new(supervisor(&aggregate));

        let warm = sup.spawn_warm(Duration::from_secs(60));

        // Immediate first tick
        sleep(Duration::from_millis(10)).await;
        assert_eq!(aggregate.calls(), 1);

        // Next tick one period later
        sleep(Duration::from_secs(61)).await;
        assert_eq!(aggregate.calls(), 2);

        warm.stop();
        warm.stopped().await;
        sleep(Duration::from_secs(120)).await;
        assert_eq!(aggregate.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_warm_task_survives_failures() {
        let aggregate = Arc::new(CountingAggregate::new());
        aggregate.set_failing(true);
        let sup = Arc::new(supervisor(&aggregate));

        let warm = sup.spawn_warm(Duration::from_secs(60));

        sleep(Duration::from_millis(10)).await;
        sleep(Duration::from_secs(61)).await;
        // Still ticking despite every refresh failing
        assert!(aggregate.calls() >= 2);
        assert!(!warm.is_finished());

        warm.stop();
        warm.stopped().await;
    }
}
