use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::api::{ResourceApi, ResourcePayload};
use crate::collector::{CallRecord, RecordSink};
use crate::retry::{CallOutcome, RetryPolicy};
use crate::unit::{UnitPlan, UnitStatus, WorkUnit, WorkUnitOutcome};

/// Plain counts, used both thread-locally and as a snapshot of [`RunCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub units_succeeded: u64,
    pub units_partial: u64,
    pub units_failed: u64,
    pub calls_succeeded: u64,
    pub calls_failed: u64,
}

impl CounterSnapshot {
    pub fn add(&mut self, outcome: &WorkUnitOutcome) {
        match outcome.status {
            UnitStatus::Succeeded => self.units_succeeded += 1,
            UnitStatus::Partial => self.units_partial += 1,
            UnitStatus::Failed => self.units_failed += 1,
        }
        self.calls_succeeded += outcome.succeeded_calls as u64;
        self.calls_failed += outcome.failed_calls as u64;
    }

    pub fn units_total(&self) -> u64 {
        self.units_succeeded + self.units_partial + self.units_failed
    }
}

/// Shared totals for one phase. Workers merge into it once, when they finish.
#[derive(Debug, Default)]
pub struct RunCounters {
    units_succeeded: AtomicU64,
    units_partial: AtomicU64,
    units_failed: AtomicU64,
    calls_succeeded: AtomicU64,
    calls_failed: AtomicU64,
}

impl RunCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&self, local: &CounterSnapshot) {
        self.units_succeeded
            .fetch_add(local.units_succeeded, Ordering::Relaxed);
        self.units_partial
            .fetch_add(local.units_partial, Ordering::Relaxed);
        self.units_failed.fetch_add(local.units_failed, Ordering::Relaxed);
        self.calls_succeeded
            .fetch_add(local.calls_succeeded, Ordering::Relaxed);
        self.calls_failed.fetch_add(local.calls_failed, Ordering::Relaxed);
    }

    /// Count a standalone call. Samplers use this; they have no units.
    pub fn add_call(&self, succeeded: bool) {
        if succeeded {
            self.calls_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.calls_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            units_succeeded: self.units_succeeded.load(Ordering::Relaxed),
            units_partial: self.units_partial.load(Ordering::Relaxed),
            units_failed: self.units_failed.load(Ordering::Relaxed),
            calls_succeeded: self.calls_succeeded.load(Ordering::Relaxed),
            calls_failed: self.calls_failed.load(Ordering::Relaxed),
        }
    }
}

/// Countdown latch: `wait` returns once `count_down` was called `count` times.
#[derive(Debug)]
pub struct CompletionLatch {
    remaining: Mutex<usize>,
    zero: Condvar,
}

impl CompletionLatch {
    pub fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            zero: Condvar::new(),
        }
    }

    pub fn count_down(&self) {
        let mut remaining = self.remaining.lock().unwrap_or_else(|p| p.into_inner());
        if *remaining > 0 {
            *remaining -= 1;
            if *remaining == 0 {
                self.zero.notify_all();
            }
        }
    }

    pub fn remaining(&self) -> usize {
        *self.remaining.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn wait(&self) {
        let guard = self.remaining.lock().unwrap_or_else(|p| p.into_inner());
        let _guard = self
            .zero
            .wait_while(guard, |remaining| *remaining > 0)
            .unwrap_or_else(|p| p.into_inner());
    }

    /// Returns true if the latch reached zero within `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.remaining.lock().unwrap_or_else(|p| p.into_inner());
        let (guard, _) = self
            .zero
            .wait_timeout_while(guard, timeout, |remaining| *remaining > 0)
            .unwrap_or_else(|p| p.into_inner());
        *guard == 0
    }
}

/// Counts its latch down exactly once when dropped, including when the owning
/// worker panics or is never started.
struct LatchGuard(Arc<CompletionLatch>);

impl Drop for LatchGuard {
    fn drop(&mut self) {
        self.0.count_down();
    }
}

/// Ids created during the ramp, for samplers to read back.
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    ids: RwLock<Vec<String>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, id: String) {
        self.ids.write().unwrap_or_else(|p| p.into_inner()).push(id);
    }

    pub fn len(&self) -> usize {
        self.ids.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn random<R: Rng>(&self, rng: &mut R) -> Option<String> {
        let ids = self.ids.read().unwrap_or_else(|p| p.into_inner());
        if ids.is_empty() {
            return None;
        }
        Some(ids[rng.gen_range(0..ids.len())].clone())
    }
}

/// Dependencies every worker of a phase shares.
#[derive(Clone)]
pub struct WorkerContext {
    pub api: Arc<dyn ResourceApi>,
    pub plan: Arc<UnitPlan>,
    pub payload: Arc<ResourcePayload>,
    pub policy: RetryPolicy,
    pub counters: Arc<RunCounters>,
    pub registry: Option<Arc<ResourceRegistry>>,
}

/// Runs a fixed number of work units back to back on one thread.
pub struct Worker {
    id: usize,
    iterations: usize,
    ctx: WorkerContext,
    sink: RecordSink,
    _done: LatchGuard,
}

impl Worker {
    pub fn new(
        id: usize,
        iterations: usize,
        ctx: WorkerContext,
        sink: RecordSink,
        latch: Arc<CompletionLatch>,
    ) -> Self {
        Self {
            id,
            iterations,
            ctx,
            sink,
            _done: LatchGuard(latch),
        }
    }

    /// Run every iteration regardless of failures, merge the local counts,
    /// then release the latch.
    pub fn run(self) -> CounterSnapshot {
        let mut local = CounterSnapshot::default();
        let unit = WorkUnit::new(
            self.ctx.api.as_ref(),
            &self.ctx.plan,
            &self.ctx.payload,
            self.ctx.policy,
        );

        for _ in 0..self.iterations {
            let outcome = unit.run(&self.sink);
            local.add(&outcome);
            if let (Some(registry), Some(id)) = (&self.ctx.registry, outcome.created_id) {
                registry.push(id);
            }
        }

        self.ctx.counters.merge(&local);
        debug!(
            "Worker {} done: units ok={} partial={} failed={}",
            self.id, local.units_succeeded, local.units_partial, local.units_failed
        );
        local
    }
}

/// Read-only load alongside the ramp: fetch the events of a random created
/// resource until cancelled.
///
/// The flag is checked once per loop, so a sampler stops at most one call
/// after cancellation. Each fetch gets a single attempt.
pub struct Sampler {
    pub id: usize,
    pub api: Arc<dyn ResourceApi>,
    pub registry: Arc<ResourceRegistry>,
    pub policy: RetryPolicy,
    pub counters: Arc<RunCounters>,
    pub sink: RecordSink,
    pub cancel: Arc<AtomicBool>,
}

const SAMPLER_IDLE: Duration = Duration::from_millis(10);

impl Sampler {
    /// Returns the number of calls made.
    pub fn run(self) -> u64 {
        let mut rng = StdRng::from_entropy();
        let policy = RetryPolicy::new(1, self.policy.criterion);
        let mut calls = 0u64;

        while !self.cancel.load(Ordering::Acquire) {
            let Some(id) = self.registry.random(&mut rng) else {
                std::thread::sleep(SAMPLER_IDLE);
                continue;
            };

            calls += 1;
            match policy.run(|| self.api.fetch_events(&id)) {
                CallOutcome::Success {
                    status,
                    started_at_ms,
                    latency_ms,
                    ..
                } => {
                    self.counters.add_call(true);
                    self.sink.record(CallRecord::new(
                        started_at_ms,
                        "GET",
                        latency_ms,
                        status,
                        Some("review".to_string()),
                    ));
                }
                CallOutcome::Exhausted { .. } => self.counters.add_call(false),
            }
        }

        debug!("Sampler {} stopped after {} calls", self.id, calls);
        calls
    }
}

/// Owns the OS threads of a run and joins all of them at the end.
pub struct WorkerPool {
    prefix: String,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn with_capacity(prefix: impl Into<String>, capacity: usize) -> Self {
        Self {
            prefix: prefix.into(),
            handles: Vec::with_capacity(capacity),
        }
    }

    pub fn spawn<F>(&mut self, label: &str, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = format!("{}-{}", self.prefix, label);
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(f)
            .with_context(|| format!("Failed to spawn thread {name}"))?;
        self.handles.push(handle);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Join every thread. Returns how many panicked.
    pub fn join_all(self) -> usize {
        let mut panicked = 0;
        for handle in self.handles {
            let name = handle.thread().name().unwrap_or("?").to_string();
            if handle.join().is_err() {
                error!("Thread {} panicked", name);
                panicked += 1;
            }
        }
        if panicked > 0 {
            warn!("{} {} threads panicked", panicked, self.prefix);
        }
        panicked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiResponse, EventKind, MockApi};
    use crate::collector::RecordCollector;
    use crate::error::CallError;
    use crate::retry::SuccessCriterion;
    use std::time::Instant;

    fn ctx(api: Arc<dyn ResourceApi>, registry: Option<Arc<ResourceRegistry>>) -> WorkerContext {
        WorkerContext {
            api,
            plan: Arc::new(UnitPlan::create_react()),
            payload: Arc::new(ResourcePayload::synthetic(8)),
            policy: RetryPolicy::new(2, SuccessCriterion::NotErrorClass),
            counters: Arc::new(RunCounters::new()),
            registry,
        }
    }

    #[test]
    fn test_latch_releases_at_zero() {
        let latch = Arc::new(CompletionLatch::new(3));
        assert!(!latch.wait_timeout(Duration::from_millis(5)));

        std::thread::scope(|s| {
            for _ in 0..3 {
                let latch = Arc::clone(&latch);
                s.spawn(move || latch.count_down());
            }
        });

        latch.wait();
        assert_eq!(latch.remaining(), 0);
        assert!(latch.wait_timeout(Duration::ZERO));
    }

    #[test]
    fn test_latch_never_goes_below_zero() {
        let latch = CompletionLatch::new(1);
        latch.count_down();
        latch.count_down();
        assert_eq!(latch.remaining(), 0);
    }

    #[test]
    fn test_worker_runs_all_iterations_and_merges() {
        let api: Arc<dyn ResourceApi> = Arc::new(MockApi::new(0));
        let registry = Arc::new(ResourceRegistry::new());
        let ctx = ctx(api, Some(Arc::clone(&registry)));
        let counters = Arc::clone(&ctx.counters);
        let collector = Arc::new(RecordCollector::new());
        let latch = Arc::new(CompletionLatch::new(1));

        let local = Worker::new(0, 25, ctx, collector.sink(), Arc::clone(&latch)).run();

        assert_eq!(local.units_succeeded, 25);
        assert_eq!(local.calls_succeeded, 100);
        assert_eq!(counters.snapshot(), local);
        assert_eq!(collector.len(), 100);
        assert_eq!(registry.len(), 25);
        assert_eq!(latch.remaining(), 0);
    }

    #[test]
    fn test_failing_worker_still_finishes() {
        let api: Arc<dyn ResourceApi> = Arc::new(MockApi::new(0).with_failures(1.0, 0.0, 1));
        let ctx = ctx(api, None);
        let collector = Arc::new(RecordCollector::new());
        let latch = Arc::new(CompletionLatch::new(1));

        let local = Worker::new(3, 10, ctx, collector.sink(), Arc::clone(&latch)).run();

        assert_eq!(local.units_failed, 10);
        assert_eq!(local.units_total(), 10);
        assert_eq!(local.calls_failed, 10);
        assert!(collector.is_empty());
        assert_eq!(latch.remaining(), 0);
    }

    #[test]
    fn test_unstarted_worker_releases_latch() {
        let api: Arc<dyn ResourceApi> = Arc::new(MockApi::new(0));
        let collector = Arc::new(RecordCollector::new());
        let latch = Arc::new(CompletionLatch::new(1));

        drop(Worker::new(0, 5, ctx(api, None), collector.sink(), Arc::clone(&latch)));

        assert_eq!(latch.remaining(), 0);
    }

    /// Slow fetch that counts calls made after cancellation.
    struct SlowApi {
        cancel: Arc<AtomicBool>,
        late_calls: AtomicU64,
    }

    impl ResourceApi for SlowApi {
        fn name(&self) -> &'static str {
            "slow"
        }
        fn create_resource(&self, _: &ResourcePayload) -> Result<ApiResponse<String>, CallError> {
            Ok(ApiResponse::new(200, "1".to_string()))
        }
        fn fetch_resource(&self, _: &str) -> Result<ApiResponse<String>, CallError> {
            Ok(ApiResponse::new(200, String::new()))
        }
        fn submit_event(&self, _: EventKind, _: &str) -> Result<ApiResponse<()>, CallError> {
            Ok(ApiResponse::new(201, ()))
        }
        fn fetch_events(&self, _: &str) -> Result<ApiResponse<String>, CallError> {
            if self.cancel.load(Ordering::Acquire) {
                self.late_calls.fetch_add(1, Ordering::SeqCst);
            }
            std::thread::sleep(Duration::from_millis(20));
            Ok(ApiResponse::new(200, String::new()))
        }
    }

    #[test]
    fn test_sampler_stops_within_one_call() {
        let cancel = Arc::new(AtomicBool::new(false));
        let api = Arc::new(SlowApi {
            cancel: Arc::clone(&cancel),
            late_calls: AtomicU64::new(0),
        });
        let registry = Arc::new(ResourceRegistry::new());
        registry.push("7".to_string());
        let collector = Arc::new(RecordCollector::new());
        let counters = Arc::new(RunCounters::new());

        let mut pool = WorkerPool::with_capacity("sampler", 3);
        for id in 0..3 {
            let sampler = Sampler {
                id,
                api: api.clone(),
                registry: Arc::clone(&registry),
                policy: RetryPolicy::new(5, SuccessCriterion::NotErrorClass),
                counters: Arc::clone(&counters),
                sink: collector.sink(),
                cancel: Arc::clone(&cancel),
            };
            pool.spawn(&id.to_string(), move || {
                sampler.run();
            })
            .unwrap();
        }

        std::thread::sleep(Duration::from_millis(100));
        cancel.store(true, Ordering::Release);
        let stopped_at = Instant::now();
        assert_eq!(pool.join_all(), 0);

        // Each sampler may have passed its check just before the flag flipped.
        assert!(api.late_calls.load(Ordering::SeqCst) <= 3);
        assert!(stopped_at.elapsed() < Duration::from_secs(1));
        assert!(counters.snapshot().calls_succeeded > 0);
        assert_eq!(collector.len() as u64, counters.snapshot().calls_succeeded);
    }

    #[test]
    fn test_sampler_idles_without_resources() {
        let cancel = Arc::new(AtomicBool::new(true));
        let collector = Arc::new(RecordCollector::new());
        let sampler = Sampler {
            id: 0,
            api: Arc::new(MockApi::new(0)),
            registry: Arc::new(ResourceRegistry::new()),
            policy: RetryPolicy::new(1, SuccessCriterion::NotErrorClass),
            counters: Arc::new(RunCounters::new()),
            sink: collector.sink(),
            cancel,
        };
        assert_eq!(sampler.run(), 0);
    }

    #[test]
    fn test_registry_random_pick() {
        let registry = ResourceRegistry::new();
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(registry.random(&mut rng), None);

        registry.push("a".to_string());
        registry.push("b".to_string());
        let pick = registry.random(&mut rng).unwrap();
        assert!(pick == "a" || pick == "b");
    }

    #[test]
    fn test_pool_counts_panics() {
        let mut pool = WorkerPool::with_capacity("t", 2);
        pool.spawn("ok", || {}).unwrap();
        pool.spawn("boom", || panic!("boom")).unwrap();
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.join_all(), 1);
    }
}
