use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::api::{ResourceApi, ResourcePayload};
use crate::collector::{CallRecord, RecordCollector};
use crate::config::RunConfig;
use crate::ramp::RampPlanner;
use crate::report::ReportSink;
use crate::retry::RetryPolicy;
use crate::stats::{LatencyStats, RunStatistics};
use crate::unit::UnitPlan;
use crate::worker::{
    CompletionLatch, CounterSnapshot, ResourceRegistry, RunCounters, Sampler, Worker,
    WorkerContext, WorkerPool,
};

/// Wall time never drops below this, so throughput stays finite.
const MIN_WALL_SECS: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Warmup,
    Ramp,
    Drain,
    Report,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Warmup => "WARMUP",
            Phase::Ramp => "RAMP",
            Phase::Drain => "DRAIN",
            Phase::Report => "REPORT",
        };
        f.write_str(name)
    }
}

/// Result of a finished run, handed to every [`ReportSink`].
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub config: RunConfig,
    pub api: String,
    /// RFC 3339 time the ramp started.
    pub started_at: String,
    pub wall_time_secs: f64,
    pub injected_delay_secs: f64,
    /// Successful main-load calls per wall-clock second.
    pub throughput_per_sec: f64,
    pub expected_units: usize,
    pub counters: CounterSnapshot,
    pub sampler_counters: CounterSnapshot,
    pub statistics: RunStatistics,
    pub sampler_latency: LatencyStats,
    pub panicked_threads: usize,
    /// Main-load records in arrival order.
    #[serde(skip)]
    pub records: Vec<CallRecord>,
}

/// Live handles of the ramp phase, consumed by the drain.
struct RampState {
    latch: Arc<CompletionLatch>,
    workers: WorkerPool,
    auxiliary: WorkerPool,
    cancel: Arc<AtomicBool>,
    collector: Arc<RecordCollector>,
    sampler_collector: Arc<RecordCollector>,
    counters: Arc<RunCounters>,
    sampler_counters: Arc<RunCounters>,
}

struct Drained {
    records: Vec<CallRecord>,
    sampler_records: Vec<CallRecord>,
    counters: CounterSnapshot,
    sampler_counters: CounterSnapshot,
    panicked: usize,
}

/// Drives one run through WARMUP, RAMP, DRAIN and REPORT, in that order.
pub struct Orchestrator {
    config: RunConfig,
    api: Arc<dyn ResourceApi>,
    payload: Arc<ResourcePayload>,
    plan: Arc<UnitPlan>,
    planner: RampPlanner,
    sinks: Vec<Box<dyn ReportSink>>,
}

impl Orchestrator {
    pub fn new(config: RunConfig, api: Arc<dyn ResourceApi>, payload: ResourcePayload) -> Self {
        let plan = Arc::new(config.unit_plan.clone());
        let planner = RampPlanner::from_config(&config);
        Self {
            config,
            api,
            payload: Arc::new(payload),
            plan,
            planner,
            sinks: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: impl ReportSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn run(&self) -> Result<RunReport> {
        info!(
            "Starting run against {} via {}: {} groups x {} workers x {} iterations, {}s between groups",
            self.config.target_base_url,
            self.api.name(),
            self.config.num_thread_groups,
            self.config.thread_group_size,
            self.config.iterations_per_worker,
            self.config.inter_group_delay_secs
        );

        self.warmup();

        let started_at = Utc::now().to_rfc3339();
        let start = Instant::now();
        let state = self.ramp();
        self.await_workers(&state);
        let elapsed = start.elapsed();
        let drained = self.drain(state);

        let report = self.report(started_at, elapsed, drained);
        for sink in &self.sinks {
            sink.emit(&report)
                .with_context(|| format!("Report sink '{}' failed", sink.name()))?;
        }
        Ok(report)
    }

    fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.config.max_retries, self.config.success_criterion)
    }

    fn context(
        &self,
        counters: Arc<RunCounters>,
        registry: Option<Arc<ResourceRegistry>>,
    ) -> WorkerContext {
        WorkerContext {
            api: Arc::clone(&self.api),
            plan: Arc::clone(&self.plan),
            payload: Arc::clone(&self.payload),
            policy: self.policy(),
            counters,
            registry,
        }
    }

    fn warmup(&self) {
        let workers = self.config.warmup_workers;
        let iterations = self.config.warmup_iterations_per_worker;
        if workers == 0 || iterations == 0 {
            info!("Phase {}: skipped", Phase::Warmup);
            return;
        }
        info!(
            "Phase {}: {} workers x {} iterations",
            Phase::Warmup,
            workers,
            iterations
        );

        let latch = Arc::new(CompletionLatch::new(workers));
        let collector = Arc::new(RecordCollector::new());
        let counters = Arc::new(RunCounters::new());
        let ctx = self.context(Arc::clone(&counters), None);
        let mut pool = WorkerPool::with_capacity("warmup", workers);

        for id in 0..workers {
            let worker = Worker::new(
                id,
                iterations,
                ctx.clone(),
                collector.sink(),
                Arc::clone(&latch),
            );
            if let Err(e) = pool.spawn(&id.to_string(), move || {
                worker.run();
            }) {
                error!("{:#}", e);
            }
        }

        latch.wait();
        pool.join_all();

        let done = counters.snapshot();
        info!(
            "Warm-up finished: {} units ({} failed), {} records discarded",
            done.units_total(),
            done.units_failed,
            collector.len()
        );
    }

    fn ramp(&self) -> RampState {
        let total = self.planner.total_workers();
        info!(
            "Phase {}: {} workers in {} groups, {:?} injected delay",
            Phase::Ramp,
            total,
            self.config.num_thread_groups,
            self.planner.total_delay()
        );

        let latch = Arc::new(CompletionLatch::new(total));
        let collector = Arc::new(RecordCollector::new());
        let sampler_collector = Arc::new(RecordCollector::new());
        let counters = Arc::new(RunCounters::new());
        let sampler_counters = Arc::new(RunCounters::new());
        let cancel = Arc::new(AtomicBool::new(false));

        let registry = (self.config.sampler_workers > 0).then(|| Arc::new(ResourceRegistry::new()));
        let ctx = self.context(Arc::clone(&counters), registry.clone());

        let mut workers = WorkerPool::with_capacity("worker", total);
        let mut auxiliary = WorkerPool::with_capacity("aux", self.config.sampler_workers + 1);

        for group in self.planner.groups() {
            info!(
                "Launching group {} ({} workers, +{}ms)",
                group.index + 1,
                group.workers,
                group.launch_offset_ms
            );
            for slot in 0..group.workers {
                let id = group.index * self.config.thread_group_size + slot;
                let worker = Worker::new(
                    id,
                    self.config.iterations_per_worker,
                    ctx.clone(),
                    collector.sink(),
                    Arc::clone(&latch),
                );
                if let Err(e) = workers.spawn(&id.to_string(), move || {
                    worker.run();
                }) {
                    error!("{:#}", e);
                }
            }

            if group.index == 0 {
                if let Some(registry) = &registry {
                    self.start_samplers(
                        &mut auxiliary,
                        registry,
                        &sampler_collector,
                        &sampler_counters,
                        &cancel,
                    );
                }
                self.start_progress(&mut auxiliary, &latch, &collector, &counters);
            }

            if let Some(delay) = group.delay_after {
                std::thread::sleep(delay);
            }
        }

        RampState {
            latch,
            workers,
            auxiliary,
            cancel,
            collector,
            sampler_collector,
            counters,
            sampler_counters,
        }
    }

    fn start_samplers(
        &self,
        pool: &mut WorkerPool,
        registry: &Arc<ResourceRegistry>,
        collector: &Arc<RecordCollector>,
        counters: &Arc<RunCounters>,
        cancel: &Arc<AtomicBool>,
    ) {
        for id in 0..self.config.sampler_workers {
            let sampler = Sampler {
                id,
                api: Arc::clone(&self.api),
                registry: Arc::clone(registry),
                policy: self.policy(),
                counters: Arc::clone(counters),
                sink: collector.sink(),
                cancel: Arc::clone(cancel),
            };
            if let Err(e) = pool.spawn(&format!("sampler-{id}"), move || {
                sampler.run();
            }) {
                error!("{:#}", e);
            }
        }
    }

    /// Log progress every interval until the latch reaches zero.
    fn start_progress(
        &self,
        pool: &mut WorkerPool,
        latch: &Arc<CompletionLatch>,
        collector: &Arc<RecordCollector>,
        counters: &Arc<RunCounters>,
    ) {
        if self.config.progress_interval_ms == 0 {
            return;
        }
        let interval = Duration::from_millis(self.config.progress_interval_ms);
        let latch = Arc::clone(latch);
        let collector = Arc::clone(collector);
        let counters = Arc::clone(counters);
        let total = self.planner.total_workers();

        let spawned = pool.spawn("progress", move || {
            while !latch.wait_timeout(interval) {
                let done = counters.snapshot();
                info!(
                    "Progress: workers_done={}/{} records={} units_ok={} partial={} failed={}",
                    total - latch.remaining(),
                    total,
                    collector.len(),
                    done.units_succeeded,
                    done.units_partial,
                    done.units_failed
                );
            }
        });
        if let Err(e) = spawned {
            warn!("Progress logging disabled: {:#}", e);
        }
    }

    /// The run ends when the last worker counts down. Samplers are told to
    /// stop here and are joined later, outside the measured wall time.
    fn await_workers(&self, state: &RampState) {
        info!(
            "Phase {}: waiting for {} workers",
            Phase::Drain,
            state.latch.remaining()
        );
        state.latch.wait();
        state.cancel.store(true, Ordering::Release);
    }

    fn drain(&self, state: RampState) -> Drained {
        let panicked = state.auxiliary.join_all() + state.workers.join_all();

        Drained {
            records: state.collector.records(),
            sampler_records: state.sampler_collector.records(),
            counters: state.counters.snapshot(),
            sampler_counters: state.sampler_counters.snapshot(),
            panicked,
        }
    }

    fn report(&self, started_at: String, elapsed: Duration, drained: Drained) -> RunReport {
        info!("Phase {}: {} records", Phase::Report, drained.records.len());

        let injected = self.planner.total_delay().as_secs_f64();
        let mut wall = elapsed.as_secs_f64();
        if self.config.subtract_delay {
            wall -= injected;
        }
        let wall = wall.max(MIN_WALL_SECS);

        let expected_units = self.config.expected_units();
        let units = drained.counters.units_total();
        if units != expected_units as u64 {
            warn!(
                "Unit accounting mismatch: {} finished, {} expected",
                units, expected_units
            );
        }

        RunReport {
            config: self.config.clone(),
            api: self.api.name().to_string(),
            started_at,
            wall_time_secs: wall,
            injected_delay_secs: injected,
            throughput_per_sec: drained.counters.calls_succeeded as f64 / wall,
            expected_units,
            counters: drained.counters,
            sampler_counters: drained.sampler_counters,
            statistics: RunStatistics::compute(&drained.records),
            sampler_latency: LatencyStats::from_records(&drained.sampler_records),
            panicked_threads: drained.panicked,
            records: drained.records,
        }
    }
}
