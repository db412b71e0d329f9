use loadrig_core::{
    FileConfig, MockApi, Orchestrator, ResourcePayload, RunArgs, RunConfig, SuccessCriterion,
    UnitPlan,
};
use std::sync::Arc;

fn config(group_size: i64, groups: i64) -> RunConfig {
    let args = RunArgs {
        thread_group_size: group_size,
        num_thread_groups: groups,
        delay_secs: 0,
        target_base_url: "http://127.0.0.1:9/app".to_string(),
    };
    let mut config = RunConfig::resolve(args, &FileConfig::default()).unwrap();
    config.warmup_workers = 3;
    config.warmup_iterations_per_worker = 4;
    config.iterations_per_worker = 6;
    config.sampler_workers = 0;
    config.progress_interval_ms = 0;
    config
}

#[test]
fn units_add_up_under_partial_failure() {
    let mut cfg = config(3, 3);
    cfg.max_retries = 1;
    let orchestrator = Orchestrator::new(
        cfg,
        Arc::new(MockApi::new(0).with_failures(0.3, 0.1, 42)),
        ResourcePayload::synthetic(32),
    );

    let report = orchestrator.run().unwrap();
    let c = report.counters;

    assert_eq!(report.expected_units, 54);
    assert_eq!(c.units_succeeded + c.units_partial + c.units_failed, 54);
    assert!(c.units_failed > 0);
    // Every successful call leaves exactly one record; warm-up leaves none.
    assert_eq!(report.records.len() as u64, c.calls_succeeded);
    assert_eq!(report.statistics.overall.count as u64, c.calls_succeeded);
    let bucketed: u64 = report.statistics.throughput.iter().map(|b| b.count).sum();
    assert_eq!(bucketed, c.calls_succeeded);
}

#[test]
fn samplers_stay_out_of_main_results() {
    let mut cfg = config(2, 2);
    cfg.sampler_workers = 2;
    let orchestrator = Orchestrator::new(
        cfg,
        Arc::new(MockApi::new(1)),
        ResourcePayload::synthetic(32),
    );

    let report = orchestrator.run().unwrap();

    assert_eq!(report.counters.units_succeeded, 24);
    assert_eq!(report.records.len(), 96);
    assert!(report.records.iter().all(|r| r.response_code < 400));
    assert_eq!(
        report.sampler_latency.count as u64,
        report.sampler_counters.calls_succeeded
    );
    assert_eq!(report.sampler_counters.units_total(), 0);
    assert_eq!(report.panicked_threads, 0);
}

#[test]
fn create_fetch_plan_with_strict_criterion() {
    let mut cfg = config(2, 1);
    cfg.unit_plan = UnitPlan::create_fetch();
    cfg.success_criterion = SuccessCriterion::OkOrCreated;
    cfg.warmup_workers = 0;
    let orchestrator = Orchestrator::new(
        cfg,
        Arc::new(MockApi::new(0)),
        ResourcePayload::synthetic(8),
    );

    let report = orchestrator.run().unwrap();

    assert_eq!(report.counters.units_succeeded, 12);
    assert_eq!(report.records.len(), 24);
    assert_eq!(report.statistics.by_category["GET albums"].count, 12);
    assert_eq!(report.statistics.by_category["POST albums"].count, 12);
}
