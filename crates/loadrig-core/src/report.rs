use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::collector::CallRecord;
use crate::orchestrator::RunReport;
use crate::stats::{LatencyStats, ThroughputBucket};

pub const RECORDS_FILE: &str = "records.csv";
pub const THROUGHPUT_FILE: &str = "throughput.csv";
pub const SUMMARY_FILE: &str = "summary.json";

/// Destination for a finished run.
pub trait ReportSink: Send + Sync {
    fn name(&self) -> &'static str;
    fn emit(&self, report: &RunReport) -> Result<()>;
}

const RECORD_HEADERS: [&str; 5] = [
    "StartTime",
    "RequestType",
    "Latency",
    "ResponseCode",
    "ApiEndpoint",
];
const THROUGHPUT_HEADERS: [&str; 2] = ["Time(S)", "Throughput"];

#[derive(Serialize)]
struct RecordRow<'a> {
    start_time: i64,
    request_type: &'a str,
    latency: i64,
    response_code: u16,
    api_endpoint: Option<&'a str>,
}

impl<'a> From<&'a CallRecord> for RecordRow<'a> {
    fn from(r: &'a CallRecord) -> Self {
        Self {
            start_time: r.start_time_ms,
            request_type: &r.operation,
            latency: r.latency_ms,
            response_code: r.response_code,
            api_endpoint: r.endpoint.as_deref(),
        }
    }
}

/// Header row is written even when there are no rows.
fn csv_writer<W: io::Write>(out: W, headers: &[&str]) -> Result<csv::Writer<W>> {
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(out);
    wtr.write_record(headers)?;
    Ok(wtr)
}

/// One row per call record, in arrival order.
pub fn write_records_csv<W: io::Write>(out: W, records: &[CallRecord]) -> Result<()> {
    let mut wtr = csv_writer(out, &RECORD_HEADERS)?;
    for record in records {
        wtr.serialize(RecordRow::from(record))?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_throughput_csv<W: io::Write>(out: W, buckets: &[ThroughputBucket]) -> Result<()> {
    let mut wtr = csv_writer(out, &THROUGHPUT_HEADERS)?;
    for b in buckets {
        wtr.serialize((b.second, b.count))?;
    }
    wtr.flush()?;
    Ok(())
}

/// Writes `records.csv`, `throughput.csv` and `summary.json` into one directory.
#[derive(Debug, Clone)]
pub struct CsvReportSink {
    dir: PathBuf,
}

impl CsvReportSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn create(&self, file: &str) -> Result<File> {
        let path = self.dir.join(file);
        File::create(&path).with_context(|| format!("Failed to create {}", path.display()))
    }
}

impl ReportSink for CsvReportSink {
    fn name(&self) -> &'static str {
        "csv"
    }

    fn emit(&self, report: &RunReport) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        write_records_csv(self.create(RECORDS_FILE)?, &report.records)
            .with_context(|| format!("Failed to write {RECORDS_FILE}"))?;
        write_throughput_csv(self.create(THROUGHPUT_FILE)?, &report.statistics.throughput)
            .with_context(|| format!("Failed to write {THROUGHPUT_FILE}"))?;
        serde_json::to_writer_pretty(self.create(SUMMARY_FILE)?, report)
            .with_context(|| format!("Failed to write {SUMMARY_FILE}"))?;

        info!(
            "Results written to {} ({} records)",
            self.dir.display(),
            report.records.len()
        );
        Ok(())
    }
}

/// Prints the run summary to stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleReportSink;

fn print_latency(label: &str, s: &LatencyStats) {
    println!(
        "{:<16} n={:<8} mean={:.2}ms median={:.1}ms p99={}ms min={}ms max={}ms",
        label, s.count, s.mean_ms, s.median_ms, s.p99_ms, s.min_ms, s.max_ms
    );
}

impl ReportSink for ConsoleReportSink {
    fn name(&self) -> &'static str {
        "console"
    }

    fn emit(&self, report: &RunReport) -> Result<()> {
        let c = &report.config;
        let units = &report.counters;

        println!("\n=== Run Summary ({}) ===", report.api);
        println!("Target: {}", c.target_base_url);
        println!(
            "Groups: {} x {} workers, {}s delay, {} iterations, plan {}",
            c.num_thread_groups,
            c.thread_group_size,
            c.inter_group_delay_secs,
            c.iterations_per_worker,
            c.unit_plan
        );
        println!("Started: {}", report.started_at);
        if c.subtract_delay {
            println!(
                "Wall time: {:.3}s ({:.0}s injected delay excluded)",
                report.wall_time_secs, report.injected_delay_secs
            );
        } else {
            println!("Wall time: {:.3}s", report.wall_time_secs);
        }
        println!("Throughput: {:.2} calls/s", report.throughput_per_sec);
        println!(
            "Units: {} succeeded, {} partial, {} failed ({} expected)",
            units.units_succeeded, units.units_partial, units.units_failed, report.expected_units
        );
        println!(
            "Calls: {} succeeded, {} failed",
            units.calls_succeeded, units.calls_failed
        );
        if c.sampler_workers > 0 {
            println!(
                "Sampler calls: {} succeeded, {} failed",
                report.sampler_counters.calls_succeeded, report.sampler_counters.calls_failed
            );
        }
        if report.panicked_threads > 0 {
            println!("Panicked threads: {}", report.panicked_threads);
        }

        println!();
        print_latency("ALL", &report.statistics.overall);
        for (category, stats) in &report.statistics.by_category {
            print_latency(category, stats);
        }
        if c.sampler_workers > 0 {
            print_latency("sampler", &report.sampler_latency);
        }
        println!();
        Ok(())
    }
}
