use serde::{Deserialize, Serialize, Serializer};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::retry::SuccessCriterion;
use crate::unit::UnitPlan;

pub const DEFAULT_WARMUP_WORKERS: usize = 10;
pub const DEFAULT_WARMUP_ITERATIONS: usize = 100;
pub const DEFAULT_ITERATIONS_PER_WORKER: usize = 100;
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_SAMPLER_WORKERS: usize = 3;
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 1_000;

/// The four positional command-line parameters, unvalidated.
#[derive(Debug, Clone)]
pub struct RunArgs {
    pub thread_group_size: i64,
    pub num_thread_groups: i64,
    pub delay_secs: i64,
    pub target_base_url: String,
}

/// Fully validated run parameters. Built once, read-only afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    pub thread_group_size: usize,
    pub num_thread_groups: usize,
    pub inter_group_delay_secs: u64,
    pub warmup_workers: usize,
    pub warmup_iterations_per_worker: usize,
    pub iterations_per_worker: usize,
    pub max_retries: u32,
    pub target_base_url: String,
    pub sampler_workers: usize,
    pub success_criterion: SuccessCriterion,
    #[serde(serialize_with = "serialize_display")]
    pub unit_plan: UnitPlan,
    pub subtract_delay: bool,
    pub output_dir: PathBuf,
    pub progress_interval_ms: u64,
    pub request_timeout_ms: u64,
}

fn serialize_display<S: Serializer>(plan: &UnitPlan, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(plan)
}

impl RunConfig {
    /// Combine positional arguments with optional file settings and validate
    /// the result. Nothing is started when this fails.
    pub fn resolve(args: RunArgs, file: &FileConfig) -> Result<Self, ConfigError> {
        let thread_group_size = positive("thread_group_size", args.thread_group_size)?;
        let num_thread_groups = positive("num_thread_groups", args.num_thread_groups)?;
        let inter_group_delay_secs = non_negative("delay_secs", args.delay_secs)?;
        let target_base_url = validate_base_url(&args.target_base_url)?;

        let max_retries = file.target.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
        if max_retries == 0 {
            return Err(ConfigError::NotPositive {
                field: "max_retries",
                value: 0,
            });
        }

        let success_criterion = match file.target.success_criterion.as_deref() {
            None => SuccessCriterion::default(),
            Some(raw) => raw.parse().map_err(|value| ConfigError::UnknownValue {
                field: "success_criterion",
                value,
            })?,
        };

        let unit_plan = match file.scenario.plan.as_deref() {
            None => UnitPlan::default(),
            Some(raw) => raw.parse().map_err(|_| ConfigError::UnknownValue {
                field: "plan",
                value: raw.to_string(),
            })?,
        };

        let iterations_per_worker = file
            .ramp
            .iterations_per_worker
            .unwrap_or(DEFAULT_ITERATIONS_PER_WORKER);
        check_totals(
            thread_group_size,
            num_thread_groups,
            iterations_per_worker,
            inter_group_delay_secs,
        )?;

        Ok(Self {
            thread_group_size,
            num_thread_groups,
            inter_group_delay_secs,
            warmup_workers: file.warmup.workers.unwrap_or(DEFAULT_WARMUP_WORKERS),
            warmup_iterations_per_worker: file
                .warmup
                .iterations_per_worker
                .unwrap_or(DEFAULT_WARMUP_ITERATIONS),
            iterations_per_worker,
            max_retries,
            target_base_url,
            sampler_workers: file
                .scenario
                .sampler_workers
                .unwrap_or(DEFAULT_SAMPLER_WORKERS),
            success_criterion,
            unit_plan,
            subtract_delay: file.scenario.subtract_delay.unwrap_or(false),
            output_dir: file
                .output
                .dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("results")),
            progress_interval_ms: file
                .output
                .progress_interval_ms
                .unwrap_or(DEFAULT_PROGRESS_INTERVAL_MS),
            request_timeout_ms: file.target.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
        })
    }

    /// Units the ramp phase will execute, warm-up excluded.
    pub fn expected_units(&self) -> usize {
        self.thread_group_size
            .saturating_mul(self.num_thread_groups)
            .saturating_mul(self.iterations_per_worker)
    }
}

fn positive(field: &'static str, value: i64) -> Result<usize, ConfigError> {
    if value <= 0 {
        return Err(ConfigError::NotPositive { field, value });
    }
    usize::try_from(value).map_err(|_| ConfigError::TooLarge {
        field,
        reason: format!("{value} does not fit in usize"),
    })
}

fn non_negative(field: &'static str, value: i64) -> Result<u64, ConfigError> {
    if value < 0 {
        return Err(ConfigError::Negative { field, value });
    }
    Ok(value as u64)
}

/// Reject group shapes whose worker, unit or delay totals do not fit.
fn check_totals(
    group_size: usize,
    groups: usize,
    iterations: usize,
    delay_secs: u64,
) -> Result<(), ConfigError> {
    let too_large = |field: &'static str, reason: &str| ConfigError::TooLarge {
        field,
        reason: reason.to_string(),
    };

    let workers = group_size
        .checked_mul(groups)
        .ok_or_else(|| too_large("thread_group_size", "total worker count overflows"))?;
    workers
        .checked_mul(iterations)
        .ok_or_else(|| too_large("iterations_per_worker", "total unit count overflows"))?;

    // Launch offsets are kept in milliseconds and the total delay as a Duration
    // multiplied by a u32 group count.
    let gaps = u32::try_from(groups - 1)
        .map_err(|_| too_large("num_thread_groups", "more groups than u32::MAX"))?;
    delay_secs
        .checked_mul(gaps as u64)
        .and_then(|secs| secs.checked_mul(1000))
        .ok_or_else(|| too_large("delay_secs", "total injected delay overflows"))?;
    Ok(())
}

fn validate_base_url(raw: &str) -> Result<String, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };
    let url = url::Url::parse(raw).map_err(|e| invalid(e.to_string()))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(invalid(format!("unsupported scheme {}", url.scheme())));
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(invalid("must not include query/fragment".to_string()));
    }

    Ok(raw.trim_end_matches('/').to_string())
}

/// Optional TOML settings. Every field may be omitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub ramp: RampSection,
    pub warmup: WarmupSection,
    pub target: TargetSection,
    pub scenario: ScenarioSection,
    pub output: OutputSection,
}

impl FileConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RampSection {
    pub iterations_per_worker: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmupSection {
    /// Zero skips the warm-up phase.
    pub workers: Option<usize>,
    pub iterations_per_worker: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetSection {
    pub max_retries: Option<u32>,
    /// Per-request timeout in milliseconds
    pub timeout_ms: Option<u64>,
    /// `not-error-class` or `ok-or-created`
    pub success_criterion: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioSection {
    /// `create-fetch`, `create-react`, `create-react:<kind>,...` or `create:<step>,...`
    pub plan: Option<String>,
    pub sampler_workers: Option<usize>,
    /// Report wall time minus the injected inter-group delay
    pub subtract_delay: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSection {
    pub dir: Option<PathBuf>,
    /// Progress log interval; 0 disables
    pub progress_interval_ms: Option<u64>,
}
