use anyhow::{Context, Result};
use clap::Parser;
use loadrig_core::{
    AlbumProfile, ConsoleReportSink, CsvReportSink, FileConfig, HttpApi, MockApi, Orchestrator,
    ResourceApi, ResourcePayload, RunArgs, RunConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Size of the generated image when `--image` is not given.
const SYNTHETIC_IMAGE_BYTES: usize = 4096;

#[derive(Parser, Debug)]
#[command(name = "loadrig")]
#[command(about = "Staged thread-group load generator for a resource service")]
struct Args {
    /// Workers launched per thread group
    thread_group_size: i64,

    /// Number of thread groups
    num_thread_groups: i64,

    /// Seconds to wait between consecutive groups
    delay_secs: i64,

    /// Base URL of the service, e.g. http://localhost:8080/app
    target_base_url: String,

    /// Optional TOML file with run settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Collaborator: mock or http
    #[arg(long, default_value = "http")]
    mode: String,

    /// Simulated latency per mock call
    #[arg(long, default_value = "5")]
    mock_delay_ms: u64,

    /// Share of mock calls answered with 500
    #[arg(long, default_value = "0.0")]
    mock_error_rate: f64,

    /// Image file uploaded with every create call
    #[arg(long)]
    image: Option<PathBuf>,

    /// Work units per worker (overrides config)
    #[arg(long)]
    iterations: Option<usize>,

    /// Attempts per call (overrides config)
    #[arg(long)]
    max_retries: Option<u32>,

    /// Sampler threads, 0 disables (overrides config)
    #[arg(long)]
    samplers: Option<usize>,

    /// Warm-up workers, 0 skips the warm-up (overrides config)
    #[arg(long)]
    warmup_workers: Option<usize>,

    /// Unit plan, e.g. create-fetch or create-react:like,dislike (overrides config)
    #[arg(long)]
    plan: Option<String>,

    /// Exclude the injected inter-group delay from wall time
    #[arg(long)]
    subtract_delay: bool,

    /// Parent directory for run results (overrides config)
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Print the resolved config and ramp schedule, then exit
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut file = match &args.config {
        Some(path) => FileConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => FileConfig::default(),
    };
    apply_overrides(&mut file, &args);

    let config = RunConfig::resolve(
        RunArgs {
            thread_group_size: args.thread_group_size,
            num_thread_groups: args.num_thread_groups,
            delay_secs: args.delay_secs,
            target_base_url: args.target_base_url.clone(),
        },
        &file,
    )
    .context("Invalid run parameters")?;

    if args.dry_run {
        return print_plan(&config);
    }

    let api: Arc<dyn ResourceApi> = match args.mode.as_str() {
        "mock" => Arc::new(
            MockApi::new(args.mock_delay_ms).with_failures(args.mock_error_rate, 0.0, 0),
        ),
        "http" => {
            let io_threads = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4);
            Arc::new(
                HttpApi::new(&config.target_base_url, config.request_timeout_ms, io_threads)
                    .context("Failed to create HTTP client")?,
            )
        }
        _ => anyhow::bail!("Invalid mode: {}, must be 'mock' or 'http'", args.mode),
    };
    info!("Using collaborator: {}", api.name());

    let payload = load_payload(args.image.as_ref())?;

    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let run_dir = config.output_dir.join(format!("run_{}", timestamp));

    Orchestrator::new(config, api, payload)
        .with_sink(CsvReportSink::new(&run_dir))
        .with_sink(ConsoleReportSink)
        .run()?;

    Ok(())
}

fn apply_overrides(file: &mut FileConfig, args: &Args) {
    if let Some(n) = args.iterations {
        file.ramp.iterations_per_worker = Some(n);
    }
    if let Some(n) = args.max_retries {
        file.target.max_retries = Some(n);
    }
    if let Some(n) = args.samplers {
        file.scenario.sampler_workers = Some(n);
    }
    if let Some(n) = args.warmup_workers {
        file.warmup.workers = Some(n);
    }
    if let Some(plan) = &args.plan {
        file.scenario.plan = Some(plan.clone());
    }
    if args.subtract_delay {
        file.scenario.subtract_delay = Some(true);
    }
    if let Some(dir) = &args.output_dir {
        file.output.dir = Some(dir.clone());
    }
}

fn load_payload(image: Option<&PathBuf>) -> Result<ResourcePayload> {
    match image {
        Some(path) => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("Failed to read image {:?}", path))?;
            info!("Uploading {} ({} bytes) per create", path.display(), bytes.len());
            Ok(ResourcePayload::new(bytes, AlbumProfile::default()))
        }
        None => Ok(ResourcePayload::synthetic(SYNTHETIC_IMAGE_BYTES)),
    }
}

fn print_plan(config: &RunConfig) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);

    let planner = loadrig_core::RampPlanner::from_config(config);
    println!("\n=== Ramp Schedule ===");
    for group in planner.groups() {
        println!(
            "Group {}: {} workers at +{}ms",
            group.index + 1,
            group.workers,
            group.launch_offset_ms
        );
    }
    println!("Total workers: {}", planner.total_workers());
    println!("Injected delay: {:?}", planner.total_delay());
    println!("Expected units: {}", config.expected_units());
    Ok(())
}
