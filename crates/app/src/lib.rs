use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use vidgen_core::client::{check_health, ApiClient};
use vidgen_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use vidgen_core::jobs::JobStatus;
use vidgen_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, RuntimeLogMode,
    DEFAULT_LOG_FILTER,
};
use vidgen_core::params::{GenerationRequest, Preset};
use vidgen_core::relay::{relay_router, RelayState};
use vidgen_core::server::{app_router, app_state_with_config};

const DEFAULT_API_URL: &str = "http://localhost:10000";
const DEFAULT_HEALTH_URL: &str = "http://localhost:10000/health";

#[derive(Parser)]
#[command(
    name = "vidgen",
    about = "Text-to-video generation job queue"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long, global = true)]
    port: Option<u16>,

    #[arg(long, global = true)]
    host: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the job-queue API (default).
    Serve,
    /// Run the webhook relay in front of a running API.
    Relay,
    /// Submit a job, wait for it and download the video.
    Generate(GenerateArgs),
    /// Probe a health endpoint; exits 0 on HTTP 200.
    Healthcheck(HealthcheckArgs),
}

#[derive(Args)]
struct GenerateArgs {
    #[arg(long, default_value = DEFAULT_API_URL, help = "Base URL of the API")]
    url: String,
    #[arg(long, help = "Text prompt")]
    prompt: String,
    #[arg(long, help = "Preset name (portrait_60s, portrait_30s, landscape_60s, landscape_30s)")]
    preset: Option<Preset>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    #[arg(long)]
    video_length: Option<u32>,
    #[arg(long)]
    fps: Option<u32>,
    #[arg(long)]
    seed: Option<i64>,
    #[arg(long = "steps")]
    num_inference_steps: Option<u32>,
    #[arg(short = 'o', long, help = "Where to save the video (default: <job_id>.mp4)")]
    output: Option<PathBuf>,
    #[arg(long, default_value_t = 1800, help = "Give up polling after this many seconds")]
    max_wait: u64,
    #[arg(long, default_value_t = 10, help = "Seconds between status checks")]
    poll_interval: u64,
}

#[derive(Args)]
struct HealthcheckArgs {
    #[arg(default_value = DEFAULT_HEALTH_URL)]
    url: String,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let mode = match cli.command {
        None | Some(Commands::Serve) => RuntimeLogMode::Server,
        Some(Commands::Relay) => RuntimeLogMode::Relay,
        Some(Commands::Generate(_)) | Some(Commands::Healthcheck(_)) => RuntimeLogMode::Cli,
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    // One-shot commands should not leave log files behind.
    let log_data_dir = match mode {
        RuntimeLogMode::Cli => None,
        _ => Some(resolved_data_dir.as_path()),
    };
    init_logging(mode, log_data_dir, cli.verbose, cli.log_filter.as_deref());
    log_startup_metadata(mode, log_data_dir);

    match cli.command {
        None | Some(Commands::Serve) => {
            let config = load_config(&resolved_data_dir, cli.host, cli.port)?;
            run_server(config).await
        }
        Some(Commands::Relay) => {
            let config = load_config(&resolved_data_dir, cli.host, cli.port)?;
            run_relay(config).await
        }
        Some(Commands::Generate(args)) => run_generate(args).await,
        Some(Commands::Healthcheck(args)) => {
            if check_health(&args.url).await {
                Ok(())
            } else {
                std::process::exit(1);
            }
        }
    }
}

/// File, then environment, then command line. Relative paths resolve against
/// the working directory.
fn load_config(
    data_dir: &Path,
    host_override: Option<String>,
    port_override: Option<u16>,
) -> Result<AppConfig> {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let cfg_path = config_path(data_dir);
    let mut config = match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };
    config.apply_env_overrides();
    apply_cli_overrides(&mut config, host_override, port_override);

    let cwd = std::env::current_dir().context("failed to read working directory")?;
    config.resolve_paths(&cwd);
    Ok(config)
}

/// `--host`/`--port` apply to whichever listener the command starts.
fn apply_cli_overrides(config: &mut AppConfig, host: Option<String>, port: Option<u16>) {
    if let Some(host) = host {
        config.server.host = host.clone();
        config.relay.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
        config.relay.port = port;
    }
}

fn init_logging(
    mode: RuntimeLogMode,
    data_dir: Option<&Path>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) {
    let panic_hook_plan = logging::install_panic_hook(data_dir);

    let init_options = LoggingInitOptions {
        mode,
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let file_env_filter = parse_env_filter_with_fallback(&file_filter, "file");

            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(appender)
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            // No data dir is the normal case for one-shot commands.
            if let Some(attempted_log_dir) = attempted_log_dir {
                warn!(
                    attempted_log_dir = %attempted_log_dir.display(),
                    reason = %reason,
                    "Persistent file logging unavailable; continuing with console-only logging"
                );
            }
        }
    }

    if let PanicHookInstallPlan::Fallback { reason } = panic_hook_plan {
        if data_dir.is_some() {
            warn!(
                reason = %reason,
                "Panic crash artifact hook unavailable; continuing without panic artifacts"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(mode: RuntimeLogMode, data_dir: Option<&Path>) {
    let pid = std::process::id();
    if let Some(data_dir) = data_dir {
        let cfg_path = config_path(data_dir);
        info!(
            mode = mode.as_str(),
            pid,
            data_dir = %data_dir.display(),
            config_path = %cfg_path.display(),
            "Runtime startup metadata"
        );
    } else {
        info!(mode = mode.as_str(), pid, "Runtime startup metadata");
    }
}

async fn run_server(config: AppConfig) -> Result<()> {
    info!(
        model_root = %config.paths.model_root.display(),
        output_dir = %config.paths.output_dir.display(),
        pool_size = config.workers.effective_pool_size(),
        "Server configuration"
    );

    let state = app_state_with_config(&config)?;
    if config.model.preload {
        state.start_background_warmup();
    } else {
        info!("Model preload disabled; the first job will load it");
    }

    let app = app_router(state);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!(%addr, "Starting vidgen server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn run_relay(config: AppConfig) -> Result<()> {
    let state = RelayState::new(&config.relay.api_base_url, config.relay.port)
        .context("invalid relay API base URL")?;

    let addr = format!("{}:{}", config.relay.host, config.relay.port);
    info!(
        %addr,
        api_base_url = %config.relay.api_base_url,
        "Starting vidgen webhook relay"
    );

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, relay_router(state)).await?;
    Ok(())
}

fn build_generate_request(args: &GenerateArgs) -> GenerationRequest {
    let mut request = GenerationRequest::with_prompt(args.prompt.clone());
    request.preset = args.preset.map(|preset| preset.as_str().to_string());
    request.width = args.width;
    request.height = args.height;
    request.video_length = args.video_length;
    request.fps = args.fps;
    request.seed = args.seed;
    request.num_inference_steps = args.num_inference_steps;
    request
}

fn default_output_path(job_id: &str) -> PathBuf {
    PathBuf::from(format!("{job_id}.mp4"))
}

async fn run_generate(args: GenerateArgs) -> Result<()> {
    let client = ApiClient::new(&args.url)?;

    let health = client
        .health()
        .await
        .context("API is not reachable; is the server running?")?;
    info!(
        model_state = ?health.model_state,
        active_jobs = health.active_jobs,
        "API is up"
    );

    let request = build_generate_request(&args);
    let created = client.submit(&request).await.context("failed to submit job")?;
    info!(
        job_id = %created.job_id,
        estimated_secs = created.estimated_time,
        "Job submitted"
    );

    let poll_interval = Duration::from_secs(args.poll_interval.max(1));
    let max_wait = Duration::from_secs(args.max_wait);
    let finished = client
        .wait_for_completion(&created.job_id, poll_interval, max_wait)
        .await?;

    match finished.status {
        JobStatus::Completed => {
            let Some(video_url) = finished.video_url.as_deref() else {
                bail!("job {} completed without a video URL", finished.job_id);
            };
            let dest = args
                .output
                .clone()
                .unwrap_or_else(|| default_output_path(&finished.job_id));
            let bytes = client.download(video_url, &dest).await?;
            info!(
                job_id = %finished.job_id,
                path = %dest.display(),
                bytes,
                "Video downloaded"
            );
            Ok(())
        }
        status => bail!(
            "job {} ended as {status}: {}",
            finished.job_id,
            finished.error.as_deref().unwrap_or("no error message")
        ),
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    #[test]
    fn no_subcommand_means_serve() {
        let cli = Cli::try_parse_from(["vidgen", "--port", "9000"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.port, Some(9000));
    }

    #[test]
    fn generate_parses_preset_and_defaults() {
        let cli = Cli::try_parse_from([
            "vidgen",
            "generate",
            "--prompt",
            "a fox in snow",
            "--preset",
            "landscape_30s",
        ])
        .unwrap();
        let Some(Commands::Generate(args)) = cli.command else {
            panic!("expected generate");
        };
        assert_eq!(args.url, DEFAULT_API_URL);
        assert_eq!(args.preset, Some(Preset::Landscape30s));
        assert_eq!(args.max_wait, 1800);
        assert_eq!(args.poll_interval, 10);

        let request = build_generate_request(&args);
        assert_eq!(request.prompt.as_deref(), Some("a fox in snow"));
        assert_eq!(request.preset.as_deref(), Some("landscape_30s"));
        assert!(request.width.is_none());
    }

    #[test]
    fn generate_rejects_unknown_preset() {
        let result = Cli::try_parse_from([
            "vidgen",
            "generate",
            "--prompt",
            "x",
            "--preset",
            "square_10s",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn healthcheck_url_defaults_to_local_api() {
        let cli = Cli::try_parse_from(["vidgen", "healthcheck"]).unwrap();
        let Some(Commands::Healthcheck(args)) = cli.command else {
            panic!("expected healthcheck");
        };
        assert_eq!(args.url, DEFAULT_HEALTH_URL);
    }

    #[test]
    fn default_output_is_named_after_job() {
        assert_eq!(default_output_path("abc"), PathBuf::from("abc.mp4"));
    }
}

#[cfg(test)]
mod config_override_tests {
    use super::*;

    #[test]
    fn cli_overrides_apply_to_both_listeners() {
        let mut config = AppConfig::default();
        apply_cli_overrides(&mut config, Some("127.0.0.1".to_string()), Some(9100));
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.relay.host, "127.0.0.1");
        assert_eq!(config.relay.port, 9100);
    }

    #[test]
    fn missing_overrides_keep_config() {
        let mut config = AppConfig::default();
        apply_cli_overrides(&mut config, None, None);
        assert_eq!(config.server.port, 10000);
        assert_eq!(config.relay.port, 8080);
    }
}
