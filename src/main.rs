//! runnr CLI entry point.
//!
//! Loads a bundle, registers every Runnable with a [`Scheduler`] and either
//! runs a single job (`--run`) or serves until Ctrl-C.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, bail};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use runnr_common::{ConfigFile, RuntimeConfig};
use runnr_core::{Bundle, Fqfn, WasmEngine, WasmRunner};
use runnr_host::Capabilities;
use runnr_scheduler::{Job, Scheduler};

const DEFAULT_LOG_FILTER: &str = "info,runnr=debug";

#[derive(Debug, Parser)]
#[command(name = "runnr", version, about = "Run a bundle of Wasm Runnables")]
struct Cli {
    /// Path to the bundle zip.
    #[arg(long, env = "RUNNR_BUNDLE_PATH")]
    bundle: Option<PathBuf>,

    /// TOML configuration file.
    #[arg(long, env = "RUNNR_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter, e.g. `info,runnr=debug`. Falls back to `RUST_LOG`.
    #[arg(long, env = "RUNNR_LOG_LEVEL")]
    log_level: Option<String>,

    /// Append JSON log lines to this file instead of stdout.
    #[arg(long, env = "RUNNR_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Run one job against this function (FQFN or bare name) and exit.
    #[arg(long, requires = "input")]
    run: Option<String>,

    /// Input for `--run`.
    #[arg(long)]
    input: Option<String>,

    #[command(flatten)]
    transport: TransportArgs,
}

/// Settings for the server transport. Parsed and reported only.
#[derive(Debug, clap::Args)]
struct TransportArgs {
    #[arg(long, env = "RUNNR_HTTP_PORT", default_value_t = 8080)]
    http_port: u16,

    #[arg(long, env = "RUNNR_TLS_PORT")]
    tls_port: Option<u16>,

    #[arg(long, env = "RUNNR_DOMAIN")]
    domain: Option<String>,

    #[arg(long, env = "RUNNR_CONTROL_PLANE")]
    control_plane: Option<String>,

    #[arg(long, env = "RUNNR_ENV_TOKEN", hide_env_values = true)]
    env_token: Option<String>,

    #[arg(long, env = "RUNNR_HEADLESS")]
    headless: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let file_config = match &cli.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load config file {}", path.display()))?,
        None => ConfigFile::default(),
    };

    init_tracing(
        cli.log_level.as_deref().or(file_config.logging.level.as_deref()),
        cli.log_file
            .clone()
            .or_else(|| file_config.logging.file.clone().map(PathBuf::from)),
    )?;

    info!("Starting runnr");
    log_transport(&cli.transport);

    let bundle_path = cli
        .bundle
        .clone()
        .or_else(|| file_config.bundle.path.clone().map(PathBuf::from))
        .context("No bundle given. Pass --bundle or set RUNNR_BUNDLE_PATH")?;

    let bundle = Bundle::read(&bundle_path)
        .with_context(|| format!("Failed to load bundle {}", bundle_path.display()))?;

    let scheduler = build_scheduler(&bundle, &file_config.runtime)?;

    if let Some(function) = cli.run.as_deref() {
        let result = run_once(&scheduler, function, cli.input.unwrap_or_default()).await;
        scheduler.shutdown().await;
        return result;
    }

    info!(job_types = ?scheduler.job_types(), "Ready. Press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    scheduler.shutdown().await;

    Ok(())
}

fn init_tracing(level: Option<&str>, log_file: Option<PathBuf>) -> anyhow::Result<()> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).with_context(|| format!("Invalid log level '{level}'"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
    };

    let (json_layer, stdout_layer) = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Mutex::new(file));
            (Some(layer), None)
        }
        None => (None, Some(tracing_subscriber::fmt::layer())),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(stdout_layer)
        .init();

    Ok(())
}

fn log_transport(transport: &TransportArgs) {
    info!(
        http_port = transport.http_port,
        tls_port = ?transport.tls_port,
        domain = ?transport.domain,
        control_plane = ?transport.control_plane,
        env_token_set = transport.env_token.is_some(),
        headless = transport.headless,
        "Transport settings (server transport not started)"
    );
}

/// Register every Runnable in `bundle` under its FQFN. One in the default
/// namespace is also reachable by its bare name, through an alias to the
/// same worker.
fn build_scheduler(bundle: &Bundle, runtime: &RuntimeConfig) -> anyhow::Result<Scheduler> {
    let directive = bundle.directive();

    let capability_config = directive.capabilities.clone().unwrap_or_default();
    let capabilities = Capabilities::from_config(&capability_config, Some(bundle.static_file_fn()))
        .context("Failed to set up capabilities")?;

    let engine = WasmEngine::new(&runtime.engine).context("Failed to create Wasm engine")?;
    let scheduler = Scheduler::with_capabilities(capabilities);

    for module_ref in bundle.runnable_refs() {
        let runner = Arc::new(WasmRunner::from_ref(
            module_ref.clone(),
            engine.clone(),
            runtime.execution.clone(),
        ));

        scheduler.register(module_ref.fqfn(), runner, runtime.worker.clone());

        let fqfn = Fqfn::parse(module_ref.fqfn());
        if fqfn.is_default_namespace() && !scheduler.alias(fqfn.name.clone(), module_ref.fqfn()) {
            warn!(name = %fqfn.name, fqfn = %module_ref.fqfn(), "bare name already taken, not aliased");
        }
    }

    if !directive.schedules.is_empty() {
        warn!(
            count = directive.schedules.len(),
            "Directive schedules need a coordinator and are not run"
        );
    }

    info!(
        identifier = %directive.identifier,
        version = %directive.version,
        runnables = bundle.runnable_refs().len(),
        static_files = bundle.static_files().count(),
        "Bundle loaded"
    );

    Ok(scheduler)
}

async fn run_once(scheduler: &Scheduler, function: &str, input: String) -> anyhow::Result<()> {
    if !scheduler.is_registered(function) {
        bail!("No runnable registered as '{function}'");
    }

    let output = scheduler
        .do_job(Job::new(function, input))
        .then()
        .await
        .with_context(|| format!("Job '{function}' failed"))?;

    let bytes = output.into_bytes()?;
    println!("{}", String::from_utf8_lossy(&bytes));

    Ok(())
}
