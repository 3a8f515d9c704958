use crate::{
    appliance::HttpAppliance,
    broker::consume_amqp,
    config::Config,
    device::{DeviceController, DeviceOps, DeviceSession},
    dispatcher::{Dispatcher, JobDescriptor, run_once},
    orchestrator::{JobExecutor, PhaseOrchestrator},
    storage::{ArtifactSource, StorageClient},
    util::{ensure_dir, now_rfc3339},
};
use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "traffic-worker")]
#[command(about = "Device-bound worker that drives APK traffic-analysis jobs from a shared queue")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Path to config TOML. If omitted, uses ./traffic-worker.toml if present.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override log level (trace/debug/info/warn/error).
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Consume the job queue until the broker closes.
    Consume {},
    /// Run one job without the queue and print its report.
    Run {
        #[arg(long)]
        app: String,
        /// Defaults to the latest version known to storage.
        #[arg(long)]
        version: Option<String>,
    },
    /// Download an APK (or its privacy policy) from storage.
    Fetch {
        #[arg(long)]
        app: String,
        #[arg(long)]
        version: Option<String>,
        #[arg(long)]
        policy: bool,
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
    /// Print device diagnostics as JSON.
    Doctor {},
    Install {
        #[arg(long)]
        apk: PathBuf,
        #[arg(long)]
        grant: bool,
    },
    Reboot {
        #[arg(long)]
        wait: bool,
        #[arg(long)]
        unlock: bool,
    },
}

pub fn dispatch(args: Args) -> Result<()> {
    let cfg_path = resolve_config_path(args.config.as_deref());
    let cfg = Config::load(&cfg_path)?;
    let log_path = resolve_log_path(&cfg);
    let _guard = init_logging(&args, &cfg, log_path.as_deref())?;
    info!(config = %cfg_path.display(), "configuration loaded");

    match &args.cmd {
        Command::Consume {} => consume(&cfg),
        Command::Run { app, version } => run(&cfg, app, version.as_deref()),
        Command::Fetch {
            app,
            version,
            policy,
            out_dir,
        } => fetch(&cfg, app, version.as_deref(), *policy, out_dir.as_deref()),
        Command::Doctor {} => doctor(&cfg),
        Command::Install { apk, grant } => install(&cfg, apk, *grant),
        Command::Reboot { wait, unlock } => reboot(&cfg, *wait, *unlock),
    }
}

pub fn resolve_config_path(user: Option<&Path>) -> PathBuf {
    if let Some(p) = user {
        return p.to_path_buf();
    }
    let default = PathBuf::from("traffic-worker.toml");
    if default.exists() {
        default
    } else {
        PathBuf::from("traffic-worker.example.toml")
    }
}

fn init_logging(args: &Args, cfg: &Config, file_path: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(cfg.logging.level.as_str());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stdout_layer = if cfg.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_names(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .boxed()
    };

    let (file_layer, guard) = if let Some(path) = file_path {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        ensure_dir(parent)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file: {}", path.display()))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to init logging: {e}"))?;

    Ok(guard)
}

fn resolve_log_path(cfg: &Config) -> Option<PathBuf> {
    if !cfg.logging.write_to_file {
        return None;
    }
    if !cfg.logging.file_path.is_empty() {
        return Some(PathBuf::from(&cfg.logging.file_path));
    }
    Some(PathBuf::from("traffic-worker.log"))
}

fn controller(cfg: &Config) -> Result<Arc<DeviceController>> {
    let session = DeviceSession::resolve(&cfg.device)?;
    info!(device = session.serial(), "device session resolved");
    Ok(Arc::new(DeviceController::new(&cfg.device, &session)))
}

fn orchestrator(cfg: &Config, device: &Arc<DeviceController>) -> Result<PhaseOrchestrator> {
    let appliance = Arc::new(HttpAppliance::new(&cfg.appliance)?);
    let preflight: Arc<dyn DeviceOps> = device.clone();
    Ok(
        PhaseOrchestrator::new(&cfg.testing, DeviceOps::serial(device.as_ref()), appliance)
            .with_preflight(preflight),
    )
}

fn consume(cfg: &Config) -> Result<()> {
    let device = controller(cfg)?;
    if !device.ensure_reachable() {
        warn!(device = DeviceOps::serial(device.as_ref()), "device is not reachable at start");
    }

    let storage: Arc<dyn ArtifactSource> = Arc::new(StorageClient::new(&cfg.storage)?);
    let executor: Arc<dyn JobExecutor> = Arc::new(orchestrator(cfg, &device)?);
    let ops: Arc<dyn DeviceOps> = device.clone();
    let dispatcher = Dispatcher::new(cfg, storage, executor, Some(ops))?;

    let started = now_rfc3339();
    let summary = consume_amqp(&cfg.broker, &dispatcher)?;
    info!(
        started = %started,
        received = summary.received,
        acked = summary.acked,
        "consumer stopped"
    );
    Ok(())
}

fn run(cfg: &Config, app: &str, version: Option<&str>) -> Result<()> {
    let storage = StorageClient::new(&cfg.storage)?;
    let version = match version {
        Some(v) => v.to_string(),
        None => storage
            .resolve_version(app)
            .ok_or_else(|| anyhow!("no version of {app} known to storage"))?,
    };
    let device = controller(cfg)?;
    let orchestrator = orchestrator(cfg, &device)?;

    let staging = PathBuf::from(&cfg.storage.staging_dir);
    ensure_dir(&staging)?;
    let job = JobDescriptor::new(app, &version);
    let report = run_once(&storage, &orchestrator, &job, &staging)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn fetch(
    cfg: &Config,
    app: &str,
    version: Option<&str>,
    policy: bool,
    out_dir: Option<&Path>,
) -> Result<()> {
    let storage = StorageClient::new(&cfg.storage)?;
    let version = match version {
        Some(v) => v.to_string(),
        None => storage
            .resolve_version(app)
            .ok_or_else(|| anyhow!("no version of {app} known to storage"))?,
    };
    let out_dir = out_dir.map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    ensure_dir(&out_dir)?;

    let path = if policy {
        storage.fetch_policy(app, &version, &out_dir)?
    } else {
        storage.fetch_apk(app, &version, &out_dir)?
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "app": app,
            "version": version,
            "path": path,
        }))?
    );
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    let device = controller(cfg)?;
    let status = device.status();
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "config": {
                "tool_path": cfg.device.tool_path,
                "aapt_path": cfg.device.aapt_path,
                "broker": format!("{}:{}", cfg.broker.host, cfg.broker.port),
                "storage": cfg.storage.base_url,
                "appliance": cfg.appliance.base_url,
                "fleet_position": cfg.fleet_position(),
            },
            "device": status,
        }))?
    );
    Ok(())
}

fn install(cfg: &Config, apk: &Path, grant: bool) -> Result<()> {
    let device = controller(cfg)?;
    let report = device
        .install(apk, grant)
        .with_context(|| format!("installing {}", apk.display()))?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.installed {
        return Err(anyhow!("{} is not installed after install", report.package));
    }
    Ok(())
}

fn reboot(cfg: &Config, wait: bool, unlock: bool) -> Result<()> {
    let device = controller(cfg)?;
    if unlock && cfg.device.password().is_none() {
        warn!("unlock requested without device.unlock_password, skipping unlock");
    }
    let ok = device.reboot(wait, unlock);
    println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "ok": ok }))?);
    if !ok {
        return Err(anyhow!("reboot did not complete"));
    }
    Ok(())
}
