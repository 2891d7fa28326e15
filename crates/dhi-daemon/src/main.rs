//! dhi-daemon - the Dhi cognitive middleware control plane.
//!
//! Startup order matters: the local `.env` seed and provider credentials
//! are read while the process is still effectively single-threaded, the
//! environment fingerprint is captured and compared against (or
//! initialized as) the project baseline, the ledger writer is spawned,
//! and only then does the HTTP surface start accepting requests.
//! Shutdown cancels the global kill switch first so every live pipeline
//! (sandbox included) terminates before the listener closes.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dhi_core::gate::DeterminismGate;
use dhi_daemon::config::{DEFAULT_ENV_ALLOWLIST, DaemonConfig, load_dotenv};
use dhi_daemon::gateway::{HttpGateway, ProviderKeys};
use dhi_daemon::http::router;
use dhi_daemon::ledger::LedgerHandle;
use dhi_daemon::manifest_store::ManifestStore;
use dhi_daemon::sandbox::SandboxExecutor;
use dhi_daemon::sandbox::backend::{
    CONTAINER_RUNTIME_ENV_VAR, DEFAULT_CONTAINER_RUNTIME, MICROVM_RUNTIME_ENV_VAR,
};
use dhi_daemon::sandbox::plan::PlanConfig;
use dhi_daemon::state::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// dhi daemon - verification-first LLM middleware
#[derive(Parser, Debug)]
#[command(name = "dhi-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// HTTP listen address
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Path to the SQLite VEIL ledger
    #[arg(long, default_value = "data/veil.db")]
    ledger_path: PathBuf,

    /// Root directory of the manifest store
    #[arg(long, default_value = "data/manifests")]
    manifest_root: PathBuf,

    /// Root directory of the durable artifact tree
    #[arg(long, default_value = "data/artifacts")]
    artifact_root: PathBuf,

    /// Path of the persisted baseline fingerprint
    #[arg(long, default_value = "data/baseline.json")]
    baseline_path: PathBuf,

    /// Container runtime binary for fast/balanced modes
    #[arg(long, env = CONTAINER_RUNTIME_ENV_VAR, default_value = DEFAULT_CONTAINER_RUNTIME)]
    container_runtime: String,

    /// MicroVM runtime binary enabling strict mode on this host
    #[arg(long, env = MICROVM_RUNTIME_ENV_VAR)]
    microvm_runtime: Option<String>,

    /// Sandbox image reference
    #[arg(long, default_value = "dhi-sandbox:latest")]
    image: String,

    /// Sandbox image build file, hashed into the fingerprint when present
    #[arg(long, default_value = "Dockerfile.sandbox")]
    sandbox_dockerfile: PathBuf,

    /// Policy: mandate strict isolation for every request
    #[arg(long)]
    require_strict: bool,

    /// Concurrency cap on live sandboxes
    #[arg(long, default_value = "4")]
    max_sandboxes: usize,

    /// Bounded wait (seconds) for a sandbox slot before backpressure
    #[arg(long, default_value = "10")]
    queue_wait_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Optional JSON file with the project test suite plan
    #[arg(long)]
    plan_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Seed provider credentials from a local .env before first read.
    let cwd = std::env::current_dir().context("failed to resolve working directory")?;
    load_dotenv(&cwd);

    let plan = match &args.plan_config {
        Some(path) => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("failed to read plan config {}", path.display()))?;
            serde_json::from_slice::<PlanConfig>(&bytes)
                .with_context(|| format!("failed to parse plan config {}", path.display()))?
        },
        None => PlanConfig::default(),
    };

    let config = DaemonConfig {
        listen: args.listen,
        ledger_path: args.ledger_path,
        manifest_root: args.manifest_root,
        artifact_root: args.artifact_root,
        baseline_path: args.baseline_path,
        container_runtime: args.container_runtime,
        microvm_runtime: args.microvm_runtime,
        sandbox_image: args.image,
        sandbox_dockerfile: Some(args.sandbox_dockerfile),
        lockfiles: vec![PathBuf::from("uv.lock"), PathBuf::from("requirements.txt")],
        require_strict: args.require_strict,
        max_sandboxes: args.max_sandboxes,
        queue_wait: Duration::from_secs(args.queue_wait_secs),
        env_allowlist: DEFAULT_ENV_ALLOWLIST.iter().map(ToString::to_string).collect(),
        plan,
    };

    let fingerprint = config.capture_fingerprint();
    let baseline = config
        .load_or_init_baseline(&fingerprint)
        .context("failed to load or initialize the baseline fingerprint")?;
    info!(
        fingerprint = %fingerprint.fingerprint_hash(),
        baseline = %baseline.fingerprint_hash(),
        "environment fingerprint captured"
    );

    let ledger = LedgerHandle::spawn(&config.ledger_path).context("failed to open VEIL ledger")?;
    let manifests =
        ManifestStore::open(&config.manifest_root).context("failed to open manifest store")?;
    let gateway = HttpGateway::new(ProviderKeys::from_env());
    let executor = SandboxExecutor {
        container_runtime: config.container_runtime.clone(),
        microvm_runtime: config.microvm_runtime.clone(),
        image: config.sandbox_image.clone(),
        artifact_root: config.artifact_root.clone(),
        require_strict: config.require_strict,
    };
    let gate = DeterminismGate::new(baseline);

    let listen = config.listen;
    let state = Arc::new(AppState::new(
        config, gateway, executor, ledger, manifests, gate, fingerprint,
    ));

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!(addr = %listen, "dhi daemon listening");

    let shutdown = state.shutdown.clone();
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Global kill switch: every live pipeline observes this token
            // and terminates its sandbox with prejudice.
            shutdown.cancel();
            info!("shutdown requested, cancelling live pipelines");
        })
        .await
        .context("server error")?;

    info!("daemon shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
