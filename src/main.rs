use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kube::CustomResourceExt;
use tracing::{error, info};

use llmsafespace::api::{AppState, create_app};
use llmsafespace::cache::SessionCache;
use llmsafespace::cluster::{KubeGateway, build_client};
use llmsafespace::config::Config;
use llmsafespace::controller;
use llmsafespace::metrics::Metrics;
use llmsafespace::service::{SandboxService, ServiceLimits};
use llmsafespace::session::SessionManager;
use llmsafespace::store::Store;
use llmsafespace::types::{RuntimeEnvironment, Sandbox, SandboxProfile, WarmPod, WarmPool};

#[derive(Parser)]
#[command(name = "llmsafespace")]
#[command(about = "Secure, isolated code execution sandboxes for LLM agents")]
#[command(version)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WebSocket orchestration service
    Api,
    /// Run the sandbox and warm-pool reconcilers
    Controller,
    /// Print the custom resource definitions as YAML
    Crd,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,llmsafespace=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env(),
    };

    match cli.command {
        Commands::Api => run_api(config).await,
        Commands::Controller => run_controller(config).await,
        Commands::Crd => print_crds(),
    }
}

async fn run_api(config: Config) -> Result<()> {
    let store = Store::connect(&config.database.url)
        .await
        .context("connect resource store")?;
    let cache = SessionCache::connect(&config.redis)
        .await
        .context("connect session cache")?;

    let client = build_client(&config.kubernetes)
        .await
        .context("build kubernetes client")?;
    let gateway = Arc::new(KubeGateway::new(client, config.kubernetes.namespace.clone()));

    let metrics = Arc::new(Metrics::default());
    let sessions = Arc::new(SessionManager::new(cache));
    let service = Arc::new(SandboxService::new(
        gateway,
        store,
        sessions,
        metrics.clone(),
        ServiceLimits {
            default_timeout: std::time::Duration::from_secs(
                config.execution.default_timeout_seconds,
            ),
            package_install_timeout: std::time::Duration::from_secs(
                config.execution.package_install_timeout_seconds,
            ),
        },
    ));

    let app = create_app(AppState { service, metrics });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, "llmsafespace API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve API")?;

    info!("shutdown complete");
    Ok(())
}

async fn run_controller(config: Config) -> Result<()> {
    let store = Store::connect(&config.database.url)
        .await
        .context("connect resource store")?;
    let client = build_client(&config.kubernetes)
        .await
        .context("build kubernetes client")?;

    let metrics = Arc::new(Metrics::default());
    let ctx = controller::Ctx::new(client, &config, store, metrics);

    if let Err(e) = controller::run_controllers(ctx, &config).await {
        error!(error = %e, "controller exited");
        std::process::exit(1);
    }
    Ok(())
}

fn print_crds() -> Result<()> {
    let crds = [
        serde_yaml::to_string(&Sandbox::crd())?,
        serde_yaml::to_string(&SandboxProfile::crd())?,
        serde_yaml::to_string(&RuntimeEnvironment::crd())?,
        serde_yaml::to_string(&WarmPool::crd())?,
        serde_yaml::to_string(&WarmPod::crd())?,
    ];
    println!("{}", crds.join("---\n"));
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
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}
