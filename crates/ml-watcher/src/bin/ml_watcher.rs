/*
 * 5D Labs Agent Platform - ML Model Watcher
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! ML Watcher Service - dataset `ConfigMap` to model regeneration
//!
//! This service keeps the recommendation model in step with its dataset by:
//! - Polling the dataset `ConfigMap` and fingerprinting its parameters
//! - Creating a one-shot Kubernetes Job for every new fingerprint
//! - Rolling the serving Deployment once the Job succeeds
//! - Providing health, readiness and status endpoints

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use k8s_openapi::api::core::v1::ConfigMap;
use ml_watcher::lease::LeaderElector;
use ml_watcher::state::ConfigMapStateStore;
use ml_watcher::telemetry::{self, LogFormat};
use ml_watcher::{
    Fingerprint, JobNamer, KubePlatform, Platform, Reconciler, StateStore, TaskSpec,
    WatchedConfig, WatcherConfig,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

/// Regenerates the recommendation model whenever the dataset `ConfigMap` changes
#[derive(Parser)]
#[command(name = "ml-watcher")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to the watcher configuration file
    #[arg(long, env = "ML_WATCHER_CONFIG_PATH", default_value = DEFAULT_CONFIG_PATH, global = true)]
    config: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value = "json", global = true)]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reconciler loop until SIGINT/SIGTERM (default)
    Run,
    /// Run a single tick and exit
    Once,
    /// Print the fingerprint of a dataset ConfigMap manifest
    Fingerprint {
        /// ConfigMap manifest (YAML)
        #[arg(long)]
        file: PathBuf,
    },
    /// Print the regeneration Job that would be created for a ConfigMap manifest
    RenderJob {
        /// ConfigMap manifest (YAML)
        #[arg(long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.log_format);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&cli.config).await,
        Commands::Once => once(&cli.config).await,
        Commands::Fingerprint { file } => {
            let watched = read_manifest(&file)?;
            let params = watched.params()?;
            println!("{}", Fingerprint::of(&params));
            Ok(())
        }
        Commands::RenderJob { file } => {
            let config = load_watcher_config(&cli.config)?;
            let watched = read_manifest(&file)?;
            let params = watched.params()?;
            let spec = TaskSpec {
                name: JobNamer::new().next_name(&params.dataset_name),
                namespace: config.namespace.clone(),
                fingerprint: Fingerprint::of(&params),
                params,
            };
            let job = ml_watcher::job::build_job(&spec, &config.job);
            print!("{}", serde_yaml::to_string(&job)?);
            Ok(())
        }
    }
}

async fn run(config_path: &Path) -> Result<()> {
    info!(
        "Starting ML Watcher Service v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = load_watcher_config(config_path)?;
    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let reconciler = Arc::new(build_reconciler(&config, &client));

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let server_handle = if config.server.enabled {
        let listener = tokio::net::TcpListener::bind(&config.server.bind_address)
            .await
            .with_context(|| format!("Failed to bind {}", config.server.bind_address))?;
        info!("HTTP server listening on {}", config.server.bind_address);

        let app = ml_watcher::server::router(Arc::clone(&reconciler), &config.server);
        let stop = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(stop.cancelled_owned())
                .await
            {
                error!("HTTP server error: {}", e);
            }
        }))
    } else {
        None
    };

    if config.leader_election.enabled {
        let elector =
            LeaderElector::new(client.clone(), &config.namespace, &config.leader_election);
        lead_until_shutdown(&reconciler, &elector, &shutdown).await?;
    } else {
        // run() restores persisted state before the first tick
        reconciler.run(shutdown.clone()).await;
    }
    shutdown.cancel();

    if let Some(handle) = server_handle {
        let _ = handle.await;
    }

    info!("ML Watcher Service stopped");
    Ok(())
}

/// Alternate between waiting for the lease and reconciling while holding it.
///
/// Each term runs on a child token: losing the lease ends the term and
/// re-enters the election, only process shutdown ends the loop.
async fn lead_until_shutdown(
    reconciler: &Reconciler,
    elector: &LeaderElector,
    shutdown: &CancellationToken,
) -> Result<()> {
    loop {
        info!(identity = %elector.identity(), "Waiting for leader lease");
        if !elector.acquire(shutdown).await? {
            info!("Shutdown requested before leadership was acquired");
            return Ok(());
        }

        let term = shutdown.child_token();
        let renewal = elector.spawn_renewal(term.clone());
        reconciler.run(term.clone()).await;
        term.cancel();
        let _ = renewal.await;

        if shutdown.is_cancelled() {
            if let Err(e) = elector.release().await {
                warn!("Failed to release leader lease: {}", e);
            }
            return Ok(());
        }
        warn!(identity = %elector.identity(), "Leadership lost, re-entering election");
    }
}

async fn once(config_path: &Path) -> Result<()> {
    let config = load_watcher_config(config_path)?;
    let client = kube::Client::try_default().await?;
    let reconciler = build_reconciler(&config, &client);
    if let Err(e) = reconciler.restore().await {
        warn!("Failed to restore persisted state, starting cold: {}", e);
    }

    let report = reconciler.tick().await;
    for observation in &report.observations {
        info!(?observation, "Task observation");
    }
    let action = report.action?;
    info!(?action, "Tick complete");
    Ok(())
}

fn build_reconciler(config: &WatcherConfig, client: &kube::Client) -> Reconciler {
    let platform: Arc<dyn Platform> = Arc::new(KubePlatform::new(
        client.clone(),
        &config.namespace,
        config.job.clone(),
    ));
    let store: Option<Arc<dyn StateStore>> = config.state.persist.then(|| {
        Arc::new(ConfigMapStateStore::new(
            client.clone(),
            &config.namespace,
            &config.state.config_map_name,
        )) as Arc<dyn StateStore>
    });

    Reconciler::new(config, platform, store)
}

fn load_watcher_config(config_path: &Path) -> Result<WatcherConfig> {
    let path = config_path.to_string_lossy();
    let mut config = match WatcherConfig::from_mounted_file(&path) {
        Ok(cfg) => {
            info!("Loaded watcher configuration from {}", path);
            cfg
        }
        Err(err) => {
            warn!(
                "Failed to load configuration from {}: {}. Using defaults.",
                path, err
            );
            WatcherConfig::default()
        }
    };

    config.apply_env_overrides()?;
    config
        .validate()
        .context("Watcher configuration validation failed")?;
    Ok(config)
}

fn read_manifest(path: &Path) -> Result<WatchedConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let cm: ConfigMap = serde_yaml::from_str(&content)
        .with_context(|| format!("{} is not a ConfigMap manifest", path.display()))?;
    Ok(WatchedConfig::new(
        cm.metadata.name.unwrap_or_default(),
        cm.metadata.namespace.unwrap_or_default(),
        cm.data.unwrap_or_default(),
    ))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
