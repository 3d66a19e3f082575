// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! control-plane-hooks - control-plane reconciliation for Deckhouse clusters.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use control_plane_hooks::config::HooksConfig;
use control_plane_hooks::etcd::grpc::GrpcEtcdConnector;
use control_plane_hooks::health::{FlagCheck, HealthServer};
use control_plane_hooks::hook_manager::HookManager;
use control_plane_hooks::kube_api::{kube_events, KubeClusterApi};
use control_plane_hooks::reconcile_context::ReconcileContext;
use control_plane_hooks::values::Values;

/// Control-plane hooks
///
/// Resolves the effective Kubernetes version, keeps etcd membership and quota
/// in line with the master nodes, approves master updates one at a time and
/// publishes the values the control-plane-manager charts render from.
#[derive(Parser, Debug)]
#[command(name = "control-plane-hooks")]
#[command(version = control_plane_hooks::VERSION)]
#[command(about = "Deckhouse control-plane hooks", long_about = None)]
struct Args {
    /// Path to the kubeconfig file
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the module values document (YAML or JSON)
    #[arg(long)]
    values: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    log_json: bool,

    /// Port for the health and metrics server
    #[arg(long)]
    healthz_bind_port: Option<u16>,

    /// Run startup, before-helm and after-helm once, then exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level, args.log_json)?;

    info!(version = control_plane_hooks::VERSION, "starting control-plane-hooks");

    let config = load_config(args.config.as_deref(), args.healthz_bind_port).await?;
    let values = load_values(args.values.as_deref()).await?;
    info!(
        namespace = %config.namespace,
        resync_period = ?config.resync_period,
        "configuration loaded"
    );

    let client = create_client(args.kubeconfig.as_deref()).await?;
    let ctx = ReconcileContext::new(
        Arc::new(KubeClusterApi::new(client.clone())),
        Arc::new(GrpcEtcdConnector::new(config.etcd_request_timeout)),
        Arc::new(config.clone()),
    );
    let manager = HookManager::new(ctx, values);

    if args.once {
        return match manager.run_once().await {
            Ok(()) => {
                info!("single run finished");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "single run failed");
                Err(e.into())
            }
        };
    }

    let shutdown_token = manager.shutdown_token();
    tokio::spawn({
        let token = shutdown_token.clone();
        async move {
            wait_for_shutdown().await;
            token.cancel();
        }
    });

    let server = HealthServer::new(
        config.healthz_bind_address.clone(),
        config.healthz_bind_port,
        manager.metrics(),
    )
    .with_requirements(manager.requirements());
    server
        .registry()
        .register(Arc::new(FlagCheck::new("hooks", manager.readiness())))
        .await;
    let health = server.spawn(shutdown_token.clone());

    let events = kube_events(client, &config.namespace);
    if let Err(e) = manager.run(events).await {
        error!(error = %e, "hook manager failed");
        return Err(e.into());
    }

    shutdown_token.cancel();
    match health.await {
        Ok(Err(e)) => error!(error = %e, "health server failed"),
        Err(e) => error!(error = %e, "health server task failed"),
        Ok(Ok(())) => {}
    }

    info!("control-plane-hooks exited");
    Ok(())
}

/// Initializes logging based on the provided level and format.
fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(
            level
                .parse()
                .with_context(|| format!("invalid log level: {}", level))?,
        )
        .from_env_lossy();

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty())
            .init();
    }
    Ok(())
}

/// Loads the configuration file, applying command-line overrides.
async fn load_config(path: Option<&Path>, healthz_bind_port: Option<u16>) -> anyhow::Result<HooksConfig> {
    let mut config = match path {
        Some(path) => {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read config file: {:?}", path))?;
            serde_yaml::from_str::<HooksConfig>(&content)
                .with_context(|| format!("failed to parse config file: {:?}", path))?
        }
        None => HooksConfig::default(),
    };

    if let Some(port) = healthz_bind_port {
        config.healthz_bind_port = port;
    }
    Ok(config)
}

/// Loads the module values document.
async fn load_values(path: Option<&Path>) -> anyhow::Result<Values> {
    let Some(path) = path else {
        return Ok(Values::default());
    };
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read values file: {:?}", path))?;
    Values::from_yaml(&content).with_context(|| format!("failed to parse values file: {:?}", path))
}

/// Creates a Kubernetes client.
async fn create_client(kubeconfig: Option<&Path>) -> anyhow::Result<kube::Client> {
    use kube::config::{KubeConfigOptions, Kubeconfig};
    use kube::Config;

    let kube_config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("failed to read kubeconfig from: {:?}", path))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .with_context(|| format!("failed to load kubeconfig from: {:?}", path))?
        }
        None => Config::infer().await.context("failed to load kubeconfig")?,
    };

    kube::Client::try_from(kube_config).context("failed to create kubernetes client")
}

/// Waits for SIGINT or SIGTERM.
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
    }
}
