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

//! kube-node-sync - reconciles host network configuration with Kubernetes nodes.

#![warn(clippy::all)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kube_node_sync::applier::{
    FirewallChainApplier, IptablesPacketFilter, ReverseProxyApplier, RuleApplier,
};
use kube_node_sync::command::{BoxedRunner, HostCommandRunner};
use kube_node_sync::config::SyncConfig;
use kube_node_sync::health::{HealthServer, SyncStatusChecker};
use kube_node_sync::reconciler::Reconciler;
use kube_node_sync::source::KubeNodeSource;

/// Kubernetes node membership synchronizer
///
/// Polls the cluster for nodes carrying an address annotation and keeps one
/// downstream artifact in step with that membership: either an iptables
/// chain accepting traffic from every node, or an nginx upstream file.
#[derive(Parser, Debug)]
#[command(name = "kube-node-sync")]
#[command(version)]
#[command(about = "Kubernetes node membership synchronizer", long_about = None)]
struct Args {
    /// Path to the kubeconfig file
    #[arg(long, global = true)]
    kubeconfig: Option<PathBuf>,

    /// Master URL to build a client from
    #[arg(long, global = true)]
    master: Option<String>,

    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, global = true)]
    log_json: bool,

    /// Node annotation holding the node address
    #[arg(long, global = true)]
    address_annotation: Option<String>,

    /// Time between reconciliation cycles
    #[arg(long, global = true, value_parser = parse_duration)]
    sync_period: Option<Duration>,

    /// Port for the health check server
    #[arg(long, global = true)]
    healthz_bind_port: Option<u16>,

    /// Disable the health check server
    #[arg(long, global = true)]
    disable_healthz: bool,

    #[command(subcommand)]
    target: Target,
}

/// The artifact to keep in sync.
#[derive(Subcommand, Debug)]
enum Target {
    /// Maintain an iptables chain accepting traffic from every node
    Firewall {
        /// Chain to manage
        #[arg(long)]
        chain: Option<String>,

        /// Destination port accepted from nodes
        #[arg(long)]
        port: Option<u16>,

        /// iptables executable
        #[arg(long)]
        iptables: Option<String>,

        /// iptables-restore executable
        #[arg(long)]
        iptables_restore: Option<String>,
    },

    /// Maintain an nginx upstream file and reload nginx on change
    Proxy {
        /// Nginx upstream file
        #[arg(long)]
        upstream_file: Option<PathBuf>,

        /// systemctl executable
        #[arg(long)]
        systemctl: Option<String>,

        /// Unit to reload after writing the file
        #[arg(long)]
        service: Option<String>,
    },
}

fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    humantime::parse_duration(s).map_err(|e| anyhow::anyhow!("invalid duration: {}", e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level, args.log_json)?;

    info!("starting kube-node-sync");

    let (config, target) = load_config(args).await?;
    let client = create_client(&config).await?;
    let runner: BoxedRunner = Arc::new(HostCommandRunner::new());

    let applier: Arc<dyn RuleApplier> = match target {
        TargetKind::Firewall => {
            info!(
                table = %config.firewall.table,
                chain = %config.firewall.chain,
                port = config.firewall.port,
                "syncing firewall chain"
            );
            let filter = Arc::new(IptablesPacketFilter::new(
                runner,
                config.firewall.iptables.clone(),
                config.firewall.iptables_restore.clone(),
            ));
            Arc::new(FirewallChainApplier::new(filter, &config.firewall))
        }
        TargetKind::Proxy => {
            info!(path = %config.proxy.upstream_file.display(), "using nginx config file");
            Arc::new(ReverseProxyApplier::new(runner, &config.proxy))
        }
    };

    let source = Arc::new(KubeNodeSource::new(client, config.generic.address_annotation.clone()));
    let reconciler = Reconciler::from_config(source, applier, &config.generic);

    if config.generic.enable_healthz {
        let server = HealthServer::new(
            config.generic.healthz_bind_address.clone(),
            config.generic.healthz_bind_port,
        );
        server
            .registry()
            .register(Arc::new(SyncStatusChecker::new(reconciler.status())))
            .await;
        server.spawn().await.context("failed to start health server")?;
    }

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(reconciler.run(cancel.clone()));

    wait_for_shutdown().await?;
    cancel.cancel();
    handle.await.context("reconciler task failed")?;

    info!("kube-node-sync exited successfully");
    Ok(())
}

/// Which applier the subcommand selected.
#[derive(Debug, Clone, Copy)]
enum TargetKind {
    Firewall,
    Proxy,
}

/// Initializes logging based on the provided level and format.
fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.parse().context("invalid log level")?)
        .from_env_lossy();

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .init();
    }
    Ok(())
}

/// Loads the configuration from file, then applies command-line overrides.
async fn load_config(mut args: Args) -> anyhow::Result<(SyncConfig, TargetKind)> {
    let mut config = if let Some(config_path) = args.config.take() {
        let content = tokio::fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("failed to read config file: {:?}", config_path))?;

        serde_yaml::from_str::<SyncConfig>(&content)
            .with_context(|| format!("failed to parse config file: {:?}", config_path))?
    } else {
        SyncConfig::default()
    };

    if let Some(kubeconfig) = args.kubeconfig {
        config.generic.kubeconfig = Some(kubeconfig);
    }
    if let Some(master) = args.master {
        config.generic.master = Some(master);
    }
    if let Some(annotation) = args.address_annotation {
        config.generic.address_annotation = annotation;
    }
    if let Some(period) = args.sync_period {
        config.generic.sync_period = period;
    }
    if let Some(port) = args.healthz_bind_port {
        config.generic.healthz_bind_port = port;
    }
    if args.disable_healthz {
        config.generic.enable_healthz = false;
    }

    let target = match args.target {
        Target::Firewall {
            chain,
            port,
            iptables,
            iptables_restore,
        } => {
            if let Some(chain) = chain {
                config.firewall.chain = chain;
            }
            if let Some(port) = port {
                config.firewall.port = port;
            }
            if let Some(iptables) = iptables {
                config.firewall.iptables = iptables;
            }
            if let Some(iptables_restore) = iptables_restore {
                config.firewall.iptables_restore = iptables_restore;
            }
            TargetKind::Firewall
        }
        Target::Proxy {
            upstream_file,
            systemctl,
            service,
        } => {
            if let Some(upstream_file) = upstream_file {
                config.proxy.upstream_file = upstream_file;
            }
            if let Some(systemctl) = systemctl {
                config.proxy.systemctl = systemctl;
            }
            if let Some(service) = service {
                config.proxy.service = service;
            }
            TargetKind::Proxy
        }
    };

    if config.generic.sync_period.is_zero() {
        anyhow::bail!("sync period must be greater than zero");
    }

    Ok((config, target))
}

/// Creates a Kubernetes client from the configuration.
async fn create_client(config: &SyncConfig) -> anyhow::Result<kube::Client> {
    use kube::config::{KubeConfigOptions, Kubeconfig};
    use kube::Config;

    let kube_config = if let Some(kubeconfig_path) = &config.generic.kubeconfig {
        let kubeconfig = Kubeconfig::read_from(kubeconfig_path)
            .with_context(|| format!("failed to read kubeconfig from: {:?}", kubeconfig_path))?;
        Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .with_context(|| format!("failed to load kubeconfig from: {:?}", kubeconfig_path))?
    } else if let Some(master_url) = &config.generic.master {
        let uri = master_url
            .parse::<http::Uri>()
            .with_context(|| format!("invalid master URL: {}", master_url))?;
        Config::new(uri)
    } else {
        Config::infer().await.context("failed to load kubeconfig")?
    };

    kube::Client::try_from(kube_config).context("failed to create kubernetes client")
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() -> anyhow::Result<()> {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .context("failed to install SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
            }
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.context("failed to listen for Ctrl+C")?;
        info!("received Ctrl+C, shutting down");
    }

    Ok(())
}
