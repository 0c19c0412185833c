//! Command-line interface

use crate::config::LogFormat;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Container stats sampler
#[derive(Parser, Debug)]
#[command(name = "cstats")]
#[command(author, version, about = "Samples container CPU and memory into a CSV file", long_about = None)]
pub struct Cli {
    /// Config file (TOML, YAML or JSON); values are overridden by CSTATS_* env vars and flags
    #[arg(long, global = true, env = "CSTATS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging, including one event per sample
    #[arg(long, global = true)]
    pub debug: bool,

    /// Log output format
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Serve /healthz, /readyz and /metrics on this port
    #[arg(long, global = true)]
    pub api_port: Option<u16>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Collect Docker container stats via the engine socket
    Docker(DockerArgs),

    /// Collect Kubernetes pod stats via the metrics API
    #[command(alias = "k8s")]
    Kubernetes(KubernetesArgs),
}

/// Which backend a command drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Docker,
    Kubernetes,
}

impl Command {
    pub fn backend(&self) -> Backend {
        match self {
            Command::Docker(_) => Backend::Docker,
            Command::Kubernetes(_) => Backend::Kubernetes,
        }
    }

    pub fn common(&self) -> &CommonArgs {
        match self {
            Command::Docker(args) => &args.common,
            Command::Kubernetes(args) => &args.common,
        }
    }
}

#[derive(Args, Debug)]
pub struct CommonArgs {
    /// Collection interval in seconds [default: 5]
    #[arg(long)]
    pub interval: Option<u64>,

    /// Output CSV file path
    #[arg(long)]
    pub outfile: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct DockerArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Docker engine socket [default: $DOCKER_HOST or /var/run/docker.sock]
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Maximum concurrent stats requests per cycle [default: 32]
    #[arg(long)]
    pub max_concurrency: Option<usize>,

    /// Timeout in seconds for a single engine request [default: 10]
    #[arg(long)]
    pub request_timeout: Option<u64>,
}

#[derive(Args, Debug)]
pub struct KubernetesArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Kubernetes namespace (empty = all namespaces)
    #[arg(long, short)]
    pub namespace: Option<String>,

    /// Label selector (e.g. app=web)
    #[arg(long, short = 'l')]
    pub selector: Option<String>,

    /// Kubeconfig context to use
    #[arg(long)]
    pub context: Option<String>,
}
