//! Sampler configuration
//!
//! Layered lowest to highest: built-in defaults, optional config file,
//! `CSTATS_*` environment variables, command-line flags.

use crate::cli::{Backend, Cli, Command};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    fn as_str(self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Text => "text",
        }
    }
}

/// Sampler configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SamplerConfig {
    /// Seconds between cycle starts
    pub interval_secs: u64,

    /// CSV file samples are appended to
    pub outfile: PathBuf,

    /// Log every produced sample
    pub debug: bool,

    pub log_format: LogFormat,

    /// Port for the health/metrics server, disabled when unset
    pub api_port: Option<u16>,

    /// Concurrent Docker stats requests per cycle
    pub max_concurrency: usize,

    /// Docker engine socket; falls back to `DOCKER_HOST`, then the default socket
    pub docker_socket: Option<PathBuf>,

    /// Timeout for a single Docker engine request
    pub request_timeout_secs: u64,

    /// Kubernetes namespace (unset = all namespaces)
    pub namespace: Option<String>,

    /// Kubernetes label selector
    pub selector: Option<String>,

    /// Kubeconfig context
    pub context: Option<String>,
}

impl SamplerConfig {
    /// Load configuration for the backend selected on the command line
    pub fn load(cli: &Cli) -> Result<Self> {
        let backend = cli.command.backend();

        let mut builder = config::Config::builder()
            .set_default("interval_secs", 5_i64)?
            .set_default("outfile", backend.default_outfile())?
            .set_default("debug", false)?
            .set_default("log_format", LogFormat::Json.as_str())?
            .set_default("max_concurrency", 32_i64)?
            .set_default("request_timeout_secs", 10_i64)?;

        if let Some(path) = &cli.config {
            builder = builder.add_source(config::File::from(path.as_path()).required(true));
        }

        builder = builder.add_source(config::Environment::with_prefix("CSTATS").try_parsing(true));

        let common = cli.command.common();
        builder = builder
            .set_override_option("interval_secs", common.interval.map(to_i64))?
            .set_override_option("outfile", common.outfile.as_deref().map(path_string))?
            .set_override_option("debug", cli.debug.then_some(true))?
            .set_override_option("log_format", cli.log_format.map(LogFormat::as_str))?
            .set_override_option("api_port", cli.api_port.map(i64::from))?;

        builder = match &cli.command {
            Command::Docker(args) => builder
                .set_override_option("docker_socket", args.socket.as_deref().map(path_string))?
                .set_override_option("max_concurrency", args.max_concurrency.map(|n| n as i64))?
                .set_override_option("request_timeout_secs", args.request_timeout.map(to_i64))?,
            Command::Kubernetes(args) => builder
                .set_override_option("namespace", args.namespace.clone())?
                .set_override_option("selector", args.selector.clone())?
                .set_override_option("context", args.context.clone())?,
        };

        let config: SamplerConfig = builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            bail!("interval must be a positive number of seconds");
        }
        if self.max_concurrency == 0 {
            bail!("max_concurrency must be at least 1");
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be positive");
        }
        if self.outfile.as_os_str().is_empty() {
            bail!("outfile must not be empty");
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Backend {
    fn default_outfile(self) -> &'static str {
        match self {
            Backend::Docker => "docker-stats.csv",
            Backend::Kubernetes => "k8s-stats.csv",
        }
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
