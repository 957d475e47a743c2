use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};

const ENV_PREFIX: &str = "TILECACHE";
const DEFAULT_CONFIG_FILE: &str = "tilecache.toml";

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".tiles")
}

fn default_fetch_timeout() -> u64 {
    10
}

fn default_client_timeout() -> u64 {
    30
}

fn default_max_request_header_size() -> usize {
    32 * 1024
}

fn default_max_response_header_size() -> usize {
    32 * 1024
}

fn default_max_body_size() -> u64 {
    64 * 1024 * 1024 // 64 MiB
}

fn default_content_encoding_gzip() -> bool {
    true
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout: u64,
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(default = "default_max_request_header_size")]
    pub max_request_header_size: usize,
    #[serde(default = "default_max_response_header_size")]
    pub max_response_header_size: usize,
    #[serde(default = "default_max_body_size")]
    pub max_body_size: u64,
    /// Emit `Content-Encoding: gzip` on every successful response, whatever the body is.
    #[serde(default = "default_content_encoding_gzip")]
    pub content_encoding_gzip: bool,
    /// Let concurrent misses for one key share a single origin fetch.
    #[serde(default)]
    pub coalesce_misses: bool,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            cache_dir: default_cache_dir(),
            fetch_timeout: default_fetch_timeout(),
            client_timeout: default_client_timeout(),
            max_request_header_size: default_max_request_header_size(),
            max_response_header_size: default_max_response_header_size(),
            max_body_size: default_max_body_size(),
            content_encoding_gzip: default_content_encoding_gzip(),
            coalesce_misses: false,
            log: default_log_format(),
            metrics_listen: None,
        }
    }
}

impl Settings {
    /// Layer defaults, the optional config file, `TILECACHE__*` environment
    /// variables and command-line overrides, in that order.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        let config_path = resolve_config_path(cli);

        if let Some(path) = &config_path {
            builder = builder.add_source(File::from(path.clone()).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        if let Some(path) = &config_path {
            settings.apply_base_dir(path);
        }
        settings.apply_cli(cli);
        settings.validate()?;
        Ok(settings)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    fn apply_cli(&mut self, cli: &Cli) {
        if let Some(listen) = cli.listen {
            self.listen = listen;
        }
        if let Some(cache_dir) = &cli.cache_dir {
            self.cache_dir = cache_dir.clone();
        }
        if let Some(log) = cli.log {
            self.log = log;
        }
    }

    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        self.cache_dir = absolutize(&self.cache_dir, base_dir);
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.cache_dir.as_os_str().is_empty(),
            "cache_dir must not be empty"
        );
        ensure!(
            self.fetch_timeout > 0,
            "fetch_timeout must be greater than 0 seconds (got {})",
            self.fetch_timeout
        );
        ensure!(
            self.client_timeout > 0,
            "client_timeout must be greater than 0 seconds (got {})",
            self.client_timeout
        );
        ensure!(
            self.max_request_header_size > 0,
            "max_request_header_size must be greater than 0 (got {})",
            self.max_request_header_size
        );
        ensure!(
            self.max_response_header_size > 0,
            "max_response_header_size must be greater than 0 (got {})",
            self.max_response_header_size
        );
        ensure!(
            self.max_body_size > 0,
            "max_body_size must be greater than 0 (got {})",
            self.max_body_size
        );
        if let Some(metrics) = self.metrics_listen {
            ensure!(
                metrics != self.listen,
                "metrics_listen must differ from listen ({metrics})"
            );
        }
        Ok(())
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

fn resolve_config_path(cli: &Cli) -> Option<PathBuf> {
    if let Some(path) = &cli.config {
        return Some(path.clone());
    }
    let candidate = PathBuf::from(DEFAULT_CONFIG_FILE);
    candidate.exists().then_some(candidate)
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
