use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::relabel::{ParsedRelabelConfigs, RelabelConfig};

use super::{env, strict};

/// `writer.yaml`: remote-write sinks and their shared settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriterConfig {
    #[serde(default)]
    pub global: WriterGlobalConfig,

    #[serde(default)]
    pub writers: Vec<WriterEntry>,
}

/// Extra labels and relabel rules shared by every writer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriterGlobalConfig {
    #[serde(default)]
    pub extra_labels: BTreeMap<String, String>,

    #[serde(default)]
    pub metric_relabel_configs: Vec<RelabelConfig>,
}

/// One remote-write endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriterEntry {
    /// Name used in logs and self metrics. Default: URL host.
    #[serde(default)]
    pub name: String,

    pub url: String,

    #[serde(default)]
    pub basic_auth_user: String,

    #[serde(default)]
    pub basic_auth_pass: String,

    /// Extra headers as `Key: Value`; `Host` overrides the request host.
    #[serde(default)]
    pub headers: Vec<String>,

    /// Default: 500.
    #[serde(default = "default_connect_timeout_millis")]
    pub connect_timeout_millis: u64,

    /// Default: 5000.
    #[serde(default = "default_request_timeout_millis")]
    pub request_timeout_millis: u64,

    /// Default: 2.
    #[serde(default = "default_max_idle_conns_per_host")]
    pub max_idle_conns_per_host: usize,

    /// Concurrent senders. Default: CPUs * 2.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Default: 100.
    #[serde(default = "default_retry_times")]
    pub retry_times: u32,

    /// Default: 3000.
    #[serde(default = "default_retry_interval_millis")]
    pub retry_interval_millis: u64,

    /// Requests queued before new ones are dropped. Default: 10000.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    #[serde(default)]
    pub proxy_url: String,

    /// Local IP address to bind outgoing connections to.
    #[serde(default)]
    pub interface: String,

    #[serde(default)]
    pub follow_redirects: bool,

    #[serde(default)]
    pub extra_labels: BTreeMap<String, String>,

    #[serde(default)]
    pub metric_relabel_configs: Vec<RelabelConfig>,

    #[serde(default)]
    pub tls_ca: String,

    #[serde(default)]
    pub tls_cert: String,

    #[serde(default)]
    pub tls_key: String,

    #[serde(default)]
    pub tls_skip_verify: bool,

    #[serde(default)]
    pub tls_server_name: String,

    /// One of `1.0`, `1.1`, `1.2`, `1.3`.
    #[serde(default)]
    pub tls_min_version: String,

    #[serde(default)]
    pub tls_max_version: String,
}

// --- Default value functions ---

fn default_connect_timeout_millis() -> u64 {
    500
}

fn default_request_timeout_millis() -> u64 {
    5000
}

fn default_max_idle_conns_per_host() -> usize {
    2
}

fn default_concurrency() -> usize {
    num_cpus::get().max(1) * 2
}

fn default_retry_times() -> u32 {
    100
}

fn default_retry_interval_millis() -> u64 {
    3000
}

fn default_max_queue_size() -> usize {
    10_000
}

impl WriterEntry {
    /// Entry with every option at its default.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            url: url.into(),
            basic_auth_user: String::new(),
            basic_auth_pass: String::new(),
            headers: Vec::new(),
            connect_timeout_millis: default_connect_timeout_millis(),
            request_timeout_millis: default_request_timeout_millis(),
            max_idle_conns_per_host: default_max_idle_conns_per_host(),
            concurrency: default_concurrency(),
            retry_times: default_retry_times(),
            retry_interval_millis: default_retry_interval_millis(),
            max_queue_size: default_max_queue_size(),
            proxy_url: String::new(),
            interface: String::new(),
            follow_redirects: false,
            extra_labels: BTreeMap::new(),
            metric_relabel_configs: Vec::new(),
            tls_ca: String::new(),
            tls_cert: String::new(),
            tls_key: String::new(),
            tls_skip_verify: false,
            tls_server_name: String::new(),
            tls_min_version: String::new(),
            tls_max_version: String::new(),
        }
    }

    /// Configured name, or the URL host.
    pub fn display_name(&self) -> String {
        if !self.name.is_empty() {
            return self.name.clone();
        }
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| {
                u.host_str().map(|h| match u.port() {
                    Some(p) => format!("{h}:{p}"),
                    None => h.to_string(),
                })
            })
            .unwrap_or_else(|| self.url.clone())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_millis)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_millis)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_millis)
    }

    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.url).with_context(|| format!("writer url {:?}", self.url))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            bail!("writer url {:?} must be http or https", self.url);
        }
        if self.concurrency == 0 {
            bail!("writer {}: concurrency must be positive", self.display_name());
        }
        if self.max_queue_size == 0 {
            bail!("writer {}: max_queue_size must be positive", self.display_name());
        }
        if self.request_timeout_millis == 0 {
            bail!("writer {}: request_timeout_millis must be positive", self.display_name());
        }
        for h in &self.headers {
            if super::split_header(h).is_none() {
                bail!("writer {}: header {h:?} must be formatted as 'Key: Value'", self.display_name());
            }
        }
        if !self.proxy_url.is_empty() {
            url::Url::parse(&self.proxy_url)
                .with_context(|| format!("writer {}: proxy_url", self.display_name()))?;
        }
        if !self.interface.is_empty() && self.interface.parse::<std::net::IpAddr>().is_err() {
            bail!("writer {}: interface must be a local IP address", self.display_name());
        }
        if self.tls_cert.is_empty() != self.tls_key.is_empty() {
            bail!("writer {}: tls_cert and tls_key must be set together", self.display_name());
        }
        for v in [&self.tls_min_version, &self.tls_max_version] {
            if !v.is_empty() && !matches!(v.as_str(), "1.0" | "1.1" | "1.2" | "1.3") {
                bail!("writer {}: unsupported TLS version {v:?}", self.display_name());
            }
        }
        ParsedRelabelConfigs::parse(&self.metric_relabel_configs)
            .with_context(|| format!("writer {}: metric_relabel_configs", self.display_name()))?;
        Ok(())
    }
}

impl WriterConfig {
    /// Loads `writer.yaml`. A missing file yields an empty config.
    pub fn load(path: &Path, strict_parse: bool) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading writer config {}", path.display()))?;
        let cfg: Self = strict::from_yaml(&env::expand(&data), strict_parse)
            .with_context(|| format!("parsing writer config {}", path.display()))?;
        cfg.validate()
            .with_context(|| format!("validating writer config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        ParsedRelabelConfigs::parse(&self.global.metric_relabel_configs)
            .context("global.metric_relabel_configs")?;
        let mut names = std::collections::HashSet::new();
        for w in &self.writers {
            w.validate()?;
            if !names.insert(w.display_name()) {
                bail!("writer name {:?} is used twice; set distinct names", w.display_name());
            }
        }
        Ok(())
    }
}
