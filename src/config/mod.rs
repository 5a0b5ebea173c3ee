pub mod env;
pub mod loader;
pub mod strict;
pub mod writer;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metric::Labels;
use crate::plugin::PluginConfig;
use crate::relabel::{ParsedRelabelConfigs, RelabelConfig};

pub use self::loader::{LoadedConfig, Loader};
pub use self::writer::{WriterConfig, WriterEntry, WriterGlobalConfig};

/// Configuration problems callers may want to branch on.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("job_name {job:?} is defined in both {} and {}", first.display(), second.display())]
    DuplicateJob {
        job: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("job {job:?}: scrape_rule_files is empty")]
    NoRuleFiles { job: String },

    #[error("job {job:?}: scrape_rule_files pattern {pattern:?} matched no files")]
    RuleFilesNotFound { job: String, pattern: String },

    #[error("unknown configuration keys: {}", keys.join(", "))]
    UnknownFields { keys: Vec<String> },

    #[error("conf.d {} is not a directory", path.display())]
    NotADirectory { path: PathBuf },
}

/// One `main*.yaml` entry file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,

    /// Globs of extra files holding scrape configs, relative to the plugin dir.
    #[serde(default)]
    pub scrape_config_files: Vec<String>,

    #[serde(default)]
    pub scrape_configs: Vec<ScrapeConfig>,
}

/// Defaults shared by every job of an entry file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Default: 1m. Zero means default.
    #[serde(default = "default_scrape_interval", with = "humantime_serde")]
    pub scrape_interval: Duration,

    /// Default: 10s. Clamped to the interval.
    #[serde(default = "default_scrape_timeout", with = "humantime_serde")]
    pub scrape_timeout: Duration,

    /// Default: 50.
    #[serde(default = "default_scrape_concurrency")]
    pub scrape_concurrency: usize,

    #[serde(default)]
    pub external_labels: BTreeMap<String, String>,

    /// Applied to every job of this file after the job's own rules.
    #[serde(default)]
    pub metric_relabel_configs: Vec<RelabelConfig>,
}

/// One job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeConfig {
    pub job_name: String,

    #[serde(default, with = "humantime_serde")]
    pub scrape_interval: Option<Duration>,

    #[serde(default, with = "humantime_serde")]
    pub scrape_timeout: Option<Duration>,

    #[serde(default)]
    pub scrape_concurrency: Option<usize>,

    /// Plugin rule files (paths or globs), relative to the plugin dir.
    #[serde(default)]
    pub scrape_rule_files: Vec<String>,

    /// Target relabeling.
    #[serde(default)]
    pub relabel_configs: Vec<RelabelConfig>,

    /// Post-scrape relabeling.
    #[serde(default)]
    pub metric_relabel_configs: Vec<RelabelConfig>,

    #[serde(default)]
    pub static_configs: Vec<StaticConfig>,

    #[serde(default)]
    pub file_sd_configs: Vec<FileSdConfig>,

    #[serde(default)]
    pub http_sd_configs: Vec<HttpSdConfig>,
}

/// Literal targets sharing a label set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StaticConfig {
    #[serde(default)]
    pub targets: Vec<String>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Files (or HTTP URLs) holding lists of [`StaticConfig`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileSdConfig {
    #[serde(default)]
    pub files: Vec<String>,
}

/// Prometheus HTTP service discovery endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpSdConfig {
    pub url: String,

    /// How long a response is reused. Default: 5s.
    #[serde(default = "default_sd_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,
}

// --- Default value functions ---

fn default_scrape_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_scrape_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_scrape_concurrency() -> usize {
    50
}

fn default_sd_refresh_interval() -> Duration {
    crate::cache::DEFAULT_TTL
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            scrape_interval: default_scrape_interval(),
            scrape_timeout: default_scrape_timeout(),
            scrape_concurrency: default_scrape_concurrency(),
            external_labels: BTreeMap::new(),
            metric_relabel_configs: Vec::new(),
        }
    }
}

// --- Validation ---

impl Config {
    /// Checks consistency of a fully merged entry file. A job_name
    /// repeated inside `file` is a [`ConfigError::DuplicateJob`].
    pub fn validate(&self, file: &Path) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.scrape_configs.len());
        for sc in &self.scrape_configs {
            sc.validate()?;
            if !seen.insert(sc.job_name.as_str()) {
                return Err(ConfigError::DuplicateJob {
                    job: sc.job_name.clone(),
                    first: file.to_path_buf(),
                    second: file.to_path_buf(),
                }
                .into());
            }
        }
        Ok(())
    }
}

impl ScrapeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.job_name.trim().is_empty() {
            bail!("job_name is required");
        }
        if self.scrape_rule_files.is_empty() {
            return Err(ConfigError::NoRuleFiles {
                job: self.job_name.clone(),
            }
            .into());
        }
        if self.scrape_concurrency == Some(0) {
            bail!("job {:?}: scrape_concurrency must be positive", self.job_name);
        }
        for sd in &self.http_sd_configs {
            let url = url::Url::parse(&sd.url).with_context(|| {
                format!("job {:?}: http_sd url {:?}", self.job_name, sd.url)
            })?;
            if url.scheme() != "http" && url.scheme() != "https" {
                bail!("job {:?}: http_sd url must be http or https", self.job_name);
            }
        }
        Ok(())
    }

    /// Interval after applying the global default; zero means default.
    pub fn effective_interval(&self, global: &GlobalConfig) -> Duration {
        let global_interval = if global.scrape_interval.is_zero() {
            default_scrape_interval()
        } else {
            global.scrape_interval
        };
        self.scrape_interval
            .filter(|d| !d.is_zero())
            .unwrap_or(global_interval)
    }

    /// Timeout after applying defaults, clamped to the effective interval.
    pub fn effective_timeout(&self, global: &GlobalConfig) -> Duration {
        let global_timeout = if global.scrape_timeout.is_zero() {
            default_scrape_timeout()
        } else {
            global.scrape_timeout
        };
        let timeout = self
            .scrape_timeout
            .filter(|d| !d.is_zero())
            .unwrap_or(global_timeout);
        timeout.min(self.effective_interval(global))
    }

    pub fn effective_concurrency(&self, global: &GlobalConfig) -> usize {
        let global_concurrency = if global.scrape_concurrency == 0 {
            default_scrape_concurrency()
        } else {
            global.scrape_concurrency
        };
        self.scrape_concurrency.unwrap_or(global_concurrency)
    }
}

/// Splits a `Key: Value` header line into trimmed parts.
pub fn split_header(raw: &str) -> Option<(&str, &str)> {
    let (k, v) = raw.split_once(':')?;
    let k = k.trim();
    if k.is_empty() {
        return None;
    }
    Some((k, v.trim()))
}

// --- Resolved job configuration ---

/// Globally unique job identity: entry file plus job name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId {
    pub file: PathBuf,
    pub job: String,
}

impl JobId {
    pub fn new(file: impl Into<PathBuf>, job: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            job: job.into(),
        }
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.file.display(), self.job)
    }
}

/// A loaded plugin rule file.
#[derive(Debug, Clone)]
pub struct RuleFile {
    pub path: PathBuf,
    /// Bytes after env expansion; used to detect changes on reload.
    pub raw: Arc<[u8]>,
    pub parsed: PluginConfig,
}

impl PartialEq for RuleFile {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path && self.raw == other.raw
    }
}

/// Everything a job runner needs for one job, with defaults applied and
/// relabel rules compiled.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub id: JobId,
    pub plugin: Arc<str>,
    /// Plugin directory; relative paths in the job resolve against it.
    pub base_dir: PathBuf,
    pub scrape_interval: Duration,
    pub scrape_timeout: Duration,
    pub scrape_concurrency: usize,
    pub external_labels: Labels,
    pub target_relabel: Arc<ParsedRelabelConfigs>,
    pub metric_relabel: Arc<ParsedRelabelConfigs>,
    pub global_metric_relabel: Arc<ParsedRelabelConfigs>,
    pub rules: Vec<RuleFile>,
    pub scrape: ScrapeConfig,
    pub global: GlobalConfig,
}

impl JobConfig {
    /// Resolves a scrape config against its file's global section.
    pub fn resolve(
        id: JobId,
        plugin: &str,
        base_dir: &Path,
        scrape: ScrapeConfig,
        global: &GlobalConfig,
        rules: Vec<RuleFile>,
    ) -> Result<Self> {
        let target_relabel = ParsedRelabelConfigs::parse(&scrape.relabel_configs)?;
        let metric_relabel = ParsedRelabelConfigs::parse(&scrape.metric_relabel_configs)?;
        let global_metric_relabel = ParsedRelabelConfigs::parse(&global.metric_relabel_configs)?;

        Ok(Self {
            id,
            plugin: Arc::from(plugin),
            base_dir: base_dir.to_path_buf(),
            scrape_interval: scrape.effective_interval(global),
            scrape_timeout: scrape.effective_timeout(global),
            scrape_concurrency: scrape.effective_concurrency(global),
            external_labels: Labels::from_pairs(
                global
                    .external_labels
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_str())),
            ),
            target_relabel: Arc::new(target_relabel),
            metric_relabel: Arc::new(metric_relabel),
            global_metric_relabel: Arc::new(global_metric_relabel),
            rules,
            scrape,
            global: global.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.id.job
    }
}

/// Two job configs are equal when their sources are: the same scrape and
/// global sections, plugin and rule file bytes.
impl PartialEq for JobConfig {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.plugin == other.plugin
            && self.base_dir == other.base_dir
            && self.scrape == other.scrape
            && self.global == other.global
            && self.rules == other.rules
    }
}
