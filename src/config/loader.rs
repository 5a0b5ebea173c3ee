use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::plugin::{Plugin, PluginRegistry};

use super::{env, strict, Config, ConfigError, JobConfig, JobId, RuleFile, ScrapeConfig};

/// Extra scrape config file: either a bare list or a `scrape_configs` map.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum ScrapeConfigFile {
    List(Vec<ScrapeConfig>),
    Wrapped { scrape_configs: Vec<ScrapeConfig> },
}

impl ScrapeConfigFile {
    fn into_configs(self) -> Vec<ScrapeConfig> {
        match self {
            Self::List(v) => v,
            Self::Wrapped { scrape_configs } => scrape_configs,
        }
    }
}

/// Result of walking `conf.d`.
#[derive(Debug, Default)]
pub struct LoadedConfig {
    pub jobs: BTreeMap<JobId, JobConfig>,
    /// Entry files that failed to load, with their error.
    pub failed: Vec<(PathBuf, anyhow::Error)>,
    /// Every entry file found, loaded or not.
    pub files: Vec<PathBuf>,
}

impl LoadedConfig {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Reads the `conf.d` tree: one subdirectory per plugin, each holding
/// `main*.yaml` entry files and the rule files they reference.
#[derive(Debug, Clone)]
pub struct Loader {
    conf_dir: PathBuf,
    registry: PluginRegistry,
    strict: bool,
}

impl Loader {
    pub fn new(conf_dir: impl Into<PathBuf>, registry: PluginRegistry, strict: bool) -> Self {
        Self {
            conf_dir: conf_dir.into(),
            registry,
            strict,
        }
    }

    pub fn conf_dir(&self) -> &Path {
        &self.conf_dir
    }

    /// Loads every entry file.
    ///
    /// Per-file failures are collected in [`LoadedConfig::failed`]. A
    /// job_name defined twice, in one file or across files, fails the
    /// whole load.
    pub fn load_all(&self) -> Result<LoadedConfig> {
        if !self.conf_dir.is_dir() {
            return Err(ConfigError::NotADirectory {
                path: self.conf_dir.clone(),
            }
            .into());
        }

        let mut out = LoadedConfig::default();
        for plugin_dir in sorted_subdirs(&self.conf_dir)? {
            let Some(name) = plugin_dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(plugin) = self.registry.get(name) else {
                warn!(dir = %plugin_dir.display(), "no plugin registered for directory, skipping");
                continue;
            };

            for file in entry_files(&plugin_dir)? {
                out.files.push(file.clone());
                match self.load_file(plugin.as_ref(), &plugin_dir, &file) {
                    Ok(jobs) => {
                        debug!(file = %file.display(), jobs = jobs.len(), "loaded config file");
                        for job in jobs {
                            out.jobs.insert(job.id.clone(), job);
                        }
                    }
                    Err(e) if is_duplicate_job(&e) => return Err(e),
                    Err(e) => out.failed.push((file, e)),
                }
            }
        }

        check_unique_job_names(out.jobs.keys())?;
        Ok(out)
    }

    /// Loads one entry file and every job it defines.
    pub fn load_file(
        &self,
        plugin: &dyn Plugin,
        plugin_dir: &Path,
        file: &Path,
    ) -> Result<Vec<JobConfig>> {
        let text = read_expanded(file)?;
        let mut cfg: Config = strict::from_yaml(&text, self.strict)
            .with_context(|| format!("loading {}", file.display()))?;

        for pattern in std::mem::take(&mut cfg.scrape_config_files) {
            for extra in expand_glob(plugin_dir, &pattern)? {
                let text = read_expanded(&extra)?;
                let parsed: ScrapeConfigFile = strict::from_yaml(&text, self.strict)
                    .with_context(|| format!("loading {}", extra.display()))?;
                cfg.scrape_configs.extend(parsed.into_configs());
            }
        }

        cfg.validate(file)
            .with_context(|| format!("validating {}", file.display()))?;

        let mut jobs = Vec::with_capacity(cfg.scrape_configs.len());
        for sc in cfg.scrape_configs {
            let rules = self.load_rules(plugin, plugin_dir, &sc).with_context(|| {
                format!(
                    "loading rule files of job {:?} in {}",
                    sc.job_name,
                    file.display()
                )
            })?;
            let id = JobId::new(file, sc.job_name.as_str());
            let job = JobConfig::resolve(id, plugin.name(), plugin_dir, sc, &cfg.global, rules)
                .with_context(|| format!("resolving job in {}", file.display()))?;
            jobs.push(job);
        }
        Ok(jobs)
    }

    fn load_rules(
        &self,
        plugin: &dyn Plugin,
        plugin_dir: &Path,
        sc: &ScrapeConfig,
    ) -> Result<Vec<RuleFile>> {
        let mut rules = Vec::new();
        for pattern in &sc.scrape_rule_files {
            let matches = expand_glob(plugin_dir, pattern)?;
            if matches.is_empty() {
                return Err(ConfigError::RuleFilesNotFound {
                    job: sc.job_name.clone(),
                    pattern: pattern.clone(),
                }
                .into());
            }
            for path in matches {
                let text = read_expanded(&path)?;
                let parsed = plugin
                    .parse_config(plugin_dir, text.as_bytes())
                    .with_context(|| format!("parsing rule file {}", path.display()))?;
                rules.push(RuleFile {
                    path,
                    raw: Arc::from(text.into_bytes()),
                    parsed,
                });
            }
        }
        Ok(rules)
    }
}

fn is_duplicate_job(e: &anyhow::Error) -> bool {
    matches!(
        e.downcast_ref::<ConfigError>(),
        Some(ConfigError::DuplicateJob { .. })
    )
}

/// Fails on a job_name used by more than one entry file.
pub fn check_unique_job_names<'a, I>(ids: I) -> Result<()>
where
    I: IntoIterator<Item = &'a JobId>,
{
    let mut seen: HashMap<&str, &Path> = HashMap::new();
    for id in ids {
        if let Some(first) = seen.insert(id.job.as_str(), id.file.as_path()) {
            return Err(ConfigError::DuplicateJob {
                job: id.job.clone(),
                first: first.to_path_buf(),
                second: id.file.clone(),
            }
            .into());
        }
    }
    Ok(())
}

fn read_expanded(path: &Path) -> Result<String> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(env::expand(&text).into_owned())
}

fn sorted_subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let entry = entry.with_context(|| format!("listing {}", dir.display()))?;
        let path = entry.path();
        if path.is_dir() {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

fn entry_files(plugin_dir: &Path) -> Result<Vec<PathBuf>> {
    Ok(expand_glob(plugin_dir, "main*.yaml")?
        .into_iter()
        .filter(|p| p.is_file())
        .collect())
}

/// Expands a glob relative to `base` (absolute patterns are used as is).
/// Results are sorted.
pub fn expand_glob(base: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let full = if Path::new(pattern).is_absolute() {
        PathBuf::from(pattern)
    } else {
        base.join(pattern)
    };
    let full = full.to_string_lossy();
    let mut out = Vec::new();
    for entry in glob::glob(&full).with_context(|| format!("invalid glob {full:?}"))? {
        out.push(entry.with_context(|| format!("expanding {full:?}"))?);
    }
    out.sort();
    Ok(out)
}
