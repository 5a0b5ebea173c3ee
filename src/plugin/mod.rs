pub mod buffer;
pub mod prometheus;

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::metric::Labels;

pub use self::buffer::SampleBuffer;

/// Plugin registry and config handle errors.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin {0:?} registered twice")]
    Duplicate(String),

    #[error("plugin {plugin:?} received a config parsed by {owner:?}")]
    ForeignConfig { plugin: String, owner: String },

    #[error("plugin {plugin:?} config has unexpected type")]
    ConfigType { plugin: String },
}

/// Opaque parsed rule file, tagged with the plugin that produced it.
#[derive(Clone)]
pub struct PluginConfig {
    plugin: Arc<str>,
    inner: Arc<dyn Any + Send + Sync>,
}

impl PluginConfig {
    pub fn new<T>(plugin: &str, inner: T) -> Self
    where
        T: Any + Send + Sync,
    {
        Self {
            plugin: Arc::from(plugin),
            inner: Arc::new(inner),
        }
    }

    /// Name of the plugin that parsed this config.
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Returns the concrete config, checking the owning plugin first.
    pub fn downcast<T: Any>(&self, plugin: &str) -> Result<&T, PluginError> {
        if &*self.plugin != plugin {
            return Err(PluginError::ForeignConfig {
                plugin: plugin.to_string(),
                owner: self.plugin.to_string(),
            });
        }
        self.inner
            .downcast_ref::<T>()
            .ok_or_else(|| PluginError::ConfigType {
                plugin: plugin.to_string(),
            })
    }
}

impl fmt::Debug for PluginConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginConfig")
            .field("plugin", &self.plugin)
            .finish_non_exhaustive()
    }
}

/// Per-target scrape context.
#[derive(Debug, Clone)]
pub struct ScrapeContext {
    pub job: Arc<str>,
    /// Final target labels (after relabeling), read-only for plugins.
    pub labels: Labels,
    /// Cancelled on shutdown or when the scrape deadline passes.
    pub cancel: CancellationToken,
    pub deadline: Instant,
}

impl ScrapeContext {
    /// Time left before the scrape deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// A protocol backend.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// Registry key; also the `conf.d` subdirectory name.
    fn name(&self) -> &str;

    /// Parses one rule file. Must not perform I/O beyond `bytes`.
    fn parse_config(&self, base_dir: &Path, bytes: &[u8]) -> Result<PluginConfig>;

    /// Scrapes one target into `buf`.
    ///
    /// Records already pushed are kept when an error is returned.
    async fn scrape(
        &self,
        ctx: &ScrapeContext,
        target: &str,
        cfg: &PluginConfig,
        buf: &SampleBuffer,
    ) -> Result<()>;
}

/// Collects plugins before the scheduler starts.
#[derive(Default)]
pub struct PluginRegistryBuilder {
    plugins: HashMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: Plugin>(mut self, plugin: P) -> Result<Self, PluginError> {
        let name = plugin.name().to_string();
        if self.plugins.contains_key(&name) {
            return Err(PluginError::Duplicate(name));
        }
        self.plugins.insert(name, Arc::new(plugin));
        Ok(self)
    }

    pub fn build(self) -> PluginRegistry {
        PluginRegistry {
            plugins: Arc::new(self.plugins),
        }
    }
}

/// Frozen, cheaply cloneable plugin lookup table.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: Arc<HashMap<String, Arc<dyn Plugin>>>,
}

impl PluginRegistry {
    pub fn builder() -> PluginRegistryBuilder {
        PluginRegistryBuilder::new()
    }

    /// Registry holding the plugins compiled into this binary.
    pub fn builtin() -> Result<Self, PluginError> {
        Ok(Self::builder()
            .register(prometheus::PrometheusPlugin::new())?
            .build())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.plugins.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.names())
            .finish()
    }
}
