use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::cache::{Cache, TtlCache};
use crate::config::{HttpSdConfig, StaticConfig};
use crate::metric::Labels;

use super::{static_targets, TargetSource};

/// Label carrying the SD endpoint a target came from.
pub const META_URL: &str = "__meta_url";

/// Cached HTTP SD response.
pub type HttpTargets = Arc<Vec<Labels>>;

/// One target group in the Prometheus HTTP SD format.
#[derive(Debug, Deserialize)]
struct TargetGroup {
    #[serde(default)]
    targets: Vec<String>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

/// Prometheus-compatible HTTP service discovery.
pub struct HttpSource<'a> {
    client: &'a reqwest::Client,
    cache: &'a TtlCache<String, HttpTargets>,
    cfg: &'a HttpSdConfig,
}

impl<'a> HttpSource<'a> {
    pub fn new(
        client: &'a reqwest::Client,
        cache: &'a TtlCache<String, HttpTargets>,
        cfg: &'a HttpSdConfig,
    ) -> Self {
        Self { client, cache, cfg }
    }

    async fn fetch(&self) -> Result<Vec<Labels>> {
        let url = &self.cfg.url;
        let resp = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .with_context(|| format!("requesting {url}"))?;

        let status = resp.status();
        if !status.is_success() {
            bail!("unexpected status {status} from {url}");
        }

        let groups: Vec<TargetGroup> = resp
            .json()
            .await
            .with_context(|| format!("decoding response from {url}"))?;

        Ok(groups_to_targets(groups, url))
    }
}

fn groups_to_targets(groups: Vec<TargetGroup>, url: &str) -> Vec<Labels> {
    let configs: Vec<StaticConfig> = groups
        .into_iter()
        .map(|g| StaticConfig {
            targets: g.targets,
            labels: g.labels,
        })
        .collect();
    static_targets(&configs, Some((META_URL, url)))
}

#[async_trait]
impl TargetSource for HttpSource<'_> {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn targets(&self) -> Result<Vec<Labels>> {
        if let Some(hit) = self.cache.get(&self.cfg.url) {
            return Ok(hit.as_ref().clone());
        }
        let targets = Arc::new(self.fetch().await?);
        self.cache.set_with_ttl(
            self.cfg.url.clone(),
            Arc::clone(&targets),
            self.cfg.refresh_interval,
        );
        Ok(targets.as_ref().clone())
    }
}
