use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::cache::{Cache, TtlCache};
use crate::config::env;

/// Reads discovery files from disk or over HTTP, env-expanded and cached.
pub struct SourceReader {
    client: reqwest::Client,
    cache: TtlCache<String, Arc<str>>,
}

impl SourceReader {
    pub fn new(client: reqwest::Client, ttl: Duration) -> Self {
        Self {
            client,
            cache: TtlCache::new(ttl),
        }
    }

    pub fn is_remote(location: &str) -> bool {
        location.starts_with("http://") || location.starts_with("https://")
    }

    /// Returns the expanded contents of `location` (a path or an HTTP URL).
    pub async fn read(&self, location: &str) -> Result<Arc<str>> {
        if let Some(hit) = self.cache.get(&location.to_string()) {
            return Ok(hit);
        }

        let raw = if Self::is_remote(location) {
            self.fetch(location).await?
        } else {
            tokio::fs::read_to_string(location)
                .await
                .with_context(|| format!("reading {location}"))?
        };

        let text: Arc<str> = Arc::from(env::expand(&raw).as_ref());
        self.cache.set(location.to_string(), Arc::clone(&text));
        Ok(text)
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("requesting {url}"))?;

        let status = resp.status();
        if !status.is_success() {
            bail!("unexpected status {status} from {url}");
        }

        resp.text()
            .await
            .with_context(|| format!("reading body from {url}"))
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }
}
