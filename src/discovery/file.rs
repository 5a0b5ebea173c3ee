use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::warn;

use crate::config::loader::expand_glob;
use crate::config::{FileSdConfig, StaticConfig};
use crate::metric::Labels;

use super::reader::SourceReader;
use super::{static_targets, TargetSource};

/// Label carrying the file a target came from, relative to the job dir.
pub const META_FILEPATH: &str = "__meta_filepath";

/// File-based discovery: YAML or JSON lists of static configs.
pub struct FileSource<'a> {
    reader: &'a SourceReader,
    base_dir: &'a Path,
    cfg: &'a FileSdConfig,
}

impl<'a> FileSource<'a> {
    pub fn new(reader: &'a SourceReader, base_dir: &'a Path, cfg: &'a FileSdConfig) -> Self {
        Self {
            reader,
            base_dir,
            cfg,
        }
    }

    fn locations(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for pattern in &self.cfg.files {
            if SourceReader::is_remote(pattern) {
                out.push((pattern.clone(), pattern.clone()));
                continue;
            }
            match expand_glob(self.base_dir, pattern) {
                Ok(paths) => {
                    for path in paths {
                        let rel = relative_to(&path, self.base_dir);
                        out.push((path.to_string_lossy().into_owned(), rel));
                    }
                }
                Err(e) => warn!(pattern = %pattern, error = %e, "file_sd glob failed"),
            }
        }
        out
    }
}

#[async_trait]
impl TargetSource for FileSource<'_> {
    fn kind(&self) -> &'static str {
        "file"
    }

    async fn targets(&self) -> Result<Vec<Labels>> {
        let mut out = Vec::new();
        for (location, meta) in self.locations() {
            match self.load(&location).await {
                Ok(configs) => {
                    out.extend(static_targets(&configs, Some((META_FILEPATH, meta.as_str()))));
                }
                Err(e) => warn!(file = %location, error = %e, "skipping file_sd file"),
            }
        }
        Ok(out)
    }
}

impl FileSource<'_> {
    async fn load(&self, location: &str) -> Result<Vec<StaticConfig>> {
        let text = self.reader.read(location).await?;
        parse_static_configs(&text).with_context(|| format!("parsing {location}"))
    }
}

/// Parses a YAML or JSON list of static configs. An empty document is an
/// empty list.
pub fn parse_static_configs(text: &str) -> Result<Vec<StaticConfig>> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let configs: Option<Vec<StaticConfig>> = serde_yaml::from_str(text)?;
    Ok(configs.unwrap_or_default())
}

fn relative_to(path: &Path, base: &Path) -> String {
    path.strip_prefix(base)
        .map(PathBuf::from)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .into_owned()
}
