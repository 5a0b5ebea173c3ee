//! Built-in plugin scraping the Prometheus text exposition format.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::split_header;
use crate::metric::{Labels, MetricRecord};

use super::{Plugin, PluginConfig, SampleBuffer, ScrapeContext};

pub const PLUGIN_NAME: &str = "prometheus";

/// Rule file for the prometheus plugin (TOML).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrometheusRule {
    #[serde(default = "default_scheme")]
    pub scheme: String,

    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,

    /// Prefix of the `<namespace>_up` health series.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Extra request headers as `Key: Value`.
    #[serde(default)]
    pub headers: Vec<String>,

    #[serde(default)]
    pub basic_auth_user: String,

    #[serde(default)]
    pub basic_auth_pass: String,
}

impl Default for PrometheusRule {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            metrics_path: default_metrics_path(),
            namespace: default_namespace(),
            headers: Vec::new(),
            basic_auth_user: String::new(),
            basic_auth_pass: String::new(),
        }
    }
}

// --- Default value functions ---

fn default_scheme() -> String {
    "http".to_string()
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_namespace() -> String {
    PLUGIN_NAME.to_string()
}

impl PrometheusRule {
    pub fn validate(&self) -> Result<()> {
        if self.scheme != "http" && self.scheme != "https" {
            bail!("scheme must be http or https, got {:?}", self.scheme);
        }
        if !self.metrics_path.starts_with('/') {
            bail!("metrics_path must start with '/'");
        }
        if self.namespace.is_empty() {
            bail!("namespace is required");
        }
        for h in &self.headers {
            if split_header(h).is_none() {
                bail!("header {h:?} must be formatted as 'Key: Value'");
            }
        }
        Ok(())
    }

    fn url(&self, target: &str) -> String {
        if target.contains("://") {
            format!("{}{}", target.trim_end_matches('/'), self.metrics_path)
        } else {
            format!("{}://{}{}", self.scheme, target, self.metrics_path)
        }
    }

    fn up_name(&self) -> String {
        format!("{}_up", self.namespace)
    }
}

/// Scrapes `/metrics`-style endpoints.
pub struct PrometheusPlugin {
    client: reqwest::Client,
}

impl PrometheusPlugin {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    async fn fetch(
        &self,
        ctx: &ScrapeContext,
        target: &str,
        rule: &PrometheusRule,
    ) -> Result<String> {
        let url = rule.url(target);
        let mut req = self
            .client
            .get(&url)
            .header("Accept", "text/plain;version=0.0.4")
            .timeout(ctx.remaining());
        for h in &rule.headers {
            if let Some((k, v)) = split_header(h) {
                req = req.header(k, v);
            }
        }
        if !rule.basic_auth_user.is_empty() {
            req = req.basic_auth(&rule.basic_auth_user, Some(&rule.basic_auth_pass));
        }

        let resp = tokio::select! {
            _ = ctx.cancel.cancelled() => bail!("scrape of {url} cancelled"),
            resp = req.send() => resp.with_context(|| format!("requesting {url}"))?,
        };

        let status = resp.status();
        if !status.is_success() {
            bail!("{url} returned HTTP {status}");
        }

        resp.text()
            .await
            .with_context(|| format!("reading body from {url}"))
    }
}

impl Default for PrometheusPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for PrometheusPlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn parse_config(&self, _base_dir: &Path, bytes: &[u8]) -> Result<PluginConfig> {
        let text = std::str::from_utf8(bytes).context("rule file is not valid UTF-8")?;
        let rule: PrometheusRule = toml::from_str(text).context("parsing prometheus rule file")?;
        rule.validate()?;
        Ok(PluginConfig::new(PLUGIN_NAME, rule))
    }

    async fn scrape(
        &self,
        ctx: &ScrapeContext,
        target: &str,
        cfg: &PluginConfig,
        buf: &SampleBuffer,
    ) -> Result<()> {
        let rule = cfg.downcast::<PrometheusRule>(PLUGIN_NAME)?;
        let up = rule.up_name();

        let parsed = match self.fetch(ctx, target, rule).await {
            Ok(body) => parse_text(&body).map_err(anyhow::Error::from),
            Err(e) => Err(e),
        };

        match parsed {
            Ok(samples) => {
                buf.extend(samples.into_iter().map(|s| s.into_record(&ctx.labels)));
                buf.push(MetricRecord::gauge(up, 1.0));
                Ok(())
            }
            Err(e) => {
                buf.push(MetricRecord::gauge(up, 0.0));
                Err(e)
            }
        }
    }
}

/// Malformed exposition line.
#[derive(Debug, Error)]
#[error("line {line}: {reason}")]
pub struct ExpositionError {
    pub line: usize,
    pub reason: String,
}

/// One sample line from a text exposition.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpositionSample {
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub value: f64,
    /// Milliseconds; 0 if the line carried no timestamp.
    pub timestamp_ms: i64,
}

impl ExpositionSample {
    /// Converts into a record. Labels clashing with `target` labels are
    /// renamed to `exported_<name>`.
    fn into_record(self, target: &Labels) -> MetricRecord {
        let mut tags = BTreeMap::new();
        for (k, v) in self.labels {
            if target.contains(&k) {
                tags.insert(format!("exported_{k}"), v);
            } else {
                tags.insert(k, v);
            }
        }
        let mut record = MetricRecord::gauge(self.name, self.value).timestamp(self.timestamp_ms);
        record.tags = tags;
        record
    }
}

/// Parses the Prometheus text format (version 0.0.4).
pub fn parse_text(body: &str) -> Result<Vec<ExpositionSample>, ExpositionError> {
    let mut out = Vec::new();
    for (idx, raw) in body.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let sample = parse_line(line).map_err(|reason| ExpositionError {
            line: idx + 1,
            reason,
        })?;
        out.push(sample);
    }
    Ok(out)
}

fn parse_line(line: &str) -> Result<ExpositionSample, String> {
    let name_end = line
        .find(|c: char| c == '{' || c.is_whitespace())
        .ok_or_else(|| "missing value".to_string())?;
    let name = &line[..name_end];
    if name.is_empty() {
        return Err("empty metric name".to_string());
    }

    let mut rest = &line[name_end..];
    let mut labels = Vec::new();
    if let Some(after) = rest.strip_prefix('{') {
        let (parsed, remaining) = parse_labels(after)?;
        labels = parsed;
        rest = remaining;
    }

    let mut parts = rest.split_whitespace();
    let value = parts
        .next()
        .ok_or_else(|| "missing value".to_string())
        .and_then(parse_value)?;
    let timestamp_ms = match parts.next() {
        Some(ts) => ts
            .parse::<i64>()
            .map_err(|_| format!("invalid timestamp {ts:?}"))?,
        None => 0,
    };
    if parts.next().is_some() {
        return Err("trailing data after timestamp".to_string());
    }

    Ok(ExpositionSample {
        name: name.to_string(),
        labels,
        value,
        timestamp_ms,
    })
}

/// Parses `name="value",...}` and returns the remainder after `}`.
fn parse_labels(mut s: &str) -> Result<(Vec<(String, String)>, &str), String> {
    let mut labels = Vec::new();
    loop {
        s = s.trim_start();
        if let Some(rest) = s.strip_prefix('}') {
            return Ok((labels, rest));
        }

        let eq = s.find('=').ok_or_else(|| "label without '='".to_string())?;
        let name = s[..eq].trim();
        if name.is_empty() {
            return Err("empty label name".to_string());
        }
        s = s[eq + 1..].trim_start();
        s = s
            .strip_prefix('"')
            .ok_or_else(|| format!("label {name} value is not quoted"))?;

        let mut value = String::new();
        let mut chars = s.char_indices();
        let end = loop {
            match chars.next() {
                Some((i, '"')) => break i,
                Some((_, '\\')) => match chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, c)) => value.push(c),
                    None => return Err("unterminated escape".to_string()),
                },
                Some((_, c)) => value.push(c),
                None => return Err(format!("unterminated value for label {name}")),
            }
        };
        labels.push((name.to_string(), value));

        s = s[end + 1..].trim_start();
        if let Some(rest) = s.strip_prefix(',') {
            s = rest;
        } else if !s.starts_with('}') {
            return Err("expected ',' or '}' after label value".to_string());
        }
    }
}

fn parse_value(raw: &str) -> Result<f64, String> {
    match raw {
        "+Inf" | "Inf" => Ok(f64::INFINITY),
        "-Inf" => Ok(f64::NEG_INFINITY),
        "NaN" => Ok(f64::NAN),
        _ => raw.parse::<f64>().map_err(|_| format!("invalid value {raw:?}")),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;

    #[test]
    fn test_parse_simple_and_labeled() {
        let body = r#"
# HELP foo A counter.
# TYPE foo counter
foo 42
http_requests_total{method="post",code="200"} 1027 1395066363000
"#;
        let samples = parse_text(body).expect("valid exposition");
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].name, "foo");
        assert_eq!(samples[0].value, 42.0);
        assert_eq!(samples[0].timestamp_ms, 0);
        assert_eq!(
            samples[1].labels,
            vec![
                ("method".to_string(), "post".to_string()),
                ("code".to_string(), "200".to_string())
            ]
        );
        assert_eq!(samples[1].timestamp_ms, 1395066363000);
    }

    #[test]
    fn test_parse_special_values_and_escapes() {
        let body = "a +Inf\nb -Inf\nc NaN\nd{path=\"C:\\\\dir\",msg=\"say \\\"hi\\\"\\n\",} 1\n";
        let samples = parse_text(body).expect("valid exposition");
        assert!(samples[0].value.is_infinite() && samples[0].value > 0.0);
        assert!(samples[1].value.is_infinite() && samples[1].value < 0.0);
        assert!(samples[2].value.is_nan());
        assert_eq!(samples[3].labels[0].1, "C:\\dir");
        assert_eq!(samples[3].labels[1].1, "say \"hi\"\n");
    }

    #[test]
    fn test_parse_errors_report_line() {
        let err = parse_text("ok 1\nbroken{a=\"x\" 1\n").expect_err("malformed");
        assert_eq!(err.line, 2);
        assert!(parse_text("novalue\n").is_err());
        assert!(parse_text("x notanumber\n").is_err());
    }

    #[test]
    fn test_rule_defaults_and_validation() {
        let plugin = PrometheusPlugin::new();
        let cfg = plugin
            .parse_config(Path::new("."), b"")
            .expect("empty rule file uses defaults");
        let rule = cfg
            .downcast::<PrometheusRule>(PLUGIN_NAME)
            .expect("prometheus rule");
        assert_eq!(rule, &PrometheusRule::default());
        assert_eq!(rule.url("10.0.0.1:9100"), "http://10.0.0.1:9100/metrics");

        assert!(plugin
            .parse_config(Path::new("."), b"scheme = \"ftp\"")
            .is_err());
        assert!(plugin
            .parse_config(Path::new("."), b"headers = [\"nocolon\"]")
            .is_err());
        assert!(plugin
            .parse_config(Path::new("."), b"unknown_key = 1")
            .is_err());
    }

    #[test]
    fn test_clashing_labels_are_exported() {
        let target = Labels::from_pairs([("job", "j1"), ("instance", "h:1")]);
        let sample = ExpositionSample {
            name: "m".to_string(),
            labels: vec![("job".to_string(), "inner".to_string())],
            value: 1.0,
            timestamp_ms: 0,
        };
        let record = sample.into_record(&target);
        assert_eq!(record.tags.get("exported_job").map(String::as_str), Some("inner"));
        assert!(!record.tags.contains_key("job"));
    }

    #[tokio::test]
    async fn test_unreachable_target_reports_down() {
        let plugin = PrometheusPlugin::new();
        let cfg = plugin
            .parse_config(Path::new("."), b"namespace = \"node\"")
            .expect("valid rule");
        let cancel = CancellationToken::new();
        let ctx = ScrapeContext {
            job: "j".into(),
            labels: Labels::new(),
            cancel: cancel.clone(),
            deadline: tokio::time::Instant::now() + Duration::from_secs(2),
        };
        let buf = SampleBuffer::new(cancel);

        // Port 1 on loopback is not listening.
        let res = plugin.scrape(&ctx, "127.0.0.1:1", &cfg, &buf).await;
        assert!(res.is_err());

        let records = buf.drain();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].measurement, "node_up");
        assert_eq!(records[0].fields[0].1.as_f64(), 0.0);
    }
}
