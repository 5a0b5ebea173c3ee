pub mod sanitize;

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metric::Labels;

pub use self::sanitize::{finalize, is_valid_label_name, is_valid_metric_name};

/// Relabel rule action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    #[default]
    Replace,
    Keep,
    Drop,
    KeepIfEqual,
    DropIfEqual,
    Hashmod,
    Labelmap,
    Labeldrop,
    Labelkeep,
    Lowercase,
    Uppercase,
    Keepequal,
    Dropequal,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::Keep => "keep",
            Self::Drop => "drop",
            Self::KeepIfEqual => "keep_if_equal",
            Self::DropIfEqual => "drop_if_equal",
            Self::Hashmod => "hashmod",
            Self::Labelmap => "labelmap",
            Self::Labeldrop => "labeldrop",
            Self::Labelkeep => "labelkeep",
            Self::Lowercase => "lowercase",
            Self::Uppercase => "uppercase",
            Self::Keepequal => "keepequal",
            Self::Dropequal => "dropequal",
        }
    }

    fn requires_target_label(self) -> bool {
        matches!(
            self,
            Self::Replace
                | Self::Hashmod
                | Self::Lowercase
                | Self::Uppercase
                | Self::Keepequal
                | Self::Dropequal
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relabel rule as written in YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelabelConfig {
    #[serde(default)]
    pub source_labels: Vec<String>,

    /// Joins source label values. Default: ";".
    #[serde(default = "default_separator")]
    pub separator: String,

    /// Anchored regular expression. Default: "(.*)".
    #[serde(default = "default_regex")]
    pub regex: String,

    #[serde(default)]
    pub modulus: u64,

    #[serde(default)]
    pub target_label: String,

    /// Replacement template with `$1`/`${name}` references. Default: "$1".
    #[serde(default = "default_replacement")]
    pub replacement: String,

    #[serde(default)]
    pub action: Action,
}

impl Default for RelabelConfig {
    fn default() -> Self {
        Self {
            source_labels: Vec::new(),
            separator: default_separator(),
            regex: default_regex(),
            modulus: 0,
            target_label: String::new(),
            replacement: default_replacement(),
            action: Action::default(),
        }
    }
}

fn default_separator() -> String {
    ";".to_string()
}

fn default_regex() -> String {
    "(.*)".to_string()
}

fn default_replacement() -> String {
    "$1".to_string()
}

/// Invalid relabel rule, detected at config-load time.
#[derive(Debug, Error)]
pub enum RelabelError {
    #[error("relabel rule #{index}: invalid regex {regex:?}: {source}")]
    InvalidRegex {
        index: usize,
        regex: String,
        #[source]
        source: regex::Error,
    },

    #[error("relabel rule #{index}: action {action} requires target_label")]
    MissingTargetLabel { index: usize, action: Action },

    #[error("relabel rule #{index}: hashmod requires a positive modulus")]
    ZeroModulus { index: usize },

    #[error("relabel rule #{index}: action {action} requires at least two source_labels")]
    NotEnoughSourceLabels { index: usize, action: Action },
}

#[derive(Debug, Clone)]
struct ParsedRule {
    action: Action,
    source_labels: Vec<String>,
    separator: String,
    regex: Regex,
    match_all: bool,
    modulus: u64,
    target_label: String,
    replacement: String,
}

/// Compiled, ordered list of relabel rules.
#[derive(Debug, Clone, Default)]
pub struct ParsedRelabelConfigs {
    rules: Vec<ParsedRule>,
}

impl ParsedRelabelConfigs {
    /// Validates and compiles the rules.
    pub fn parse(configs: &[RelabelConfig]) -> Result<Self, RelabelError> {
        let mut rules = Vec::with_capacity(configs.len());

        for (index, cfg) in configs.iter().enumerate() {
            let regex = Regex::new(&format!("^(?:{})$", cfg.regex)).map_err(|source| {
                RelabelError::InvalidRegex {
                    index,
                    regex: cfg.regex.clone(),
                    source,
                }
            })?;

            if cfg.action.requires_target_label() && cfg.target_label.is_empty() {
                return Err(RelabelError::MissingTargetLabel {
                    index,
                    action: cfg.action,
                });
            }

            if cfg.action == Action::Hashmod && cfg.modulus == 0 {
                return Err(RelabelError::ZeroModulus { index });
            }

            if matches!(cfg.action, Action::KeepIfEqual | Action::DropIfEqual)
                && cfg.source_labels.len() < 2
            {
                return Err(RelabelError::NotEnoughSourceLabels {
                    index,
                    action: cfg.action,
                });
            }

            rules.push(ParsedRule {
                action: cfg.action,
                source_labels: cfg.source_labels.clone(),
                separator: cfg.separator.clone(),
                match_all: cfg.regex == "(.*)" || cfg.regex == ".*",
                regex,
                modulus: cfg.modulus,
                target_label: cfg.target_label.clone(),
                replacement: cfg.replacement.clone(),
            });
        }

        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Applies every rule in order.
    ///
    /// A `keep`/`drop`-style rule that rejects the set clears it and stops
    /// evaluation; callers treat an empty set as dropped.
    pub fn apply(&self, labels: &mut Labels) {
        for rule in &self.rules {
            if !rule.apply(labels) {
                labels.clear();
                return;
            }
        }
    }
}

impl ParsedRule {
    /// Returns false when the label set must be dropped.
    fn apply(&self, labels: &mut Labels) -> bool {
        match self.action {
            Action::Replace => {
                let value = self.source_value(labels);
                let Some(caps) = self.regex.captures(&value) else {
                    return true;
                };

                let mut target = String::new();
                caps.expand(&self.target_label, &mut target);
                if target.is_empty() {
                    return true;
                }

                let mut replaced = String::new();
                caps.expand(&self.replacement, &mut replaced);
                if replaced.is_empty() {
                    labels.remove(&target);
                } else {
                    labels.set(target, replaced);
                }
                true
            }
            Action::Keep => {
                let value = self.source_value(labels);
                self.match_all || self.regex.is_match(&value)
            }
            Action::Drop => {
                let value = self.source_value(labels);
                !(self.match_all || self.regex.is_match(&value))
            }
            Action::KeepIfEqual => self.sources_equal(labels),
            Action::DropIfEqual => !self.sources_equal(labels),
            Action::Keepequal => {
                let value = self.source_value(labels);
                value == labels.get_or_empty(&self.target_label)
            }
            Action::Dropequal => {
                let value = self.source_value(labels);
                value != labels.get_or_empty(&self.target_label)
            }
            Action::Hashmod => {
                let value = self.source_value(labels);
                let bucket = hashmod(&value, self.modulus);
                labels.set(self.target_label.as_str(), bucket.to_string());
                true
            }
            Action::Labelmap => {
                let mut mapped = Vec::new();
                for l in labels.iter() {
                    if let Some(caps) = self.regex.captures(&l.name) {
                        let mut name = String::new();
                        caps.expand(&self.replacement, &mut name);
                        if !name.is_empty() {
                            mapped.push((name, l.value.clone()));
                        }
                    }
                }
                for (name, value) in mapped {
                    labels.set(name, value);
                }
                true
            }
            Action::Labeldrop => {
                labels.retain(|l| !self.regex.is_match(&l.name));
                true
            }
            Action::Labelkeep => {
                labels.retain(|l| self.regex.is_match(&l.name));
                true
            }
            Action::Lowercase => {
                let value = self.source_value(labels).to_lowercase();
                labels.set(self.target_label.as_str(), value);
                true
            }
            Action::Uppercase => {
                let value = self.source_value(labels).to_uppercase();
                labels.set(self.target_label.as_str(), value);
                true
            }
        }
    }

    fn source_value(&self, labels: &Labels) -> String {
        let mut out = String::new();
        for (i, name) in self.source_labels.iter().enumerate() {
            if i > 0 {
                out.push_str(&self.separator);
            }
            out.push_str(labels.get_or_empty(name));
        }
        out
    }

    fn sources_equal(&self, labels: &Labels) -> bool {
        let mut values = self.source_labels.iter().map(|n| labels.get_or_empty(n));
        match values.next() {
            Some(first) => values.all(|v| v == first),
            None => true,
        }
    }
}

/// Prometheus-compatible hashmod: md5, lower 8 bytes big-endian, modulo.
fn hashmod(value: &str, modulus: u64) -> u64 {
    let digest = md5::compute(value.as_bytes());
    let mut tail = [0u8; 8];
    tail.copy_from_slice(&digest[8..16]);
    u64::from_be_bytes(tail) % modulus
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(yaml: &str) -> ParsedRelabelConfigs {
        let cfgs: Vec<RelabelConfig> = serde_yaml::from_str(yaml).expect("valid yaml");
        ParsedRelabelConfigs::parse(&cfgs).expect("valid rules")
    }

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        Labels::from_pairs(pairs.iter().copied())
    }

    #[test]
    fn test_defaults_from_yaml() {
        let cfgs: Vec<RelabelConfig> =
            serde_yaml::from_str("- target_label: x\n").expect("valid yaml");
        assert_eq!(cfgs[0].separator, ";");
        assert_eq!(cfgs[0].regex, "(.*)");
        assert_eq!(cfgs[0].replacement, "$1");
        assert_eq!(cfgs[0].action, Action::Replace);
    }

    #[test]
    fn test_replace_with_capture() {
        let rules = rule(
            r#"
- source_labels: [__address__]
  regex: '([^:]+):\d+'
  target_label: host
"#,
        );
        let mut ls = labels(&[("__address__", "db1:3306")]);
        rules.apply(&mut ls);
        assert_eq!(ls.get("host"), Some("db1"));
    }

    #[test]
    fn test_replace_overwrites_existing() {
        let rules = rule(
            r#"
- target_label: env
  replacement: prod
"#,
        );
        let mut ls = labels(&[("env", "dev")]);
        rules.apply(&mut ls);
        assert_eq!(ls.get("env"), Some("prod"));
        assert_eq!(ls.len(), 1);
    }

    #[test]
    fn test_replace_empty_result_removes_label() {
        let rules = rule(
            r#"
- source_labels: [missing]
  target_label: env
"#,
        );
        let mut ls = labels(&[("env", "dev")]);
        rules.apply(&mut ls);
        assert!(!ls.contains("env"));
    }

    #[test]
    fn test_replace_no_match_is_noop() {
        let rules = rule(
            r#"
- source_labels: [a]
  regex: 'x+'
  target_label: b
  replacement: matched
"#,
        );
        let mut ls = labels(&[("a", "yyy")]);
        rules.apply(&mut ls);
        assert!(!ls.contains("b"));
    }

    #[test]
    fn test_regex_is_anchored() {
        let rules = rule(
            r#"
- source_labels: [a]
  regex: 'foo'
  action: keep
"#,
        );
        let mut ls = labels(&[("a", "foobar")]);
        rules.apply(&mut ls);
        assert!(ls.is_empty());
    }

    #[test]
    fn test_drop_short_circuits() {
        let rules = rule(
            r#"
- source_labels: [__address__]
  regex: '127\..*'
  action: drop
- target_label: after
  replacement: x
"#,
        );
        let mut ls = labels(&[("__address__", "127.0.0.1:9999")]);
        rules.apply(&mut ls);
        assert!(ls.is_empty());

        let mut kept = labels(&[("__address__", "10.0.0.1:9999")]);
        rules.apply(&mut kept);
        assert_eq!(kept.get("after"), Some("x"));
    }

    #[test]
    fn test_keep_if_equal_and_drop_if_equal() {
        let keep = rule(
            r#"
- source_labels: [a, b]
  action: keep_if_equal
"#,
        );
        let mut same = labels(&[("a", "1"), ("b", "1")]);
        keep.apply(&mut same);
        assert!(!same.is_empty());
        let mut diff = labels(&[("a", "1"), ("b", "2")]);
        keep.apply(&mut diff);
        assert!(diff.is_empty());

        let drop = rule(
            r#"
- source_labels: [a, b]
  action: drop_if_equal
"#,
        );
        let mut same = labels(&[("a", "1"), ("b", "1")]);
        drop.apply(&mut same);
        assert!(same.is_empty());
    }

    #[test]
    fn test_keepequal_dropequal() {
        let keep = rule(
            r#"
- source_labels: [port]
  target_label: expected_port
  action: keepequal
"#,
        );
        let mut ls = labels(&[("port", "80"), ("expected_port", "80")]);
        keep.apply(&mut ls);
        assert_eq!(ls.len(), 2);
        let mut ls = labels(&[("port", "80"), ("expected_port", "81")]);
        keep.apply(&mut ls);
        assert!(ls.is_empty());

        let drop = rule(
            r#"
- source_labels: [port]
  target_label: expected_port
  action: dropequal
"#,
        );
        let mut ls = labels(&[("port", "80"), ("expected_port", "80")]);
        drop.apply(&mut ls);
        assert!(ls.is_empty());
    }

    #[test]
    fn test_hashmod_is_stable_and_bounded() {
        let rules = rule(
            r#"
- source_labels: [__address__]
  modulus: 8
  target_label: shard
  action: hashmod
"#,
        );
        let mut a = labels(&[("__address__", "10.0.0.1:9100")]);
        let mut b = labels(&[("__address__", "10.0.0.1:9100")]);
        rules.apply(&mut a);
        rules.apply(&mut b);
        let shard: u64 = a.get("shard").expect("shard set").parse().expect("number");
        assert!(shard < 8);
        assert_eq!(a.get("shard"), b.get("shard"));
    }

    #[test]
    fn test_labelmap() {
        let rules = rule(
            r#"
- regex: '__meta_kubernetes_pod_label_(.+)'
  action: labelmap
"#,
        );
        let mut ls = labels(&[
            ("__meta_kubernetes_pod_label_app", "web"),
            ("__meta_other", "x"),
        ]);
        rules.apply(&mut ls);
        assert_eq!(ls.get("app"), Some("web"));
        assert!(!ls.contains("other"));
    }

    #[test]
    fn test_labeldrop_labelkeep() {
        let drop = rule(
            r#"
- regex: 'tmp_.*'
  action: labeldrop
"#,
        );
        let mut ls = labels(&[("tmp_a", "1"), ("keep", "2")]);
        drop.apply(&mut ls);
        assert_eq!(ls.len(), 1);
        assert!(ls.contains("keep"));

        let keep = rule(
            r#"
- regex: '__name__|job'
  action: labelkeep
"#,
        );
        let mut ls = labels(&[("__name__", "m"), ("job", "j"), ("other", "x")]);
        keep.apply(&mut ls);
        assert_eq!(ls.len(), 2);
    }

    #[test]
    fn test_lowercase_uppercase() {
        let rules = rule(
            r#"
- source_labels: [a]
  target_label: lower
  action: lowercase
- source_labels: [a]
  target_label: upper
  action: uppercase
"#,
        );
        let mut ls = labels(&[("a", "MiXeD")]);
        rules.apply(&mut ls);
        assert_eq!(ls.get("lower"), Some("mixed"));
        assert_eq!(ls.get("upper"), Some("MIXED"));
    }

    #[test]
    fn test_separator_joins_sources() {
        let rules = rule(
            r#"
- source_labels: [a, b]
  separator: '-'
  target_label: ab
"#,
        );
        let mut ls = labels(&[("a", "x"), ("b", "y")]);
        rules.apply(&mut ls);
        assert_eq!(ls.get("ab"), Some("x-y"));
    }

    #[test]
    fn test_parse_errors() {
        let bad_regex = vec![RelabelConfig {
            regex: "(".to_string(),
            target_label: "x".to_string(),
            ..Default::default()
        }];
        assert!(matches!(
            ParsedRelabelConfigs::parse(&bad_regex),
            Err(RelabelError::InvalidRegex { .. })
        ));

        let no_target = vec![RelabelConfig::default()];
        assert!(matches!(
            ParsedRelabelConfigs::parse(&no_target),
            Err(RelabelError::MissingTargetLabel { .. })
        ));

        let zero_mod = vec![RelabelConfig {
            action: Action::Hashmod,
            target_label: "x".to_string(),
            ..Default::default()
        }];
        assert!(matches!(
            ParsedRelabelConfigs::parse(&zero_mod),
            Err(RelabelError::ZeroModulus { .. })
        ));

        let one_source = vec![RelabelConfig {
            action: Action::KeepIfEqual,
            source_labels: vec!["a".to_string()],
            ..Default::default()
        }];
        assert!(matches!(
            ParsedRelabelConfigs::parse(&one_source),
            Err(RelabelError::NotEnoughSourceLabels { .. })
        ));
    }

    #[test]
    fn test_unknown_action_rejected() {
        let res: Result<Vec<RelabelConfig>, _> = serde_yaml::from_str("- action: explode\n");
        assert!(res.is_err());
    }
}
