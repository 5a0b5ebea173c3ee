use std::collections::BTreeMap;
use std::fmt;

/// Label carrying the metric name in the write stage.
pub const METRIC_NAME_LABEL: &str = "__name__";
/// Label carrying the scrape address until target relabeling finishes.
pub const ADDRESS_LABEL: &str = "__address__";
/// Prefix of service-discovery metadata labels.
pub const META_LABEL_PREFIX: &str = "__meta_";
/// Default instance label.
pub const INSTANCE_LABEL: &str = "instance";
/// Default job label.
pub const JOB_LABEL: &str = "job";

/// A single name/value pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Ordered label set.
///
/// Order is insertion order until [`Labels::sort`] is called. Names are kept
/// unique by [`Labels::set`]; [`Labels::push`] does not check and is followed
/// by [`Labels::dedup_keep_first`] where duplicates may appear.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Labels(Vec<Label>);

impl Labels {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self(Vec::with_capacity(cap))
    }

    /// Builds a label set from pairs, later pairs overwriting earlier ones.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut labels = Self::new();
        for (k, v) in pairs {
            labels.set(k, v);
        }
        labels
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Label> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Label] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<Label> {
        self.0
    }

    /// Returns the value of the first label with the given name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }

    /// Returns the value of the label, or the empty string if absent.
    pub fn get_or_empty(&self, name: &str) -> &str {
        self.get(name).unwrap_or("")
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|l| l.name == name)
    }

    /// Sets a label, overwriting the existing value in place.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|l| l.name == name) {
            Some(existing) => existing.value = value,
            None => self.0.push(Label { name, value }),
        }
    }

    /// Appends without checking for an existing name.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push(Label::new(name, value));
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|l| l.name != name);
    }

    pub fn retain<F>(&mut self, f: F)
    where
        F: FnMut(&Label) -> bool,
    {
        self.0.retain(f);
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Sorts labels by name (stable, so equal names keep their order).
    pub fn sort(&mut self) {
        self.0.sort_by(|a, b| a.name.cmp(&b.name));
    }

    /// Removes later labels whose name was already seen.
    pub fn dedup_keep_first(&mut self) {
        if self.0.len() < 2 {
            return;
        }
        let mut seen = std::collections::HashSet::with_capacity(self.0.len());
        self.0.retain(|l| seen.insert(l.name.clone()));
    }

    /// Removes every `__meta_*` label.
    pub fn strip_meta(&mut self) {
        self.0.retain(|l| !l.name.starts_with(META_LABEL_PREFIX));
    }

    /// Removes every `__`-prefixed label except `__name__`.
    pub fn strip_reserved(&mut self) {
        self.0
            .retain(|l| l.name == METRIC_NAME_LABEL || !l.name.starts_with("__"));
    }

    /// Overlays `other` on top of `self`; values from `other` win.
    pub fn merge_from(&mut self, other: &Labels) {
        for l in other.iter() {
            self.set(l.name.as_str(), l.value.as_str());
        }
    }
}

impl From<Vec<Label>> for Labels {
    fn from(v: Vec<Label>) -> Self {
        Self(v)
    }
}

impl FromIterator<Label> for Labels {
    fn from_iter<T: IntoIterator<Item = Label>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Labels {
    type Item = &'a Label;
    type IntoIter = std::slice::Iter<'a, Label>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, l) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={:?}", l.name, l.value)?;
        }
        f.write_str("}")
    }
}

/// One value at one point in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub value: f64,
    /// Milliseconds since the Unix epoch; 0 means "fill at ingress".
    pub timestamp_ms: i64,
}

/// A label set with its samples, the unit handed to the write pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeries {
    pub labels: Labels,
    pub samples: Vec<Sample>,
}

impl TimeSeries {
    pub fn new(labels: Labels, value: f64, timestamp_ms: i64) -> Self {
        Self {
            labels,
            samples: vec![Sample {
                value,
                timestamp_ms,
            }],
        }
    }

    /// Returns the metric name, if set.
    pub fn name(&self) -> Option<&str> {
        self.labels.get(METRIC_NAME_LABEL)
    }

    /// Replaces zero timestamps with `now_ms`.
    pub fn fill_timestamps(&mut self, now_ms: i64) {
        for s in &mut self.samples {
            if s.timestamp_ms == 0 {
                s.timestamp_ms = now_ms;
            }
        }
    }
}

/// Field value of a plugin-facing metric record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Int(i64),
    UInt(u64),
    Bool(bool),
}

impl FieldValue {
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Float(v) => v,
            Self::Int(v) => v as f64,
            Self::UInt(v) => v as f64,
            Self::Bool(v) => {
                if v {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        Self::UInt(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// Plugin-facing record: one measurement with several numeric fields.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: Vec<(String, FieldValue)>,
    pub timestamp_ms: i64,
}

impl MetricRecord {
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: Vec::with_capacity(1),
            timestamp_ms: 0,
        }
    }

    /// Record with a single value whose name is the measurement itself.
    pub fn gauge(measurement: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self::new(measurement).field("", value)
    }

    pub fn tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(name.into(), value.into());
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    /// Expands into one series per field, on top of `base` labels.
    ///
    /// Record tags override base labels.
    pub fn into_series(self, base: &Labels) -> Vec<TimeSeries> {
        let mut out = Vec::with_capacity(self.fields.len());
        for (field, value) in &self.fields {
            let mut labels = Labels::with_capacity(base.len() + self.tags.len() + 1);
            labels.merge_from(base);
            for (k, v) in &self.tags {
                labels.set(k.as_str(), v.as_str());
            }
            labels.set(METRIC_NAME_LABEL, series_name(&self.measurement, field));
            out.push(TimeSeries::new(labels, value.as_f64(), self.timestamp_ms));
        }
        out
    }
}

/// Joins measurement and field into a metric name.
///
/// An empty or `-` field means the measurement is the full name.
pub fn series_name(measurement: &str, field: &str) -> String {
    if field.is_empty() || field == "-" {
        measurement.to_string()
    } else if measurement.is_empty() {
        field.to_string()
    } else {
        format!("{measurement}_{field}")
    }
}

/// Current wall clock in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
