use crate::config::JobConfig;
use crate::metric::{Labels, ADDRESS_LABEL, INSTANCE_LABEL, JOB_LABEL};

/// A target ready to scrape.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeTarget {
    /// Value of `__address__` after target relabeling.
    pub address: String,
    /// Target labels after relabeling, meta labels stripped, sorted.
    pub labels: Labels,
}

impl ScrapeTarget {
    /// Labels every series from this target starts with: the target
    /// labels without reserved `__*` names.
    pub fn series_labels(&self) -> Labels {
        let mut base = self.labels.clone();
        base.strip_reserved();
        base
    }
}

/// Builds the final label set of one discovered target.
///
/// Labels are merged as `job`, then external labels, then the target's own
/// labels, later sources winning. `instance` defaults to the address. A
/// target whose relabeled set is empty or has no `__address__` is dropped.
pub fn prepare_target(job: &JobConfig, discovered: &Labels) -> Option<ScrapeTarget> {
    let mut labels = Labels::with_capacity(discovered.len() + job.external_labels.len() + 2);
    labels.set(JOB_LABEL, job.name());
    labels.merge_from(&job.external_labels);
    labels.merge_from(discovered);

    if !labels.contains(INSTANCE_LABEL) {
        let address = labels.get_or_empty(ADDRESS_LABEL).to_string();
        if !address.is_empty() {
            labels.set(INSTANCE_LABEL, address);
        }
    }

    job.target_relabel.apply(&mut labels);
    let address = match labels.get(ADDRESS_LABEL) {
        Some(addr) if !addr.is_empty() => addr.to_string(),
        _ => return None,
    };

    labels.strip_meta();
    labels.sort();

    Some(ScrapeTarget { address, labels })
}
