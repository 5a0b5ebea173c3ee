pub mod job;
pub mod target;

#[cfg(test)]
pub(crate) mod testutil;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::loader::{check_unique_job_names, Loader};
use crate::config::{JobConfig, JobId};

pub use self::job::{JobDeps, JobRunner, JobState, TickSummary};
pub use self::target::{prepare_target, ScrapeTarget};

/// What a reload changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReloadSummary {
    pub added: Vec<JobId>,
    pub updated: Vec<JobId>,
    pub removed: Vec<JobId>,
    pub unchanged: usize,
    /// Entry files that failed to load; their previous jobs were kept.
    pub failed_files: Vec<PathBuf>,
}

impl ReloadSummary {
    /// True when no runner was started, updated or stopped.
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Owns one [`JobRunner`] per loaded job.
pub struct Scheduler {
    loader: Loader,
    deps: JobDeps,
    jobs: RwLock<BTreeMap<JobId, JobRunner>>,
    /// Handles of runners stopped by a reload that may still be finishing
    /// a tick.
    retired: Mutex<Vec<JoinHandle<()>>>,
    /// Cancels in-flight scrapes once the shutdown window has passed.
    abort: CancellationToken,
    reload_lock: tokio::sync::Mutex<()>,
}

impl Scheduler {
    pub fn new(loader: Loader, deps: JobDeps) -> Self {
        Self {
            loader,
            deps,
            jobs: RwLock::new(BTreeMap::new()),
            retired: Mutex::new(Vec::new()),
            abort: CancellationToken::new(),
            reload_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Loads `conf.d` and starts a runner per job. Any entry file that
    /// fails to load fails the start.
    pub fn start(&self) -> Result<usize> {
        let loaded = self.loader.load_all()?;
        if !loaded.failed.is_empty() {
            let details: Vec<String> = loaded
                .failed
                .iter()
                .map(|(file, e)| format!("{}: {e:#}", file.display()))
                .collect();
            bail!(
                "{} config file(s) failed to load: {}",
                details.len(),
                details.join("; ")
            );
        }

        let summary = self.apply(loaded.jobs, &[])?;
        info!(
            jobs = summary.added.len(),
            files = loaded.files.len(),
            "scheduler started"
        );
        Ok(summary.added.len())
    }

    /// Re-reads `conf.d` and diff-applies it to the running jobs.
    ///
    /// Files that fail to load keep their previous jobs. A duplicate job
    /// name anywhere rejects the reload and leaves every runner untouched.
    pub async fn reload(&self) -> Result<ReloadSummary> {
        let _serialized = self.reload_lock.lock().await;

        let result = self.load_and_apply();
        let outcome = if result.is_ok() { "success" } else { "failure" };
        self.deps
            .metrics
            .config_reloads_total
            .with_label_values(&[outcome])
            .inc();

        let summary = result?;
        info!(
            added = summary.added.len(),
            updated = summary.updated.len(),
            removed = summary.removed.len(),
            unchanged = summary.unchanged,
            failed_files = summary.failed_files.len(),
            "config reloaded"
        );
        Ok(summary)
    }

    fn load_and_apply(&self) -> Result<ReloadSummary> {
        let loaded = self.loader.load_all()?;
        let failed_files: Vec<PathBuf> = loaded
            .failed
            .iter()
            .map(|(file, e)| {
                warn!(
                    file = %file.display(),
                    error = ?e,
                    "config file failed to load, keeping its previous jobs"
                );
                file.clone()
            })
            .collect();

        let mut summary = self.apply(loaded.jobs, &failed_files)?;
        summary.failed_files = failed_files;
        Ok(summary)
    }

    /// Makes the running set match `jobs`. Runners whose entry file is in
    /// `keep_files` survive even when absent from `jobs`.
    pub fn apply(
        &self,
        jobs: BTreeMap<JobId, JobConfig>,
        keep_files: &[PathBuf],
    ) -> Result<ReloadSummary> {
        let mut running = self.jobs.write();

        let mut next = jobs;
        for (id, runner) in running.iter() {
            if keep_files.contains(&id.file) && !next.contains_key(id) {
                next.insert(id.clone(), runner.config().as_ref().clone());
            }
        }
        check_unique_job_names(next.keys())?;

        let mut summary = ReloadSummary::default();

        let stale: Vec<JobId> = running
            .keys()
            .filter(|id| !next.contains_key(*id))
            .cloned()
            .collect();
        for id in stale {
            if let Some(runner) = running.remove(&id) {
                runner.stop();
                if let Some(handle) = runner.take_handle() {
                    self.retired.lock().push(handle);
                }
                info!(job = %id, "job removed");
                summary.removed.push(id);
            }
        }

        for (id, cfg) in next {
            match running.get(&id) {
                Some(runner) if *runner.config() == cfg => summary.unchanged += 1,
                Some(runner) => {
                    runner.update_config(cfg);
                    summary.updated.push(id);
                }
                None => {
                    let runner = JobRunner::spawn(cfg, self.deps.clone(), self.abort.clone())?;
                    running.insert(id.clone(), runner);
                    summary.added.push(id);
                }
            }
        }

        self.deps.metrics.jobs_running.set(running.len() as f64);
        self.retired.lock().retain(|h| !h.is_finished());
        Ok(summary)
    }

    /// Stops every runner and waits up to `timeout` for in-flight ticks.
    /// Scrapes still running after that are cancelled. Returns whether
    /// everything finished in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let runners: Vec<JobRunner> = std::mem::take(&mut *self.jobs.write())
            .into_values()
            .collect();
        let mut handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.retired.lock());
        for runner in &runners {
            runner.stop();
            if let Some(handle) = runner.take_handle() {
                handles.push(handle);
            }
        }
        self.deps.metrics.jobs_running.set(0.0);

        let pending = handles.len();
        let drained = tokio::time::timeout(timeout, async move {
            for handle in handles {
                let _ = handle.await;
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                runners = pending,
                timeout = ?timeout,
                "shutdown window expired, cancelling in-flight scrapes"
            );
        }
        self.abort.cancel();
        info!(runners = runners.len(), drained, "scheduler stopped");
        drained
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        self.jobs.read().keys().cloned().collect()
    }

    pub fn job_state(&self, id: &JobId) -> Option<JobState> {
        self.jobs.read().get(id).map(JobRunner::state)
    }

    pub fn job_config(&self, id: &JobId) -> Option<Arc<JobConfig>> {
        self.jobs.read().get(id).map(JobRunner::config)
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use tempfile::TempDir;

    use super::testutil::{test_deps, test_registry, CollectSink, FakePlugin};
    use super::*;

    fn write(dir: &Path, rel: &str, body: &str) {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create dirs");
        }
        fs::write(path, body).expect("write file");
    }

    fn jobs_yaml(jobs: &[(&str, &str)]) -> String {
        let mut out = String::from("scrape_configs:\n");
        for (name, interval) in jobs {
            out.push_str(&format!(
                "  - job_name: {name}\n    scrape_interval: {interval}\n    scrape_rule_files: [rules.d/*.toml]\n"
            ));
        }
        out
    }

    fn scheduler(dir: &TempDir) -> Scheduler {
        let plugin = FakePlugin::default();
        let loader = Loader::new(dir.path(), test_registry(plugin.clone()), true);
        Scheduler::new(loader, test_deps(plugin, Arc::new(CollectSink::default())))
    }

    fn names(ids: &[JobId]) -> Vec<&str> {
        ids.iter().map(|id| id.job.as_str()).collect()
    }

    fn setup() -> TempDir {
        let dir = TempDir::new().expect("tempdir");
        write(dir.path(), "fake/rules.d/a.toml", "x = 1\n");
        dir
    }

    #[tokio::test]
    async fn test_start_and_identical_reload_is_noop() {
        let dir = setup();
        write(dir.path(), "fake/main.yaml", &jobs_yaml(&[("a", "1h")]));
        let sched = scheduler(&dir);

        assert_eq!(sched.start().expect("start"), 1);
        let id = sched.job_ids()[0].clone();
        let before = sched.job_config(&id).expect("config");

        let summary = sched.reload().await.expect("reload");
        assert!(summary.is_noop());
        assert_eq!(summary.unchanged, 1);
        assert!(Arc::ptr_eq(&before, &sched.job_config(&id).expect("config")));

        sched.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_reload_adds_updates_and_removes() {
        let dir = setup();
        write(
            dir.path(),
            "fake/main.yaml",
            &jobs_yaml(&[("a", "1h"), ("b", "1h")]),
        );
        let sched = scheduler(&dir);
        sched.start().expect("start");

        write(
            dir.path(),
            "fake/main.yaml",
            &jobs_yaml(&[("b", "30m"), ("c", "1h")]),
        );
        let summary = sched.reload().await.expect("reload");
        assert_eq!(names(&summary.added), vec!["c"]);
        assert_eq!(names(&summary.updated), vec!["b"]);
        assert_eq!(names(&summary.removed), vec!["a"]);
        assert_eq!(names(&sched.job_ids()), vec!["b", "c"]);

        let b = sched
            .job_ids()
            .into_iter()
            .find(|id| id.job == "b")
            .expect("b");
        assert_eq!(
            sched.job_config(&b).expect("config").scrape_interval,
            Duration::from_secs(1800)
        );

        assert!(sched.shutdown(Duration::from_secs(1)).await);
        assert!(sched.is_empty());
    }

    #[tokio::test]
    async fn test_reload_keeps_jobs_of_failed_file() {
        let dir = setup();
        write(dir.path(), "fake/main.yaml", &jobs_yaml(&[("a", "1h")]));
        write(dir.path(), "fake/main-2.yaml", &jobs_yaml(&[("b", "1h")]));
        let sched = scheduler(&dir);
        assert_eq!(sched.start().expect("start"), 2);

        write(dir.path(), "fake/main-2.yaml", "scrape_configs: [ {job_name: ");
        let summary = sched.reload().await.expect("reload");
        assert!(summary.is_noop());
        assert_eq!(summary.failed_files.len(), 1);
        assert_eq!(names(&sched.job_ids()), vec!["a", "b"]);

        sched.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_reload_duplicate_job_rejected() {
        let dir = setup();
        write(dir.path(), "fake/main.yaml", &jobs_yaml(&[("a", "1h")]));
        let sched = scheduler(&dir);
        sched.start().expect("start");

        write(dir.path(), "fake/main-2.yaml", &jobs_yaml(&[("a", "5m")]));
        let err = sched.reload().await.expect_err("duplicate job");
        assert!(err.to_string().contains("is defined in both"));
        assert_eq!(sched.len(), 1);
        let id = &sched.job_ids()[0];
        assert_eq!(
            sched.job_config(id).expect("config").scrape_interval,
            Duration::from_secs(3600)
        );

        sched.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_start_fails_on_bad_file() {
        let dir = setup();
        write(dir.path(), "fake/main.yaml", "scrape_configs:\n  - job_name: a\n");
        let sched = scheduler(&dir);
        let err = sched.start().expect_err("no rule files");
        assert!(err.to_string().contains("failed to load"));
        assert!(sched.is_empty());
    }

    #[tokio::test]
    async fn test_empty_scrape_configs() {
        let dir = setup();
        write(dir.path(), "fake/main.yaml", "scrape_configs: []\n");
        let sched = scheduler(&dir);
        assert_eq!(sched.start().expect("start"), 0);
        assert!(sched.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_shutdown_stops_runners() {
        let dir = setup();
        write(dir.path(), "fake/main.yaml", &jobs_yaml(&[("a", "1h"), ("b", "1h")]));
        let sched = scheduler(&dir);
        sched.start().expect("start");
        let ids = sched.job_ids();
        assert!(ids
            .iter()
            .all(|id| matches!(sched.job_state(id), Some(JobState::Created | JobState::Running))));

        assert!(sched.shutdown(Duration::from_secs(1)).await);
        assert!(sched.job_state(&ids[0]).is_none());
    }
}
