use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::TickSchedule;
use crate::config::{JobConfig, JobId};
use crate::discovery::SharedResolver;
use crate::export::health::HealthMetrics;
use crate::metric::{now_millis, MetricRecord, TimeSeries};
use crate::plugin::{Plugin, PluginRegistry, SampleBuffer, ScrapeContext};
use crate::sink::SeriesSink;

use super::target::{prepare_target, ScrapeTarget};

/// Lifecycle of a job runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JobState {
    Created = 0,
    Running = 1,
    /// A new config was handed over and the runner has not picked it up yet.
    Updating = 2,
    Stopping = 3,
    Stopped = 4,
}

impl JobState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Updating,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Updating => "updating",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

/// Shared collaborators of every job runner.
#[derive(Clone)]
pub struct JobDeps {
    pub registry: PluginRegistry,
    pub resolver: SharedResolver,
    pub sink: Arc<dyn SeriesSink>,
    pub metrics: Arc<HealthMetrics>,
}

/// Counters for one tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    /// Targets kept after target relabeling.
    pub targets: usize,
    /// Targets scraped (successfully or not).
    pub scrapes: usize,
    /// Scrapes that failed, timed out or panicked.
    pub errors: usize,
    /// Series handed to the sink.
    pub series: usize,
}

/// Handle to one job's long-running task.
pub struct JobRunner {
    id: JobId,
    config: watch::Sender<Arc<JobConfig>>,
    state: Arc<AtomicU8>,
    stop: CancellationToken,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl JobRunner {
    /// Starts the job's task. `abort` cancels in-flight scrapes; stopping
    /// the runner alone only ends scheduling.
    pub fn spawn(job: JobConfig, deps: JobDeps, abort: CancellationToken) -> Result<Self> {
        let schedule = TickSchedule::new(job.scrape_interval)
            .with_context(|| format!("scheduling job {}", job.id))?;

        let id = job.id.clone();
        let (tx, rx) = watch::channel(Arc::new(job));
        let state = Arc::new(AtomicU8::new(JobState::Created as u8));
        let stop = CancellationToken::new();

        let task = RunnerTask {
            id: id.clone(),
            config: rx,
            state: Arc::clone(&state),
            stop: stop.clone(),
            abort,
            deps,
            schedule,
        };
        let handle = tokio::spawn(task.run());

        Ok(Self {
            id,
            config: tx,
            state,
            stop,
            handle: parking_lot::Mutex::new(Some(handle)),
        })
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Config the next tick will use.
    pub fn config(&self) -> Arc<JobConfig> {
        Arc::clone(&self.config.borrow())
    }

    /// Swaps the job's config. A tick in progress finishes with its own
    /// snapshot; the runner wakes so a new interval applies right away.
    pub fn update_config(&self, job: JobConfig) {
        let _ = self.state.compare_exchange(
            JobState::Running as u8,
            JobState::Updating as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.config.send_replace(Arc::new(job));
        info!(job = %self.id, "job config updated");
    }

    /// Stops scheduling new ticks. A tick in progress runs to completion.
    pub fn stop(&self) {
        if self.state() != JobState::Stopped {
            self.state.store(JobState::Stopping as u8, Ordering::Release);
        }
        self.stop.cancel();
    }

    /// Takes the task handle, for awaiting the runner's exit.
    pub fn take_handle(&self) -> Option<JoinHandle<()>> {
        self.handle.lock().take()
    }
}

impl Drop for JobRunner {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

enum Wake {
    Tick,
    Update,
    Stop,
}

struct RunnerTask {
    id: JobId,
    config: watch::Receiver<Arc<JobConfig>>,
    state: Arc<AtomicU8>,
    stop: CancellationToken,
    abort: CancellationToken,
    deps: JobDeps,
    schedule: TickSchedule,
}

impl RunnerTask {
    async fn run(mut self) {
        let _ = self.state.compare_exchange(
            JobState::Created as u8,
            JobState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        info!(
            job = %self.id,
            interval = ?self.schedule.interval(),
            "job started"
        );

        loop {
            let due = self.schedule.next_due(Instant::now());
            let wake = tokio::select! {
                biased;
                _ = self.stop.cancelled() => Wake::Stop,
                changed = self.config.changed() => {
                    if changed.is_ok() { Wake::Update } else { Wake::Stop }
                }
                _ = tokio::time::sleep_until(due) => Wake::Tick,
            };

            match wake {
                Wake::Stop => break,
                Wake::Update => {
                    let snapshot = Arc::clone(&self.config.borrow_and_update());
                    self.sync_interval(&snapshot);
                    let _ = self.state.compare_exchange(
                        JobState::Updating as u8,
                        JobState::Running as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                }
                Wake::Tick => {
                    let snapshot = Arc::clone(&self.config.borrow());
                    self.sync_interval(&snapshot);
                    self.schedule.mark_started(Instant::now());

                    let summary = run_tick(&snapshot, &self.deps, &self.abort).await;
                    debug!(
                        job = %self.id,
                        tick = self.schedule.ticks(),
                        targets = summary.targets,
                        errors = summary.errors,
                        series = summary.series,
                        "tick finished"
                    );
                }
            }
        }

        self.state
            .store(JobState::Stopped as u8, Ordering::Release);
        info!(job = %self.id, ticks = self.schedule.ticks(), "job stopped");
    }

    fn sync_interval(&mut self, job: &JobConfig) {
        if job.scrape_interval == self.schedule.interval() {
            return;
        }
        match self.schedule.set_interval(job.scrape_interval) {
            Ok(()) => debug!(job = %self.id, interval = ?job.scrape_interval, "interval changed"),
            Err(e) => warn!(job = %self.id, error = %e, "ignoring interval change"),
        }
    }
}

/// Runs one tick of `job`: resolve targets, scrape them with bounded
/// concurrency, relabel the results and hand them to the sink.
pub async fn run_tick(
    job: &Arc<JobConfig>,
    deps: &JobDeps,
    abort: &CancellationToken,
) -> TickSummary {
    let started = Instant::now();
    let job_name = job.name();
    let mut summary = TickSummary::default();

    let Some(plugin) = deps.registry.get(&job.plugin) else {
        error!(job = %job.id, plugin = %job.plugin, "plugin not registered");
        return summary;
    };

    let discovered = deps.resolver.resolve(job, abort).await;
    if abort.is_cancelled() {
        debug!(job = %job.id, "tick aborted during target discovery");
        return summary;
    }
    let targets: Vec<ScrapeTarget> = discovered
        .iter()
        .filter_map(|labels| prepare_target(job, labels))
        .collect();
    summary.targets = targets.len();
    deps.metrics
        .targets
        .with_label_values(&[job_name])
        .set(targets.len() as f64);

    let limit = Arc::new(Semaphore::new(job.scrape_concurrency.max(1)));
    let mut scrapes = JoinSet::new();
    for target in targets {
        let Ok(permit) = Arc::clone(&limit).acquire_owned().await else {
            break;
        };
        let plugin = Arc::clone(&plugin);
        let job = Arc::clone(job);
        let abort = abort.clone();
        scrapes.spawn(async move {
            let _permit = permit;
            scrape_target(plugin.as_ref(), &job, &target, &abort).await
        });
    }

    let mut batch = Vec::new();
    while let Some(joined) = scrapes.join_next().await {
        summary.scrapes += 1;
        match joined {
            Ok(outcome) => {
                if outcome.failed {
                    summary.errors += 1;
                }
                batch.extend(outcome.series);
            }
            Err(e) => {
                summary.errors += 1;
                error!(job = %job.id, error = %e, "scrape task panicked");
            }
        }
    }
    summary.series = batch.len();

    deps.metrics
        .scrapes_total
        .with_label_values(&[job_name])
        .inc_by(summary.scrapes as f64);
    deps.metrics
        .scrape_errors_total
        .with_label_values(&[job_name])
        .inc_by(summary.errors as f64);
    deps.metrics
        .samples_scraped_total
        .with_label_values(&[job_name])
        .inc_by(summary.series as f64);
    deps.metrics
        .scrape_duration
        .with_label_values(&[job_name])
        .observe(started.elapsed().as_secs_f64());

    if !batch.is_empty() {
        deps.sink.submit(batch);
    }
    summary
}

struct ScrapeOutcome {
    series: Vec<TimeSeries>,
    failed: bool,
}

async fn scrape_target(
    plugin: &dyn Plugin,
    job: &JobConfig,
    target: &ScrapeTarget,
    abort: &CancellationToken,
) -> ScrapeOutcome {
    let cancel = abort.child_token();
    let deadline = Instant::now() + job.scrape_timeout;
    let ctx = ScrapeContext {
        job: Arc::from(job.name()),
        labels: target.labels.clone(),
        cancel: cancel.clone(),
        deadline,
    };
    let buf = SampleBuffer::new(cancel.clone());

    let result = tokio::time::timeout_at(
        deadline,
        scrape_rules(plugin, job, &ctx, &target.address, &buf),
    )
    .await;

    let failed = match result {
        Ok(Ok(())) => false,
        Ok(Err(e)) => {
            warn!(job = %job.id, target = %target.address, error = %e, "scrape failed");
            true
        }
        Err(_) => {
            warn!(
                job = %job.id,
                target = %target.address,
                timeout = ?job.scrape_timeout,
                "scrape timed out"
            );
            true
        }
    };

    let records = buf.drain();
    cancel.cancel();
    ScrapeOutcome {
        series: expand_records(job, target, records),
        failed,
    }
}

/// Calls the plugin once per rule file. Every rule runs; the first error
/// is returned.
async fn scrape_rules(
    plugin: &dyn Plugin,
    job: &JobConfig,
    ctx: &ScrapeContext,
    address: &str,
    buf: &SampleBuffer,
) -> Result<()> {
    let mut first_err = None;
    for rule in &job.rules {
        if let Err(e) = plugin.scrape(ctx, address, &rule.parsed, buf).await {
            let e = e.context(format!("rule file {}", rule.path.display()));
            if first_err.is_none() {
                first_err = Some(e);
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Expands buffered records into series on top of the target labels,
/// fills missing timestamps and applies job then global metric relabeling.
pub fn expand_records(
    job: &JobConfig,
    target: &ScrapeTarget,
    records: Vec<MetricRecord>,
) -> Vec<TimeSeries> {
    let base = target.series_labels();
    let now = now_millis();
    let mut out = Vec::with_capacity(records.len());
    for record in records {
        for mut ts in record.into_series(&base) {
            ts.fill_timestamps(now);
            job.metric_relabel.apply(&mut ts.labels);
            if ts.labels.is_empty() {
                continue;
            }
            job.global_metric_relabel.apply(&mut ts.labels);
            if ts.labels.is_empty() {
                continue;
            }
            out.push(ts);
        }
    }
    out
}
