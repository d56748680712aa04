//! Bounded-concurrency execution of named jobs.
//!
//! Every job runs to completion; failures are collected and returned as one
//! [`ThelmaError::Multiple`] next to a per-job [`PoolReport`].

use crate::error::{ErrorAggregator, Result, ThelmaError};
use crate::metrics::{merge_labels, normalize_labels, Labels, MetricsSink};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::info;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

pub struct Job {
    pub name: String,
    pub labels: Labels,
    run: BoxFuture<'static, Result<()>>,
}

impl Job {
    pub fn new<F>(name: impl Into<String>, fut: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            labels: Labels::new(),
            run: Box::pin(fut),
        }
    }

    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }
}

// ---------------------------------------------------------------------------
// Options / report
// ---------------------------------------------------------------------------

pub struct MetricsOptions {
    pub sink: Arc<dyn MetricsSink>,
    /// Metric name prefix, e.g. `thelma_bees_apply_schedule`.
    pub prefix: String,
    pub labels: Labels,
}

pub struct PoolOptions {
    pub num_workers: usize,
    pub summarize: bool,
    pub dry_run: bool,
    pub metrics: Option<MetricsOptions>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            num_workers: 10,
            summarize: true,
            dry_run: false,
            metrics: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Succeeded => "ok",
            JobStatus::Failed => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub name: String,
    pub status: JobStatus,
    pub duration: Duration,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PoolReport {
    pub jobs: Vec<JobReport>,
}

impl PoolReport {
    pub fn succeeded(&self) -> Vec<&str> {
        self.names_with(JobStatus::Succeeded)
    }

    pub fn failed(&self) -> Vec<&str> {
        self.names_with(JobStatus::Failed)
    }

    fn names_with(&self, status: JobStatus) -> Vec<&str> {
        self.jobs
            .iter()
            .filter(|j| j.status == status)
            .map(|j| j.name.as_str())
            .collect()
    }

    /// Fixed-width status table, one line per job.
    pub fn table(&self) -> String {
        let width = self
            .jobs
            .iter()
            .map(|j| j.name.len())
            .max()
            .unwrap_or(0)
            .max("JOB".len());
        let mut out = format!("{:<width$}  {:<6}  {:>9}  ERROR\n", "JOB", "STATUS", "DURATION");
        for j in &self.jobs {
            out.push_str(&format!(
                "{:<width$}  {:<6}  {:>8.1}s  {}\n",
                j.name,
                j.status.as_str(),
                j.duration.as_secs_f64(),
                j.error.as_deref().unwrap_or("")
            ));
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

pub struct Pool {
    jobs: Vec<Job>,
    opts: PoolOptions,
}

struct Outcome {
    index: usize,
    labels: Labels,
    report: JobReport,
    error: Option<ThelmaError>,
}

impl Pool {
    pub fn new(jobs: Vec<Job>, opts: PoolOptions) -> Self {
        Self { jobs, opts }
    }

    pub async fn execute(self) -> (PoolReport, Result<()>) {
        let Pool { jobs, opts } = self;
        let total = jobs.len();
        let workers = opts.num_workers.clamp(1, total.max(1));

        let (tx, rx) = mpsc::channel::<(usize, Job)>(total.max(1));
        for (i, job) in jobs.into_iter().enumerate() {
            // Capacity equals the job count, so this never waits.
            if tx.send((i, job)).await.is_err() {
                break;
            }
        }
        drop(tx);

        let rx = Arc::new(AsyncMutex::new(rx));
        let outcomes: Arc<Mutex<Vec<Outcome>>> = Arc::new(Mutex::new(Vec::with_capacity(total)));

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let rx = rx.clone();
            let outcomes = outcomes.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some((index, job)) = next else { break };
                    let outcome = run_job(index, job).await;
                    if let Ok(mut guard) = outcomes.lock() {
                        guard.push(outcome);
                    }
                }
            }));
        }
        for h in handles {
            let _ = h.await;
        }

        let mut outcomes = match Arc::try_unwrap(outcomes) {
            Ok(m) => m.into_inner().unwrap_or_else(|p| p.into_inner()),
            Err(shared) => shared
                .lock()
                .map(|mut g| std::mem::take(&mut *g))
                .unwrap_or_default(),
        };
        outcomes.sort_by_key(|o| o.index);

        if let Some(m) = opts.metrics.as_ref().filter(|_| !opts.dry_run) {
            emit_metrics(m, &outcomes);
        }

        let mut agg = ErrorAggregator::new();
        let mut report = PoolReport::default();
        for o in outcomes {
            if let Some(e) = o.error {
                agg.push(o.report.name.clone(), e);
            }
            report.jobs.push(o.report);
        }

        if opts.summarize && !report.jobs.is_empty() {
            info!(
                succeeded = report.succeeded().len(),
                failed = report.failed().len(),
                "job summary:\n{}",
                report.table()
            );
        }

        (report, agg.into_result())
    }
}

async fn run_job(index: usize, job: Job) -> Outcome {
    let Job { name, labels, run } = job;
    let started = Instant::now();
    let result = match tokio::spawn(run).await {
        Ok(r) => r,
        Err(e) => Err(ThelmaError::Fatal(format!("job {name} panicked: {e}"))),
    };
    let duration = started.elapsed();
    let (status, error) = match result {
        Ok(()) => (JobStatus::Succeeded, None),
        Err(e) => (JobStatus::Failed, Some(e)),
    };
    Outcome {
        index,
        labels,
        report: JobReport {
            name,
            status,
            duration,
            error: error.as_ref().map(|e| e.to_string()),
        },
        error,
    }
}

fn emit_metrics(m: &MetricsOptions, outcomes: &[Outcome]) {
    for o in outcomes {
        let mut status = Labels::new();
        status.insert("job_name".to_string(), o.report.name.clone());
        status.insert("ok".to_string(), (o.report.status == JobStatus::Succeeded).to_string());
        let labels = normalize_labels(merge_labels([Some(&m.labels), Some(&o.labels), Some(&status)]));
        m.sink.counter(&format!("{}_count", m.prefix), &labels, 1);
        m.sink.gauge(
            &format!("{}_duration_seconds", m.prefix),
            &labels,
            o.report.duration.as_secs_f64(),
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingMetrics {
        counters: Mutex<Vec<(String, Labels)>>,
    }

    impl MetricsSink for RecordingMetrics {
        fn counter(&self, name: &str, labels: &Labels, _value: u64) {
            self.counters
                .lock()
                .unwrap()
                .push((name.to_string(), labels.clone()));
        }
        fn gauge(&self, _name: &str, _labels: &Labels, _value: f64) {}
    }

    #[tokio::test]
    async fn all_jobs_run_and_errors_are_aggregated() {
        let ran = Arc::new(AtomicUsize::new(0));
        let jobs = (0..5)
            .map(|i| {
                let ran = ran.clone();
                Job::new(format!("bee-{i}"), async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    if i % 2 == 1 {
                        Err(ThelmaError::remote("argocd", format!("sync {i} failed")))
                    } else {
                        Ok(())
                    }
                })
            })
            .collect();

        let (report, result) = Pool::new(
            jobs,
            PoolOptions {
                num_workers: 2,
                ..Default::default()
            },
        )
        .execute()
        .await;

        assert_eq!(ran.load(Ordering::SeqCst), 5);
        assert_eq!(report.succeeded(), vec!["bee-0", "bee-2", "bee-4"]);
        assert_eq!(report.failed(), vec!["bee-1", "bee-3"]);
        match result.unwrap_err() {
            ThelmaError::Multiple(errs) => {
                let names: Vec<_> = errs.iter().map(|(n, _)| n.as_str()).collect();
                assert_eq!(names, vec!["bee-1", "bee-3"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(report.table().contains("bee-3"));
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let jobs = (0..8)
            .map(|i| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                Job::new(format!("job-{i}"), async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();
        let (report, result) = Pool::new(
            jobs,
            PoolOptions {
                num_workers: 3,
                summarize: false,
                ..Default::default()
            },
        )
        .execute()
        .await;
        assert!(result.is_ok());
        assert_eq!(report.jobs.len(), 8);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn metrics_skipped_in_dry_run() {
        for dry_run in [false, true] {
            let sink = Arc::new(RecordingMetrics::default());
            let mut base = Labels::new();
            base.insert("job".into(), "bees-delete".into());
            let (_, result) = Pool::new(
                vec![Job::new("my-bee", async { Ok(()) })],
                PoolOptions {
                    num_workers: 1,
                    summarize: false,
                    dry_run,
                    metrics: Some(MetricsOptions {
                        sink: sink.clone(),
                        prefix: "thelma_bees".into(),
                        labels: base,
                    }),
                },
            )
            .execute()
            .await;
            assert!(result.is_ok());
            let counters = sink.counters.lock().unwrap();
            if dry_run {
                assert!(counters.is_empty());
            } else {
                assert_eq!(counters.len(), 1);
                assert_eq!(counters[0].0, "thelma_bees_count");
                assert_eq!(counters[0].1["_job"], "bees-delete");
                assert_eq!(counters[0].1["ok"], "true");
            }
        }
    }

    #[tokio::test]
    async fn empty_pool_is_ok() {
        let (report, result) = Pool::new(vec![], PoolOptions::default()).execute().await;
        assert!(result.is_ok());
        assert!(report.jobs.is_empty());
    }
}
