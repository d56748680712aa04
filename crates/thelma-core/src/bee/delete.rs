use super::{cluster_for, Bee, BeeFilter, Bees, DeleteOptions};
use crate::error::{Result, ThelmaError};
use crate::lifecycle::BeeState;
use crate::metrics::Labels;
use crate::pool::{Job, MetricsOptions, Pool, PoolOptions, PoolReport};
use crate::seed::SeedOptions;
use tracing::{info, warn};

/// Result of a bulk operation: what succeeded plus the aggregate error.
#[derive(Debug, Default)]
pub struct BulkOutcome {
    /// Names the operation was (or in dry-run, would have been) applied to.
    pub selected: Vec<String>,
    pub succeeded: Vec<String>,
    pub dry_run: bool,
    pub report: PoolReport,
    pub error: Option<ThelmaError>,
}

impl BulkOutcome {
    pub fn into_result(self) -> Result<Vec<String>> {
        match self.error {
            None => Ok(self.succeeded),
            Some(e) => Err(e),
        }
    }
}

impl Bees {
    /// Delete a BEE. Returns `None` when it was already gone and
    /// `ignore_missing` is set.
    pub async fn delete_with(&self, name: &str, opts: &DeleteOptions) -> Result<Option<Bee>> {
        let state = self.state().await?;
        let env = match state.environments().get(name) {
            Ok(env) => env.clone(),
            Err(_) if opts.ignore_missing => {
                info!(bee = %name, "bee does not exist, nothing to delete");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        env.ensure_destroyable(opts.force)?;

        let mut bee = Bee::existing(env);
        bee.transition(BeeState::Deleting)?;

        if opts.export_logs {
            self.export_logs(&mut bee, true).await;
        }

        if opts.unseed {
            let seed_opts = SeedOptions {
                force: opts.force,
                ..Default::default()
            };
            let result = match cluster_for(&state, &bee.environment) {
                Ok(cluster) => {
                    self.c
                        .seeder
                        .unseed(&bee.environment, cluster, &seed_opts)
                        .await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(bee = %name, error = %e, "unseed failed, deleting anyway");
            }
        }

        self.c.state.delete_environment(name).await?;
        info!(bee = %name, "deleted from state");

        // The first refresh removes the apps; ArgoCD only drops the
        // environment's project on the next one.
        self.refresh_bee_generator().await?;
        self.refresh_bee_generator().await?;

        bee.transition(BeeState::NonExistent)?;
        Ok(Some(bee))
    }

    /// Delete every BEE matching `filter`, `max_parallel` at a time.
    pub async fn delete_all(&self, filter: &BeeFilter, opts: &DeleteOptions, max_parallel: usize, dry_run: bool) -> Result<BulkOutcome> {
        let bees = self.filter_bees(filter).await?;
        let selected: Vec<String> = bees.iter().map(|b| b.name().to_string()).collect();
        info!(count = selected.len(), dry_run, "selected bees for deletion");

        let jobs = selected
            .iter()
            .map(|name| {
                let bees = self.clone();
                let name = name.clone();
                let opts = opts.clone();
                let mut labels = Labels::new();
                labels.insert("bee".to_string(), name.clone());
                Job::new(name.clone(), async move {
                    if dry_run {
                        info!(bee = %name, "dry run, would delete");
                        return Ok(());
                    }
                    bees.delete_with(&name, &opts).await.map(|_| ())
                })
                .with_labels(labels)
            })
            .collect();

        let pool = Pool::new(
            jobs,
            PoolOptions {
                num_workers: max_parallel.max(1),
                summarize: true,
                dry_run,
                metrics: Some(MetricsOptions {
                    sink: self.c.metrics.clone(),
                    prefix: "thelma_bees_delete".to_string(),
                    labels: Labels::new(),
                }),
            },
        );
        let (report, result) = pool.execute().await;
        let succeeded = if dry_run {
            Vec::new()
        } else {
            report.succeeded().into_iter().map(str::to_string).collect()
        };
        Ok(BulkOutcome {
            selected,
            succeeded,
            dry_run,
            report,
            error: result.err(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{AutoDelete, Environment};
    use crate::error::ErrorKind;
    use crate::testing::{fixture_document, Harness};
    use crate::types::Lifecycle;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn delete_removes_state_then_refreshes_generator_twice() {
        let h = Harness::new();
        let opts = DeleteOptions {
            unseed: true,
            export_logs: true,
            ..Default::default()
        };
        let bee = h.bees.delete_with("my-bee", &opts).await.unwrap().unwrap();
        assert_eq!(bee.state, BeeState::NonExistent);
        assert_eq!(bee.log_locations.len(), 3);
        assert!(h.environment("my-bee").is_none());

        let export = h.log.position("logs.export").unwrap();
        let unseed = h.log.position("unseed my-bee").unwrap();
        let delete = h.log.position("state.delete my-bee").unwrap();
        let refresh = h.log.position("argocd.hard_refresh").unwrap();
        assert!(export < unseed && unseed < delete && delete < refresh);
        assert_eq!(h.log.count("argocd.hard_refresh terra-bee-generator"), 2);
    }

    #[tokio::test]
    async fn best_effort_steps_do_not_block_delete() {
        let h = Harness::new();
        h.logs
            .failures
            .inject("logs.export", ThelmaError::remote("gcs", "denied"));
        h.seeder
            .failures
            .inject("unseed", ThelmaError::remote("sam", "timeout"));
        let opts = DeleteOptions {
            unseed: true,
            export_logs: true,
            ..Default::default()
        };
        assert!(h.bees.delete_with("my-bee", &opts).await.unwrap().is_some());
        assert!(h.log.contains("state.delete my-bee"));
    }

    #[tokio::test]
    async fn missing_bee() {
        let h = Harness::new();
        let err = h
            .bees
            .delete_with("ghost", &DeleteOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let ignored = DeleteOptions {
            ignore_missing: true,
            ..Default::default()
        };
        assert!(h.bees.delete_with("ghost", &ignored).await.unwrap().is_none());
        assert_eq!(h.log.count("argocd."), 0);
    }

    #[tokio::test]
    async fn non_dynamic_requires_force() {
        let h = Harness::new();
        let err = h
            .bees
            .delete_with("swatomation", &DeleteOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(h.environment("swatomation").is_some());

        let forced = DeleteOptions {
            force: true,
            ..Default::default()
        };
        assert!(h.bees.delete_with("swatomation", &forced).await.unwrap().is_some());
        assert!(h.environment("swatomation").is_none());
    }

    fn doc_with_expired_bees() -> crate::state::StateDocument {
        let mut doc = fixture_document();
        let now = Utc::now();
        for (name, after) in [("old-one", -2), ("old-two", -1), ("future", 5)] {
            let mut env = Environment::new(name, Lifecycle::Dynamic, "terra-qa-bees");
            env.template = "swatomation".into();
            env.auto_delete = Some(AutoDelete {
                enabled: true,
                after: now + Duration::hours(after),
            });
            doc.environments.push(env);
        }
        doc
    }

    #[tokio::test]
    async fn delete_all_auto_delete_only() {
        let h = Harness::with_document(doc_with_expired_bees());
        let filter = BeeFilter::new().auto_delete_due_at(Utc::now());
        let outcome = h
            .bees
            .delete_all(&filter, &DeleteOptions::default(), 4, false)
            .await
            .unwrap();
        assert_eq!(outcome.selected, vec!["old-one", "old-two"]);
        assert_eq!(outcome.into_result().unwrap(), vec!["old-one", "old-two"]);
        assert!(h.environment("future").is_some());
        assert!(h.environment("my-bee").is_some());
    }

    #[tokio::test]
    async fn delete_all_dry_run_touches_nothing() {
        let h = Harness::with_document(doc_with_expired_bees());
        let outcome = h
            .bees
            .delete_all(&BeeFilter::new(), &DeleteOptions::default(), 2, true)
            .await
            .unwrap();
        assert_eq!(outcome.selected.len(), 4);
        assert!(outcome.succeeded.is_empty());
        assert_eq!(h.log.count("state.delete"), 0);
    }

    #[tokio::test]
    async fn delete_all_reports_partial_failure() {
        let h = Harness::with_document(doc_with_expired_bees());
        h.state
            .failures
            .inject("state.delete", ThelmaError::remote("sherlock", "503"));
        let filter = BeeFilter::new().auto_delete_due_at(Utc::now());
        let outcome = h
            .bees
            .delete_all(&filter, &DeleteOptions::default(), 1, false)
            .await
            .unwrap();
        assert_eq!(outcome.succeeded.len(), 1);
        assert_eq!(outcome.report.failed().len(), 1);
        assert_eq!(outcome.error.unwrap().kind(), ErrorKind::Multiple);
    }
}
