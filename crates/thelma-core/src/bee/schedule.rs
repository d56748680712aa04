use super::{ApplyScheduleOptions, Bee, BeeFilter, Bees, StartStopOptions};
use crate::argocd::SyncOptions;
use crate::environment::{Environment, ScheduleEnd};
use crate::error::{Result, ThelmaError};
use crate::lifecycle::BeeState;
use crate::metrics::Labels;
use crate::notify::{bee_start_stop_message, best_effort_dm, schedule_conflict_message};
use crate::pool::{Job, MetricsOptions, Pool, PoolOptions, PoolReport};
use crate::schedule::{check_daily_schedule_match, is_weekend_day};
use chrono::{DateTime, Local, TimeZone, Utc};
use tracing::{debug, info, warn};

/// A BEE whose offline flag the schedule wants changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleFlip {
    pub name: String,
    /// `true` to take the BEE offline, `false` to bring it back.
    pub stop: bool,
}

#[derive(Debug, Default)]
pub struct ScheduleOutcome {
    /// Every flip the schedule called for (in dry run, what would happen).
    pub flips: Vec<ScheduleFlip>,
    /// Flips that were applied successfully.
    pub flipped: Vec<String>,
    /// BEEs scheduled to both start and stop in the window; left untouched.
    pub conflicts: Vec<String>,
    pub dry_run: bool,
    /// Flipped BEEs as stored after the run.
    pub bees: Vec<Bee>,
    pub report: PoolReport,
    pub error: Option<ThelmaError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Leave,
    Flip { stop: bool },
    Conflict,
}

impl Bees {
    /// Take a BEE offline (`stop`) or bring it back online.
    pub async fn start_stop_with(&self, name: &str, stop: bool, opts: StartStopOptions) -> Result<Bee> {
        let mut bee = self.get(name).await?;
        self.c.state.set_offline(name, stop).await?;
        bee.environment = self.state().await?.environments().get(name)?.clone();

        let target = BeeState::existing(stop);
        if bee.state != target {
            bee.transition(target)?;
        }
        info!(bee = %name, offline = stop, "set offline");

        if opts.sync {
            let outcome = self
                .sync_argo_apps_in(&bee.environment, &self.start_stop_sync_options(stop))
                .await;
            bee.sync_statuses = outcome.statuses;
            if let Some(e) = outcome.error {
                return Err(e);
            }
        }

        if opts.notify {
            best_effort_dm(
                self.c.notifier.as_ref(),
                &bee.environment.owner,
                &bee_start_stop_message(name, stop),
            )
            .await;
        }
        Ok(bee)
    }

    fn start_stop_sync_options(&self, stop: bool) -> SyncOptions {
        SyncOptions {
            skip_legacy_configs_restart: true,
            wait_healthy: !stop,
            wait_healthy_timeout_seconds: self.config.start_stop_wait_healthy_timeout_seconds,
            ..Default::default()
        }
    }

    /// Start and stop BEEs according to their daily offline schedules, read
    /// as wall-clock times in the host's local zone.
    ///
    /// The window is `[now - from_past, now]`. BEEs created within
    /// `creation_buffer` of `now` are skipped.
    pub async fn apply_schedule(&self, filter: &BeeFilter, opts: &ApplyScheduleOptions) -> Result<ScheduleOutcome> {
        self.apply_schedule_in(filter, opts, &Local).await
    }

    /// [`Bees::apply_schedule`] with schedule times read in `tz`.
    pub async fn apply_schedule_in<Tz>(
        &self,
        filter: &BeeFilter,
        opts: &ApplyScheduleOptions,
        tz: &Tz,
    ) -> Result<ScheduleOutcome>
    where
        Tz: TimeZone + Sync,
    {
        let now = opts.now.unwrap_or_else(Utc::now);
        let since = now - opts.from_past;
        let created_before = now - opts.creation_buffer;

        let mut outcome = ScheduleOutcome {
            dry_run: opts.dry_run,
            ..Default::default()
        };

        for bee in self.filter_bees(filter).await? {
            let env = &bee.environment;
            if env.created_at > created_before {
                debug!(bee = %env.name, created_at = %env.created_at, "created too recently, skipping");
                continue;
            }
            let decision = decide(env, opts, &since.with_timezone(tz), &now.with_timezone(tz));
            match decision {
                Decision::Leave => {}
                Decision::Flip { stop } => {
                    info!(bee = %env.name, stop, "schedule flip");
                    outcome.flips.push(ScheduleFlip {
                        name: env.name.clone(),
                        stop,
                    });
                }
                Decision::Conflict => {
                    warn!(bee = %env.name, "bee is scheduled to both start and stop, leaving it as is");
                    outcome.conflicts.push(env.name.clone());
                    if !opts.dry_run {
                        self.notify_schedule_conflict(env).await;
                    }
                }
            }
        }

        let jobs = outcome
            .flips
            .iter()
            .map(|flip| {
                let bees = self.clone();
                let flip = flip.clone();
                let dry_run = opts.dry_run;
                let mut labels = Labels::new();
                labels.insert("action".to_string(), if flip.stop { "stop" } else { "start" }.to_string());
                Job::new(flip.name.clone(), async move {
                    if dry_run {
                        info!(bee = %flip.name, stop = flip.stop, "dry run, would flip");
                        return Ok(());
                    }
                    let opts = StartStopOptions {
                        notify: false,
                        sync: true,
                    };
                    bees.start_stop_with(&flip.name, flip.stop, opts).await.map(|_| ())
                })
                .with_labels(labels)
            })
            .collect();

        let (report, result) = Pool::new(
            jobs,
            PoolOptions {
                num_workers: opts.max_parallel.max(1),
                summarize: true,
                dry_run: opts.dry_run,
                metrics: Some(MetricsOptions {
                    sink: self.c.metrics.clone(),
                    prefix: "thelma_bees_apply_schedule".to_string(),
                    labels: Labels::new(),
                }),
            },
        )
        .execute()
        .await;

        if !opts.dry_run {
            outcome.flipped = report.succeeded().into_iter().map(str::to_string).collect();
            let state = self.state().await?;
            outcome.bees = outcome
                .flipped
                .iter()
                .filter_map(|name| state.environments().get(name).ok())
                .cloned()
                .map(Bee::existing)
                .collect();
        }
        outcome.report = report;
        outcome.error = result.err();
        Ok(outcome)
    }

    async fn notify_schedule_conflict(&self, env: &Environment) {
        let text = schedule_conflict_message(&env.name);
        let dm = if env.owner.is_empty() {
            Err(ThelmaError::validation(format!("{} has no owner", env.name)))
        } else {
            self.c.notifier.send_direct_message(&env.owner, &text).await
        };
        if let Err(e) = dm {
            debug!(bee = %env.name, error = %e, "could not message owner, alerting devops");
            let title = format!("Schedule conflict for BEE {}", env.name);
            if let Err(e) = self.c.notifier.send_devops_alert(&title, &text, false).await {
                debug!(bee = %env.name, error = %e, "failed to send devops alert");
            }
        }
    }
}

fn decide<Tz: TimeZone>(
    env: &Environment,
    opts: &ApplyScheduleOptions,
    since: &DateTime<Tz>,
    now: &DateTime<Tz>,
) -> Decision {
    let would_stop = opts.stop
        && env
            .offline_schedule_begin
            .as_ref()
            .is_some_and(|b| b.enabled && check_daily_schedule_match(&b.time, since, now));
    let would_start = opts.start
        && env.offline_schedule_end.as_ref().is_some_and(|e| {
            e.enabled && check_daily_schedule_match(&e.time, since, now) && weekend_allows(e, since, now)
        });

    match (would_stop, would_start) {
        (true, true) => Decision::Conflict,
        (true, false) if !env.offline => Decision::Flip { stop: true },
        (false, true) if env.offline => Decision::Flip { stop: false },
        _ => Decision::Leave,
    }
}

/// Weekends are judged in the offset the start time was stored with.
fn weekend_allows<Tz: TimeZone>(end: &ScheduleEnd, since: &DateTime<Tz>, now: &DateTime<Tz>) -> bool {
    let tz = *end.time.offset();
    end.weekends
        || !is_weekend_day(&since.with_timezone(&tz))
        || !is_weekend_day(&now.with_timezone(&tz))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::ScheduleBegin;
    use crate::testing::{fixture_document, Harness, UsEastern2024, OWNER};
    use chrono::{Duration, FixedOffset};

    fn est() -> FixedOffset {
        FixedOffset::west_opt(5 * 3600).unwrap()
    }

    /// Tuesday 2024-03-12 at `h:m` in UTC-5.
    fn tuesday(h: u32, m: u32) -> DateTime<Utc> {
        est()
            .with_ymd_and_hms(2024, 3, 12, h, m, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn daily(h: u32) -> DateTime<FixedOffset> {
        est().with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap()
    }

    fn harness(now: DateTime<Utc>, configure: impl FnOnce(&mut Environment)) -> Harness {
        let mut doc = fixture_document();
        let bee = doc
            .environments
            .iter_mut()
            .find(|e| e.name == "my-bee")
            .unwrap();
        bee.created_at = now - Duration::hours(2);
        configure(bee);
        Harness::with_document(doc)
    }

    fn stop_at(h: u32) -> impl FnOnce(&mut Environment) {
        move |env: &mut Environment| {
            env.offline_schedule_begin = Some(ScheduleBegin {
                enabled: true,
                time: daily(h),
            })
        }
    }

    fn opts(now: DateTime<Utc>) -> ApplyScheduleOptions {
        ApplyScheduleOptions {
            now: Some(now),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn stops_a_bee_whose_stop_time_passed() {
        let now = tuesday(17, 5);
        let h = harness(now, stop_at(17));
        let outcome = h.bees.apply_schedule_in(&BeeFilter::new(), &opts(now), &est()).await.unwrap();

        assert_eq!(
            outcome.flips,
            vec![ScheduleFlip {
                name: "my-bee".into(),
                stop: true
            }]
        );
        assert_eq!(outcome.flipped, vec!["my-bee"]);
        assert!(outcome.error.is_none());
        assert!(outcome.bees[0].environment.offline);
        assert_eq!(outcome.bees[0].state, BeeState::Stopped);

        let set = h.log.position("state.set_offline my-bee true").unwrap();
        let sync = h.log.position("argocd.sync_releases").unwrap();
        assert!(set < sync);
        let calls = h.argocd.sync_calls.lock().unwrap().clone();
        assert!(calls[0].2.skip_legacy_configs_restart);
    }

    #[tokio::test]
    async fn stop_time_keeps_its_wall_clock_hour_after_dst() {
        // Stop time saved in winter as 17:00 EST.
        let july_at = |h, m| {
            UsEastern2024
                .with_ymd_and_hms(2024, 7, 9, h, m, 0)
                .unwrap()
                .with_timezone(&Utc)
        };

        let now = july_at(17, 5);
        let h = harness(now, stop_at(17));
        let outcome = h
            .bees
            .apply_schedule_in(&BeeFilter::new(), &opts(now), &UsEastern2024)
            .await
            .unwrap();
        assert_eq!(outcome.flipped, vec!["my-bee"]);

        let now = july_at(18, 5);
        let h = harness(now, stop_at(17));
        let outcome = h
            .bees
            .apply_schedule_in(&BeeFilter::new(), &opts(now), &UsEastern2024)
            .await
            .unwrap();
        assert!(outcome.flips.is_empty());
    }

    #[tokio::test]
    async fn dry_run_reports_without_mutating() {
        let now = tuesday(17, 5);
        let h = harness(now, stop_at(17));
        let mut o = opts(now);
        o.dry_run = true;
        let outcome = h.bees.apply_schedule_in(&BeeFilter::new(), &o, &est()).await.unwrap();
        assert!(outcome.dry_run);
        assert_eq!(outcome.flips.len(), 1);
        assert!(outcome.flipped.is_empty());
        assert_eq!(h.log.count("state."), 0);
        assert_eq!(h.log.count("argocd."), 0);
        assert!(!h.environment("my-bee").unwrap().offline);
    }

    #[tokio::test]
    async fn outside_the_window_or_already_offline_is_left_alone() {
        let now = tuesday(17, 30);
        let h = harness(now, stop_at(17));
        let outcome = h.bees.apply_schedule_in(&BeeFilter::new(), &opts(now), &est()).await.unwrap();
        assert!(outcome.flips.is_empty());

        let now = tuesday(17, 5);
        let h = harness(now, |env| {
            stop_at(17)(env);
            env.offline = true;
        });
        let outcome = h.bees.apply_schedule_in(&BeeFilter::new(), &opts(now), &est()).await.unwrap();
        assert!(outcome.flips.is_empty());
    }

    #[tokio::test]
    async fn recently_created_bees_are_skipped() {
        let now = tuesday(17, 5);
        let h = harness(now, |env| {
            stop_at(17)(env);
            env.created_at = now - Duration::minutes(10);
        });
        let outcome = h.bees.apply_schedule_in(&BeeFilter::new(), &opts(now), &est()).await.unwrap();
        assert!(outcome.flips.is_empty());
    }

    fn start_at(h: u32, weekends: bool) -> impl FnOnce(&mut Environment) {
        move |env: &mut Environment| {
            env.offline = true;
            env.offline_schedule_end = Some(ScheduleEnd {
                enabled: true,
                time: daily(h),
                weekends,
            })
        }
    }

    #[tokio::test]
    async fn starts_on_weekdays() {
        let now = tuesday(8, 5);
        let h = harness(now, start_at(8, false));
        let outcome = h.bees.apply_schedule_in(&BeeFilter::new(), &opts(now), &est()).await.unwrap();
        assert_eq!(outcome.flipped, vec!["my-bee"]);
        assert!(h.log.contains("state.set_offline my-bee false"));
        assert!(!h.environment("my-bee").unwrap().offline);
    }

    #[tokio::test]
    async fn weekend_starts_need_opt_in() {
        let saturday = tuesday(8, 5) + Duration::days(4);
        let h = harness(saturday, start_at(8, false));
        let outcome = h.bees.apply_schedule_in(&BeeFilter::new(), &opts(saturday), &est()).await.unwrap();
        assert!(outcome.flips.is_empty());

        let h = harness(saturday, start_at(8, true));
        let outcome = h.bees.apply_schedule_in(&BeeFilter::new(), &opts(saturday), &est()).await.unwrap();
        assert_eq!(outcome.flips.len(), 1);
    }

    #[tokio::test]
    async fn conflicting_schedules_message_the_owner() {
        let now = tuesday(17, 5);
        let h = harness(now, |env| {
            stop_at(17)(env);
            env.offline_schedule_end = Some(ScheduleEnd {
                enabled: true,
                time: daily(17),
                weekends: true,
            });
        });
        let outcome = h.bees.apply_schedule_in(&BeeFilter::new(), &opts(now), &est()).await.unwrap();
        assert_eq!(outcome.conflicts, vec!["my-bee"]);
        assert!(outcome.flips.is_empty());
        assert!(h.log.contains(&format!("notify.dm {OWNER}")));
        assert_eq!(h.log.count("notify.alert"), 0);
    }

    #[tokio::test]
    async fn conflict_falls_back_to_devops_alert() {
        let now = tuesday(17, 5);
        let h = harness(now, |env| {
            stop_at(17)(env);
            env.offline_schedule_end = Some(ScheduleEnd {
                enabled: true,
                time: daily(17),
                weekends: true,
            });
        });
        h.notifier
            .failures
            .inject("notify.dm", ThelmaError::remote("slack", "users_not_found"));
        h.bees.apply_schedule_in(&BeeFilter::new(), &opts(now), &est()).await.unwrap();
        assert_eq!(h.log.count("notify.alert"), 1);
    }

    #[tokio::test]
    async fn start_stop_with_notifies_owner() {
        let h = Harness::new();
        let bee = h
            .bees
            .start_stop_with("my-bee", true, StartStopOptions::default())
            .await
            .unwrap();
        assert_eq!(bee.state, BeeState::Stopped);
        assert!(bee.environment.offline);
        let calls = h.argocd.sync_calls.lock().unwrap().clone();
        assert!(!calls[0].2.wait_healthy);
        assert!(h.notifier.messages.lock().unwrap()[0].1.contains("stopped"));

        let bee = h
            .bees
            .start_stop_with(
                "my-bee",
                false,
                StartStopOptions {
                    notify: false,
                    sync: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(bee.state, BeeState::Ready);
        assert_eq!(h.log.count("argocd.sync_releases"), 1);
    }
}
