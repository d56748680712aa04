use anyhow::Context;
use chrono::{DateTime, Duration, FixedOffset, Utc};
use clap::Subcommand;
use serde_json::json;
use thelma_core::bee::{ApplyScheduleOptions, BeeFilter, BulkOutcome, DeleteOptions, ScheduleOutcome};
use thelma_core::pool::PoolReport;

use super::parse_rfc3339;
use crate::app::App;
use crate::duration::parse_duration;
use crate::output::print_json;

#[derive(Subcommand)]
pub enum BeesSubcommand {
    /// Start and stop BEEs according to their daily schedules
    ApplySchedule {
        /// Report what would change without changing anything
        #[arg(long)]
        dry_run: bool,
        /// How far back to look for scheduled times
        #[arg(long, default_value = "20m", value_parser = parse_duration)]
        from_past: Duration,
        /// Leave BEEs younger than this alone
        #[arg(long, default_value = "20m", value_parser = parse_duration)]
        creation_buffer: Duration,
        /// BEEs to start or stop at once [default: from config]
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Do not bring any BEE online
        #[arg(long)]
        no_start: bool,
        /// Do not take any BEE offline
        #[arg(long)]
        no_stop: bool,
        /// Only BEEs created from this template
        #[arg(long)]
        template: Option<String>,
        /// Evaluate the schedule as of this time (RFC3339) instead of now
        #[arg(long, value_parser = parse_rfc3339, hide = true)]
        now: Option<DateTime<FixedOffset>>,
    },
    /// Delete many BEEs at once
    Delete {
        /// Only BEEs whose auto-delete time has passed
        #[arg(long)]
        auto_delete_only: bool,
        /// Only BEEs created from this template
        #[arg(long)]
        template: Option<String>,
        /// Only BEEs owned by this user
        #[arg(long)]
        owner: Option<String>,
        /// Report what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
        /// BEEs to delete at once [default: from config]
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Unregister seeded users first
        #[arg(long)]
        unseed: bool,
        /// Export container logs before deleting
        #[arg(long)]
        export_logs: bool,
    },
}

pub async fn run(app: &App, subcmd: BeesSubcommand, json: bool) -> anyhow::Result<()> {
    let default_parallel = app.bees.config().max_parallel;
    match subcmd {
        BeesSubcommand::ApplySchedule {
            dry_run,
            from_past,
            creation_buffer,
            max_parallel,
            no_start,
            no_stop,
            template,
            now,
        } => {
            let opts = ApplyScheduleOptions {
                dry_run,
                start: !no_start,
                stop: !no_stop,
                from_past,
                creation_buffer,
                max_parallel: max_parallel.unwrap_or(default_parallel),
                now: now.map(|t| t.with_timezone(&Utc)),
            };
            let filter = template.map_or_else(BeeFilter::new, |t| BeeFilter::new().template(t));
            let outcome = app
                .bees
                .apply_schedule(&filter, &opts)
                .await
                .context("failed to apply schedules")?;
            report_schedule(outcome, json)
        }
        BeesSubcommand::Delete {
            auto_delete_only,
            template,
            owner,
            dry_run,
            max_parallel,
            unseed,
            export_logs,
        } => {
            let mut filter = BeeFilter::new();
            if auto_delete_only {
                filter = filter.auto_delete_due_at(Utc::now());
            }
            if let Some(t) = template {
                filter = filter.template(t);
            }
            if let Some(o) = owner {
                filter = filter.owner(o);
            }
            let opts = DeleteOptions {
                unseed,
                export_logs,
                ignore_missing: true,
                force: false,
            };
            let outcome = app
                .bees
                .delete_all(&filter, &opts, max_parallel.unwrap_or(default_parallel), dry_run)
                .await
                .context("failed to select BEEs")?;
            report_bulk(outcome, json)
        }
    }
}

fn report_schedule(outcome: ScheduleOutcome, json: bool) -> anyhow::Result<()> {
    if json {
        let flips: Vec<_> = outcome
            .flips
            .iter()
            .map(|f| json!({ "name": f.name, "action": if f.stop { "stop" } else { "start" } }))
            .collect();
        print_json(&json!({
            "dryRun": outcome.dry_run,
            "flips": flips,
            "flipped": outcome.flipped,
            "conflicts": outcome.conflicts,
        }))?;
    } else {
        if outcome.flips.is_empty() {
            println!("No BEEs to start or stop.");
        }
        for f in &outcome.flips {
            let action = if f.stop { "stop" } else { "start" };
            if outcome.dry_run {
                println!("would {action} {}", f.name);
            } else {
                println!("{action} {}", f.name);
            }
        }
        for name in &outcome.conflicts {
            println!("conflict {name}: scheduled to both start and stop, left as is");
        }
        print_report(&outcome.report, outcome.dry_run);
    }
    fail_with(outcome.error, "some BEEs could not be started or stopped")
}

fn report_bulk(outcome: BulkOutcome, json: bool) -> anyhow::Result<()> {
    if json {
        print_json(&json!({
            "dryRun": outcome.dry_run,
            "selected": outcome.selected,
            "deleted": outcome.succeeded,
            "failed": outcome.report.failed(),
        }))?;
    } else if outcome.selected.is_empty() {
        println!("No BEEs matched.");
    } else if outcome.dry_run {
        for name in &outcome.selected {
            println!("would delete {name}");
        }
    } else {
        print_report(&outcome.report, false);
        println!("Deleted {} of {} BEEs.", outcome.succeeded.len(), outcome.selected.len());
    }
    fail_with(outcome.error, "some BEEs could not be deleted")
}

fn print_report(report: &PoolReport, dry_run: bool) {
    if !dry_run && !report.jobs.is_empty() {
        println!();
        print!("{}", report.table());
    }
}

fn fail_with(error: Option<thelma_core::ThelmaError>, msg: &'static str) -> anyhow::Result<()> {
    match error {
        None => Ok(()),
        Some(e) => Err(anyhow::Error::new(e).context(msg)),
    }
}
