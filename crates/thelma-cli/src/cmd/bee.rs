use anyhow::Context;
use chrono::{DateTime, FixedOffset, Utc};
use clap::{Args, Subcommand};
use thelma_core::bee::{BeeFilter, CreateOptions, DeleteOptions, ResetOptions, StartStopOptions};
use thelma_core::environment::{AutoDelete, ScheduleBegin, ScheduleEnd};
use tracing::info;

use super::{parse_rfc3339, report_outcome, PinArgs, ProvisionArgs, SeedArgs, SyncArgs};
use crate::app::App;
use crate::duration::parse_duration;
use crate::output::{bee_row, print_bee, print_json, print_pins, print_table, BeeView, BEE_HEADERS};

#[derive(Subcommand)]
pub enum BeeSubcommand {
    /// Create a BEE from a template and provision it
    Create(CreateArgs),
    /// Pin, sync and seed an existing BEE
    Provision {
        name: String,
        #[command(flatten)]
        args: ProvisionArgs,
    },
    /// Provision again without re-pinning from scratch
    ReProvision {
        name: String,
        #[command(flatten)]
        args: ProvisionArgs,
    },
    /// Sync the BEE's generator and apps
    Sync {
        name: String,
        #[command(flatten)]
        args: SyncArgs,
    },
    /// Delete a BEE
    Delete {
        name: String,
        /// Unregister seeded users first
        #[arg(long)]
        unseed: bool,
        /// Export container logs before deleting
        #[arg(long)]
        export_logs: bool,
        /// Succeed when the BEE does not exist
        #[arg(long)]
        ignore_missing: bool,
        /// Permit deleting an environment that is not a BEE
        #[arg(long)]
        force: bool,
    },
    /// Pin release versions on a BEE
    Pin {
        name: String,
        #[command(flatten)]
        pin: PinArgs,
        /// Only update state; do not sync
        #[arg(long)]
        no_sync: bool,
    },
    /// Remove every version override from a BEE
    Unpin {
        name: String,
        /// Only update state; do not sync
        #[arg(long)]
        no_sync: bool,
    },
    /// Bring a stopped BEE back online
    Start(StartStopArgs),
    /// Take a BEE offline
    Stop(StartStopArgs),
    /// List BEEs
    List {
        #[arg(long)]
        template: Option<String>,
        #[arg(long)]
        owner: Option<String>,
        /// Only offline BEEs
        #[arg(long, conflicts_with = "online")]
        offline: bool,
        /// Only online BEEs
        #[arg(long)]
        online: bool,
    },
    /// Show a BEE, its schedule and its releases
    Describe { name: String },
    /// Wipe a BEE's persistent volumes and bring it back up
    Reset {
        name: String,
        /// Message the owner on Slack when done
        #[arg(long)]
        notify: bool,
        /// Unregister seeded users before resetting
        #[arg(long)]
        unseed: bool,
        /// Skip seeding after the reset
        #[arg(long)]
        no_seed: bool,
        #[arg(long, value_name = "SECONDS")]
        wait_healthy_timeout_seconds: Option<u64>,
        #[command(flatten)]
        seeder: SeedArgs,
    },
    /// Run the seeding steps against a BEE
    Seed {
        name: String,
        #[command(flatten)]
        seeder: SeedArgs,
    },
    /// Undo seeding: unregister users from Sam
    Unseed {
        name: String,
        #[command(flatten)]
        seeder: SeedArgs,
    },
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// BEE name [default: generated from the template]
    #[arg(long)]
    pub name: Option<String>,
    /// Template environment [default: from config]
    #[arg(long)]
    pub template: Option<String>,
    /// Owner email [default: $THELMA_OWNER]
    #[arg(long, env = "THELMA_OWNER")]
    pub owner: Option<String>,
    /// Delete automatically after this long (e.g. 6h, 2d)
    #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
    pub delete_after: Option<chrono::Duration>,
    /// Take the BEE offline daily at this time (RFC3339; only the time of day is used)
    #[arg(long, value_name = "TIME", value_parser = parse_rfc3339)]
    pub daily_stop_time: Option<DateTime<FixedOffset>>,
    /// Bring the BEE back online daily at this time (RFC3339)
    #[arg(long, value_name = "TIME", value_parser = parse_rfc3339)]
    pub daily_start_time: Option<DateTime<FixedOffset>>,
    /// Also start the BEE on weekends
    #[arg(long, requires = "daily_start_time")]
    pub daily_start_weekends: bool,
    #[command(flatten)]
    pub provision: ProvisionArgs,
}

#[derive(Args, Debug)]
pub struct StartStopArgs {
    pub name: String,
    /// Do not message the owner
    #[arg(long)]
    pub no_notify: bool,
    /// Only flip the offline flag; do not sync
    #[arg(long)]
    pub no_sync: bool,
}

impl StartStopArgs {
    fn options(&self) -> StartStopOptions {
        StartStopOptions {
            notify: !self.no_notify,
            sync: !self.no_sync,
        }
    }
}

pub async fn run(app: &App, subcmd: BeeSubcommand, json: bool) -> anyhow::Result<()> {
    let default_timeout = app.bees.config().wait_healthy_timeout_seconds;
    match subcmd {
        BeeSubcommand::Create(args) => create(app, args, json).await,
        BeeSubcommand::Provision { name, args } => {
            let opts = args.options(default_timeout)?;
            let outcome = app.bees.provision_with(&name, &opts).await?;
            report_outcome(app, outcome, "provisioned", json)
        }
        BeeSubcommand::ReProvision { name, args } => {
            let opts = args.options(default_timeout)?;
            let outcome = app.bees.re_provision_with(&name, &opts).await?;
            report_outcome(app, outcome, "provisioned", json)
        }
        BeeSubcommand::Sync { name, args } => {
            let outcome = app.bees.sync_with(&name, &args.options(default_timeout)).await?;
            report_outcome(app, outcome, "synced", json)
        }
        BeeSubcommand::Delete {
            name,
            unseed,
            export_logs,
            ignore_missing,
            force,
        } => {
            let opts = DeleteOptions {
                unseed,
                export_logs,
                ignore_missing,
                force,
            };
            delete(app, &name, &opts, json).await
        }
        BeeSubcommand::Pin { name, pin, no_sync } => {
            let opts = pin.options()?;
            let bee = app
                .bees
                .pin_versions(&name, &opts)
                .await
                .with_context(|| format!("failed to pin versions on '{name}'"))?;
            if json {
                print_json(&bee.environment.pins)?;
            } else {
                print_pins(&bee.environment.pins);
            }
            sync_after_pin(app, &name, no_sync, json).await
        }
        BeeSubcommand::Unpin { name, no_sync } => {
            let bee = app
                .bees
                .unpin_versions(&name)
                .await
                .with_context(|| format!("failed to unpin '{name}'"))?;
            if !json {
                println!("Removed version overrides from '{}'.", bee.name());
            }
            sync_after_pin(app, &name, no_sync, json).await
        }
        BeeSubcommand::Start(args) => start_stop(app, &args, false, json).await,
        BeeSubcommand::Stop(args) => start_stop(app, &args, true, json).await,
        BeeSubcommand::List {
            template,
            owner,
            offline,
            online,
        } => {
            let mut filter = BeeFilter::new();
            if let Some(t) = template {
                filter = filter.template(t);
            }
            if let Some(o) = owner {
                filter = filter.owner(o);
            }
            if offline || online {
                filter = filter.offline(offline);
            }
            list(app, &filter, json).await
        }
        BeeSubcommand::Describe { name } => {
            let bee = app.bees.get(&name).await?;
            let url = app.bees.url(&name);
            if json {
                print_json(&BeeView::new(&bee, url))
            } else {
                print_bee(&bee, &url);
                Ok(())
            }
        }
        BeeSubcommand::Reset {
            name,
            notify,
            unseed,
            no_seed,
            wait_healthy_timeout_seconds,
            seeder,
        } => {
            let mut opts = ResetOptions {
                force: seeder.force,
                notify,
                unseed,
                seed: !no_seed,
                seed_options: seeder.options(),
                ..Default::default()
            };
            if let Some(t) = wait_healthy_timeout_seconds {
                opts.wait_healthy_timeout_seconds = t;
            }
            let outcome = app.bees.reset_with(&name, &opts).await?;
            report_outcome(app, outcome, "reset", json)
        }
        BeeSubcommand::Seed { name, seeder } => {
            app.bees
                .seed_with(&name, &seeder.options())
                .await
                .with_context(|| format!("failed to seed '{name}'"))?;
            done(json, &name, "seeded")
        }
        BeeSubcommand::Unseed { name, seeder } => {
            app.bees
                .unseed_with(&name, &seeder.options())
                .await
                .with_context(|| format!("failed to unseed '{name}'"))?;
            done(json, &name, "unseeded")
        }
    }
}

async fn create(app: &App, args: CreateArgs, json: bool) -> anyhow::Result<()> {
    let now = Utc::now();
    let opts = CreateOptions {
        name: args.name.unwrap_or_default(),
        template: args.template.unwrap_or_default(),
        owner: args.owner.unwrap_or_default(),
        auto_delete: args.delete_after.map(|d| AutoDelete {
            enabled: true,
            after: now + d,
        }),
        offline_schedule_begin: args.daily_stop_time.map(|time| ScheduleBegin {
            enabled: true,
            time,
        }),
        offline_schedule_end: args.daily_start_time.map(|time| ScheduleEnd {
            enabled: true,
            time,
            weekends: args.daily_start_weekends,
        }),
        provision: args
            .provision
            .options(app.bees.config().wait_healthy_timeout_seconds)?,
    };
    let outcome = app.bees.create_with(&opts).await?;
    report_outcome(app, outcome, "created", json)
}

async fn delete(app: &App, name: &str, opts: &DeleteOptions, json: bool) -> anyhow::Result<()> {
    let deleted = app
        .bees
        .delete_with(name, opts)
        .await
        .with_context(|| format!("failed to delete '{name}'"))?;
    if json {
        return print_json(&serde_json::json!({ "name": name, "deleted": deleted.is_some() }));
    }
    match deleted {
        Some(_) => println!("Deleted BEE '{name}'."),
        None => println!("BEE '{name}' does not exist."),
    }
    Ok(())
}

async fn sync_after_pin(app: &App, name: &str, no_sync: bool, json: bool) -> anyhow::Result<()> {
    if no_sync {
        info!(bee = %name, "skipping sync");
        return Ok(());
    }
    let opts = thelma_core::bee::ProvisionExistingOptions {
        wait_healthy_timeout_seconds: app.bees.config().wait_healthy_timeout_seconds,
        ..Default::default()
    };
    let outcome = app.bees.sync_with(name, &opts).await?;
    match outcome.error {
        None => done(json, name, "synced"),
        Some(e) => Err(anyhow::Error::new(e).context(format!("failed to sync '{name}'"))),
    }
}

async fn start_stop(app: &App, args: &StartStopArgs, stop: bool, json: bool) -> anyhow::Result<()> {
    let name = &args.name;
    let verb = if stop { "stopped" } else { "started" };
    let bee = app
        .bees
        .start_stop_with(name, stop, args.options())
        .await
        .with_context(|| format!("BEE '{name}' was not {verb}"))?;
    if json {
        print_json(&BeeView::new(&bee, app.bees.url(name)))
    } else {
        println!("BEE '{name}' {verb}.");
        Ok(())
    }
}

async fn list(app: &App, filter: &BeeFilter, json: bool) -> anyhow::Result<()> {
    let bees = app.bees.filter_bees(filter).await.context("failed to list BEEs")?;
    if json {
        let views: Vec<BeeView<'_>> = bees
            .iter()
            .map(|b| BeeView::new(b, app.bees.url(b.name())))
            .collect();
        return print_json(&views);
    }
    if bees.is_empty() {
        println!("No BEEs.");
        return Ok(());
    }
    let rows = bees.iter().map(|b| bee_row(&b.environment)).collect();
    print_table(BEE_HEADERS, rows);
    Ok(())
}

fn done(json: bool, name: &str, verb: &str) -> anyhow::Result<()> {
    if json {
        print_json(&serde_json::json!({ "name": name, "status": verb }))
    } else {
        println!("BEE '{name}' {verb}.");
        Ok(())
    }
}
