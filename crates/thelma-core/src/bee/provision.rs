use super::{
    cluster_for, generate_name, template_from, Bee, BeeOutcome, Bees, CreateOptions,
    ProvisionExistingOptions, ProvisionOptions, ResetOptions,
};
use crate::argocd::SyncOptions;
use crate::error::{Result, ThelmaError};
use crate::lifecycle::BeeState;
use crate::logs::ExportOptions;
use crate::notify::{bee_failed_message, bee_ready_message, best_effort_dm};
use crate::paths::validate_environment_name;
use crate::pin::{self, PinOptions};
use crate::release::Cluster;
use crate::seed::{seed_with_retry, SeedOptions};
use crate::state::CreateEnvironment;
use tracing::{info, warn};

impl Bees {
    /// Create a BEE from a template, then provision it.
    pub async fn create_with(&self, opts: &CreateOptions) -> Result<BeeOutcome> {
        let template = if opts.template.is_empty() {
            self.config.default_template.clone()
        } else {
            opts.template.clone()
        };
        let name = if opts.name.is_empty() {
            generate_name(&template)
        } else {
            opts.name.clone()
        };
        validate_environment_name(&name)?;

        template_from(&self.state().await?, &template)?;
        let req = CreateEnvironment {
            name: name.clone(),
            template,
            owner: opts.owner.clone(),
            auto_delete: opts.auto_delete.clone(),
            offline_schedule_begin: opts.offline_schedule_begin.clone(),
            offline_schedule_end: opts.offline_schedule_end.clone(),
        };
        self.c.state.create_from_template(&req).await?;
        info!(bee = %name, template = %req.template, owner = %req.owner, "created bee");

        let state = self.state().await?;
        let env = state.environments().get(&name)?.clone();
        let cluster = cluster_for(&state, &env)?.clone();
        let mut bee = Bee::new(env, BeeState::NonExistent);
        bee.transition(BeeState::Created)?;
        Ok(self.provision_bee(bee, &cluster, &opts.provision, true).await)
    }

    /// Pin, sync, and (optionally) seed an existing BEE.
    pub async fn provision_with(&self, name: &str, opts: &ProvisionOptions) -> Result<BeeOutcome> {
        let (bee, cluster) = self.load(name).await?;
        Ok(self.provision_bee(bee, &cluster, opts, true).await)
    }

    /// Provision without touching pins.
    pub async fn re_provision_with(&self, name: &str, opts: &ProvisionOptions) -> Result<BeeOutcome> {
        let (bee, cluster) = self.load(name).await?;
        Ok(self.provision_bee(bee, &cluster, opts, false).await)
    }

    /// Converge generator and apps; never pins, seeds, or exports logs.
    pub async fn sync_with(&self, name: &str, opts: &ProvisionExistingOptions) -> Result<BeeOutcome> {
        let (bee, cluster) = self.load(name).await?;
        let opts = ProvisionOptions {
            existing: opts.clone(),
            ..Default::default()
        };
        Ok(self.provision_bee(bee, &cluster, &opts, false).await)
    }

    /// Wipe a BEE's persistent volumes and bring it back up.
    pub async fn reset_with(&self, name: &str, opts: &ResetOptions) -> Result<BeeOutcome> {
        let (bee, cluster) = self.load(name).await?;
        let env = &bee.environment;
        env.ensure_destroyable(opts.force)?;

        if opts.unseed {
            let unseed_opts = SeedOptions {
                force: opts.force || opts.seed_options.force,
                ..opts.seed_options.clone()
            };
            if let Err(e) = self.c.seeder.unseed(env, &cluster, &unseed_opts).await {
                warn!(bee = %name, error = %e, "unseed before reset failed");
            }
        }

        for sts in self.c.kube.list_stateful_sets(env).await? {
            for pvc in &sts.pvcs {
                self.c.kube.delete_pvc(env, pvc).await?;
            }
            self.c.kube.restart_stateful_set(env, &sts.name).await?;
            info!(bee = %name, stateful_set = %sts.name, pvcs = sts.pvcs.len(), "reset stateful set");
        }

        let provision = ProvisionOptions {
            seed: opts.seed,
            seed_options: opts.seed_options.clone(),
            existing: ProvisionExistingOptions {
                wait_healthy: true,
                wait_healthy_timeout_seconds: opts.wait_healthy_timeout_seconds,
                notify: opts.notify,
                sync_generator_only: false,
            },
            ..Default::default()
        };
        Ok(self.provision_bee(bee, &cluster, &provision, false).await)
    }

    /// Run the seeder once, without retries.
    pub async fn seed_with(&self, name: &str, opts: &SeedOptions) -> Result<()> {
        let (bee, cluster) = self.load(name).await?;
        self.c.seeder.seed(&bee.environment, &cluster, opts).await?;
        info!(bee = %name, "seeded");
        Ok(())
    }

    pub async fn unseed_with(&self, name: &str, opts: &SeedOptions) -> Result<()> {
        let (bee, cluster) = self.load(name).await?;
        bee.environment.ensure_destroyable(opts.force)?;
        self.c.seeder.unseed(&bee.environment, &cluster, opts).await?;
        info!(bee = %name, "unseeded");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn load(&self, name: &str) -> Result<(Bee, Cluster)> {
        let state = self.state().await?;
        let env = state.environments().get(name)?.clone();
        let cluster = cluster_for(&state, &env)?.clone();
        Ok((Bee::existing(env), cluster))
    }

    async fn provision_bee(&self, mut bee: Bee, cluster: &Cluster, opts: &ProvisionOptions, pin: bool) -> BeeOutcome {
        let notify = opts.existing.notify;

        if pin {
            if let Err(e) = self.pin_phase(&mut bee, &opts.pin_options).await {
                warn!(bee = %bee.name(), error = %e, "pinning versions failed");
                if notify {
                    self.notify_failed(&bee, &e).await;
                }
                return BeeOutcome::failed(bee, e);
            }
        }

        match self.provision_apps(&mut bee, cluster, opts).await {
            Ok(()) => {
                info!(bee = %bee.name(), state = %bee.state, "provisioned");
                if notify && !opts.existing.sync_generator_only {
                    let url = self.url(bee.name());
                    best_effort_dm(
                        self.c.notifier.as_ref(),
                        &bee.environment.owner,
                        &bee_ready_message(bee.name(), &url),
                    )
                    .await;
                }
                BeeOutcome::ok(bee)
            }
            Err(e) => {
                warn!(bee = %bee.name(), state = %bee.state, error = %e, "provisioning failed");
                if opts.export_logs_on_failure {
                    self.export_logs(&mut bee, true).await;
                }
                if notify {
                    self.notify_failed(&bee, &e).await;
                }
                BeeOutcome::failed(bee, e)
            }
        }
    }

    async fn pin_phase(&self, bee: &mut Bee, opts: &PinOptions) -> Result<()> {
        let effective = pin::apply(self.c.state.as_ref(), &bee.environment, opts).await?;
        tracing::debug!(bee = %bee.name(), pins = effective.len(), "applied pins");
        let state = self.state().await?;
        bee.environment = state.environments().get(bee.name())?.clone();
        Ok(())
    }

    async fn provision_apps(&self, bee: &mut Bee, cluster: &Cluster, opts: &ProvisionOptions) -> Result<()> {
        let settled = BeeState::existing(bee.environment.offline);

        bee.transition(BeeState::GeneratorSyncing)?;
        self.c.kube.create_namespace(&bee.environment).await?;
        self.refresh_bee_generator().await?;
        self.sync_environment_generator(&bee.environment).await?;
        if opts.existing.sync_generator_only {
            info!(bee = %bee.name(), "generator synced, skipping apps");
            return bee.transition(settled);
        }

        bee.transition(BeeState::AppsSyncing)?;
        let sync_opts = SyncOptions {
            hard_refresh: false,
            wait_healthy: opts.existing.wait_healthy,
            wait_healthy_timeout_seconds: opts.existing.wait_healthy_timeout_seconds,
            skip_legacy_configs_restart: true,
            sync_if_no_diff: true,
        };
        let releases = &bee.environment.releases;
        let outcome = self
            .c
            .argocd
            .sync_releases(releases, releases.len().max(1), &sync_opts)
            .await;
        bee.sync_statuses = outcome.statuses;
        if let Some(e) = outcome.error {
            return Err(e);
        }

        if opts.seed {
            bee.transition(BeeState::Seeding)?;
            seed_with_retry(
                self.c.seeder.as_ref(),
                &bee.environment,
                cluster,
                &opts.seed_options,
                self.config.seed_retry,
            )
            .await?;
        }

        bee.transition(settled)
    }

    /// Export logs of every release; failures are logged, never returned.
    pub(super) async fn export_logs(&self, bee: &mut Bee, upload: bool) {
        match self
            .c
            .logs
            .export(&bee.environment.releases, &ExportOptions { upload })
            .await
        {
            Ok(locations) => {
                for (release, location) in &locations {
                    info!(bee = %bee.name(), release = %release, %location, "container logs");
                }
                bee.log_locations.extend(locations);
            }
            Err(e) => warn!(bee = %bee.name(), error = %e, "failed to export container logs"),
        }
    }

    async fn notify_failed(&self, bee: &Bee, err: &ThelmaError) {
        best_effort_dm(
            self.c.notifier.as_ref(),
            &bee.environment.owner,
            &bee_failed_message(bee.name(), err),
        )
        .await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
