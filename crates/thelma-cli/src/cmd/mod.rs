pub mod bee;
pub mod bees;

use anyhow::Context;
use chrono::{DateTime, FixedOffset};
use clap::{ArgAction, Args};
use std::io::Read;
use std::path::PathBuf;
use thelma_core::bee::{BeeOutcome, ProvisionExistingOptions, ProvisionOptions};
use thelma_core::pin::{parse_versions, PinFlags, PinOptions, VersionsFormat};
use thelma_core::seed::SeedOptions;

use crate::app::App;
use crate::output::{print_bee, print_json, BeeView};

// ---------------------------------------------------------------------------
// Shared flag groups
// ---------------------------------------------------------------------------

#[derive(Args, Debug, Clone, Default)]
pub struct SeedArgs {
    /// Create the Elasticsearch ontology index
    #[arg(long)]
    pub step_1_create_elasticsearch: bool,
    /// Register service-account profiles with Orch
    #[arg(long)]
    pub step_2_register_sa_profiles: bool,
    /// Grant service accounts permissions in Sam
    #[arg(long)]
    pub step_3_add_sa_sam_permissions: bool,
    /// Register the test users for the cluster's project
    #[arg(long)]
    pub step_4_register_test_users: bool,
    /// Create the Agora methods repository
    #[arg(long)]
    pub step_5_create_agora_methods_repository: bool,
    /// Extra user to register (repeatable; `set-adc` and `use-adc` are special)
    #[arg(long, value_name = "USER")]
    pub step_6_extra_user: Vec<String>,
    /// Run only the steps enabled explicitly
    #[arg(long)]
    pub no_steps: bool,
    /// Log step failures as warnings instead of failing
    #[arg(long)]
    pub force: bool,
    /// Register your own application-default credentials (same as --step-6-extra-user use-adc)
    #[arg(long)]
    pub register_self: bool,
}

impl SeedArgs {
    pub fn options(&self) -> SeedOptions {
        SeedOptions {
            step1_create_elasticsearch: self.step_1_create_elasticsearch,
            step2_register_sa_profiles: self.step_2_register_sa_profiles,
            step3_add_sa_sam_permissions: self.step_3_add_sa_sam_permissions,
            step4_register_test_users: self.step_4_register_test_users,
            step5_create_agora_methods_repository: self.step_5_create_agora_methods_repository,
            step6_extra_user: self.step_6_extra_user.clone(),
            no_steps: self.no_steps,
            force: self.force,
            register_self_shortcut: self.register_self,
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct PinArgs {
    /// File of per-release version overrides (`-` reads stdin)
    #[arg(long, value_name = "PATH")]
    pub versions_file: Option<PathBuf>,
    /// Format of --versions-file: yaml, json, or legacy-jenkins-properties
    #[arg(long, default_value = "yaml")]
    pub versions_format: VersionsFormat,
    /// Pin every release to this terra-helmfile ref
    #[arg(long, value_name = "REF")]
    pub terra_helmfile_ref: Option<String>,
    /// Pin every release to this firecloud-develop ref
    #[arg(long, value_name = "REF")]
    pub firecloud_develop_ref: Option<String>,
}

impl PinArgs {
    pub fn options(&self) -> anyhow::Result<PinOptions> {
        let file_overrides = match &self.versions_file {
            None => Default::default(),
            Some(path) => {
                let data = read_input(path)?;
                parse_versions(self.versions_format, &data)
                    .with_context(|| format!("failed to parse {}", path.display()))?
            }
        };
        Ok(PinOptions {
            flags: PinFlags {
                terra_helmfile_ref: self.terra_helmfile_ref.clone(),
                firecloud_develop_ref: self.firecloud_develop_ref.clone(),
            },
            file_overrides,
        })
    }
}

fn read_input(path: &std::path::Path) -> anyhow::Result<Vec<u8>> {
    if path.as_os_str() == "-" {
        let mut data = Vec::new();
        std::io::stdin()
            .read_to_end(&mut data)
            .context("failed to read versions from stdin")?;
        return Ok(data);
    }
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

#[derive(Args, Debug, Clone)]
pub struct SyncArgs {
    /// Only sync the environment's generator, not its apps
    #[arg(long)]
    pub generator_only: bool,
    /// Wait for every app to report healthy
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub wait_healthy: bool,
    /// How long to wait for apps to become healthy [default: from config]
    #[arg(long, value_name = "SECONDS")]
    pub wait_healthy_timeout_seconds: Option<u64>,
    /// Message the owner on Slack when done
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub notify: bool,
}

impl SyncArgs {
    pub fn options(&self, default_timeout: u64) -> ProvisionExistingOptions {
        ProvisionExistingOptions {
            wait_healthy: self.wait_healthy,
            wait_healthy_timeout_seconds: self.wait_healthy_timeout_seconds.unwrap_or(default_timeout),
            notify: self.notify,
            sync_generator_only: self.generator_only,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ProvisionArgs {
    #[command(flatten)]
    pub sync: SyncArgs,
    /// Seed the BEE after it comes up
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub seed: bool,
    /// Export container logs when provisioning fails
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub export_logs_on_failure: bool,
    #[command(flatten)]
    pub pin: PinArgs,
    #[command(flatten)]
    pub seeder: SeedArgs,
}

impl ProvisionArgs {
    pub fn options(&self, default_timeout: u64) -> anyhow::Result<ProvisionOptions> {
        Ok(ProvisionOptions {
            seed: self.seed,
            seed_options: self.seeder.options(),
            pin_options: self.pin.options()?,
            export_logs_on_failure: self.export_logs_on_failure,
            existing: self.sync.options(default_timeout),
        })
    }
}

// ---------------------------------------------------------------------------
// Parsers and printing
// ---------------------------------------------------------------------------

pub fn parse_rfc3339(s: &str) -> Result<DateTime<FixedOffset>, String> {
    DateTime::parse_from_rfc3339(s).map_err(|e| format!("invalid RFC3339 time '{s}': {e}"))
}

/// Print the BEE, then fail with the outcome's error if there was one.
pub fn report_outcome(app: &App, outcome: BeeOutcome, verb: &str, json: bool) -> anyhow::Result<()> {
    let name = outcome.bee.name().to_string();
    let url = app.bees.url(&name);
    if json {
        print_json(&BeeView::new(&outcome.bee, url))?;
    } else {
        print_bee(&outcome.bee, &url);
    }
    match outcome.error {
        None => {
            if !json {
                println!("\nBEE '{name}' {verb}.");
            }
            Ok(())
        }
        Some(e) => Err(anyhow::Error::new(e).context(format!("bee '{name}' was not {verb}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_args_map_onto_options() {
        let args = SeedArgs {
            step_1_create_elasticsearch: true,
            step_6_extra_user: vec!["qa@test.firecloud.org".into()],
            no_steps: true,
            register_self: true,
            ..Default::default()
        };
        let steps = args.options().effective();
        assert!(steps.create_elasticsearch);
        assert!(!steps.register_sa_profiles);
        assert_eq!(steps.extra_users, vec!["qa@test.firecloud.org", "use-adc"]);
    }

    #[test]
    fn pin_flags_without_file() {
        let args = PinArgs {
            versions_format: VersionsFormat::Yaml,
            terra_helmfile_ref: Some("my-ref".into()),
            ..Default::default()
        };
        let opts = args.options().unwrap();
        assert_eq!(opts.flags.terra_helmfile_ref.as_deref(), Some("my-ref"));
        assert!(opts.file_overrides.is_empty());
    }

    #[test]
    fn versions_file_is_parsed_in_its_format() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("versions.json");
        std::fs::write(&path, r#"{"sam": {"appVersion": "1.2.3"}}"#).unwrap();
        let args = PinArgs {
            versions_file: Some(path),
            versions_format: VersionsFormat::Json,
            ..Default::default()
        };
        let opts = args.options().unwrap();
        assert_eq!(opts.file_overrides["sam"].app_version.as_deref(), Some("1.2.3"));
    }

    #[test]
    fn rfc3339_errors_name_the_input() {
        assert!(parse_rfc3339("2024-03-12T18:00:00-05:00").is_ok());
        let err = parse_rfc3339("6pm").unwrap_err();
        assert!(err.contains("6pm"));
    }
}
