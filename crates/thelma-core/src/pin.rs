//! Release version pinning.
//!
//! Pins come from two places: command-line flags (environment-wide refs) and
//! a versions file (per-release overrides) in one of three formats. They are
//! merged into a complete override map for the environment and handed to the
//! state store, which returns the effective post-update pins.

use crate::environment::Environment;
use crate::error::{Result, ThelmaError};
use crate::release::Release;
use crate::state::StateStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// VersionOverride
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terra_helmfile_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firecloud_develop_ref: Option<String>,
}

pub type VersionOverrides = BTreeMap<String, VersionOverride>;

impl VersionOverride {
    pub fn is_empty(&self) -> bool {
        self.chart_version.is_none()
            && self.app_version.is_none()
            && self.terra_helmfile_ref.is_none()
            && self.firecloud_develop_ref.is_none()
    }

    /// Field-wise merge: values set on `self` win over `prior`.
    pub fn merged_over(&self, prior: &VersionOverride) -> VersionOverride {
        VersionOverride {
            chart_version: self
                .chart_version
                .clone()
                .or_else(|| prior.chart_version.clone()),
            app_version: self.app_version.clone().or_else(|| prior.app_version.clone()),
            terra_helmfile_ref: self
                .terra_helmfile_ref
                .clone()
                .or_else(|| prior.terra_helmfile_ref.clone()),
            firecloud_develop_ref: self
                .firecloud_develop_ref
                .clone()
                .or_else(|| prior.firecloud_develop_ref.clone()),
        }
    }

    /// Write the pinned values onto a release record.
    pub fn apply_to(&self, release: &mut Release) {
        if let Some(v) = &self.chart_version {
            release.chart_version = v.clone();
        }
        if let Some(v) = &self.app_version {
            release.set_app_version(v);
        }
        if let Some(v) = &self.terra_helmfile_ref {
            release.terra_helmfile_ref = Some(v.clone());
        }
        if let Some(v) = &self.firecloud_develop_ref {
            release.firecloud_develop_ref = Some(v.clone());
        }
    }
}

/// Merge `supplied` over `prior`, entry by entry. Entries only present in
/// `prior` are kept.
pub fn merge_overrides(prior: &VersionOverrides, supplied: &VersionOverrides) -> VersionOverrides {
    let mut merged = prior.clone();
    for (name, o) in supplied {
        let next = match prior.get(name) {
            Some(p) => o.merged_over(p),
            None => o.clone(),
        };
        merged.insert(name.clone(), next);
    }
    merged
}

// ---------------------------------------------------------------------------
// PinOptions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PinFlags {
    pub terra_helmfile_ref: Option<String>,
    pub firecloud_develop_ref: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PinOptions {
    pub flags: PinFlags,
    pub file_overrides: VersionOverrides,
}

// ---------------------------------------------------------------------------
// VersionsFormat
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VersionsFormat {
    #[default]
    Yaml,
    Json,
    LegacyJenkinsProperties,
}

impl VersionsFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            VersionsFormat::Yaml => "yaml",
            VersionsFormat::Json => "json",
            VersionsFormat::LegacyJenkinsProperties => "legacy-jenkins-properties",
        }
    }
}

impl fmt::Display for VersionsFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for VersionsFormat {
    type Err = ThelmaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "yaml" => Ok(VersionsFormat::Yaml),
            "json" => Ok(VersionsFormat::Json),
            "legacy-jenkins-properties" => Ok(VersionsFormat::LegacyJenkinsProperties),
            _ => Err(ThelmaError::validation(format!(
                "unknown versions format '{s}': expected yaml, json, or legacy-jenkins-properties"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Release names used by the legacy Jenkins properties files that differ
/// from the current release names.
const LEGACY_ALIASES: &[(&str, &str)] = &[
    ("consent-ontology", "ontology"),
    ("firecloud-orchestration", "firecloudorch"),
    ("firecloud-ui", "firecloudui"),
    ("job-manager", "jobmanager"),
];

pub fn parse_versions(format: VersionsFormat, data: &[u8]) -> Result<VersionOverrides> {
    match format {
        VersionsFormat::Yaml => parse_structured(data, |d| Ok(serde_yaml::from_slice(d)?)),
        VersionsFormat::Json => parse_structured(data, |d| Ok(serde_json::from_slice(d)?)),
        VersionsFormat::LegacyJenkinsProperties => parse_legacy(data),
    }
}

fn parse_structured(
    data: &[u8],
    decode: impl Fn(&[u8]) -> Result<BTreeMap<String, Option<VersionOverride>>>,
) -> Result<VersionOverrides> {
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(VersionOverrides::new());
    }
    let raw = decode(data)?;
    Ok(raw
        .into_iter()
        .map(|(name, o)| (name, o.unwrap_or_default()))
        .collect())
}

fn parse_legacy(data: &[u8]) -> Result<VersionOverrides> {
    let text = String::from_utf8_lossy(data);
    let mut out = VersionOverrides::new();
    for (idx, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            warn!(line = idx + 1, "skipping versions line without '=': {line}");
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        let Some(stem) = key.strip_suffix("_img") else {
            warn!(line = idx + 1, "skipping versions line without _img key: {line}");
            continue;
        };
        if stem.is_empty() || value.is_empty() {
            warn!(line = idx + 1, "skipping incomplete versions line: {line}");
            continue;
        }
        let name = legacy_release_name(stem);
        debug!(release = %name, version = %value, "parsed legacy version");
        out.insert(
            name,
            VersionOverride {
                app_version: Some(value.to_string()),
                ..Default::default()
            },
        );
    }
    Ok(out)
}

fn legacy_release_name(stem: &str) -> String {
    let hyphenated = stem.replace('_', "-");
    LEGACY_ALIASES
        .iter()
        .find(|(from, _)| *from == hyphenated)
        .map(|(_, to)| (*to).to_string())
        .unwrap_or(hyphenated)
}

// ---------------------------------------------------------------------------
// Image tag normalization
// ---------------------------------------------------------------------------

/// Make `tag` a valid Docker image tag: characters outside
/// `[A-Za-z0-9_.-]` become `-`, and leading `.`/`-` are stripped.
pub fn normalize_image_tag(tag: &str) -> String {
    let replaced: String = tag
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    replaced.trim_start_matches(['.', '-']).to_string()
}

// ---------------------------------------------------------------------------
// Apply
// ---------------------------------------------------------------------------

/// Build the complete desired override map for `env`.
///
/// File overrides for unknown releases are dropped, app versions are
/// normalized, every release without an override gets an empty one, and the
/// flag refs are propagated into every entry that lacks them.
pub fn desired_overrides(env: &Environment, opts: &PinOptions) -> VersionOverrides {
    let mut overrides = VersionOverrides::new();

    for (name, o) in &opts.file_overrides {
        if !env.has_release(name) {
            warn!(bee = %env.name, release = %name, "ignoring version override for unknown release");
            continue;
        }
        let mut o = o.clone();
        if let Some(v) = &o.app_version {
            o.app_version = Some(normalize_image_tag(v));
        }
        overrides.insert(name.clone(), o);
    }

    for release in &env.releases {
        overrides.entry(release.name.clone()).or_default();
    }

    for o in overrides.values_mut() {
        if o.terra_helmfile_ref.is_none() {
            o.terra_helmfile_ref = opts.flags.terra_helmfile_ref.clone();
        }
        if o.firecloud_develop_ref.is_none() {
            o.firecloud_develop_ref = opts.flags.firecloud_develop_ref.clone();
        }
    }

    overrides
}

/// Persist `opts` for `env` and return the effective pins.
///
/// An environment-level helmfile ref is pinned first; if that fails nothing
/// else is written.
pub async fn apply(
    store: &dyn StateStore,
    env: &Environment,
    opts: &PinOptions,
) -> Result<VersionOverrides> {
    if let Some(git_ref) = &opts.flags.terra_helmfile_ref {
        store
            .pin_environment_to_terra_helmfile_ref(&env.name, git_ref)
            .await?;
    }
    let overrides = desired_overrides(env, opts);
    store.pin_versions(&env.name, &overrides).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Lifecycle;
    use proptest::prelude::*;
    use std::str::FromStr;

    fn bee() -> Environment {
        let mut env = Environment::new("my-bee", Lifecycle::Dynamic, "terra-qa-bees");
        for name in ["leonardo", "sam", "workspacemanager"] {
            env.releases
                .push(Release::app(name, "my-bee", "terra-qa-bees").with_versions("1.0.0", "v1"));
        }
        env
    }

    #[test]
    fn parse_yaml_versions() {
        let data = b"sam:\n  appVersion: 'feature/branch'\n  chartVersion: 0.34.0\nleonardo: ~\n";
        let parsed = parse_versions(VersionsFormat::Yaml, data).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["sam"].app_version.as_deref(), Some("feature/branch"));
        assert_eq!(parsed["sam"].chart_version.as_deref(), Some("0.34.0"));
        assert!(parsed["leonardo"].is_empty());
    }

    #[test]
    fn parse_json_versions() {
        let data = br#"{"rawls": {"terraHelmfileRef": "my-branch"}}"#;
        let parsed = parse_versions(VersionsFormat::Json, data).unwrap();
        assert_eq!(
            parsed["rawls"].terra_helmfile_ref.as_deref(),
            Some("my-branch")
        );
    }

    #[test]
    fn parse_empty_file_is_empty_map() {
        assert!(parse_versions(VersionsFormat::Yaml, b"  \n").unwrap().is_empty());
        assert!(parse_versions(VersionsFormat::Json, b"").unwrap().is_empty());
    }

    #[test]
    fn parse_invalid_json_is_error() {
        assert!(parse_versions(VersionsFormat::Json, b"{not json").is_err());
    }

    #[test]
    fn parse_legacy_properties() {
        let data = b"# generated\n\
            sam_img=abc123\n\
            consent_ontology_img=def\n\
            firecloud_orchestration_img = 1.2.3 \n\
            firecloud_ui_img=ui\n\
            job_manager_img=jm\n\
            workspace_manager_img=wsm\n\
            garbage line\n\
            rawls=no-suffix\n\
            _img=empty-stem\n\
            leonardo_img=\n";
        let parsed = parse_versions(VersionsFormat::LegacyJenkinsProperties, data).unwrap();
        let names: Vec<&str> = parsed.keys().map(String::as_str).collect();
        assert_eq!(
            names,
            vec![
                "firecloudorch",
                "firecloudui",
                "jobmanager",
                "ontology",
                "sam",
                "workspace-manager"
            ]
        );
        assert_eq!(parsed["firecloudorch"].app_version.as_deref(), Some("1.2.3"));
        assert_eq!(parsed["sam"].app_version.as_deref(), Some("abc123"));
    }

    #[test]
    fn versions_format_from_str() {
        assert_eq!(
            VersionsFormat::from_str("legacy-jenkins-properties").unwrap(),
            VersionsFormat::LegacyJenkinsProperties
        );
        let err = VersionsFormat::from_str("toml").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[test]
    fn normalize_examples() {
        assert_eq!(normalize_image_tag("feature/my-branch"), "feature-my-branch");
        assert_eq!(normalize_image_tag("-leading"), "leading");
        assert_eq!(normalize_image_tag("..//x"), "x");
        assert_eq!(normalize_image_tag("v1.2.3_rc"), "v1.2.3_rc");
        assert_eq!(normalize_image_tag("ünïcode"), "n-code");
        assert_eq!(normalize_image_tag(""), "");
    }

    #[test]
    fn desired_overrides_fills_every_release() {
        let overrides = desired_overrides(&bee(), &PinOptions::default());
        assert_eq!(overrides.len(), 3);
        assert!(overrides.values().all(VersionOverride::is_empty));
    }

    #[test]
    fn desired_overrides_propagates_flag_refs() {
        let mut opts = PinOptions::default();
        opts.flags.terra_helmfile_ref = Some("my-helmfile-ref".into());
        opts.file_overrides.insert(
            "sam".into(),
            VersionOverride {
                terra_helmfile_ref: Some("sam-ref".into()),
                app_version: Some("feature/x".into()),
                ..Default::default()
            },
        );
        opts.file_overrides
            .insert("not-in-env".into(), VersionOverride::default());

        let overrides = desired_overrides(&bee(), &opts);
        assert_eq!(overrides.len(), 3);
        assert_eq!(overrides["sam"].terra_helmfile_ref.as_deref(), Some("sam-ref"));
        assert_eq!(overrides["sam"].app_version.as_deref(), Some("feature-x"));
        assert_eq!(
            overrides["leonardo"].terra_helmfile_ref.as_deref(),
            Some("my-helmfile-ref")
        );
        assert_eq!(overrides["leonardo"].firecloud_develop_ref, None);
    }

    #[test]
    fn merge_overrides_later_wins_and_prior_survives() {
        let mut prior = VersionOverrides::new();
        prior.insert(
            "sam".into(),
            VersionOverride {
                chart_version: Some("1.0.0".into()),
                app_version: Some("old".into()),
                ..Default::default()
            },
        );
        prior.insert("rawls".into(), VersionOverride::default());
        let mut supplied = VersionOverrides::new();
        supplied.insert(
            "sam".into(),
            VersionOverride {
                app_version: Some("new".into()),
                ..Default::default()
            },
        );

        let merged = merge_overrides(&prior, &supplied);
        assert_eq!(merged["sam"].chart_version.as_deref(), Some("1.0.0"));
        assert_eq!(merged["sam"].app_version.as_deref(), Some("new"));
        assert!(merged.contains_key("rawls"));
    }

    #[test]
    fn apply_to_release_skips_app_version_on_cluster_release() {
        let o = VersionOverride {
            chart_version: Some("2.0.0".into()),
            app_version: Some("v2".into()),
            ..Default::default()
        };
        let mut r = Release::cluster_release("yale", "c", "yale");
        o.apply_to(&mut r);
        assert_eq!(r.chart_version, "2.0.0");
        assert_eq!(r.app_version(), None);
    }

    #[tokio::test]
    async fn applying_twice_yields_the_same_pins() {
        use crate::testing::{fixture_document, CallLog, FakeStateStore};
        let store = FakeStateStore::new(CallLog::default(), fixture_document());
        let env = store.reload().await.unwrap().environments().get("my-bee").unwrap().clone();
        let mut opts = PinOptions::default();
        opts.flags.terra_helmfile_ref = Some("my-helmfile-ref".into());
        opts.file_overrides.insert(
            "sam".into(),
            VersionOverride {
                app_version: Some("v2".into()),
                ..Default::default()
            },
        );
        let first = apply(&store, &env, &opts).await.unwrap();
        let second = apply(&store, &env, &opts).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first["sam"].app_version.as_deref(), Some("v2"));
        assert_eq!(first["leonardo"].terra_helmfile_ref.as_deref(), Some("my-helmfile-ref"));
        assert_eq!(store.log.count("state.pin_ref my-bee"), 2);
    }

    proptest! {
        #[test]
        fn normalized_tags_are_valid_and_stable(s in ".*") {
            let n = normalize_image_tag(&s);
            prop_assert!(n.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')));
            prop_assert!(!n.starts_with('.') && !n.starts_with('-'));
            prop_assert_eq!(normalize_image_tag(&n), n);
        }

        #[test]
        fn desired_overrides_is_idempotent(
            helmfile_ref in proptest::option::of("[a-z0-9-]{1,12}"),
            sam_version in proptest::option::of("[ -~]{0,16}"),
        ) {
            let env = bee();
            let mut opts = PinOptions::default();
            opts.flags.terra_helmfile_ref = helmfile_ref;
            opts.file_overrides.insert("sam".into(), VersionOverride {
                app_version: sam_version,
                ..Default::default()
            });
            let first = desired_overrides(&env, &opts);
            let second = desired_overrides(&env, &opts);
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(merge_overrides(&first, &first), first);
        }
    }
}
