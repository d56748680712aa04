use serde::Serialize;
use std::collections::BTreeMap;
use thelma_core::bee::Bee;
use thelma_core::environment::Environment;
use thelma_core::pin::VersionOverrides;

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Left-aligned columns separated by two spaces, headers underlined.
pub fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    print!("{}", render_table(headers, &rows));
}

fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.chars().count());
        }
    }

    let line = |cells: Vec<&str>| -> String {
        let padded: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(c, &w)| format!("{c:<w$}"))
            .collect();
        format!("{}\n", padded.join("  ").trim_end())
    };

    let mut out = line(headers.to_vec());
    out.push_str(&format!(
        "{}\n",
        widths.iter().map(|w| "-".repeat(*w)).collect::<Vec<_>>().join("  ")
    ));
    for row in rows {
        out.push_str(&line(row.iter().map(String::as_str).collect()));
    }
    out
}

// ---------------------------------------------------------------------------
// BEE views
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BeeView<'a> {
    #[serde(flatten)]
    pub environment: &'a Environment,
    pub state: String,
    pub url: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub sync_statuses: BTreeMap<&'a str, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub log_locations: BTreeMap<String, String>,
}

impl<'a> BeeView<'a> {
    pub fn new(bee: &'a Bee, url: String) -> Self {
        Self {
            environment: &bee.environment,
            state: bee.state.to_string(),
            url,
            sync_statuses: bee
                .sync_statuses
                .iter()
                .map(|(k, v)| (k.as_str(), v.to_string()))
                .collect(),
            log_locations: bee.log_locations.clone(),
        }
    }
}

pub fn bee_row(env: &Environment) -> Vec<String> {
    vec![
        env.name.clone(),
        env.template.clone(),
        env.owner.clone(),
        if env.offline { "offline" } else { "online" }.to_string(),
        env.created_at.format("%Y-%m-%d %H:%M").to_string(),
        auto_delete_summary(env),
    ]
}

pub const BEE_HEADERS: &[&str] = &["NAME", "TEMPLATE", "OWNER", "STATUS", "CREATED", "AUTO-DELETE"];

fn auto_delete_summary(env: &Environment) -> String {
    match &env.auto_delete {
        Some(ad) if ad.enabled => ad.after.to_rfc3339(),
        _ => "-".to_string(),
    }
}

/// Daily stop / start times in the offset they were stored with.
pub fn schedule_summary(env: &Environment) -> Vec<(String, String)> {
    let mut lines = Vec::new();
    if let Some(b) = env.offline_schedule_begin.as_ref().filter(|b| b.enabled) {
        lines.push(("Stops daily at".to_string(), b.time.format("%H:%M %:z").to_string()));
    }
    if let Some(e) = env.offline_schedule_end.as_ref().filter(|e| e.enabled) {
        let days = if e.weekends { "every day" } else { "weekdays" };
        lines.push((
            "Starts at".to_string(),
            format!("{} ({days})", e.time.format("%H:%M %:z")),
        ));
    }
    lines
}

pub fn print_bee(bee: &Bee, url: &str) {
    let env = &bee.environment;
    println!("BEE:       {}", env.name);
    println!("Template:  {}", display_or_dash(&env.template));
    println!("Owner:     {}", display_or_dash(&env.owner));
    println!("State:     {}", bee.state);
    println!("Offline:   {}", env.offline);
    println!("Created:   {}", env.created_at.to_rfc3339());
    println!("Cluster:   {}", env.default_cluster);
    println!("URL:       {url}");
    if let Some(r) = &env.terra_helmfile_ref {
        println!("Helmfile:  {r}");
    }
    if let Some(ad) = env.auto_delete.as_ref().filter(|a| a.enabled) {
        println!("Deletes:   {}", ad.after.to_rfc3339());
    }
    for (label, value) in schedule_summary(env) {
        println!("{label}: {value}");
    }

    if env.releases.is_empty() {
        println!("Releases:  (none)");
        return;
    }
    println!();
    let rows = env
        .releases
        .iter()
        .map(|r| {
            vec![
                r.name.clone(),
                r.chart_version.clone(),
                r.app_version().unwrap_or("").to_string(),
                bee.sync_statuses
                    .get(&r.name)
                    .map(|s| s.to_string())
                    .unwrap_or_default(),
                bee.log_locations.get(&r.name).cloned().unwrap_or_default(),
            ]
        })
        .collect();
    print_table(&["RELEASE", "CHART", "APP", "STATUS", "LOGS"], rows);
}

pub fn print_pins(pins: &VersionOverrides) {
    if pins.is_empty() {
        println!("No version overrides.");
        return;
    }
    let rows = pins
        .iter()
        .map(|(release, o)| {
            vec![
                release.clone(),
                o.chart_version.clone().unwrap_or_default(),
                o.app_version.clone().unwrap_or_default(),
                o.terra_helmfile_ref.clone().unwrap_or_default(),
                o.firecloud_develop_ref.clone().unwrap_or_default(),
            ]
        })
        .collect();
    print_table(
        &["RELEASE", "CHART", "APP", "HELMFILE-REF", "FIRECLOUD-DEVELOP-REF"],
        rows,
    );
}

fn display_or_dash(s: &str) -> &str {
    if s.is_empty() {
        "-"
    } else {
        s
    }
}
