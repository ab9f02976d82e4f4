use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;

use crate::api_client::{ApiClient, LogEntry};
use crate::config::CliConfig;
use crate::plugin::PluginManifest;
use crate::ui;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

pub async fn run(dir: &Path, lines: usize, follow: bool) -> Result<()> {
    let manifest = PluginManifest::load(dir)?;
    let plugin_id = manifest
        .id
        .context("plugin has not been deployed yet; run `plot deploy` first")?;

    let config = CliConfig::load()?;
    let client = ApiClient::new(&config);

    let mut entries = client.logs(&plugin_id, None, lines).await?;
    entries.sort_by_key(|e| e.timestamp);
    print_entries(&entries);

    if !follow {
        return Ok(());
    }

    let mut last = entries.last().map(|e| e.timestamp);
    loop {
        tokio::time::sleep(POLL_INTERVAL).await;
        let mut entries = client.logs(&plugin_id, last, lines).await?;
        entries.sort_by_key(|e| e.timestamp);
        // `since` is inclusive on the server
        entries.retain(|e| last.map(|l| e.timestamp > l).unwrap_or(true));
        print_entries(&entries);
        if let Some(entry) = entries.last() {
            last = Some(entry.timestamp);
        }
    }
}

fn print_entries(entries: &[LogEntry]) {
    for entry in entries {
        ui::log_line(
            &entry.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            &entry.level,
            &entry.message,
        );
    }
}
