use anyhow::Result;
use std::collections::HashSet;

use crate::api_client::{ApiClient, Priority};
use crate::config::CliConfig;
use crate::ui;

pub async fn list() -> Result<()> {
    let config = CliConfig::load()?;
    let priorities = ApiClient::new(&config).priorities().await?;

    if priorities.is_empty() {
        ui::info("No priorities yet. Create one with: plot priority create <title>");
        return Ok(());
    }
    for line in render_tree(&priorities) {
        println!("{}", line);
    }
    Ok(())
}

pub async fn create(title: &str, parent: Option<String>) -> Result<()> {
    let config = CliConfig::load()?;
    let priority = ApiClient::new(&config)
        .create_priority(title, parent.as_deref())
        .await?;
    ui::success(&format!("Created priority {} ({})", priority.title, priority.id));
    Ok(())
}

/// Indent children under their parents. Orphans (unknown parent) are shown at the top level.
fn render_tree(priorities: &[Priority]) -> Vec<String> {
    let ids: HashSet<&str> = priorities.iter().map(|p| p.id.as_str()).collect();
    let mut lines = Vec::new();
    let mut seen = HashSet::new();

    for root in priorities
        .iter()
        .filter(|p| p.parent_id.as_deref().map(|id| !ids.contains(id)).unwrap_or(true))
    {
        push_subtree(priorities, root, 0, &mut seen, &mut lines);
    }
    lines
}

fn push_subtree<'a>(
    all: &'a [Priority],
    node: &'a Priority,
    depth: usize,
    seen: &mut HashSet<&'a str>,
    lines: &mut Vec<String>,
) {
    // Guard against parent cycles
    if !seen.insert(node.id.as_str()) {
        return;
    }
    lines.push(format!("{}{}  {}", "  ".repeat(depth), node.title, node.id));
    for child in all.iter().filter(|p| p.parent_id.as_deref() == Some(node.id.as_str())) {
        push_subtree(all, child, depth + 1, seen, lines);
    }
}
