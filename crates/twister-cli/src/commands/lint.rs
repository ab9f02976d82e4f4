use anyhow::{bail, Result};
use std::path::Path;

use crate::plugin;
use crate::ui;

pub fn run(dir: &Path) -> Result<()> {
    let issues = plugin::lint(dir);
    if issues.is_empty() {
        ui::success(&format!("{} looks good", dir.display()));
        return Ok(());
    }

    for issue in &issues {
        ui::error(&format!("{}: {}", issue.path, issue.message));
    }
    bail!("{} lint issue(s) found", issues.len())
}
