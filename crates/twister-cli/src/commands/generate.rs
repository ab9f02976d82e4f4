use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

use crate::api_client::{ApiClient, GeneratedFile};
use crate::config::CliConfig;
use crate::plugin::{self, relative_path};
use crate::ui;

pub async fn run(spec: Option<PathBuf>, out: Option<PathBuf>) -> Result<()> {
    let description = match spec {
        Some(path) => std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?,
        None => ui::prompt_input("Describe the plugin")?,
    };
    if description.trim().is_empty() {
        bail!("plugin description is empty");
    }

    let config = CliConfig::load()?;
    let client = ApiClient::new(&config);

    let spinner = ui::spinner("Generating plugin...");
    let generated = client.generate(&description).await;
    spinner.finish_and_clear();
    let generated = generated?;

    let dir = out.unwrap_or_else(|| PathBuf::from(slug::slugify(&generated.name)));
    if dir.exists() && !ui::prompt_confirm(&format!("{} exists. Overwrite generated files?", dir.display()))? {
        ui::info("Cancelled.");
        return Ok(());
    }

    write_files(&dir, &generated.files)?;
    ui::success(&format!("Wrote {} files to {}", generated.files.len(), dir.display()));

    let issues = plugin::lint(&dir);
    if !issues.is_empty() {
        ui::warning("Generated plugin has lint issues:");
        for issue in &issues {
            ui::info(&format!("{}: {}", issue.path, issue.message));
        }
    }
    Ok(())
}

fn write_files(dir: &Path, files: &[GeneratedFile]) -> Result<()> {
    // Validate every path before writing anything
    let paths = files
        .iter()
        .map(|f| relative_path(&f.path))
        .collect::<Result<Vec<_>>>()?;

    for (rel, file) in paths.iter().zip(files) {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, &file.content).with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, content: &str) -> GeneratedFile {
        GeneratedFile {
            path: path.to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn test_write_files_creates_dirs() {
        let dir = tempfile::tempdir().unwrap();
        write_files(dir.path(), &[file("src/sources/mod.rs", "// sources\n")]).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("src/sources/mod.rs")).unwrap(),
            "// sources\n"
        );
    }

    #[test]
    fn test_write_files_rejects_escape_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let result = write_files(dir.path(), &[file("Cargo.toml", ""), file("../evil.rs", "")]);
        assert!(result.is_err());
        assert!(!dir.path().join("Cargo.toml").exists());
    }
}
