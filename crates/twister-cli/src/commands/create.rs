use anyhow::{bail, Context, Result};
use std::path::Path;

use crate::plugin::PluginManifest;
use crate::ui;

const LIB_TEMPLATE: &str = r#"//! {{name}} plugin.

use std::sync::Arc;

use anyhow::Result;
use twister_core::providers::{GithubIssuesSource, SourceConfig, SyncSettings};
use twister_core::{CallbackRegistry, Host, SyncEngine};

/// Register this plugin's sync engines with the host.
pub fn register(host: &Host, registry: &mut CallbackRegistry) -> Result<()> {
    let source = GithubIssuesSource::new(&SourceConfig::default());
    let engine = SyncEngine::new(source, &host.scoped("{{name}}"), SyncSettings::default())?;
    registry.register(Arc::new(engine));
    Ok(())
}
"#;

pub fn run(name: Option<String>) -> Result<()> {
    let name = match name {
        Some(name) => name,
        None => ui::prompt_input("Plugin name")?,
    };
    let slug = slug::slugify(&name);
    if slug.is_empty() {
        bail!("plugin name must contain letters or digits");
    }

    let dir = Path::new(&slug);
    if dir.exists() {
        bail!("{} already exists", dir.display());
    }

    scaffold(dir, &slug)?;

    ui::success(&format!("Created {}", slug));
    ui::header("Next steps");
    let cd = format!("cd {}", slug);
    ui::steps(&[
        cd.as_str(),
        "edit src/lib.rs and plugin.json",
        "plot lint",
        "plot deploy",
    ]);
    Ok(())
}

fn scaffold(dir: &Path, slug: &str) -> Result<()> {
    std::fs::create_dir_all(dir.join("src")).with_context(|| format!("creating {}", dir.display()))?;

    std::fs::write(dir.join("Cargo.toml"), cargo_toml(slug))?;
    std::fs::write(dir.join("src/lib.rs"), LIB_TEMPLATE.replace("{{name}}", slug))?;

    let mut manifest = PluginManifest::new(slug, None);
    manifest.sources = vec!["github-issues".to_string()];
    manifest.save(dir)?;
    Ok(())
}

fn cargo_toml(slug: &str) -> String {
    format!(
        r#"[package]
name = "{slug}"
version = "0.1.0"
edition = "2021"

[lib]
crate-type = ["cdylib", "rlib"]

[dependencies]
twister-core = "{sdk}"
anyhow = "1"
"#,
        slug = slug,
        sdk = env!("CARGO_PKG_VERSION"),
    )
}
