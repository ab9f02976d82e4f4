use anyhow::{bail, Result};
use std::path::Path;
use tracing::debug;

use crate::api_client::ApiClient;
use crate::config::CliConfig;
use crate::plugin::{self, PluginManifest};
use crate::ui;

pub async fn run(dir: &Path) -> Result<()> {
    let issues = plugin::lint(dir);
    if !issues.is_empty() {
        for issue in &issues {
            ui::error(&format!("{}: {}", issue.path, issue.message));
        }
        bail!("fix lint issues before deploying");
    }

    let config = CliConfig::load()?;
    let deploy_token = config.require_deploy_token()?;
    let bundle = plugin::bundle(dir)?;
    debug!("bundled {} files for {}", bundle.files.len(), bundle.manifest.name);

    let spinner = ui::spinner(&format!("Deploying {}...", bundle.manifest.name));
    let deployment = ApiClient::new(&config).deploy(&bundle, deploy_token).await;
    spinner.finish_and_clear();
    let deployment = deployment?;

    // Remember the plugin id so `plot logs` can find it
    let mut manifest = PluginManifest::load(dir)?;
    if manifest.id.as_deref() != Some(deployment.id.as_str()) {
        manifest.id = Some(deployment.id.clone());
        manifest.save(dir)?;
    }

    ui::success(&format!("Deployed {} {}", bundle.manifest.name, deployment.version));
    Ok(())
}
