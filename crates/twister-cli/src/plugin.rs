//! Plugin directories: the `plugin.json` manifest, lint checks and bundling.

use anyhow::{bail, Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

use twister_core::providers::BUILTIN_SOURCES;

pub const MANIFEST_FILE: &str = "plugin.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Built-in sources the plugin syncs from.
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default = "default_entry")]
    pub entry: String,
    /// Assigned by the API on first deploy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

fn default_entry() -> String {
    "src/lib.rs".to_string()
}

impl PluginManifest {
    pub fn new(name: &str, description: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            version: "0.1.0".to_string(),
            description,
            sources: Vec::new(),
            entry: default_entry(),
            id: None,
        }
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let contents = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(MANIFEST_FILE);
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, contents + "\n").with_context(|| format!("writing {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LintIssue {
    pub path: String,
    pub message: String,
}

impl LintIssue {
    fn new(path: &str, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            message: message.into(),
        }
    }
}

/// Check a plugin directory. An empty result means it is deployable.
pub fn lint(dir: &Path) -> Vec<LintIssue> {
    let mut issues = Vec::new();

    if !dir.join("Cargo.toml").is_file() {
        issues.push(LintIssue::new("Cargo.toml", "missing"));
    }

    let manifest = match PluginManifest::load(dir) {
        Ok(manifest) => manifest,
        Err(e) => {
            issues.push(LintIssue::new(MANIFEST_FILE, format!("{:#}", e)));
            return issues;
        }
    };

    if manifest.name.is_empty() {
        issues.push(LintIssue::new(MANIFEST_FILE, "\"name\" is empty"));
    } else if slug::slugify(&manifest.name) != manifest.name {
        issues.push(LintIssue::new(
            MANIFEST_FILE,
            format!("\"name\" must be lowercase words joined by dashes (try \"{}\")", slug::slugify(&manifest.name)),
        ));
    }

    if !is_version(&manifest.version) {
        issues.push(LintIssue::new(
            MANIFEST_FILE,
            format!("\"version\" must look like 1.2.3, got \"{}\"", manifest.version),
        ));
    }

    for source in &manifest.sources {
        if !BUILTIN_SOURCES.contains(&source.as_str()) {
            issues.push(LintIssue::new(
                MANIFEST_FILE,
                format!("unknown source \"{}\" (known: {})", source, BUILTIN_SOURCES.join(", ")),
            ));
        }
    }

    if relative_path(&manifest.entry).is_err() {
        issues.push(LintIssue::new(MANIFEST_FILE, "\"entry\" must be a relative path inside the plugin"));
    } else if !dir.join(&manifest.entry).is_file() {
        issues.push(LintIssue::new(&manifest.entry, "entry file is missing"));
    }

    issues
}

fn is_version(version: &str) -> bool {
    let parts: Vec<&str> = version.split('.').collect();
    parts.len() == 3 && parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

/// Reject absolute paths and `..` so generated or bundled files stay inside the plugin.
pub fn relative_path(path: &str) -> Result<PathBuf> {
    let candidate = Path::new(path);
    if path.is_empty() || candidate.components().any(|c| !matches!(c, Component::Normal(_) | Component::CurDir)) {
        bail!("refusing path outside the plugin directory: {}", path);
    }
    Ok(candidate.to_path_buf())
}

#[derive(Debug, Clone, Serialize)]
pub struct Bundle {
    pub manifest: PluginManifest,
    pub files: Vec<BundleFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BundleFile {
    pub path: String,
    /// Base64 of the file bytes.
    pub content: String,
}

/// Collect the manifest, `Cargo.toml` and every file under `src/`.
pub fn bundle(dir: &Path) -> Result<Bundle> {
    let manifest = PluginManifest::load(dir)?;
    let mut paths = vec![PathBuf::from("Cargo.toml"), PathBuf::from(MANIFEST_FILE)];
    if dir.join("Cargo.lock").is_file() {
        paths.push(PathBuf::from("Cargo.lock"));
    }
    collect_files(dir, Path::new("src"), &mut paths)?;

    let mut files = Vec::with_capacity(paths.len());
    for rel in paths {
        let bytes = std::fs::read(dir.join(&rel)).with_context(|| format!("reading {}", rel.display()))?;
        files.push(BundleFile {
            path: rel.to_string_lossy().replace('\\', "/"),
            content: base64::engine::general_purpose::STANDARD.encode(bytes),
        });
    }
    Ok(Bundle { manifest, files })
}

fn collect_files(root: &Path, rel: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let abs = root.join(rel);
    if !abs.is_dir() {
        return Ok(());
    }
    let mut entries: Vec<_> = std::fs::read_dir(&abs)
        .with_context(|| format!("listing {}", abs.display()))?
        .collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let child = rel.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            collect_files(root, &child, out)?;
        } else {
            out.push(child);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scaffold(dir: &Path, manifest: &PluginManifest) {
        std::fs::write(dir.join("Cargo.toml"), "[package]\nname = \"x\"\n").unwrap();
        std::fs::create_dir_all(dir.join("src/sources")).unwrap();
        std::fs::write(dir.join("src/lib.rs"), "pub mod sources;\n").unwrap();
        std::fs::write(dir.join("src/sources/mod.rs"), "").unwrap();
        manifest.save(dir).unwrap();
    }

    #[test]
    fn test_lint_clean_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = PluginManifest::new("team-digest", None);
        manifest.sources = vec!["github-issues".to_string(), "slack".to_string()];
        scaffold(dir.path(), &manifest);

        assert!(lint(dir.path()).is_empty());
    }

    #[test]
    fn test_lint_reports_problems() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = PluginManifest::new("Team Digest", None);
        manifest.version = "1.0".to_string();
        manifest.sources = vec!["jira".to_string()];
        manifest.entry = "src/main.rs".to_string();
        scaffold(dir.path(), &manifest);

        let messages: Vec<String> = lint(dir.path()).into_iter().map(|i| i.message).collect();
        assert_eq!(messages.len(), 4, "{:?}", messages);
        assert!(messages[0].contains("team-digest"));
        assert!(messages[2].contains("jira"));
    }

    #[test]
    fn test_lint_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let issues = lint(dir.path());
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[1].path, MANIFEST_FILE);
    }

    #[test]
    fn test_relative_path() {
        assert!(relative_path("src/lib.rs").is_ok());
        assert!(relative_path("../escape.rs").is_err());
        assert!(relative_path("/etc/passwd").is_err());
        assert!(relative_path("").is_err());
    }

    #[test]
    fn test_bundle_collects_sources() {
        let dir = tempfile::tempdir().unwrap();
        scaffold(dir.path(), &PluginManifest::new("digest", None));
        std::fs::create_dir_all(dir.path().join("target")).unwrap();
        std::fs::write(dir.path().join("target/junk"), "x").unwrap();

        let bundle = bundle(dir.path()).unwrap();
        let paths: Vec<&str> = bundle.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["Cargo.toml", "plugin.json", "src/lib.rs", "src/sources/mod.rs"]);
        assert_eq!(bundle.files[2].content, "cHViIG1vZCBzb3VyY2VzOwo=");
    }
}
