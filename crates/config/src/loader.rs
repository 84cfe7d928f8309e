use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{env_subst::substitute_env, schema::CqlinkConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["cqlink.toml", "cqlink.yaml", "cqlink.yml", "cqlink.json"];

/// Load and validate config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<CqlinkConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let config = parse_config(&substitute_env(&raw), path)?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display()))?;
    Ok(config)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./cqlink.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/cqlink/cqlink.{toml,yaml,yml,json}` (user-global)
///
/// Falls back to `CqlinkConfig::default()` when no file exists. A file that
/// exists but cannot be loaded is an error. Also returns the path used.
pub fn discover_and_load() -> anyhow::Result<(Option<PathBuf>, CqlinkConfig)> {
    load_first(candidate_paths())
}

/// Load the first existing file among `candidates`, or defaults when none
/// exists.
fn load_first(
    candidates: impl IntoIterator<Item = PathBuf>,
) -> anyhow::Result<(Option<PathBuf>, CqlinkConfig)> {
    match candidates.into_iter().find(|p| p.exists()) {
        Some(path) => {
            debug!(path = %path.display(), "loading config");
            let cfg = load_config(&path)?;
            Ok((Some(path), cfg))
        },
        None => Ok((None, CqlinkConfig::default())),
    }
}

/// Standard config locations, in search order.
fn candidate_paths() -> impl Iterator<Item = PathBuf> {
    let local = CONFIG_FILENAMES.iter().map(PathBuf::from);
    let global = config_dir()
        .into_iter()
        .flat_map(|dir| CONFIG_FILENAMES.iter().map(move |name| dir.join(name)));
    local.chain(global)
}

/// Returns the user-global config directory (`~/.config/cqlink/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "cqlink").map(|d| d.config_dir().to_path_buf())
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<CqlinkConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

/// Parse `raw` as if read from `path`, resolving placeholders with `lookup`.
#[cfg(test)]
fn parse_with_env(
    raw: &str,
    path: &Path,
    lookup: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<CqlinkConfig> {
    parse_config(&crate::env_subst::substitute_env_with(raw, lookup), path)
}
