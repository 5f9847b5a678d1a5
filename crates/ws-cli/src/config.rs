//! TOML-backed CLI configuration. Wraps `ws_core::Config` with a resolved
//! on-disk path the way the reference CLI's own config loader resolves
//! `dirs::config_dir()` — search order is `--config <path>`, then
//! `$WORKSPACE_CONFIG`, then `<config_dir>/workspaced/config.toml`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use ws_core::Config;

pub fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }
    if let Ok(p) = std::env::var("WORKSPACE_CONFIG") {
        return Ok(PathBuf::from(p));
    }
    let dir = dirs::config_dir().context("could not determine config directory")?.join("workspaced");
    Ok(dir.join("config.toml"))
}

pub fn load(explicit: Option<&Path>) -> Result<Config> {
    let path = resolve_path(explicit)?;
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(&path).with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("failed to parse config file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.toml");
        let cfg = load(Some(&path)).unwrap();
        assert_eq!(cfg.backend, ws_core::config::Backend::Filesystem);
    }

    #[test]
    fn invalid_toml_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "not valid toml [[[").unwrap();
        assert!(load(Some(&path)).is_err());
    }
}
