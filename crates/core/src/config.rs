//! Config persistence: render tool path, default concurrency, and
//! default network endpoint, stored under the XDG config directory
//! with `#[serde(default)]` fields and an atomic write (temp file +
//! rename).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Persisted defaults consumed by the core (render tool path, default
/// concurrency, default network endpoint). GUI-only fields such as
/// recent-projects lists, format presets, and an update-check flag are
/// not modeled here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderFarmConfig {
    #[serde(default = "default_render_tool_path")]
    pub render_tool_path: PathBuf,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_network_port")]
    pub network_port: u16,
    #[serde(default = "default_master_host")]
    pub network_master_host: String,
}

fn default_render_tool_path() -> PathBuf {
    PathBuf::new()
}

fn default_max_concurrent() -> usize {
    1
}

fn default_network_port() -> u16 {
    5580
}

fn default_master_host() -> String {
    "localhost".to_string()
}

impl Default for RenderFarmConfig {
    fn default() -> Self {
        Self {
            render_tool_path: default_render_tool_path(),
            max_concurrent: default_max_concurrent(),
            network_port: default_network_port(),
            network_master_host: default_master_host(),
        }
    }
}

fn xdg_config_home() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("XDG_CONFIG_HOME is set but empty");
        }
        return Ok(dir);
    }
    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".config"))
}

/// Path to the persisted config file.
pub fn config_path() -> anyhow::Result<PathBuf> {
    Ok(xdg_config_home()?.join("renderfarm").join("config.json"))
}

fn xdg_data_home() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_DATA_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("XDG_DATA_HOME is set but empty");
        }
        return Ok(dir);
    }
    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".local").join("share"))
}

/// The known user-data location under which synthesized render-tool
/// log files are written (spec.md §4.2 precondition 3). Falls back to
/// the system temp directory if no home/XDG data dir can be resolved,
/// so log synthesis never blocks a render.
pub fn log_dir() -> PathBuf {
    xdg_data_home()
        .map(|dir| dir.join("renderfarm").join("logs"))
        .unwrap_or_else(|_| std::env::temp_dir().join("renderfarm").join("logs"))
}

/// Load the config, or `None` if no config file exists yet.
pub fn load_config() -> anyhow::Result<Option<RenderFarmConfig>> {
    let path = config_path()?;
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&path)?;
    Ok(Some(serde_json::from_str(&raw)?))
}

/// Save the config atomically (write to a temp file, then rename).
pub fn save_config(config: &RenderFarmConfig) -> anyhow::Result<()> {
    let path = config_path()?;
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid config path: {}", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let json = serde_json::to_string_pretty(config)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sensible_values() {
        let cfg = RenderFarmConfig::default();
        assert_eq!(cfg.max_concurrent, 1);
        assert_eq!(cfg.network_port, 5580);
        assert_eq!(cfg.network_master_host, "localhost");
    }

    #[test]
    fn missing_fields_fall_back_to_defaults_on_load() {
        let cfg: RenderFarmConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.max_concurrent, 1);
        assert_eq!(cfg.network_port, 5580);
    }

    #[test]
    fn save_then_load_round_trips_via_xdg_config_home() {
        let dir = tempfile::tempdir().unwrap();
        // SAFETY-equivalent: test-only env mutation, single-threaded per test binary section.
        unsafe {
            std::env::set_var("XDG_CONFIG_HOME", dir.path());
        }
        let mut cfg = RenderFarmConfig::default();
        cfg.max_concurrent = 4;
        save_config(&cfg).unwrap();
        let loaded = load_config().unwrap().expect("config should exist");
        assert_eq!(loaded.max_concurrent, 4);
        unsafe {
            std::env::remove_var("XDG_CONFIG_HOME");
        }
    }
}
