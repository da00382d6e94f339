use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::CorralConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["corral.toml", "corral.yaml", "corral.yml", "corral.json"];

/// Load config from the given path (any supported format), then apply
/// `CORRAL_*` environment overrides.
pub fn load_config(path: &Path) -> anyhow::Result<CorralConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    let mut config = parse_config(&raw, path)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./corral.{toml,yaml,yml,json}`
/// 2. `~/.config/corral/corral.{toml,yaml,yml,json}`
///
/// Falls back to defaults (plus env overrides) when nothing is found or the
/// file does not parse.
pub fn discover_and_load() -> CorralConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    let mut config = CorralConfig::default();
    apply_env_overrides(&mut config);
    config
}

/// Find the first config file in standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
        .or_else(|| {
            let dir = config_dir()?;
            CONFIG_FILENAMES
                .iter()
                .map(|name| dir.join(name))
                .find(|p| p.exists())
        })
}

/// Returns the user-global config directory (`~/.config/corral/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "corral").map(|d| d.config_dir().to_path_buf())
}

/// Apply `CORRAL_DATABASE_URL` and `CORRAL_WORKERS` from the process environment.
pub fn apply_env_overrides(config: &mut CorralConfig) {
    apply_env_overrides_with(config, |name| std::env::var(name).ok());
}

fn apply_env_overrides_with(config: &mut CorralConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(url) = lookup("CORRAL_DATABASE_URL").filter(|v| !v.is_empty()) {
        config.database.url = url;
    }
    if let Some(raw) = lookup("CORRAL_WORKERS") {
        match raw.parse::<usize>() {
            Ok(workers) => config.dispatcher.workers = workers,
            Err(e) => warn!(value = %raw, error = %e, "ignoring invalid CORRAL_WORKERS"),
        }
    }
}

pub(crate) fn parse_config(raw: &str, path: &Path) -> anyhow::Result<CorralConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

/// Parse into an untyped tree, used by validation to spot unknown keys.
pub(crate) fn parse_config_value(raw: &str, path: &Path) -> anyhow::Result<serde_json::Value> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(serde_json::to_value(toml::from_str::<toml::Value>(raw)?)?),
        "yaml" | "yml" => Ok(serde_json::to_value(serde_yaml::from_str::<serde_yaml::Value>(
            raw,
        )?)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case("corral.toml", "[dispatcher]\nworkers = 7\n")]
    #[case("corral.yaml", "dispatcher:\n  workers: 7\n")]
    #[case("corral.json", "{\"dispatcher\": {\"workers\": 7}}")]
    fn loads_every_format(#[case] name: &str, #[case] body: &str) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        let cfg = parse_config(&std::fs::read_to_string(&path).unwrap(), &path).unwrap();
        assert_eq!(cfg.dispatcher.workers, 7);
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let err = parse_config("", Path::new("corral.ini")).unwrap_err();
        assert!(err.to_string().contains(".ini"));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_config(Path::new("/nonexistent/corral.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/corral.toml"));
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = CorralConfig::default();
        apply_env_overrides_with(&mut cfg, |name| match name {
            "CORRAL_DATABASE_URL" => Some("sqlite://other.db".into()),
            "CORRAL_WORKERS" => Some("12".into()),
            _ => None,
        });
        assert_eq!(cfg.database.url, "sqlite://other.db");
        assert_eq!(cfg.dispatcher.workers, 12);
    }

    #[test]
    fn invalid_worker_override_is_ignored() {
        let mut cfg = CorralConfig::default();
        apply_env_overrides_with(&mut cfg, |name| {
            (name == "CORRAL_WORKERS").then(|| "many".to_string())
        });
        assert_eq!(cfg.dispatcher.workers, 4);
    }
}
