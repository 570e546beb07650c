// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest priority.
/// Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. System-wide default
    paths.push(PathBuf::from("/etc/maestro/config.yaml"));
    paths.push(PathBuf::from("/etc/maestro/config.yml"));

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/maestro/config.yaml"));
        paths.push(home.join(".config/maestro/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("maestro/config.yaml"));
        paths.push(cfg.join("maestro/config.yml"));
    }

    // 3. Workspace-local
    paths.push(PathBuf::from(".maestro/config.yaml"));
    paths.push(PathBuf::from(".maestro/config.yml"));
    paths.push(PathBuf::from("maestro.yaml"));
    paths.push(PathBuf::from("maestro.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files.
/// The `extra` argument may provide an explicit path (e.g. `--config` CLI flag).
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    // Deserialize the merged YAML value into Config, falling back to defaults
    // when the merged value is empty (no config files found).
    let config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty()) {
        Config::default()
    } else {
        serde_yaml::from_value(merged).unwrap_or_default()
    };
    Ok(config)
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn val(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn merge_scalar_overrides() {
        let mut dst = val("limits:\n  max_active_executions: 64\n");
        merge_yaml(&mut dst, val("limits:\n  max_active_executions: 8\n"));
        let c: Config = serde_yaml::from_value(dst).unwrap();
        assert_eq!(c.limits.max_active_executions, 8);
    }

    #[test]
    fn merge_preserves_sibling_keys() {
        let mut dst = val("limits:\n  max_active_executions: 16\ncontext:\n  max_tokens: 1000\n");
        merge_yaml(&mut dst, val("context:\n  max_tokens: 2000\n"));
        let c: Config = serde_yaml::from_value(dst).unwrap();
        assert_eq!(c.limits.max_active_executions, 16);
        assert_eq!(c.context.max_tokens, 2000);
    }

    #[test]
    fn explicit_config_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("maestro.yaml");
        std::fs::write(&p, "limits:\n  execution_ttl_secs: 42\n").unwrap();
        let c = load(Some(&p)).unwrap();
        assert_eq!(c.limits.execution_ttl_secs, 42);
    }

    #[test]
    fn missing_files_fall_back_to_defaults() {
        // No explicit path and (in the test environment) no system config:
        // the result must be a fully-defaulted Config rather than an error.
        let c = load(None).unwrap();
        assert!(c.limits.max_active_executions >= 1);
    }
}
