use anyhow::{Context as _, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub store_url: Option<String>,
    pub store_token: Option<String>,
    pub synth_url: Option<String>,
    pub repair_url: Option<String>,
    pub api_key: Option<String>,
    pub cache_capacity: Option<usize>,
    pub rate_limit: Option<u64>,
    pub rate_window_secs: Option<u64>,
    pub heal_max_attempts: Option<u32>,
    pub presentation_delay_ms: Option<u64>,
    pub verbose: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EnvConfig {
    pub store_url: Option<String>,
    pub store_token: Option<String>,
    pub synth_url: Option<String>,
    pub repair_url: Option<String>,
    pub api_key: Option<String>,
    pub cache_capacity: Option<usize>,
    pub rate_limit: Option<u64>,
    pub rate_window_secs: Option<u64>,
    pub heal_max_attempts: Option<u32>,
    pub presentation_delay_ms: Option<u64>,
    pub verbose: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CliOverrides {
    pub synth_url: Option<String>,
    pub repair_url: Option<String>,
    pub api_key: Option<String>,
    pub cache_capacity: Option<usize>,
    pub rate_limit: Option<u64>,
    pub verbose: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub store_url: Option<String>,
    pub store_token: Option<String>,
    pub synth_url: String,
    pub repair_url: String,
    pub api_key: Option<String>,
    pub cache_capacity: usize,
    pub rate_limit: u64,
    pub rate_window_secs: u64,
    pub heal_max_attempts: u32,
    pub presentation_delay_ms: u64,
    pub verbose: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store_url: None,
            store_token: None,
            synth_url: "http://127.0.0.1:8787/api/generate-code".to_string(),
            repair_url: "http://127.0.0.1:8787/api/fix-code".to_string(),
            api_key: None,
            cache_capacity: 24,
            rate_limit: 10,
            rate_window_secs: 60,
            heal_max_attempts: 3,
            presentation_delay_ms: 2_500,
            verbose: false,
        }
    }
}

pub fn load_file_config(explicit_path: Option<&Path>, cwd: &Path) -> Result<Option<FileConfig>> {
    let path = match explicit_path {
        Some(p) => p.to_path_buf(),
        None => {
            let candidate = cwd.join("mage.json");
            if !candidate.exists() {
                return Ok(None);
            }
            candidate
        }
    };

    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed reading config file {}", path.display()))?;
    let parsed: FileConfig = serde_json::from_str(&raw)
        .with_context(|| format!("failed parsing config file {}", path.display()))?;
    Ok(Some(parsed))
}

impl EnvConfig {
    pub fn from_current_env() -> Self {
        Self {
            store_url: env::var("MAGE_STORE_URL").ok(),
            store_token: env::var("MAGE_STORE_TOKEN").ok(),
            synth_url: env::var("MAGE_SYNTH_URL").ok(),
            repair_url: env::var("MAGE_REPAIR_URL").ok(),
            api_key: env::var("MAGE_API_KEY").ok(),
            cache_capacity: env::var("MAGE_CACHE_CAPACITY")
                .ok()
                .and_then(|v| v.trim().parse().ok()),
            rate_limit: env::var("MAGE_RATE_LIMIT")
                .ok()
                .and_then(|v| v.trim().parse().ok()),
            rate_window_secs: env::var("MAGE_RATE_WINDOW")
                .ok()
                .and_then(|v| v.trim().parse().ok()),
            heal_max_attempts: env::var("MAGE_HEAL_ATTEMPTS")
                .ok()
                .and_then(|v| v.trim().parse().ok()),
            presentation_delay_ms: env::var("MAGE_PRESENT_DELAY_MS")
                .ok()
                .and_then(|v| v.trim().parse().ok()),
            verbose: env::var("MAGE_VERBOSE").ok().and_then(|v| parse_bool(&v)),
        }
    }
}

pub fn resolve_settings(
    cli: &CliOverrides,
    env_cfg: &EnvConfig,
    file_cfg: Option<&FileConfig>,
) -> Settings {
    let base = Settings::default();

    let store_url = env_cfg
        .store_url
        .clone()
        .or_else(|| file_cfg.and_then(|c| c.store_url.clone()))
        .or(base.store_url);

    let store_token = env_cfg
        .store_token
        .clone()
        .or_else(|| file_cfg.and_then(|c| c.store_token.clone()))
        .or(base.store_token);

    let synth_url = cli
        .synth_url
        .clone()
        .or_else(|| env_cfg.synth_url.clone())
        .or_else(|| file_cfg.and_then(|c| c.synth_url.clone()))
        .unwrap_or(base.synth_url);

    let repair_url = cli
        .repair_url
        .clone()
        .or_else(|| env_cfg.repair_url.clone())
        .or_else(|| file_cfg.and_then(|c| c.repair_url.clone()))
        .unwrap_or(base.repair_url);

    let api_key = cli
        .api_key
        .clone()
        .or_else(|| env_cfg.api_key.clone())
        .or_else(|| file_cfg.and_then(|c| c.api_key.clone()))
        .or(base.api_key);

    let cache_capacity = cli
        .cache_capacity
        .or(env_cfg.cache_capacity)
        .or(file_cfg.and_then(|c| c.cache_capacity))
        .unwrap_or(base.cache_capacity);

    let rate_limit = cli
        .rate_limit
        .or(env_cfg.rate_limit)
        .or(file_cfg.and_then(|c| c.rate_limit))
        .unwrap_or(base.rate_limit);

    let rate_window_secs = env_cfg
        .rate_window_secs
        .or(file_cfg.and_then(|c| c.rate_window_secs))
        .unwrap_or(base.rate_window_secs);

    let heal_max_attempts = env_cfg
        .heal_max_attempts
        .or(file_cfg.and_then(|c| c.heal_max_attempts))
        .unwrap_or(base.heal_max_attempts);

    let presentation_delay_ms = env_cfg
        .presentation_delay_ms
        .or(file_cfg.and_then(|c| c.presentation_delay_ms))
        .unwrap_or(base.presentation_delay_ms);

    let verbose = cli
        .verbose
        .or(env_cfg.verbose)
        .or(file_cfg.and_then(|c| c.verbose))
        .unwrap_or(base.verbose);

    Settings {
        store_url,
        store_token,
        synth_url,
        repair_url,
        api_key,
        cache_capacity,
        rate_limit,
        rate_window_secs,
        heal_max_attempts,
        presentation_delay_ms,
        verbose,
    }
}

fn parse_bool(input: &str) -> Option<bool> {
    match input.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{CliOverrides, EnvConfig, FileConfig, load_file_config, resolve_settings};
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn valid_config_parses() {
        let dir = tempdir().expect("tempdir should work");
        let path = dir.path().join("mage.json");
        fs::write(&path, r#"{"rate_limit":5,"verbose":true}"#).expect("write should work");

        let parsed = load_file_config(None, dir.path())
            .expect("parse should work")
            .expect("file should exist");
        assert_eq!(parsed.rate_limit, Some(5));
        assert_eq!(parsed.verbose, Some(true));
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempdir().expect("tempdir should work");
        let parsed = load_file_config(None, dir.path()).expect("load should work");
        assert!(parsed.is_none());
    }

    #[test]
    fn unknown_field_is_rejected() {
        let dir = tempdir().expect("tempdir should work");
        let path = dir.path().join("mage.json");
        fs::write(&path, r#"{"unknown":1}"#).expect("write should work");

        let err = load_file_config(None, dir.path()).expect_err("parse should fail");
        assert!(format!("{err:#}").contains("unknown field"));
    }

    #[test]
    fn malformed_json_has_location() {
        let dir = tempdir().expect("tempdir should work");
        let path = dir.path().join("mage.json");
        fs::write(&path, "{\n  \"rate_limit\":\n").expect("write should work");

        let err = load_file_config(None, dir.path()).expect_err("parse should fail");
        assert!(
            format!("{err:#}").contains("line") || format!("{err:#}").contains("column"),
            "expected location details, got: {err}"
        );
    }

    #[test]
    fn precedence_cli_env_file_defaults() {
        let file = FileConfig {
            rate_limit: Some(2),
            cache_capacity: Some(4),
            synth_url: Some("http://file.example/generate".to_string()),
            ..FileConfig::default()
        };

        let env_cfg = EnvConfig {
            rate_limit: Some(5),
            synth_url: Some("http://env.example/generate".to_string()),
            ..EnvConfig::default()
        };

        let cli = CliOverrides {
            synth_url: Some("http://cli.example/generate".to_string()),
            ..CliOverrides::default()
        };

        let resolved = resolve_settings(&cli, &env_cfg, Some(&file));
        assert_eq!(resolved.synth_url, "http://cli.example/generate");
        assert_eq!(resolved.rate_limit, 5);
        assert_eq!(resolved.cache_capacity, 4);
        assert_eq!(resolved.rate_window_secs, 60);
    }
}
