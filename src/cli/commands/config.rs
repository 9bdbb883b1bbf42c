//! Config command - show or edit configuration

use crate::cache::HashAlgorithm;
use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::config::schema::CorruptionPolicy;
use crate::config::{Config, ConfigManager};
use crate::error::{CacheError, CacheResult};
use crate::ui::{self, UiContext};
use std::path::PathBuf;

/// Keys accepted by `config set`
const VALID_KEYS: &[&str] = &[
    "general.log_format",
    "general.activity_log",
    "cache.enabled",
    "cache.path",
    "cache.hash_algorithm",
    "cache.ttl_days",
    "cache.preserve_on_exit",
    "cache.max_total_mb",
    "cache.lock_timeout_secs",
    "cache.on_corruption",
    "remote.root",
];

/// Execute the config command
pub async fn execute(
    args: ConfigArgs,
    manager: &ConfigManager,
    config: &Config,
) -> CacheResult<()> {
    match args.action {
        None | Some(ConfigAction::Show) => show_config(config),
        Some(ConfigAction::Path) => {
            println!("{}", manager.path().display());
            Ok(())
        }
        Some(ConfigAction::Init { force }) => init_config(manager, force).await,
        Some(ConfigAction::Set { key, value }) => set_value(manager, config, &key, &value).await,
    }
}

fn show_config(config: &Config) -> CacheResult<()> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

async fn init_config(manager: &ConfigManager, force: bool) -> CacheResult<()> {
    let ctx = UiContext::detect();
    let path = manager.path();

    if path.exists() && !force {
        ui::step_warn_hint(
            &ctx,
            &format!("Config already exists at {}", path.display()),
            "Use --force to overwrite",
        );
        return Ok(());
    }

    manager.save(&Config::default()).await?;
    ui::step_ok_detail(&ctx, "Configuration initialized", &path.display().to_string());
    Ok(())
}

async fn set_value(
    manager: &ConfigManager,
    config: &Config,
    key: &str,
    value: &str,
) -> CacheResult<()> {
    let ctx = UiContext::detect();
    let mut config = config.clone();

    if let Err(e) = apply(&mut config, key, value) {
        if !VALID_KEYS.contains(&key) {
            ui::step_error_detail(&ctx, "Unknown config key", key);
            eprintln!("Valid keys:");
            for valid in VALID_KEYS {
                eprintln!("  {}", valid);
            }
        }
        return Err(e);
    }

    manager.save(&config).await?;
    ui::step_ok(&ctx, &format!("Set {} = {}", key, value));
    Ok(())
}

/// Apply one dotted key to a config
fn apply(config: &mut Config, key: &str, value: &str) -> CacheResult<()> {
    let parts: Vec<&str> = key.split('.').collect();

    match parts.as_slice() {
        ["general", "log_format"] => {
            config.general.log_format = match value {
                "text" | "json" => value.to_string(),
                _ => {
                    return Err(CacheError::User(format!(
                        "Invalid log format: {}. Use text or json",
                        value
                    )))
                }
            }
        }
        ["general", "activity_log"] => config.general.activity_log = parse_bool(value)?,

        ["cache", "enabled"] => config.cache.enabled = parse_bool(value)?,
        ["cache", "path"] => config.cache.path = parse_optional_path(value),
        ["cache", "hash_algorithm"] => {
            config.cache.hash_algorithm = value.parse::<HashAlgorithm>()?
        }
        ["cache", "ttl_days"] => config.cache.ttl_days = parse_number(value)?,
        ["cache", "preserve_on_exit"] => config.cache.preserve_on_exit = parse_bool(value)?,
        ["cache", "max_total_mb"] => config.cache.max_total_mb = parse_number(value)?,
        ["cache", "lock_timeout_secs"] => config.cache.lock_timeout_secs = parse_number(value)?,
        ["cache", "on_corruption"] => {
            config.cache.on_corruption = match value.to_lowercase().as_str() {
                "fail" => CorruptionPolicy::Fail,
                "bypass" => CorruptionPolicy::Bypass,
                _ => {
                    return Err(CacheError::User(format!(
                        "Invalid corruption policy: {}. Use fail or bypass",
                        value
                    )))
                }
            }
        }

        ["remote", "root"] => config.remote.root = parse_optional_path(value),

        _ => return Err(CacheError::User(format!("Unknown config key: {}", key))),
    }
    Ok(())
}

fn parse_bool(value: &str) -> CacheResult<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(CacheError::User(format!(
            "Invalid boolean value: {}. Use true/false",
            value
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(value: &str) -> CacheResult<T> {
    value
        .parse()
        .map_err(|_| CacheError::User(format!("Invalid number: {}", value)))
}

/// Empty string resets the path to its platform default
fn parse_optional_path(value: &str) -> Option<PathBuf> {
    if value.is_empty() {
        None
    } else {
        Some(PathBuf::from(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_sets_cache_keys() {
        let mut config = Config::default();
        apply(&mut config, "cache.ttl_days", "3").unwrap();
        apply(&mut config, "cache.hash_algorithm", "sha512").unwrap();
        apply(&mut config, "cache.on_corruption", "bypass").unwrap();
        apply(&mut config, "cache.preserve_on_exit", "no").unwrap();

        assert_eq!(config.cache.ttl_days, 3);
        assert_eq!(config.cache.hash_algorithm, HashAlgorithm::Sha512);
        assert_eq!(config.cache.on_corruption, CorruptionPolicy::Bypass);
        assert!(!config.cache.preserve_on_exit);
    }

    #[test]
    fn apply_resets_path_with_empty_value() {
        let mut config = Config::default();
        apply(&mut config, "cache.path", "/tmp/c.db").unwrap();
        assert_eq!(config.cache.path, Some(PathBuf::from("/tmp/c.db")));
        apply(&mut config, "cache.path", "").unwrap();
        assert_eq!(config.cache.path, None);
    }

    #[test]
    fn apply_rejects_bad_values() {
        let mut config = Config::default();
        assert!(apply(&mut config, "cache.ttl_days", "soon").is_err());
        assert!(apply(&mut config, "general.log_format", "xml").is_err());
        assert!(apply(&mut config, "cache.nope", "1").is_err());
    }

    #[test]
    fn every_valid_key_is_settable() {
        let samples = [
            ("general.log_format", "json"),
            ("general.activity_log", "false"),
            ("cache.enabled", "true"),
            ("cache.path", "/tmp/x.db"),
            ("cache.hash_algorithm", "sha256"),
            ("cache.ttl_days", "1"),
            ("cache.preserve_on_exit", "true"),
            ("cache.max_total_mb", "10"),
            ("cache.lock_timeout_secs", "5"),
            ("cache.on_corruption", "fail"),
            ("remote.root", "/tmp/remote"),
        ];
        assert_eq!(samples.len(), VALID_KEYS.len());
        let mut config = Config::default();
        for (key, value) in samples {
            assert!(VALID_KEYS.contains(&key));
            apply(&mut config, key, value).unwrap();
        }
    }
}
