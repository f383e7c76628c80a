//! Flag, then `PLACY_*` environment variable, then default.

use anyhow::{Context, Result};
use serde_json::Value;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::charset::Charset;
use crate::cli::Cli;
use crate::placeholder::PlaceholderMap;
use crate::pool::PoolSizing;
use crate::stamp::StampConfig;

pub const ENV_THREADS: &str = "PLACY_THREADS";
pub const ENV_NESTED: &str = "PLACY_NESTED";
pub const ENV_MAX_DEPTH: &str = "PLACY_MAX_DEPTH";
pub const ENV_TASK_TIMEOUT_SECS: &str = "PLACY_TASK_TIMEOUT_SECS";
pub const ENV_CACHE_CAPACITY: &str = "PLACY_CACHE_CAPACITY";
pub const ENV_PLACEHOLDERS: &str = "PLACY_PLACEHOLDERS";

/// Per-invocation switches of the `stamp` command that feed the engine configuration.
#[derive(Debug, Clone, Default)]
pub struct StampOverrides {
    pub nested: bool,
    pub max_depth: Option<usize>,
    pub charset: Option<String>,
}

pub fn resolve_stamp_config(cli: &Cli, overrides: &StampOverrides) -> Result<StampConfig> {
    resolve_stamp_config_with(cli, overrides, |key| env::var(key).ok())
}

fn resolve_stamp_config_with(
    cli: &Cli,
    overrides: &StampOverrides,
    env: impl Fn(&str) -> Option<String>,
) -> Result<StampConfig> {
    let mut config = StampConfig::default();

    let threads = match cli.threads {
        Some(n) => Some(n),
        None => parse_env(&env, ENV_THREADS)?,
    };
    if let Some(n) = threads {
        config.pool.sizing = PoolSizing::Fixed(n);
    }
    if let Some(secs) = parse_env::<u64>(&env, ENV_TASK_TIMEOUT_SECS)? {
        config.pool.task_timeout = Duration::from_secs(secs.max(1));
    }
    if let Some(capacity) = parse_env(&env, ENV_CACHE_CAPACITY)? {
        config.cache.capacity = capacity;
    }

    config.archive.nested = overrides.nested || parse_env(&env, ENV_NESTED)?.unwrap_or(false);
    if let Some(depth) = overrides.max_depth {
        config.archive.max_depth = depth;
    } else if let Some(depth) = parse_env(&env, ENV_MAX_DEPTH)? {
        config.archive.max_depth = depth;
    }

    if let Some(label) = &overrides.charset {
        config.charset = Some(Charset::for_label(label)?);
    }
    Ok(config)
}

fn parse_env<T>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = env(key) else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<T>()
        .map(Some)
        .map_err(|e| anyhow::anyhow!("invalid {key}={raw}: {e}"))
}

/// The placeholder file in effect, if any: `--placeholders`, then `PLACY_PLACEHOLDERS`, then
/// `<config dir>/placy/placeholders.json` when it exists.
pub fn resolve_placeholders_path(cli: &Cli) -> Option<PathBuf> {
    if let Some(p) = cli.placeholders.clone() {
        return Some(p);
    }
    if let Ok(p) = env::var(ENV_PLACEHOLDERS)
        && !p.is_empty()
    {
        return Some(PathBuf::from(p));
    }
    default_placeholders_path().filter(|p| p.exists())
}

pub fn default_placeholders_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("placy").join("placeholders.json"))
}

/// Builds the placeholder map: the file's pairs in file order, then `set` pairs, which
/// override duplicates.
pub fn resolve_placeholders(cli: &Cli, set: &[(String, String)]) -> Result<PlaceholderMap> {
    let mut map = match resolve_placeholders_path(cli) {
        Some(path) => load_placeholders(&path)?,
        None => PlaceholderMap::new(),
    };
    map.extend(set.iter().cloned());
    Ok(map)
}

pub fn load_placeholders(path: &Path) -> Result<PlaceholderMap> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read placeholder file: {}", path.display()))?;
    parse_placeholders(&raw)
        .with_context(|| format!("Invalid placeholder file: {}", path.display()))
}

/// Parses a JSON object of placeholder pairs, keeping the file's key order. Numbers and
/// booleans are taken as their JSON text.
pub fn parse_placeholders(raw: &str) -> Result<PlaceholderMap> {
    let value: Value = serde_json::from_str(raw)?;
    let Value::Object(object) = value else {
        anyhow::bail!("expected a JSON object of placeholder pairs");
    };
    let mut map = PlaceholderMap::new();
    for (key, value) in object {
        let value = match value {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            other => anyhow::bail!("value of {key} must be a string, got {other}"),
        };
        map.insert(key, value);
    }
    Ok(map)
}
