//! Client configuration for the command line
//!
//! Settings come from an optional TOML file, then `--set key=value`
//! overrides, then `--seeds`. The result is validated before use.

use anyhow::{bail, Context, Result};
use phloem_cluster::config::parse_seeds;
use phloem_cluster::ClusterConfig;
use std::path::Path;

/// Where the CLI reads its settings from
#[derive(Debug, Default, Clone)]
pub struct ConfigSources<'a> {
    pub file: Option<&'a Path>,
    pub overrides: &'a [String],
    pub seeds: Option<&'a str>,
}

/// Build the client configuration from all sources
pub fn load(sources: &ConfigSources<'_>) -> Result<ClusterConfig> {
    let mut value = match sources.file {
        Some(path) => read_file(path)?,
        None => toml::Value::Table(Default::default()),
    };

    for override_str in sources.overrides {
        let (key, val) = parse_key_value(override_str)
            .with_context(|| format!("Invalid override format: {override_str}"))?;
        set_key(&mut value, &key, &val)
            .with_context(|| format!("Failed to apply override: {override_str}"))?;
    }

    if let Some(seeds) = sources.seeds {
        let seeds = parse_seeds(seeds).with_context(|| format!("Invalid --seeds: {seeds}"))?;
        set_toml(
            &mut value,
            "seeds",
            toml::Value::Array(seeds.iter().map(|s| toml::Value::String(s.to_string())).collect()),
        )?;
    }

    let config: ClusterConfig =
        value.try_into().context("Failed to deserialize cluster configuration")?;
    config.validate().context("Invalid cluster configuration")?;
    Ok(config)
}

fn read_file(path: &Path) -> Result<toml::Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse a "key=value" string into (key, value)
fn parse_key_value(override_str: &str) -> Result<(String, String)> {
    match override_str.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => bail!("Invalid override format '{override_str}'. Expected 'key=value'"),
    }
}

fn set_key(root: &mut toml::Value, key: &str, value_str: &str) -> Result<()> {
    if key.contains('.') {
        bail!("Cluster settings have no nested sections: '{key}'");
    }
    set_toml(root, key, parse_value(value_str)?)
}

fn set_toml(root: &mut toml::Value, key: &str, value: toml::Value) -> Result<()> {
    let toml::Value::Table(table) = root else {
        bail!("Configuration root is not a table");
    };
    table.insert(key.to_string(), value);
    Ok(())
}

/// Parse a string value with type inference
fn parse_value(value_str: &str) -> Result<toml::Value> {
    let trimmed = value_str.trim();

    match trimmed {
        "true" => return Ok(toml::Value::Boolean(true)),
        "false" => return Ok(toml::Value::Boolean(false)),
        _ => {}
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Ok(toml::Value::Integer(int_val));
    }

    if trimmed.starts_with('[') && trimmed.ends_with(']') {
        let array_toml = format!("value = {trimmed}");
        if let Ok(toml::Value::Table(mut table)) = toml::from_str::<toml::Value>(&array_toml) {
            if let Some(value) = table.remove("value") {
                return Ok(value);
            }
        }
        bail!("Failed to parse array: {trimmed}");
    }

    // everything else is a string, quotes optional
    let string_val = if trimmed.len() >= 2
        && ((trimmed.starts_with('"') && trimmed.ends_with('"'))
            || (trimmed.starts_with('\'') && trimmed.ends_with('\'')))
    {
        &trimmed[1..trimmed.len() - 1]
    } else {
        trimmed
    };
    Ok(toml::Value::String(string_val.to_string()))
}
