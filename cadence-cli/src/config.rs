//! Profile files for cadence
//!
//! A profile is a TOML file with a `[server]` section for `cadence serve` and a
//! `[client]` section for `cadence send`. Every field has a default, so a
//! profile only needs the values it changes, and any value can be overridden
//! from the command line with `--set section.key=value`.

use anyhow::{bail, Context, Result};
use cadence_core::{ClientSettings, ServerSettings};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level profile configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct ProfileConfig {
    /// Profile name, used in logs
    pub name: Option<String>,
    /// Optional description
    pub description: Option<String>,
    pub server: ServerSettings,
    pub client: ClientSettings,
    pub output: OutputConfig,
}

/// Output configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct OutputConfig {
    /// Output format: human, json
    pub format: String,
    /// File receiving JSON results
    pub file: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self { format: "human".to_string(), file: None }
    }
}

impl ProfileConfig {
    /// Load profile from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ProfileConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load profile from TOML file with --set style overrides
    pub fn from_file_with_overrides<P: AsRef<Path>>(path: P, overrides: &[String]) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let value: toml::Value = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Self::from_value_with_overrides(value, overrides)
    }

    /// Profile built from defaults and `--set` overrides only
    pub fn from_overrides(overrides: &[String]) -> Result<Self> {
        Self::from_value_with_overrides(toml::Value::Table(Default::default()), overrides)
    }

    /// Load an optional profile and apply overrides
    pub fn load(path: Option<&Path>, overrides: &[String]) -> Result<Self> {
        match path {
            Some(path) => Self::from_file_with_overrides(path, overrides),
            None => Self::from_overrides(overrides),
        }
    }

    fn from_value_with_overrides(mut value: toml::Value, overrides: &[String]) -> Result<Self> {
        for override_str in overrides {
            let (key, val) = parse_key_value(override_str)
                .with_context(|| format!("Invalid override format: {}", override_str))?;

            set_toml_path(&mut value, &key, &val)
                .with_context(|| format!("Failed to apply override: {}", override_str))?;
        }

        let config: ProfileConfig =
            value.try_into().with_context(|| "Failed to deserialize modified configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.name {
            if name.is_empty() {
                bail!("Profile name cannot be empty");
            }
        }
        self.server.validate().context("Invalid [server] section")?;
        self.client.validate().context("Invalid [client] section")?;

        let valid_formats = ["human", "json"];
        if !valid_formats.contains(&self.output.format.as_str()) {
            bail!(
                "Invalid output format '{}'. Valid options: {}",
                self.output.format,
                valid_formats.join(", ")
            );
        }
        if self.output.format == "json" && self.output.file.is_none() {
            bail!("JSON output requires output.file");
        }
        Ok(())
    }
}

/// Parse a "key=value" string into (key, value) tuple
pub fn parse_key_value(override_str: &str) -> Result<(String, String)> {
    let Some((key, value)) = override_str.split_once('=') else {
        bail!("Invalid override format '{}'. Expected 'key=value'", override_str);
    };
    if key.trim().is_empty() {
        bail!("Empty key in override '{}'", override_str);
    }
    Ok((key.trim().to_string(), value.to_string()))
}

/// Set a value in TOML using dot-notation path
pub fn set_toml_path(root: &mut toml::Value, path: &str, value_str: &str) -> Result<()> {
    let parts = parse_path(path);
    if parts.is_empty() {
        bail!("Empty path");
    }

    let mut current = root;
    for (i, part) in parts.iter().enumerate() {
        let is_last = i == parts.len() - 1;

        match part {
            PathSegment::Key(key) => {
                let toml::Value::Table(table) = current else {
                    bail!("Cannot set key '{}' on non-table value", key);
                };
                if is_last {
                    table.insert(key.clone(), parse_value(value_str)?);
                    return Ok(());
                }
                // Missing sections are created, so `--set server.histogram.bincount=50`
                // works without a [server.histogram] table in the profile
                current =
                    table.entry(key.clone()).or_insert(toml::Value::Table(Default::default()));
            }
            PathSegment::Index(idx) => {
                let toml::Value::Array(arr) = current else {
                    bail!("Cannot index non-array value");
                };
                let len = arr.len();
                let Some(slot) = arr.get_mut(*idx) else {
                    bail!("Array index {} out of bounds (length: {})", idx, len);
                };
                if is_last {
                    *slot = parse_value(value_str)?;
                    return Ok(());
                }
                current = slot;
            }
            PathSegment::Append => {
                if !is_last {
                    bail!("Append operation '+' can only be at the end of path");
                }
                let toml::Value::Array(arr) = current else {
                    bail!("Cannot append to non-array value");
                };
                arr.push(parse_value(value_str)?);
                return Ok(());
            }
        }
    }

    Ok(())
}

/// Path segment types
#[derive(Debug, PartialEq)]
enum PathSegment {
    Key(String),
    Index(usize),
    Append,
}

/// Parse a path string into segments (handles "key", "0", "+")
fn parse_path(path: &str) -> Vec<PathSegment> {
    path.split('.')
        .filter(|part| !part.is_empty())
        .map(|part| {
            if part == "+" {
                PathSegment::Append
            } else if let Ok(idx) = part.parse::<usize>() {
                PathSegment::Index(idx)
            } else {
                PathSegment::Key(part.to_string())
            }
        })
        .collect()
}

/// Parse a string value with type inference
pub fn parse_value(value_str: &str) -> Result<toml::Value> {
    let trimmed = value_str.trim();

    if trimmed == "true" {
        return Ok(toml::Value::Boolean(true));
    }
    if trimmed == "false" {
        return Ok(toml::Value::Boolean(false));
    }

    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Ok(toml::Value::Integer(int_val));
    }

    if let Ok(float_val) = trimmed.parse::<f64>() {
        return Ok(toml::Value::Float(float_val));
    }

    // Arrays and inline tables go through the TOML parser
    let bracketed = (trimmed.starts_with('[') && trimmed.ends_with(']'))
        || (trimmed.starts_with('{') && trimmed.ends_with('}'));
    if bracketed {
        let wrapped = format!("value = {}", trimmed);
        if let Ok(toml::Value::Table(mut table)) = toml::from_str::<toml::Value>(&wrapped) {
            if let Some(value) = table.remove("value") {
                return Ok(value);
            }
        }
        bail!("Failed to parse value: {}", trimmed);
    }

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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_path() {
        assert_eq!(
            parse_path("server.ack.rounds"),
            vec![
                PathSegment::Key("server".into()),
                PathSegment::Key("ack".into()),
                PathSegment::Key("rounds".into())
            ]
        );
        assert_eq!(
            parse_path("a.0.+"),
            vec![PathSegment::Key("a".into()), PathSegment::Index(0), PathSegment::Append]
        );
        assert!(parse_path("").is_empty());
    }

    #[test]
    fn test_parse_value_types() {
        assert_eq!(parse_value("true").unwrap(), toml::Value::Boolean(true));
        assert_eq!(parse_value("42").unwrap(), toml::Value::Integer(42));
        assert_eq!(parse_value("2.5").unwrap(), toml::Value::Float(2.5));
        assert_eq!(parse_value("500ms").unwrap(), toml::Value::String("500ms".into()));
        assert_eq!(parse_value("'quoted'").unwrap(), toml::Value::String("quoted".into()));
        assert_eq!(parse_value("\"").unwrap(), toml::Value::String("\"".into()));

        let table = parse_value("{ offset = 2 }").unwrap();
        assert_eq!(table.get("offset"), Some(&toml::Value::Integer(2)));
        assert_eq!(
            parse_value("[1, 2]").unwrap(),
            toml::Value::Array(vec![toml::Value::Integer(1), toml::Value::Integer(2)])
        );
        assert!(parse_value("{ broken").is_ok());
        assert!(parse_value("{ broken }").is_err());
    }

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("client.rate=10000000").unwrap(),
            ("client.rate".to_string(), "10000000".to_string())
        );
        // Only the first '=' splits
        assert_eq!(parse_key_value("name=a=b").unwrap().1, "a=b");
        assert!(parse_key_value("client.rate").is_err());
        assert!(parse_key_value("=5").is_err());
    }

    #[test]
    fn test_set_creates_missing_tables() {
        let mut root = toml::Value::Table(Default::default());
        set_toml_path(&mut root, "server.histogram.bincount", "50").unwrap();
        assert_eq!(root["server"]["histogram"]["bincount"], toml::Value::Integer(50));
    }

    #[test]
    fn test_set_rejects_scalar_parent() {
        let mut root: toml::Value = toml::from_str("[client]\nrate = 5").unwrap();
        assert!(set_toml_path(&mut root, "client.rate.inner", "1").is_err());
        assert!(set_toml_path(&mut root, "client.+", "1").is_err());
    }

    #[test]
    fn test_defaults_validate() {
        let config = ProfileConfig::from_overrides(&[]).unwrap();
        assert_eq!(config, ProfileConfig::default());
        assert_eq!(config.output.format, "human");
    }

    #[test]
    fn test_json_output_requires_file() {
        let err = ProfileConfig::from_overrides(&["output.format=json".to_string()]).unwrap_err();
        assert!(err.to_string().contains("output.file"));

        let config = ProfileConfig::from_overrides(&[
            "output.format=json".to_string(),
            "output.file=/tmp/cadence.json".to_string(),
        ])
        .unwrap();
        assert_eq!(config.output.file, Some(PathBuf::from("/tmp/cadence.json")));
    }
}
