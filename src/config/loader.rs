//! Configuration loading from disk.
//!
//! Two formats are understood, picked by file extension:
//! - `.toml`: the native [`ProxyConfig`] layout
//! - `.json`: the dev-server proxy format, an array of entries with a
//!   `context`, or an object keyed by context

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::config::schema::{ProxyConfig, RuleConfig};
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported setting: {0}")]
    Unsupported(String),

    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Source format of a configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    DevServerJson,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ConfigFormat::DevServerJson,
            _ => ConfigFormat::Toml,
        }
    }
}

/// Load and validate configuration from a file.
pub fn load_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config = parse_config(&content, ConfigFormat::from_path(path))?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Parse configuration text without validating it.
pub fn parse_config(content: &str, format: ConfigFormat) -> Result<ProxyConfig, ConfigError> {
    match format {
        ConfigFormat::Toml => Ok(toml::from_str(content)?),
        ConfigFormat::DevServerJson => {
            let document: DevServerDocument = serde_json::from_str(content)?;
            Ok(ProxyConfig {
                rules: document.into_rules()?,
                ..ProxyConfig::default()
            })
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DevServerDocument {
    List(Vec<DevServerEntry>),
    Map(BTreeMap<String, DevServerEntry>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DevServerEntry {
    #[serde(default)]
    context: Option<OneOrMany>,
    target: String,
    #[serde(default = "default_secure")]
    secure: bool,
    #[serde(default)]
    change_origin: bool,
    #[serde(default)]
    log_level: Option<String>,
    #[serde(default)]
    path_rewrite: Option<BTreeMap<String, String>>,
}

fn default_secure() -> bool {
    true
}

impl DevServerDocument {
    fn into_rules(self) -> Result<Vec<RuleConfig>, ConfigError> {
        let mut rules = Vec::new();
        match self {
            DevServerDocument::List(entries) => {
                for mut entry in entries {
                    let prefixes = entry
                        .context
                        .take()
                        .map(OneOrMany::into_vec)
                        .unwrap_or_default();
                    rules.extend(entry.into_rules(prefixes)?);
                }
            }
            DevServerDocument::Map(entries) => {
                for (context, entry) in entries {
                    rules.extend(entry.into_rules(vec![context])?);
                }
            }
        }
        Ok(rules)
    }
}

impl DevServerEntry {
    /// One rule per entry, split in two when `pathRewrite` strips only some
    /// of its prefixes.
    fn into_rules(self, path_prefixes: Vec<String>) -> Result<Vec<RuleConfig>, ConfigError> {
        let stripped = match &self.path_rewrite {
            None => BTreeSet::new(),
            Some(rewrites) => stripped_prefixes(rewrites, &path_prefixes)?,
        };
        let (strip, keep): (Vec<String>, Vec<String>) = path_prefixes
            .into_iter()
            .partition(|prefix| stripped.contains(prefix.as_str()));

        let mut rules = Vec::with_capacity(2);
        if !keep.is_empty() || strip.is_empty() {
            rules.push(self.rule(keep, false));
        }
        if !strip.is_empty() {
            rules.push(self.rule(strip, true));
        }
        Ok(rules)
    }

    fn rule(&self, path_prefixes: Vec<String>, strip_prefix: bool) -> RuleConfig {
        let verbose_logging = self
            .log_level
            .as_deref()
            .is_some_and(|level| level.eq_ignore_ascii_case("debug"));

        RuleConfig {
            name: path_prefixes.first().cloned(),
            path_prefixes,
            upstream: self.target.clone(),
            rewrite_origin: self.change_origin,
            allow_insecure_tls: !self.secure,
            verbose_logging,
            strip_prefix,
        }
    }
}

/// Prefixes removed by `pathRewrite`. Only `{"^<prefix>": ""}` for one of the
/// entry's own prefixes is expressible.
fn stripped_prefixes<'a>(
    rewrites: &'a BTreeMap<String, String>,
    prefixes: &[String],
) -> Result<BTreeSet<&'a str>, ConfigError> {
    let mut stripped = BTreeSet::new();
    for (pattern, replacement) in rewrites {
        let anchored = pattern.strip_prefix('^').unwrap_or_default();
        if !replacement.is_empty() || !prefixes.iter().any(|p| p == anchored) {
            return Err(ConfigError::Unsupported(format!(
                "pathRewrite {pattern:?} -> {replacement:?}: only removing the matched prefix is supported"
            )));
        }
        stripped.insert(anchored);
    }
    Ok(stripped)
}
