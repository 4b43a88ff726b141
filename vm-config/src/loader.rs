// Standard library imports
use std::fs;
use std::path::Path;

// External crate imports
use tracing::debug;
use vm_core::error::{Result, VmError};

// Internal imports
use crate::config::{ConnectionOverrides, Source, VsphereConfig};

pub const ENV_HOST: &str = "VCLI_HOST";
pub const ENV_USERNAME: &str = "VCLI_USERNAME";
pub const ENV_PASSWORD: &str = "VCLI_PASSWORD";
pub const ENV_INSECURE: &str = "VCLI_INSECURE";
pub const ENV_DATACENTER: &str = "VCLI_DATACENTER";

/// Builds a `VsphereConfig` with a fixed priority chain:
/// 1. **Flags:** explicit overrides from the caller layer.
/// 2. **Environment:** `VCLI_*` variables.
/// 3. **File:** an optional YAML file.
/// 4. **Defaults.**
#[derive(Default)]
pub struct ConfigLoader {
    overrides: ConnectionOverrides,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_overrides(mut self, overrides: ConnectionOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Loads the configuration and validates the connection block.
    pub fn load(&self, file: Option<&Path>) -> Result<VsphereConfig> {
        let config = self.load_unvalidated(file)?;
        config.connection.validate()?;
        Ok(config)
    }

    /// Loads without requiring credentials, for inspection commands.
    pub fn load_unvalidated(&self, file: Option<&Path>) -> Result<VsphereConfig> {
        let mut config = match file {
            Some(path) => Self::load_file(path)?,
            None => VsphereConfig::default(),
        };

        Self::apply_env(&mut config, |key| std::env::var(key).ok())?;
        config.connection.apply_overrides(&self.overrides);

        Ok(config)
    }

    fn load_file(path: &Path) -> Result<VsphereConfig> {
        debug!("Loading config from: {}", path.display());
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parses YAML text, marking every connection value it sets as file-sourced.
    pub fn parse(contents: &str) -> Result<VsphereConfig> {
        let mut config: VsphereConfig = serde_yaml_ng::from_str(contents)?;

        let conn = &mut config.connection;
        if !conn.host.is_empty() {
            conn.sources.host = Source::File;
        }
        if !conn.username.is_empty() {
            conn.sources.username = Source::File;
        }
        if !conn.password.is_empty() {
            conn.sources.password = Source::File;
        }
        if conn.insecure {
            conn.sources.insecure = Source::File;
        }

        Ok(config)
    }

    /// Overlays environment values read through `lookup`; empty values are ignored.
    pub fn apply_env<F>(config: &mut VsphereConfig, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let conn = &mut config.connection;

        if let Some(host) = get(ENV_HOST) {
            conn.host = host;
            conn.sources.host = Source::Env;
        }
        if let Some(username) = get(ENV_USERNAME) {
            conn.username = username;
            conn.sources.username = Source::Env;
        }
        if let Some(password) = get(ENV_PASSWORD) {
            conn.password = password;
            conn.sources.password = Source::Env;
        }
        if let Some(insecure) = get(ENV_INSECURE) {
            conn.insecure = parse_bool(&insecure).ok_or_else(|| {
                VmError::Config(format!("invalid {} value: '{}'", ENV_INSECURE, insecure))
            })?;
            conn.sources.insecure = Source::Env;
        }
        if let Some(datacenter) = get(ENV_DATACENTER) {
            config.defaults.datacenter = datacenter;
        }

        Ok(())
    }
}

// Accepts the same spellings as Go's strconv.ParseBool, which existing
// VCLI_INSECURE values were written against.
fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_env_overlay_sets_values_and_sources() {
        let mut config = VsphereConfig::default();
        ConfigLoader::apply_env(
            &mut config,
            lookup_from(&[
                (ENV_HOST, "vcenter.lab"),
                (ENV_USERNAME, "ops"),
                (ENV_PASSWORD, "secret"),
                (ENV_INSECURE, "true"),
                (ENV_DATACENTER, "dc-1"),
            ]),
        )
        .unwrap();

        assert_eq!(config.connection.host, "vcenter.lab");
        assert!(config.connection.insecure);
        assert_eq!(config.connection.sources.password, Source::Env);
        assert_eq!(config.defaults.datacenter, "dc-1");
    }

    #[test]
    fn test_invalid_insecure_value_is_rejected() {
        let mut config = VsphereConfig::default();
        let err = ConfigLoader::apply_env(&mut config, lookup_from(&[(ENV_INSECURE, "maybe")]))
            .unwrap_err();
        assert!(err.to_string().contains("VCLI_INSECURE"));
    }

    #[test]
    fn test_parse_yaml_marks_file_source() {
        let yaml = r#"
connection:
  host: esxi-01.lab
  username: root
defaults:
  vm_name: asegev-ubuntu-for-workflow-runs
policy:
  resolve_cache_ttl_secs: 5
  refresh_after_mutation: false
"#;
        let config = ConfigLoader::parse(yaml).unwrap();
        assert_eq!(config.connection.host, "esxi-01.lab");
        assert_eq!(config.connection.sources.host, Source::File);
        assert_eq!(config.connection.sources.password, Source::Default);
        assert_eq!(config.defaults.datacenter, "datacenter-3");
        assert_eq!(config.defaults.clone_prefix, "clone-");
        assert_eq!(config.policy.resolve_cache_ttl_secs, 5);
        assert!(!config.policy.refresh_after_mutation);
        assert_eq!(config.policy.retry.max_attempts, 3);
    }

    #[test]
    fn test_parse_bool_spellings() {
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("F"), Some(false));
        assert_eq!(parse_bool("yes"), None);
    }
}
