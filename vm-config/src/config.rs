//! Configuration for talking to a vCenter/ESXi host and for the snapshot core.
//!
//! A `VsphereConfig` is built once at the program boundary (file, environment,
//! then flags) and handed to the core by reference. Nothing in here is
//! process-global.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use vm_core::error::{Result, VmError};

pub const DEFAULT_DATACENTER: &str = "datacenter-3";
pub const DEFAULT_CLONE_PREFIX: &str = "clone-";

/// Root configuration value.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct VsphereConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub defaults: DefaultsConfig,

    #[serde(default)]
    pub policy: OperationPolicy,
}

/// Where a configuration value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    #[default]
    Default,
    File,
    Env,
    Flag,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Default => write!(f, "default"),
            Source::File => write!(f, "file"),
            Source::Env => write!(f, "env"),
            Source::Flag => write!(f, "flag"),
        }
    }
}

/// Connection settings for the remote gateway.
#[derive(Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub host: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub insecure: bool,

    /// Origin of each value, for `credentials show`-style reporting
    #[serde(skip)]
    pub sources: ConnectionSources,
}

// Hand-written so the password never reaches logs through `{:?}`.
impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &mask_password(&self.password))
            .field("insecure", &self.insecure)
            .field("sources", &self.sources)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionSources {
    pub host: Source,
    pub username: Source,
    pub password: Source,
    pub insecure: Source,
}

/// Explicit overrides supplied by the caller layer (command-line flags).
#[derive(Debug, Clone, Default)]
pub struct ConnectionOverrides {
    pub host: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub insecure: Option<bool>,
}

impl ConnectionConfig {
    /// Checks that every value needed to open a session is present.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(VmError::Config("VCLI_HOST is required".to_string()));
        }
        if self.username.trim().is_empty() {
            return Err(VmError::Config("VCLI_USERNAME is required".to_string()));
        }
        if self.password.is_empty() {
            return Err(VmError::Config("VCLI_PASSWORD is required".to_string()));
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: &ConnectionOverrides) {
        if let Some(host) = &overrides.host {
            self.host = host.clone();
            self.sources.host = Source::Flag;
        }
        if let Some(username) = &overrides.username {
            self.username = username.clone();
            self.sources.username = Source::Flag;
        }
        if let Some(password) = &overrides.password {
            self.password = password.clone();
            self.sources.password = Source::Flag;
        }
        if let Some(insecure) = overrides.insecure {
            self.insecure = insecure;
            self.sources.insecure = Source::Flag;
        }
    }

    /// Human-readable summary with the password masked.
    pub fn describe(&self) -> Vec<(&'static str, String, Source)> {
        vec![
            ("host", self.host.clone(), self.sources.host),
            ("username", self.username.clone(), self.sources.username),
            (
                "password",
                mask_password(&self.password),
                self.sources.password,
            ),
            ("insecure", self.insecure.to_string(), self.sources.insecure),
        ]
    }
}

/// Returns the password with only the first and last two characters visible.
pub fn mask_password(password: &str) -> String {
    let chars: Vec<char> = password.chars().collect();
    if chars.len() <= 4 {
        return "••••".to_string();
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{}••••••{}", head, tail)
}

/// Names applied at the boundary when the caller omits them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DefaultsConfig {
    #[serde(default = "default_datacenter")]
    pub datacenter: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_name: Option<String>,

    #[serde(default = "default_clone_prefix")]
    pub clone_prefix: String,
}

fn default_datacenter() -> String {
    DEFAULT_DATACENTER.to_string()
}

fn default_clone_prefix() -> String {
    DEFAULT_CLONE_PREFIX.to_string()
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            datacenter: default_datacenter(),
            vm_name: None,
            snapshot_name: None,
            clone_prefix: default_clone_prefix(),
        }
    }
}

impl DefaultsConfig {
    /// Derives the deterministic default name for a linked clone.
    pub fn clone_name_for(&self, source_vm_name: &str) -> String {
        format!("{}{}", self.clone_prefix, source_vm_name)
    }
}

/// Knobs for caching, retries, deadlines and post-mutation refresh.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationPolicy {
    /// Lifetime of a VM name resolution; 0 disables the cache
    #[serde(default = "default_cache_ttl")]
    pub resolve_cache_ttl_secs: u64,

    /// Per remote call deadline applied when the caller supplies none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_timeout_secs: Option<u64>,

    /// Re-read the whole snapshot tree after each mutation instead of patching it
    #[serde(default = "default_true")]
    pub refresh_after_mutation: bool,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_cache_ttl() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl Default for OperationPolicy {
    fn default() -> Self {
        Self {
            resolve_cache_ttl_secs: default_cache_ttl(),
            operation_timeout_secs: None,
            refresh_after_mutation: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl OperationPolicy {
    pub fn resolve_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.resolve_cache_ttl_secs)
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_secs.map(Duration::from_secs)
    }
}

/// Bounded exponential backoff for read-only gateway calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    2000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_password() {
        assert_eq!(mask_password("abc"), "••••");
        assert_eq!(mask_password("abcd"), "••••");
        assert_eq!(mask_password("secret-pw"), "se••••••pw");
    }

    #[test]
    fn test_debug_does_not_leak_password() {
        let conn = ConnectionConfig {
            password: "hunter2-very-secret".to_string(),
            ..Default::default()
        };
        let debug = format!("{:?}", conn);
        assert!(!debug.contains("hunter2-very-secret"));
        assert!(debug.contains("hu••••••et"));
    }

    #[test]
    fn test_validate_requires_all_connection_fields() {
        let mut conn = ConnectionConfig::default();
        assert!(conn.validate().unwrap_err().to_string().contains("VCLI_HOST"));

        conn.host = "vcenter.lab".to_string();
        assert!(conn
            .validate()
            .unwrap_err()
            .to_string()
            .contains("VCLI_USERNAME"));

        conn.username = "administrator@vsphere.local".to_string();
        assert!(conn
            .validate()
            .unwrap_err()
            .to_string()
            .contains("VCLI_PASSWORD"));

        conn.password = "pw".to_string();
        assert!(conn.validate().is_ok());
    }

    #[test]
    fn test_overrides_mark_flag_source() {
        let mut conn = ConnectionConfig::default();
        conn.apply_overrides(&ConnectionOverrides {
            host: Some("esxi-02".to_string()),
            insecure: Some(true),
            ..Default::default()
        });
        assert_eq!(conn.host, "esxi-02");
        assert!(conn.insecure);
        assert_eq!(conn.sources.host, Source::Flag);
        assert_eq!(conn.sources.insecure, Source::Flag);
        assert_eq!(conn.sources.username, Source::Default);
    }

    #[test]
    fn test_default_clone_name() {
        let defaults = DefaultsConfig::default();
        assert_eq!(defaults.clone_name_for("web-01"), "clone-web-01");
        assert_eq!(defaults.datacenter, "datacenter-3");
    }

    #[test]
    fn test_backoff_is_capped() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.backoff(1), Duration::from_millis(200));
        assert_eq!(retry.backoff(2), Duration::from_millis(400));
        assert_eq!(retry.backoff(10), Duration::from_millis(2000));
    }
}
