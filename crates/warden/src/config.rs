//! Configuration loading and validation.
//!
//! The configuration is a single YAML file read once at startup. Every field
//! except `policies` and `resources` has a default.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use warden_cloud::{ResourceKind, ResourceRef};

use crate::executor::RetryPolicy;
use crate::policy::{Policy, PolicyError, PolicySet};
use crate::trigger::DEFAULT_WATCHED_EVENTS;

/// Errors raised while loading the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid YAML for this schema.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A policy is invalid.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Seconds between full fleet scans
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,

    /// Jobs allowed to run at once across all resources
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Deadline for one inspection call
    #[serde(default = "default_inspect_timeout_secs")]
    pub inspect_timeout_secs: u64,

    /// Deadline for one corrective call
    #[serde(default = "default_remediate_timeout_secs")]
    pub remediate_timeout_secs: u64,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub provider: ProviderSettings,

    #[serde(default)]
    pub events: EventSettings,

    /// JSON Lines file receiving one outcome record per job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome_log: Option<PathBuf>,

    pub policies: Vec<Policy>,

    pub resources: Vec<ResourceEntry>,
}

const fn default_scan_interval_secs() -> u64 {
    300
}

const fn default_workers() -> usize {
    8
}

const fn default_inspect_timeout_secs() -> u64 {
    10
}

const fn default_remediate_timeout_secs() -> u64 {
    30
}

/// Backoff settings for remediation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,

    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_base_delay_secs() -> u64 {
    60
}

const fn default_max_delay_secs() -> u64 {
    900
}

const fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            multiplier: default_multiplier(),
        }
    }
}

/// Which provider backs the reconciler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderSettings {
    /// AWS WAFv2 over the signed JSON API.
    Aws {
        #[serde(default = "default_region")]
        region: String,

        /// Client-side request cap (0 disables the cap)
        #[serde(default = "default_requests_per_second")]
        requests_per_second: u32,

        /// Endpoint override, for VPC endpoints and local stacks
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },

    /// In-process provider, optionally seeded from a YAML fixture.
    Memory {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fixture: Option<PathBuf>,
    },
}

fn default_region() -> String {
    "us-east-1".to_string()
}

const fn default_requests_per_second() -> u32 {
    5
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self::Aws {
            region: default_region(),
            requests_per_second: default_requests_per_second(),
            endpoint: None,
        }
    }
}

/// Change-notification ingress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSettings {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Event names that trigger a single-resource job
    #[serde(default = "default_watched")]
    pub watched: Vec<String>,

    /// Events buffered between the HTTP endpoint and the trigger
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_watched() -> Vec<String> {
    DEFAULT_WATCHED_EVENTS.iter().map(ToString::to_string).collect()
}

const fn default_queue_capacity() -> usize {
    1024
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            watched: default_watched(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// A managed resource as declared in the configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEntry {
    pub id: String,

    /// Inferred from the ARN when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ResourceKind>,
}

impl ResourceEntry {
    /// Resolve the entry into a provider reference.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] if no kind is given and none can be
    /// inferred from the id.
    pub fn resolve(&self) -> Result<ResourceRef, ConfigError> {
        let kind = self
            .kind
            .or_else(|| ResourceKind::from_arn(&self.id))
            .ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "resource {} has no kind and none can be inferred from its id",
                    self.id
                ))
            })?;
        Ok(ResourceRef::new(self.id.clone(), kind))
    }
}

impl WardenConfig {
    /// Read, parse and validate a configuration file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration without validating it.
    ///
    /// # Errors
    /// Returns [`ConfigError::Parse`] on malformed YAML.
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Check value ranges and cross-field constraints.
    ///
    /// # Errors
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.scan_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "scan_interval_secs must be at least 1".into(),
            ));
        }
        if self.inspect_timeout_secs == 0 || self.remediate_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be at least 1s".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "retry.multiplier must be at least 1.0".into(),
            ));
        }
        if self.retry.max_delay_secs < self.retry.base_delay_secs {
            return Err(ConfigError::Invalid(
                "retry.max_delay_secs must not be below retry.base_delay_secs".into(),
            ));
        }
        if self.events.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "events.queue_capacity must be at least 1".into(),
            ));
        }
        self.events
            .listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| {
                ConfigError::Invalid(format!(
                    "events.listen_addr {} is not a socket address: {e}",
                    self.events.listen_addr
                ))
            })?;

        self.policy_set()?;
        self.resource_refs()?;
        Ok(())
    }

    /// Validated policy set.
    ///
    /// # Errors
    /// Returns [`ConfigError::Policy`] on an invalid or duplicated policy.
    pub fn policy_set(&self) -> Result<PolicySet, ConfigError> {
        Ok(PolicySet::new(self.policies.iter().cloned())?)
    }

    /// Managed resources, with kinds resolved.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] on a duplicated id or an unknown kind.
    pub fn resource_refs(&self) -> Result<Vec<ResourceRef>, ConfigError> {
        let mut seen = HashSet::new();
        self.resources
            .iter()
            .map(|entry| {
                if entry.id.trim().is_empty() {
                    return Err(ConfigError::Invalid("resource id must not be empty".into()));
                }
                if !seen.insert(entry.id.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "duplicate resource {}",
                        entry.id
                    )));
                }
                entry.resolve()
            })
            .collect()
    }

    #[must_use]
    pub const fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    #[must_use]
    pub const fn inspect_timeout(&self) -> Duration {
        Duration::from_secs(self.inspect_timeout_secs)
    }

    #[must_use]
    pub const fn remediate_timeout(&self) -> Duration {
        Duration::from_secs(self.remediate_timeout_secs)
    }

    /// Backoff policy for the executor.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_secs(self.retry.base_delay_secs),
            max_delay: Duration::from_secs(self.retry.max_delay_secs),
            multiplier: self.retry.multiplier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r"
policies:
  - kind: application_load_balancer
    web_acl_arn: waf-default
resources:
  - id: alb-1
    kind: application_load_balancer
";

    #[test]
    fn test_defaults_are_applied() {
        let config = WardenConfig::from_yaml(MINIMAL).unwrap();
        config.validate().unwrap();

        assert_eq!(config.scan_interval(), Duration::from_secs(300));
        assert_eq!(config.workers, 8);
        assert_eq!(config.inspect_timeout(), Duration::from_secs(10));
        assert_eq!(config.remediate_timeout(), Duration::from_secs(30));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.events.listen_addr, "0.0.0.0:8080");
        assert_eq!(
            config.events.watched,
            vec!["DisassociateWebACL", "AssociateWebACL"]
        );
        assert!(matches!(config.provider, ProviderSettings::Aws { requests_per_second: 5, .. }));
        assert!(config.outcome_log.is_none());
    }

    #[test]
    fn test_full_config() {
        let config = WardenConfig::from_yaml(
            r"
scan_interval_secs: 60
workers: 2
retry: { max_attempts: 3, base_delay_secs: 1, max_delay_secs: 4, multiplier: 3.0 }
provider:
  type: memory
  fixture: fixture.yaml
events:
  listen_addr: 127.0.0.1:9000
  watched: [DisassociateWebACL]
outcome_log: /tmp/outcomes.jsonl
policies:
  - kind: application_load_balancer
    web_acl_arn: arn:aws:wafv2:eu-west-1:123456789012:regional/webacl/default/abcd
resources:
  - id: arn:aws:elasticloadbalancing:eu-west-1:123456789012:loadbalancer/app/web/1
",
        )
        .unwrap();
        config.validate().unwrap();

        let refs = config.resource_refs().unwrap();
        assert_eq!(refs[0].kind, ResourceKind::ApplicationLoadBalancer);
        assert_eq!(config.retry_policy().max_attempts, 3);
        assert!(matches!(
            config.provider,
            ProviderSettings::Memory { fixture: Some(_) }
        ));
        assert_eq!(config.events.queue_capacity, 1024);
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let mut config = WardenConfig::from_yaml(MINIMAL).unwrap();
        config.workers = 0;
        assert!(config.validate().is_err());

        let mut config = WardenConfig::from_yaml(MINIMAL).unwrap();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = WardenConfig::from_yaml(MINIMAL).unwrap();
        config.inspect_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = WardenConfig::from_yaml(MINIMAL).unwrap();
        config.retry.multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = WardenConfig::from_yaml(MINIMAL).unwrap();
        config.events.listen_addr = "not-an-address".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_duplicates() {
        let mut config = WardenConfig::from_yaml(MINIMAL).unwrap();
        config.resources.push(config.resources[0].clone());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = WardenConfig::from_yaml(MINIMAL).unwrap();
        config.policies.push(config.policies[0].clone());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Policy(PolicyError::DuplicateKind(_)))
        ));
    }

    #[test]
    fn test_rejects_uninferable_kind() {
        let mut config = WardenConfig::from_yaml(MINIMAL).unwrap();
        config.resources[0].kind = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_reports_missing_file() {
        let err = WardenConfig::load(Path::new("/nonexistent/warden.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let config = WardenConfig::load(file.path()).unwrap();
        assert_eq!(config.resources.len(), 1);
    }
}
