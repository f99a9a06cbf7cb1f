//! Configuration for rigctl.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rigpool_core::{LifecycleConfig, SearchPolicy};

/// Where pool machines come from.
#[derive(Clone, PartialEq, Eq)]
pub enum Backend {
    /// Created by the provisioning service; released on erase.
    Provisioned,
    /// Pre-existing hardware sharing one password.
    Static { password: String },
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisioned => f.write_str("Provisioned"),
            Self::Static { .. } => f.write_str("Static { password: \"<redacted>\" }"),
        }
    }
}

/// rigctl configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Inventory service base URL.
    pub inventory_url: String,

    /// Provisioning service base URL.
    pub provisioner_url: String,

    /// Remote user for commands and transfers.
    pub ssh_user: String,

    pub search_tries: u32,
    pub search_interval_secs: u64,

    /// Wait after reclaim, in seconds.
    pub settle_secs: u64,

    pub converge_command: String,

    /// TOML feature catalog, if any.
    pub features_file: Option<PathBuf>,

    pub backend: Backend,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let inventory_url = string("RIGPOOL_INVENTORY_URL", "http://127.0.0.1:4000");
        let provisioner_url = string("RIGPOOL_PROVISIONER_URL", "http://127.0.0.1:8026");
        let ssh_user = string("RIGPOOL_SSH_USER", "root");

        let search_tries = parse_or(&lookup, "RIGPOOL_SEARCH_TRIES", 10)?;
        let search_interval_secs = parse_or(&lookup, "RIGPOOL_SEARCH_INTERVAL_SECS", 10)?;
        let settle_secs = parse_or(&lookup, "RIGPOOL_SETTLE_SECS", 15)?;

        let converge_command = string("RIGPOOL_CONVERGE_COMMAND", "chef-client -l error");
        let features_file = lookup("RIGPOOL_FEATURES_FILE").map(PathBuf::from);

        let backend = match lookup("RIGPOOL_BACKEND").as_deref() {
            None | Some("provisioned") => Backend::Provisioned,
            Some("static") => Backend::Static {
                password: lookup("RIGPOOL_STATIC_PASSWORD").context(
                    "RIGPOOL_STATIC_PASSWORD is required for the static backend",
                )?,
            },
            Some(other) => {
                bail!("unknown backend '{other}' (expected 'provisioned' or 'static')")
            }
        };

        let log_level = string("RIGPOOL_LOG_LEVEL", "info");

        Ok(Self {
            inventory_url,
            provisioner_url,
            ssh_user,
            search_tries,
            search_interval_secs,
            settle_secs,
            converge_command,
            features_file,
            backend,
            log_level,
        })
    }

    pub fn search_policy(&self) -> SearchPolicy {
        SearchPolicy {
            max_tries: self.search_tries,
            interval: Duration::from_secs(self.search_interval_secs),
        }
    }

    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            remote_user: self.ssh_user.clone(),
            settle_delay: Duration::from_secs(self.settle_secs),
            converge_command: self.converge_command.clone(),
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .parse()
            .with_context(|| format!("invalid value for {key}: '{value}'")),
        None => Ok(default),
    }
}
