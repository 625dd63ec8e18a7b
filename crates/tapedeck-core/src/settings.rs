//! Process-wide settings
//!
//! Resolved from the environment once, on first use, and immutable after
//! that. Tests and embedders that need different values build
//! [`Settings`] directly or through [`Settings::from_env_map`].

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::matcher::OrderPolicy;
use crate::normalize::NormalizationRules;

pub const ENV_UPSTREAM_URL: &str = "TAPEDECK_UPSTREAM_URL";
pub const ENV_MODE: &str = "TAPEDECK_MODE";
pub const ENV_ORDER: &str = "TAPEDECK_ORDER";
pub const ENV_RULES_FILE: &str = "TAPEDECK_RULES_FILE";
pub const ENV_MAX_BODY_BYTES: &str = "TAPEDECK_MAX_BODY_BYTES";

pub const DEFAULT_UPSTREAM_URL: &str = "https://api.githubcopilot.com";
pub const DEFAULT_MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

static GLOBAL: OnceCell<Settings> = OnceCell::new();

/// Whether Configure may pick record or replay on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModePolicy {
    /// Replay when a snapshot exists, record otherwise
    #[default]
    Auto,
    /// Always forward live and rewrite the snapshot on success
    Record,
    /// Never touch the network; a missing snapshot is a configuration error
    Replay,
}

impl fmt::Display for ModePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModePolicy::Auto => write!(f, "auto"),
            ModePolicy::Record => write!(f, "record"),
            ModePolicy::Replay => write!(f, "replay"),
        }
    }
}

impl FromStr for ModePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(ModePolicy::Auto),
            "record" => Ok(ModePolicy::Record),
            "replay" => Ok(ModePolicy::Replay),
            other => Err(format!(
                "Unknown mode '{other}' (expected 'auto', 'record' or 'replay')"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub upstream_url: String,
    pub mode: ModePolicy,
    pub order: OrderPolicy,
    pub rules_file: Option<PathBuf>,
    pub max_body_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            upstream_url: DEFAULT_UPSTREAM_URL.to_string(),
            mode: ModePolicy::Auto,
            order: OrderPolicy::Strict,
            rules_file: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl Settings {
    /// Build settings from any variable lookup
    ///
    /// `CI=true` implies replay-only unless `TAPEDECK_MODE` says otherwise.
    pub fn from_env_map<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::default();

        if let Some(url) = get(ENV_UPSTREAM_URL).filter(|v| !v.trim().is_empty()) {
            settings.upstream_url = url.trim().to_string();
        }

        settings.mode = match get(ENV_MODE) {
            Some(mode) => mode.parse().map_err(Error::Configuration)?,
            None if get("CI").as_deref() == Some("true") => ModePolicy::Replay,
            None => ModePolicy::Auto,
        };

        if let Some(order) = get(ENV_ORDER) {
            settings.order = order.parse().map_err(Error::Configuration)?;
        }

        settings.rules_file = get(ENV_RULES_FILE)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        if let Some(limit) = get(ENV_MAX_BODY_BYTES) {
            settings.max_body_bytes = limit.trim().parse().map_err(|e| {
                Error::Configuration(format!("Invalid {ENV_MAX_BODY_BYTES} '{limit}': {e}"))
            })?;
        }

        Ok(settings)
    }

    pub fn from_env() -> Result<Self> {
        Self::from_env_map(|key| std::env::var(key).ok())
    }

    /// The process-wide settings, read from the environment on first call
    pub fn global() -> Result<&'static Settings> {
        GLOBAL.get_or_try_init(Self::from_env)
    }

    /// Normalization rules from `rules_file`, or the defaults
    pub fn load_rules(&self) -> Result<NormalizationRules> {
        match &self.rules_file {
            Some(path) => NormalizationRules::from_yaml_file(path),
            None => Ok(NormalizationRules::default()),
        }
    }
}
