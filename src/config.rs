use anyhow::{bail, Result};
use log::warn;
use std::path::PathBuf;

pub const MIN_THRESHOLD_DAYS: u32 = 1;
pub const MAX_THRESHOLD_DAYS: u32 = 90;

/// Where the batch of identifiers comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputMode {
    /// Delimited file with a header row.
    File(PathBuf),
    /// Group email or exact display name; members are resolved via the API.
    Group(String),
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub mode: InputMode,
    pub threshold_days: u32,
    pub output: PathBuf,
}

impl RunConfig {
    pub fn new(mode: InputMode, threshold_days: u32, output: PathBuf) -> Self {
        RunConfig {
            mode,
            threshold_days: clamp_threshold(threshold_days),
            output,
        }
    }
}

/// Authentication settings for the directory session.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub tenant_id: String,
    pub client_id: String,
    /// Authority base, e.g. https://login.microsoftonline.com
    pub auth_base_url: String,
    /// Directory API base, e.g. https://graph.microsoft.com
    pub graph_base_url: String,
    /// Space-separated OAuth scopes.
    pub scopes: String,
    /// Skip the interactive strategy and go straight to device code.
    pub force_device_code: bool,
}

impl AuthConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tenant_id.trim().is_empty() {
            bail!("tenant id cannot be empty");
        }
        if self.client_id.trim().is_empty() {
            bail!("client id cannot be empty");
        }
        if !self.auth_base_url.starts_with("http") {
            bail!("auth base URL must be an http(s) URL: {}", self.auth_base_url);
        }
        if !self.graph_base_url.starts_with("http") {
            bail!(
                "directory API base URL must be an http(s) URL: {}",
                self.graph_base_url
            );
        }
        Ok(())
    }
}

/// Out-of-range thresholds are clamped to the nearest bound rather than
/// rejected.
pub fn clamp_threshold(days: u32) -> u32 {
    if days < MIN_THRESHOLD_DAYS {
        warn!(
            "Threshold {} is below the minimum, using {} day(s)",
            days, MIN_THRESHOLD_DAYS
        );
        MIN_THRESHOLD_DAYS
    } else if days > MAX_THRESHOLD_DAYS {
        warn!(
            "Threshold {} is above the maximum, using {} days",
            days, MAX_THRESHOLD_DAYS
        );
        MAX_THRESHOLD_DAYS
    } else {
        days
    }
}
