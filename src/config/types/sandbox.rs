//! Sandbox policy configuration types
//!
//! Resource ceilings and hardening knobs applied to every execution unit.
//! These values are policy floors: a request may narrow them, never widen them.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Absolute upper bound for any execution timeout, regardless of configuration
pub const HARD_TIMEOUT_CEILING_SECS: u64 = 60;

/// Sandbox policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Timeout applied when a request does not name one
    #[serde(default = "default_timeout")]
    pub default_timeout_secs: u64,
    /// Largest timeout a request may ask for
    #[serde(default = "default_max_timeout")]
    pub max_timeout_secs: u64,
    /// Memory ceiling (e.g. "256m", "1g")
    #[serde(default = "default_memory")]
    pub memory_limit: String,
    /// CPU share in cores
    #[serde(default = "default_cpu")]
    pub cpu_limit: f64,
    /// Maximum number of processes inside a unit
    #[serde(default = "default_pids")]
    pub pids_limit: i64,
    /// Time between the terminate signal and the forced kill
    #[serde(default = "default_grace_period", with = "humantime_serde")]
    pub grace_period: Duration,
    /// Maximum captured bytes per output stream
    #[serde(default = "default_max_output")]
    pub max_output_bytes: usize,
    /// Size of the ephemeral `/tmp` scratch area
    #[serde(default = "default_scratch")]
    pub scratch_size: String,
    /// Run the unit as this user (uid[:gid]); image default when unset
    #[serde(default)]
    pub run_as_user: Option<String>,
    /// Pull runtime images that are missing locally
    #[serde(default = "default_true")]
    pub pull_missing_images: bool,
    /// Upper bound for a single image pull
    #[serde(default = "default_pull_timeout", with = "humantime_serde")]
    pub image_pull_timeout: Duration,
    /// Prefix for unit names
    #[serde(default = "default_prefix")]
    pub container_prefix: String,
    /// Write `result_<id>.txt` / `error_<id>.txt` into the output directory
    #[serde(default)]
    pub record_results: bool,
    /// Remove units left behind by a previous process at engine start
    #[serde(default = "default_true")]
    pub reap_orphans_on_start: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfig {
            default_timeout_secs: default_timeout(),
            max_timeout_secs: default_max_timeout(),
            memory_limit: default_memory(),
            cpu_limit: default_cpu(),
            pids_limit: default_pids(),
            grace_period: default_grace_period(),
            max_output_bytes: default_max_output(),
            scratch_size: default_scratch(),
            run_as_user: None,
            pull_missing_images: true,
            image_pull_timeout: default_pull_timeout(),
            container_prefix: default_prefix(),
            record_results: false,
            reap_orphans_on_start: true,
        }
    }
}

impl SandboxConfig {
    /// Memory ceiling in bytes, if the configured value parses
    pub fn memory_bytes(&self) -> Option<i64> {
        parse_memory_limit(&self.memory_limit)
    }

    /// Scratch size in bytes, if the configured value parses
    pub fn scratch_bytes(&self) -> Option<i64> {
        parse_memory_limit(&self.scratch_size)
    }
}

fn default_timeout() -> u64 {
    10
}

fn default_max_timeout() -> u64 {
    HARD_TIMEOUT_CEILING_SECS
}

fn default_memory() -> String {
    "256m".to_string()
}

fn default_cpu() -> f64 {
    0.5
}

fn default_pids() -> i64 {
    50
}

fn default_grace_period() -> Duration {
    Duration::from_secs(2)
}

fn default_max_output() -> usize {
    1024 * 1024 // 1MB
}

fn default_scratch() -> String {
    "64m".to_string()
}

fn default_pull_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_prefix() -> String {
    "sandrun".to_string()
}

fn default_true() -> bool {
    true
}

/// Parse a memory limit string (e.g., "512m", "1g") to bytes
pub fn parse_memory_limit(limit: &str) -> Option<i64> {
    let limit = limit.trim().to_lowercase();
    let digits_end = limit
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(limit.len());
    let (num_str, unit) = limit.split_at(digits_end);
    if num_str.is_empty() {
        return None;
    }

    let num: i64 = num_str.parse().ok()?;
    let multiplier: i64 = match unit.trim() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1024,
        "m" | "mb" | "mib" => 1024 * 1024,
        "g" | "gb" | "gib" => 1024 * 1024 * 1024,
        _ => return None,
    };

    num.checked_mul(multiplier)
}

/// When the verification pass runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMode {
    /// Never verify
    Off,
    /// Only requests tagged with a known constant
    Tagged,
    /// Tagged requests, or stdout that names a known constant
    #[default]
    TaggedOrMarkers,
}

impl std::str::FromStr for VerificationMode {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" | "none" => Ok(VerificationMode::Off),
            "tagged" => Ok(VerificationMode::Tagged),
            "tagged_or_markers" | "markers" | "auto" => Ok(VerificationMode::TaggedOrMarkers),
            _ => Err(crate::error::Error::Config(format!(
                "Invalid verification mode: {}. Valid: off, tagged, tagged_or_markers",
                s
            ))),
        }
    }
}

/// Numeric verification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Trigger condition
    #[serde(default)]
    pub mode: VerificationMode,
    /// Absolute tolerance when comparing against the reference value
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        VerificationConfig {
            mode: VerificationMode::default(),
            tolerance: default_tolerance(),
        }
    }
}

fn default_tolerance() -> f64 {
    1e-4
}
