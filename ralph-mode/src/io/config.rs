//! Workspace configuration (`ralph-mode.toml`) and environment overrides.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Bypasses the no-observable-change completion guard.
pub const ALLOW_NO_CHANGE_ENV: &str = "RALPH_ALLOW_NO_CHANGE";
/// Forces the connectivity probe to report offline.
pub const SIMULATE_OFFLINE_ENV: &str = "RALPH_SIMULATE_OFFLINE";

/// Workspace configuration (TOML). Missing fields take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RalphConfig {
    /// Upper bound on waiting for the state lock.
    pub lock_timeout_ms: u64,

    /// Per-task budget used by `batch-init` when `--max-iterations` is omitted.
    pub default_batch_max_iterations: u32,

    /// Refuse a completion promise when the workspace did not change.
    pub completion_guard: bool,

    pub outage: OutageConfig,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OutageConfig {
    pub enabled: bool,
    /// `host:port` probed with a TCP connect.
    pub probe_addr: String,
    pub probe_timeout_ms: u64,
    pub poll_interval_secs: u64,
    /// Give up after this long offline; 0 waits indefinitely.
    pub max_wait_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent argv; the prompt is written to its stdin.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for RalphConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5_000,
            default_batch_max_iterations: 20,
            completion_guard: true,
            outage: OutageConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

impl Default for OutageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            probe_addr: "1.1.1.1:443".to_string(),
            probe_timeout_ms: 3_000,
            poll_interval_secs: 30,
            max_wait_secs: 0,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string(), "-p".to_string()],
            timeout_secs: 30 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl RalphConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lock_timeout_ms == 0 {
            return Err(anyhow!("lock_timeout_ms must be > 0"));
        }
        if self.outage.probe_addr.trim().is_empty() {
            return Err(anyhow!("outage.probe_addr must not be empty"));
        }
        if self.outage.probe_timeout_ms == 0 {
            return Err(anyhow!("outage.probe_timeout_ms must be > 0"));
        }
        if self.outage.poll_interval_secs == 0 {
            return Err(anyhow!("outage.poll_interval_secs must be > 0"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.agent.timeout_secs == 0 {
            return Err(anyhow!("agent.timeout_secs must be > 0"));
        }
        if self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RalphConfig::default()`.
pub fn load_config(path: &Path) -> Result<RalphConfig> {
    if !path.exists() {
        return Ok(RalphConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RalphConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Switches read from the process environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub allow_no_change: bool,
    pub simulate_offline: bool,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |name: &str| lookup(name).is_some_and(|value| is_truthy(&value));
        Self {
            allow_no_change: flag(ALLOW_NO_CHANGE_ENV),
            simulate_offline: flag(SIMULATE_OFFLINE_ENV),
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RalphConfig::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("ralph-mode.toml");
        fs::write(
            &path,
            "lock_timeout_ms = 250\n\n[outage]\nenabled = true\npoll_interval_secs = 5\n",
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.lock_timeout(), Duration::from_millis(250));
        assert!(cfg.outage.enabled);
        assert_eq!(cfg.outage.poll_interval_secs, 5);
        assert_eq!(cfg.outage.probe_addr, "1.1.1.1:443");
        assert_eq!(cfg.agent, AgentConfig::default());
    }

    #[test]
    fn rejects_zero_lock_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("ralph-mode.toml");
        fs::write(&path, "lock_timeout_ms = 0\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("lock_timeout_ms"));
    }

    #[test]
    fn env_flags_accept_common_truthy_values() {
        let env = EnvOverrides::from_lookup(|name| match name {
            ALLOW_NO_CHANGE_ENV => Some("TRUE".to_string()),
            SIMULATE_OFFLINE_ENV => Some("0".to_string()),
            _ => None,
        });
        assert!(env.allow_no_change);
        assert!(!env.simulate_offline);
        assert_eq!(EnvOverrides::from_lookup(|_| None), EnvOverrides::default());
    }
}
