//! Engine configuration stored in `converge.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Engine configuration (TOML).
///
/// Every field has a default so an empty or missing file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of hosts worked on at once, for fact warming and execution.
    pub parallelism: usize,

    /// Abort remaining operations once the failure ratio of one operation
    /// is strictly above this fraction.
    pub fail_threshold: f64,

    /// Fraction of hosts that may end unreachable without failing the run.
    pub unreachable_tolerance: f64,

    /// Default per-command timeout in seconds.
    pub command_timeout_secs: u64,

    pub connect_timeout_secs: u64,

    /// Keep at most this many bytes of stdout and of stderr per command.
    pub output_limit_bytes: usize,

    /// Run fact commands under privilege escalation.
    pub escalate_facts: bool,

    pub ssh: SshConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SshConfig {
    pub binary: String,
    /// Login user for hosts that do not set one.
    pub user: Option<String>,
    pub port: Option<u16>,
    /// Extra `-o` options, e.g. `StrictHostKeyChecking=accept-new`.
    pub options: Vec<String>,
    pub control_persist_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            binary: "ssh".to_string(),
            user: None,
            port: None,
            options: Vec::new(),
            control_persist_secs: 60,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: 16,
            fail_threshold: 0.0,
            unreachable_tolerance: 0.0,
            command_timeout_secs: 600,
            connect_timeout_secs: 10,
            output_limit_bytes: 100_000,
            escalate_facts: false,
            ssh: SshConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(anyhow!("parallelism must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.fail_threshold) {
            return Err(anyhow!("fail_threshold must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.unreachable_tolerance) {
            return Err(anyhow!("unreachable_tolerance must be within [0, 1]"));
        }
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("command_timeout_secs must be > 0"));
        }
        if self.connect_timeout_secs == 0 {
            return Err(anyhow!("connect_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.ssh.binary.trim().is_empty() {
            return Err(anyhow!("ssh.binary must be non-empty"));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("converge.toml");
        let mut cfg = EngineConfig::default();
        cfg.parallelism = 4;
        cfg.fail_threshold = 0.25;
        cfg.ssh.options = vec!["StrictHostKeyChecking=accept-new".to_string()];
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_files_keep_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("converge.toml");
        fs::write(&path, "fail_threshold = 0.5\n[ssh]\nport = 2222\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.fail_threshold, 0.5);
        assert_eq!(cfg.ssh.port, Some(2222));
        assert_eq!(cfg.ssh.binary, "ssh");
        assert_eq!(cfg.parallelism, 16);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let cfg = EngineConfig {
            fail_threshold: 1.5,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = EngineConfig {
            parallelism: 0,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
