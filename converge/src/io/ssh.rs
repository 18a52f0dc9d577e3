//! Connector that shells out to the `ssh` binary with connection multiplexing.
//!
//! The first command to a host opens a control master; later commands reuse
//! it until `close` sends `-O exit`.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use crate::core::inventory::Host;
use crate::error::ConnectionError;
use crate::events::OutputSink;
use crate::io::config::SshConfig;
use crate::io::connector::{CommandOutput, Connection, Connector, RunOptions, TransportError};
use crate::io::local::run_blocking;

/// ssh reserves this exit status for its own failures.
const SSH_ERROR_EXIT: i32 = 255;

#[derive(Debug, Clone)]
pub struct SshConnector {
    config: SshConfig,
    connect_timeout: Duration,
    control_dir: PathBuf,
}

impl SshConnector {
    pub fn new(config: SshConfig, connect_timeout: Duration) -> Self {
        Self {
            config,
            connect_timeout,
            control_dir: std::env::temp_dir(),
        }
    }

    fn target(&self, host: &Host) -> SshTarget {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!(
                "ControlPath={}",
                self.control_dir.join("converge-%C").display()
            ),
            "-o".to_string(),
            format!("ControlPersist={}", self.config.control_persist_secs),
        ];
        for option in &self.config.options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        if let Some(port) = host.port.or(self.config.port) {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(user) = host.user.as_ref().or(self.config.user.as_ref()) {
            args.push("-l".to_string());
            args.push(user.clone());
        }
        SshTarget {
            binary: self.config.binary.clone(),
            args,
            address: host.connect_address().to_string(),
        }
    }
}

#[async_trait]
impl Connector for SshConnector {
    #[instrument(skip_all, fields(host = %host.name))]
    async fn connect(&self, host: &Host) -> Result<Box<dyn Connection>, ConnectionError> {
        let target = self.target(host);
        let opts = RunOptions {
            stdin: None,
            timeout: self.connect_timeout + Duration::from_secs(5),
            output_limit_bytes: 4096,
        };
        let failure = |reason: String| ConnectionError {
            host: host.name.clone(),
            reason,
        };
        let out = run_blocking(target.command("true"), &opts, &OutputSink::detached())
            .await
            .map_err(|e| failure(e.0))?;
        if out.timed_out {
            return Err(failure("connection attempt timed out".to_string()));
        }
        if out.exit_code != Some(0) {
            return Err(failure(if out.stderr.is_empty() {
                format!("ssh exited with {:?}", out.exit_code)
            } else {
                out.stderr.join("\n")
            }));
        }
        debug!("connection established");
        Ok(Box::new(SshConnection { target }))
    }
}

#[derive(Debug, Clone)]
struct SshTarget {
    binary: String,
    args: Vec<String>,
    address: String,
}

impl SshTarget {
    fn command(&self, remote: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.args).arg(&self.address).arg("--").arg(remote);
        cmd
    }
}

pub struct SshConnection {
    target: SshTarget,
}

#[async_trait]
impl Connection for SshConnection {
    #[instrument(skip_all, fields(host = %self.target.address))]
    async fn run(
        &mut self,
        command: &str,
        opts: &RunOptions,
        sink: &OutputSink,
    ) -> Result<CommandOutput, TransportError> {
        let out = run_blocking(self.target.command(command), opts, sink).await?;
        if out.exit_code == Some(SSH_ERROR_EXIT) {
            return Err(TransportError(format!(
                "ssh failed: {}",
                out.stderr.join("\n")
            )));
        }
        Ok(out)
    }

    async fn close(&mut self) {
        let mut cmd = Command::new(&self.target.binary);
        cmd.args(&self.target.args)
            .arg("-O")
            .arg("exit")
            .arg(&self.target.address);
        let opts = RunOptions {
            stdin: None,
            timeout: Duration::from_secs(5),
            output_limit_bytes: 4096,
        };
        if let Err(e) = run_blocking(cmd, &opts, &OutputSink::detached()).await {
            warn!(err = %e, "failed to close control master");
        }
    }
}
