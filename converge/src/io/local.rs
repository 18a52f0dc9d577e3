//! Connector that runs every command on the controller through `sh -c`.

use std::process::Command;

use async_trait::async_trait;
use tracing::instrument;

use crate::core::inventory::Host;
use crate::error::ConnectionError;
use crate::events::OutputSink;
use crate::io::connector::{CommandOutput, Connection, Connector, RunOptions, TransportError};
use crate::io::process::run_command;

#[derive(Debug, Clone, Default)]
pub struct LocalConnector;

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self, _host: &Host) -> Result<Box<dyn Connection>, ConnectionError> {
        Ok(Box::new(LocalConnection))
    }
}

pub struct LocalConnection;

#[async_trait]
impl Connection for LocalConnection {
    #[instrument(skip_all)]
    async fn run(
        &mut self,
        command: &str,
        opts: &RunOptions,
        sink: &OutputSink,
    ) -> Result<CommandOutput, TransportError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        run_blocking(cmd, opts, sink).await
    }
}

/// Run a prepared child process on the blocking pool.
pub(crate) async fn run_blocking(
    cmd: Command,
    opts: &RunOptions,
    sink: &OutputSink,
) -> Result<CommandOutput, TransportError> {
    let stdin = opts.stdin.clone();
    let timeout = opts.timeout;
    let limit = opts.output_limit_bytes;
    let sink = sink.clone();
    let output = tokio::task::spawn_blocking(move || {
        run_command(cmd, stdin.as_deref().map(str::as_bytes), timeout, limit, &sink)
    })
    .await
    .map_err(|e| TransportError(format!("command task failed: {e}")))?
    .map_err(|e| TransportError(format!("{e:#}")))?;

    Ok(CommandOutput {
        exit_code: output.exit_code,
        stdout: output.stdout,
        stderr: output.stderr,
        timed_out: output.timed_out,
        stdout_truncated: output.stdout_truncated,
    })
}
