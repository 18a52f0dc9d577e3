//! Helpers for running child processes with timeouts and bounded output.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::types::OutputStream;
use crate::events::OutputSink;

/// Captured child process output, split into lines.
#[derive(Debug)]
pub struct ProcessOutput {
    /// `None` when the child was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

/// Run a command with a timeout, capturing stdout/stderr line by line.
///
/// Output is read on helper threads while the child runs so pipes never
/// fill up. Every line is forwarded to `sink` as it arrives. At most
/// `output_limit_bytes` per stream are kept in memory; everything from the
/// first line that does not fit is drained and counted.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    sink: &OutputSink,
) -> Result<ProcessOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let out_sink = sink.clone();
    let stdout_handle = thread::spawn(move || {
        read_lines_limited(stdout, output_limit_bytes, OutputStream::Stdout, &out_sink)
    });
    let err_sink = sink.clone();
    let stderr_handle = thread::spawn(move || {
        read_lines_limited(stderr, output_limit_bytes, OutputStream::Stderr, &err_sink)
    });

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        if let Err(e) = child_stdin.write_all(input) {
            // The child may exit without reading its input.
            warn!(err = %e, "failed to write stdin");
        }
    }

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(ProcessOutput {
        exit_code: status.code(),
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

type LinesResult = Result<(Vec<String>, usize)>;

fn join_output(handle: thread::JoinHandle<LinesResult>) -> LinesResult {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_lines_limited<R: Read>(
    reader: R,
    limit: usize,
    stream: OutputStream,
    sink: &OutputSink,
) -> LinesResult {
    let mut reader = BufReader::new(reader);
    let mut lines = Vec::new();
    let mut kept = 0usize;
    let mut truncated = 0usize;

    loop {
        let mut raw = Vec::new();
        let n = reader.read_until(b'\n', &mut raw).context("read line")?;
        if n == 0 {
            break;
        }
        let text = String::from_utf8_lossy(&raw);
        let line = text.trim_end_matches(['\n', '\r']);
        sink.emit(stream, line);

        // Keep a contiguous prefix: once a line is dropped, drop the rest.
        if truncated == 0 && kept + n <= limit {
            kept += n;
            lines.push(line.to_string());
        } else {
            truncated += n;
        }
    }

    Ok((lines, truncated))
}
