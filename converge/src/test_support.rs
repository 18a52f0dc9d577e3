//! Test-only helpers: a scripted connector and fixture builders.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::core::inventory::Host;
use crate::core::operations::{Action, Operation};
use crate::core::parsers::PRESENT_MARKER;
use crate::core::types::OutputStream;
use crate::error::ConnectionError;
use crate::events::OutputSink;
use crate::io::connector::{CommandOutput, Connection, Connector, RunOptions, TransportError};

/// Canned reply for commands matching a rule.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub exit_code: Option<i32>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub delay: Option<Duration>,
    pub timed_out: bool,
    pub transport_error: bool,
    pub stdout_truncated: usize,
}

impl Response {
    pub fn ok() -> Self {
        Self::exit(0)
    }

    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Self::default()
        }
    }

    /// Output of the `file_lines` fact for an existing file holding `text`.
    pub fn file_lines(text: &str) -> Self {
        Self::ok().stdout(&format!("{PRESENT_MARKER}\n{text}"))
    }

    pub fn stdout(mut self, text: &str) -> Self {
        self.stdout = text.lines().map(str::to_string).collect();
        self
    }

    pub fn stderr(mut self, text: &str) -> Self {
        self.stderr = text.lines().map(str::to_string).collect();
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn timed_out(mut self) -> Self {
        self.timed_out = true;
        self.exit_code = None;
        self
    }

    pub fn transport_error(mut self) -> Self {
        self.transport_error = true;
        self
    }

    /// Report `bytes` of stdout as dropped by the output limit.
    pub fn truncated(mut self, bytes: usize) -> Self {
        self.stdout_truncated = bytes;
        self
    }
}

/// One command observed by the scripted connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub seq: usize,
    pub host: String,
    pub command: String,
    pub stdin: Option<String>,
}

const ANY_HOST: &str = "*";

#[derive(Debug, Clone)]
struct Rule {
    host: String,
    pattern: String,
    response: Response,
}

#[derive(Debug, Clone)]
struct Effect {
    host: String,
    trigger: String,
    rule: Rule,
}

#[derive(Debug, Default)]
struct State {
    rules: Vec<Rule>,
    effects: Vec<Effect>,
    unreachable: Vec<String>,
    connects: Vec<String>,
    calls: Vec<Call>,
}

impl State {
    /// Newest matching rule wins; host-specific rules beat wildcard ones.
    fn response_for(&self, host: &str, command: &str) -> Response {
        let find = |wanted: &str| {
            self.rules
                .iter()
                .rev()
                .find(|r| r.host == wanted && command.contains(&r.pattern))
        };
        find(host)
            .or_else(|| find(ANY_HOST))
            .map(|r| r.response.clone())
            .unwrap_or_else(Response::ok)
    }
}

/// In-memory connector driven by substring rules.
///
/// Commands with no matching rule succeed with empty output.
#[derive(Debug, Clone, Default)]
pub struct ScriptedConnector {
    state: Arc<Mutex<State>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reply with `response` on `host` for commands containing `pattern`.
    pub fn respond(&self, host: &str, pattern: &str, response: Response) {
        self.state().rules.push(Rule {
            host: host.to_string(),
            pattern: pattern.to_string(),
            response,
        });
    }

    pub fn respond_all(&self, pattern: &str, response: Response) {
        self.respond(ANY_HOST, pattern, response);
    }

    /// After a command containing `trigger` runs on `host`, answer `pattern`
    /// with `response` from then on. Models the state change a command makes.
    pub fn on_success(&self, host: &str, trigger: &str, pattern: &str, response: Response) {
        self.state().effects.push(Effect {
            host: host.to_string(),
            trigger: trigger.to_string(),
            rule: Rule {
                host: host.to_string(),
                pattern: pattern.to_string(),
                response,
            },
        });
    }

    pub fn unreachable(&self, host: &str) {
        self.state().unreachable.push(host.to_string());
    }

    pub fn connects(&self, host: &str) -> usize {
        self.state().connects.iter().filter(|h| *h == host).count()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// Commands run on `host`, in order.
    pub fn commands(&self, host: &str) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.host == host)
            .map(|c| c.command.clone())
            .collect()
    }

    /// Number of commands on `host` containing `pattern`.
    pub fn count(&self, host: &str, pattern: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.host == host && c.command.contains(pattern))
            .count()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, host: &Host) -> Result<Box<dyn Connection>, ConnectionError> {
        let mut state = self.state();
        state.connects.push(host.name.clone());
        if state.unreachable.contains(&host.name) {
            return Err(ConnectionError {
                host: host.name.clone(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(Box::new(ScriptedConnection {
            host: host.name.clone(),
            connector: self.clone(),
        }))
    }
}

struct ScriptedConnection {
    host: String,
    connector: ScriptedConnector,
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn run(
        &mut self,
        command: &str,
        opts: &RunOptions,
        sink: &OutputSink,
    ) -> Result<CommandOutput, TransportError> {
        let response = {
            let mut state = self.connector.state();
            let seq = state.calls.len();
            state.calls.push(Call {
                seq,
                host: self.host.clone(),
                command: command.to_string(),
                stdin: opts.stdin.clone(),
            });
            state.response_for(&self.host, command)
        };

        if let Some(delay) = response.delay {
            tokio::time::sleep(delay).await;
        }
        if response.transport_error {
            return Err(TransportError("connection reset".to_string()));
        }
        for line in &response.stdout {
            sink.emit(OutputStream::Stdout, line);
        }
        for line in &response.stderr {
            sink.emit(OutputStream::Stderr, line);
        }

        if response.exit_code == Some(0) && !response.timed_out {
            let mut state = self.connector.state();
            let fired: Vec<Rule> = state
                .effects
                .iter()
                .filter(|e| e.host == self.host && command.contains(&e.trigger))
                .map(|e| e.rule.clone())
                .collect();
            state.rules.extend(fired);
        }

        Ok(CommandOutput {
            exit_code: response.exit_code,
            stdout: response.stdout,
            stderr: response.stderr,
            timed_out: response.timed_out,
            stdout_truncated: response.stdout_truncated,
        })
    }
}

/// Hosts with default connection settings, in the given order.
pub fn hosts(names: &[&str]) -> Vec<Host> {
    names.iter().map(|name| Host::named(name)).collect()
}

/// Numbered host names `prefix1..=prefixN`.
pub fn numbered(prefix: &str, count: usize) -> Vec<String> {
    (1..=count).map(|i| format!("{prefix}{i}")).collect()
}

pub fn line_present(name: &str, path: &str, lines: &[&str]) -> Operation {
    Operation::new(
        name,
        Action::LinePresent {
            path: path.to_string(),
            lines: lines.iter().map(|l| l.to_string()).collect(),
        },
    )
}

pub fn shell(name: &str, commands: &[&str]) -> Operation {
    Operation::new(
        name,
        Action::Shell {
            commands: commands.iter().map(|c| c.to_string()).collect(),
        },
    )
}
