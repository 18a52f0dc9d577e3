//! Declarative operations and their planning functions.
//!
//! An operation declares which facts it reads, which fact kinds it may
//! mutate, and how to turn a host into a desired state. Every string value
//! is rendered per host before either question is answered. Planning never
//! writes; the differ decides which commands are needed.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::facts::{FactKey, FactKind};
use crate::core::inventory::Host;
use crate::core::template::Templates;
use crate::core::types::Escalation;
use crate::error::PlanError;

/// One entry of a deploy, applied to every active host in declared order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    #[serde(flatten)]
    pub action: Action,
    #[serde(flatten)]
    pub options: OperationOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Ensure each line is present in a file, appending the missing ones.
    LinePresent { path: String, lines: Vec<String> },
    /// Ensure a file has exactly this content.
    FileContent { path: String, content: String },
    UserPresent {
        user: String,
        home: Option<String>,
        shell: Option<String>,
        group: Option<String>,
        #[serde(default)]
        groups: Vec<String>,
    },
    DirectoryPresent {
        path: String,
        mode: Option<String>,
        user: Option<String>,
        group: Option<String>,
    },
    /// Run commands unconditionally.
    Shell { commands: Vec<String> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationOptions {
    pub escalate: bool,
    pub escalate_user: Option<String>,
    /// Per-command timeout; falls back to the engine default.
    pub timeout_secs: Option<u64>,
    /// Keep the host active for later operations when this one fails.
    pub continue_on_error: bool,
    /// Substitute registry fallbacks for facts whose output cannot be parsed.
    pub tolerant: bool,
    /// Extra fact kinds to invalidate after a non-empty batch.
    pub invalidates: Vec<FactKind>,
}

impl Action {
    /// Fact keys a rendered action reads.
    pub fn reads(&self) -> Vec<FactKey> {
        match self {
            Action::LinePresent { path, .. } | Action::FileContent { path, .. } => {
                vec![FactKey::path(FactKind::FileLines, path)]
            }
            Action::UserPresent { .. } => vec![FactKey::new(FactKind::Users)],
            Action::DirectoryPresent { path, .. } => {
                vec![FactKey::path(FactKind::Directory, path)]
            }
            Action::Shell { .. } => Vec::new(),
        }
    }

    /// Desired state of a rendered action.
    pub fn into_desired(self) -> DesiredState {
        match self {
            Action::LinePresent { path, lines } => DesiredState::Lines { path, lines },
            Action::FileContent { path, content } => DesiredState::Content { path, content },
            Action::UserPresent {
                user,
                home,
                shell,
                group,
                groups,
            } => DesiredState::User(UserSpec {
                name: user,
                home,
                shell,
                group,
                groups,
            }),
            Action::DirectoryPresent {
                path,
                mode,
                user,
                group,
            } => DesiredState::Directory(DirectorySpec {
                path,
                mode,
                user,
                group,
            }),
            Action::Shell { commands } => DesiredState::Commands(commands),
        }
    }
}

/// Desired state of one host for one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DesiredState {
    Lines {
        path: String,
        lines: Vec<String>,
    },
    Content {
        path: String,
        content: String,
    },
    User(UserSpec),
    Directory(DirectorySpec),
    Commands(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSpec {
    pub name: String,
    pub home: Option<String>,
    pub shell: Option<String>,
    pub group: Option<String>,
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectorySpec {
    pub path: String,
    pub mode: Option<String>,
    pub user: Option<String>,
    pub group: Option<String>,
}

impl Operation {
    pub fn new(name: &str, action: Action) -> Self {
        Self {
            name: name.to_string(),
            action,
            options: OperationOptions::default(),
        }
    }

    /// Facts the planner must resolve for `host` before the differ runs.
    pub fn reads(&self, host: &Host, templates: &Templates) -> Result<Vec<FactKey>, PlanError> {
        Ok(self.render(host, templates)?.reads())
    }

    /// Fact kinds this operation may change on a host.
    pub fn mutates(&self) -> Vec<FactKind> {
        let mut kinds = match &self.action {
            Action::LinePresent { .. } | Action::FileContent { .. } => vec![FactKind::FileLines],
            Action::UserPresent { .. } => vec![FactKind::Users],
            Action::DirectoryPresent { .. } => vec![FactKind::Directory],
            Action::Shell { .. } => Vec::new(),
        };
        for kind in &self.options.invalidates {
            if !kinds.contains(kind) {
                kinds.push(*kind);
            }
        }
        kinds
    }

    /// Whether a successful non-empty batch means the host changed.
    pub fn tracks_changes(&self) -> bool {
        !matches!(self.action, Action::Shell { .. })
    }

    pub fn escalation(&self) -> Escalation {
        Escalation {
            enabled: self.options.escalate,
            user: self.options.escalate_user.clone(),
        }
    }

    pub fn timeout(&self, default: Duration) -> Duration {
        self.options
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(default)
    }

    /// Copy of the action with every value containing `{{` rendered for `host`.
    pub fn render(&self, host: &Host, templates: &Templates) -> Result<Action, PlanError> {
        let one = |value: &String| templates.render_for_host(value, host);
        let maybe = |value: &Option<String>| value.as_ref().map(one).transpose();
        let all = |values: &[String]| values.iter().map(one).collect::<Result<Vec<_>, _>>();

        Ok(match &self.action {
            Action::LinePresent { path, lines } => Action::LinePresent {
                path: one(path)?,
                lines: all(lines)?,
            },
            Action::FileContent { path, content } => Action::FileContent {
                path: one(path)?,
                content: one(content)?,
            },
            Action::UserPresent {
                user,
                home,
                shell,
                group,
                groups,
            } => Action::UserPresent {
                user: one(user)?,
                home: maybe(home)?,
                shell: maybe(shell)?,
                group: maybe(group)?,
                groups: all(groups)?,
            },
            Action::DirectoryPresent {
                path,
                mode,
                user,
                group,
            } => Action::DirectoryPresent {
                path: one(path)?,
                mode: maybe(mode)?,
                user: maybe(user)?,
                group: maybe(group)?,
            },
            Action::Shell { commands } => Action::Shell {
                commands: all(commands)?,
            },
        })
    }

    /// Check the declaration itself, independent of any host.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("operation name must be non-empty".to_string());
        }
        match &self.action {
            Action::LinePresent { path, lines } => {
                require_path(path)?;
                if lines.iter().any(|l| l.contains('\n')) {
                    return Err(format!("{}: lines must not contain newlines", self.name));
                }
            }
            Action::FileContent { path, .. } | Action::DirectoryPresent { path, .. } => {
                require_path(path)?;
            }
            Action::UserPresent { user, .. } => {
                if user.trim().is_empty() {
                    return Err(format!("{}: user must be non-empty", self.name));
                }
            }
            Action::Shell { .. } => {}
        }
        if self.options.timeout_secs == Some(0) {
            return Err(format!("{}: timeout_secs must be > 0", self.name));
        }
        Ok(())
    }
}

fn require_path(path: &str) -> Result<(), String> {
    if path.trim().is_empty() {
        return Err("path must be non-empty".to_string());
    }
    Ok(())
}
