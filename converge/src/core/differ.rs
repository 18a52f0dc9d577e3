//! Desired state versus resolved facts, producing the minimal command list.
//!
//! Commands follow the order of the desired-state declaration. An empty
//! result means the host already converged.

use std::collections::BTreeSet;

use crate::core::facts::{FactKey, FactKind, FactValue, FactView, PathKind, UserInfo};
use crate::core::operations::{DesiredState, DirectorySpec, UserSpec};
use crate::core::shell::quote;
use crate::core::types::PlannedCommand;
use crate::error::PlanError;

pub fn diff(desired: &DesiredState, facts: &FactView) -> Result<Vec<PlannedCommand>, PlanError> {
    match desired {
        DesiredState::Lines { path, lines } => {
            let key = FactKey::path(FactKind::FileLines, path);
            let current = file_lines(&key, facts.get(&key)?)?;
            Ok(missing_lines(path, lines, current))
        }
        DesiredState::Content { path, content } => {
            let key = FactKey::path(FactKind::FileLines, path);
            let current = file_lines(&key, facts.get(&key)?)?;
            let wanted: Vec<&str> = content.lines().collect();
            let matches = current.is_some_and(|lines| {
                lines.len() == wanted.len() && lines.iter().zip(&wanted).all(|(a, b)| a == b)
            });
            if matches {
                return Ok(Vec::new());
            }
            Ok(vec![PlannedCommand::with_stdin(
                format!("cat > {}", quote(path)),
                content.clone(),
            )])
        }
        DesiredState::User(spec) => {
            let key = FactKey::new(FactKind::Users);
            match facts.get(&key)? {
                FactValue::Users(users) => Ok(user_commands(spec, users.get(&spec.name))),
                other => Err(unexpected(&key, other)),
            }
        }
        DesiredState::Directory(spec) => {
            let key = FactKey::path(FactKind::Directory, &spec.path);
            directory_commands(spec, &key, facts.get(&key)?)
        }
        DesiredState::Commands(commands) => {
            Ok(commands.iter().map(PlannedCommand::new).collect())
        }
    }
}

fn unexpected(key: &FactKey, found: &FactValue) -> PlanError {
    PlanError::UnexpectedValue {
        fact: key.to_string(),
        found: found.variant().to_string(),
    }
}

/// `None` when the file does not exist.
fn file_lines<'a>(key: &FactKey, value: &'a FactValue) -> Result<Option<&'a [String]>, PlanError> {
    match value {
        FactValue::Lines(lines) => Ok(Some(lines)),
        FactValue::Absent => Ok(None),
        other => Err(unexpected(key, other)),
    }
}

fn missing_lines(path: &str, wanted: &[String], current: Option<&[String]>) -> Vec<PlannedCommand> {
    let present: BTreeSet<&str> = current
        .unwrap_or_default()
        .iter()
        .map(String::as_str)
        .collect();
    let target = quote(path);
    let mut emitted: BTreeSet<&str> = BTreeSet::new();
    let mut commands = Vec::new();
    for line in wanted {
        if present.contains(line.as_str()) || !emitted.insert(line) {
            continue;
        }
        commands.push(PlannedCommand::new(format!(
            "printf '%s\\n' {} >> {target}",
            quote(line)
        )));
    }
    // An unterminated last line would swallow the first append.
    if !commands.is_empty() && current.is_some_and(|lines| !lines.is_empty()) {
        commands.insert(
            0,
            PlannedCommand::new(format!(
                "[ -z \"$(tail -c 1 {target})\" ] || printf '\\n' >> {target}"
            )),
        );
    }
    commands
}

fn user_commands(spec: &UserSpec, current: Option<&UserInfo>) -> Vec<PlannedCommand> {
    let name = quote(&spec.name);
    let Some(current) = current else {
        let mut cmd = String::from("useradd");
        push_flag(&mut cmd, "-d", spec.home.as_deref());
        push_flag(&mut cmd, "-s", spec.shell.as_deref());
        push_flag(&mut cmd, "-g", spec.group.as_deref());
        if !spec.groups.is_empty() {
            push_flag(&mut cmd, "-G", Some(&spec.groups.join(",")));
        }
        cmd.push(' ');
        cmd.push_str(&name);
        return vec![PlannedCommand::new(cmd)];
    };

    let mut commands = Vec::new();
    let home = differs(&spec.home, current.home.as_deref());
    let shell = differs(&spec.shell, current.shell.as_deref());
    let group = differs(&spec.group, Some(current.group.as_str()));
    if home.is_some() || shell.is_some() || group.is_some() {
        let mut cmd = String::from("usermod");
        push_flag(&mut cmd, "-d", home);
        push_flag(&mut cmd, "-s", shell);
        push_flag(&mut cmd, "-g", group);
        cmd.push(' ');
        cmd.push_str(&name);
        commands.push(PlannedCommand::new(cmd));
    }

    let mut missing: Vec<&str> = Vec::new();
    for group in &spec.groups {
        let has = current.group == *group || current.groups.contains(group);
        if !has && !missing.contains(&group.as_str()) {
            missing.push(group);
        }
    }
    if !missing.is_empty() {
        commands.push(PlannedCommand::new(format!(
            "usermod -a -G {} {name}",
            quote(&missing.join(","))
        )));
    }
    commands
}

fn differs<'a>(want: &'a Option<String>, have: Option<&str>) -> Option<&'a str> {
    want.as_deref().filter(|w| Some(*w) != have)
}

fn push_flag(cmd: &mut String, flag: &str, value: Option<&str>) {
    if let Some(value) = value {
        cmd.push(' ');
        cmd.push_str(flag);
        cmd.push(' ');
        cmd.push_str(&quote(value));
    }
}

fn directory_commands(
    spec: &DirectorySpec,
    key: &FactKey,
    value: &FactValue,
) -> Result<Vec<PlannedCommand>, PlanError> {
    let path = quote(&spec.path);
    let mut commands = Vec::new();
    let (mode, owner) = match value {
        FactValue::Absent => {
            commands.push(PlannedCommand::new(format!("mkdir -p {path}")));
            (spec.mode.as_deref(), owner_spec(spec.user.as_deref(), spec.group.as_deref()))
        }
        FactValue::Path(info) if info.kind == PathKind::Directory => {
            let mode = spec
                .mode
                .as_deref()
                .filter(|m| normalize_mode(m) != normalize_mode(&info.mode));
            let user = spec.user.as_deref().filter(|u| *u != info.user);
            let group = spec.group.as_deref().filter(|g| *g != info.group);
            (mode, owner_spec(user, group))
        }
        FactValue::Path(info) => {
            return Err(PlanError::Unsatisfiable(format!(
                "{} exists and is not a directory ({:?})",
                spec.path, info.kind
            )));
        }
        other => return Err(unexpected(key, other)),
    };
    if let Some(mode) = mode {
        commands.push(PlannedCommand::new(format!("chmod {} {path}", quote(mode))));
    }
    if let Some(owner) = owner {
        commands.push(PlannedCommand::new(format!("chown {} {path}", quote(&owner))));
    }
    Ok(commands)
}

fn owner_spec(user: Option<&str>, group: Option<&str>) -> Option<String> {
    match (user, group) {
        (None, None) => None,
        (Some(user), None) => Some(user.to_string()),
        (None, Some(group)) => Some(format!(":{group}")),
        (Some(user), Some(group)) => Some(format!("{user}:{group}")),
    }
}

fn normalize_mode(mode: &str) -> &str {
    let trimmed = mode.trim_start_matches('0');
    if trimmed.is_empty() { "0" } else { trimmed }
}
