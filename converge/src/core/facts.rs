//! Fact identities and resolved fact values.
//!
//! A fact is a read-only query about a host, identified by its kind and
//! arguments. The set of kinds is fixed; how each kind is gathered and
//! parsed lives in [`crate::core::registry`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::PlanError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactKind {
    Home,
    Hostname,
    Os,
    OsVersion,
    Arch,
    Date,
    Users,
    LinuxDistribution,
    FileLines,
    Directory,
    WindowsFile,
}

impl FactKind {
    pub const ALL: [FactKind; 11] = [
        FactKind::Home,
        FactKind::Hostname,
        FactKind::Os,
        FactKind::OsVersion,
        FactKind::Arch,
        FactKind::Date,
        FactKind::Users,
        FactKind::LinuxDistribution,
        FactKind::FileLines,
        FactKind::Directory,
        FactKind::WindowsFile,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FactKind::Home => "home",
            FactKind::Hostname => "hostname",
            FactKind::Os => "os",
            FactKind::OsVersion => "os_version",
            FactKind::Arch => "arch",
            FactKind::Date => "date",
            FactKind::Users => "users",
            FactKind::LinuxDistribution => "linux_distribution",
            FactKind::FileLines => "file_lines",
            FactKind::Directory => "directory",
            FactKind::WindowsFile => "windows_file",
        }
    }
}

impl fmt::Display for FactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FactKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| format!("unknown fact kind '{s}'"))
    }
}

/// Identity of one fact query: kind plus positional arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FactKey {
    pub kind: FactKind,
    pub args: Vec<String>,
}

impl FactKey {
    pub fn new(kind: FactKind) -> Self {
        Self {
            kind,
            args: Vec::new(),
        }
    }

    pub fn with_args(kind: FactKind, args: Vec<String>) -> Self {
        Self { kind, args }
    }

    pub fn path(kind: FactKind, path: &str) -> Self {
        Self::with_args(kind, vec![path.to_string()])
    }
}

impl fmt::Display for FactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.args.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}({})", self.kind, self.args.join(", "))
        }
    }
}

/// A user entry from the `users` fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub group: String,
    /// Secondary groups only; the primary group is never repeated here.
    pub groups: Vec<String>,
    pub home: Option<String>,
    pub shell: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Distribution {
    pub name: String,
    pub major: Option<String>,
    pub minor: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathKind {
    File,
    Directory,
    Link,
    Other,
}

/// Ownership and permission bits of a path, from `ls -ld`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathInfo {
    pub kind: PathKind,
    /// Octal permission string without leading zeros, e.g. `755` or `4755`.
    pub mode: String,
    pub user: String,
    pub group: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowsAttributes {
    pub archive: bool,
    pub hidden: bool,
    pub readonly: bool,
    pub system: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowsFileInfo {
    pub kind: PathKind,
    pub attributes: WindowsAttributes,
    pub mtime: Option<NaiveDateTime>,
    pub size: String,
    pub name: String,
}

/// Resolved value of a fact.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FactValue {
    Text(String),
    Timestamp(DateTime<FixedOffset>),
    Users(BTreeMap<String, UserInfo>),
    Distribution(Distribution),
    Lines(Vec<String>),
    Path(PathInfo),
    WindowsFile(WindowsFileInfo),
    /// The queried object does not exist on the host.
    Absent,
    /// Output was recognized as unparsable; raw lines are kept.
    Unknown(Vec<String>),
}

impl FactValue {
    pub fn variant(&self) -> &'static str {
        match self {
            FactValue::Text(_) => "text",
            FactValue::Timestamp(_) => "timestamp",
            FactValue::Users(_) => "users",
            FactValue::Distribution(_) => "distribution",
            FactValue::Lines(_) => "lines",
            FactValue::Path(_) => "path",
            FactValue::WindowsFile(_) => "windows_file",
            FactValue::Absent => "absent",
            FactValue::Unknown(_) => "unknown",
        }
    }
}

/// A fact value as handed to planning, with its degraded marker.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub value: Arc<FactValue>,
    /// Set when the value is a tolerant fallback rather than parsed output.
    pub degraded: bool,
}

/// Facts resolved for one host, restricted to the keys an operation declared.
#[derive(Debug, Clone, Default)]
pub struct FactView {
    facts: BTreeMap<FactKey, Resolved>,
}

impl FactView {
    pub fn new(facts: BTreeMap<FactKey, Resolved>) -> Self {
        Self { facts }
    }

    pub fn get(&self, key: &FactKey) -> Result<&FactValue, PlanError> {
        self.facts
            .get(key)
            .map(|resolved| resolved.value.as_ref())
            .ok_or_else(|| PlanError::UndeclaredFact(key.to_string()))
    }

    pub fn degraded(&self) -> Vec<FactKey> {
        self.facts
            .iter()
            .filter(|(_, resolved)| resolved.degraded)
            .map(|(key, _)| key.clone())
            .collect()
    }
}
