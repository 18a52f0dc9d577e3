//! Fact registry: command template, parser and invalidation scope per kind.
//!
//! The registry is an explicit value built once at startup and shared by
//! reference with the fact store and planner. Nothing here performs I/O.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::facts::{FactKey, FactKind, FactValue};
use crate::core::parsers;
use crate::core::template::Templates;
use crate::error::{GatherFailure, ParseError};

pub type ParseFn = fn(&[String]) -> Result<FactValue, ParseError>;

/// How one fact kind is gathered.
#[derive(Debug, Clone)]
pub struct FactSpec {
    pub kind: FactKind,
    /// Names bound to the key's positional arguments when rendering.
    pub params: &'static [&'static str],
    /// Command template; arguments are available under their `params` names.
    pub command: &'static str,
    pub parse: ParseFn,
    /// Value substituted when the parser rejects output and the caller
    /// tolerates degraded facts.
    pub fallback: Option<fn() -> FactValue>,
    /// Other kinds whose cached values are stale once this kind is mutated.
    pub related: &'static [FactKind],
}

const USERS_COMMAND: &str = r#"for i in `cat /etc/passwd | cut -d: -f1`; do
    ID=`id $i`
    META=`cat /etc/passwd | grep ^$i: | cut -d: -f6-7`
    echo $ID$META
done"#;

fn builtin_specs() -> Vec<FactSpec> {
    fn text(kind: FactKind, command: &'static str) -> FactSpec {
        FactSpec {
            kind,
            params: &[],
            command,
            parse: parsers::parse_text,
            fallback: None,
            related: &[],
        }
    }

    vec![
        text(FactKind::Home, "echo $HOME"),
        text(FactKind::Hostname, "hostname"),
        text(FactKind::Os, "uname -s"),
        text(FactKind::OsVersion, "uname -r"),
        text(FactKind::Arch, "uname -p"),
        FactSpec {
            kind: FactKind::Date,
            params: &[],
            command: "date '+%Y-%m-%dT%H:%M:%S%z'",
            parse: parsers::parse_date,
            fallback: None,
            related: &[],
        },
        FactSpec {
            kind: FactKind::Users,
            params: &[],
            command: USERS_COMMAND,
            parse: parsers::parse_users,
            fallback: Some(|| FactValue::Users(BTreeMap::new())),
            related: &[FactKind::Home],
        },
        FactSpec {
            kind: FactKind::LinuxDistribution,
            params: &[],
            command: "cat /etc/*-release",
            parse: parsers::parse_linux_distribution,
            fallback: Some(|| FactValue::Unknown(Vec::new())),
            related: &[],
        },
        FactSpec {
            kind: FactKind::FileLines,
            params: &["path"],
            command: "if [ -f {{ path|quote }} ]; then echo __converge_file__; cat {{ path|quote }}; fi",
            parse: parsers::parse_file_lines,
            fallback: None,
            related: &[FactKind::Directory],
        },
        FactSpec {
            kind: FactKind::Directory,
            params: &["path"],
            command: "ls -ld {{ path|quote }} 2>/dev/null || true",
            parse: parsers::parse_directory,
            fallback: None,
            related: &[FactKind::FileLines],
        },
        FactSpec {
            kind: FactKind::WindowsFile,
            params: &["path"],
            command: "Get-ChildItem -Force -Path {{ path|ps_quote }}",
            parse: parsers::parse_windows_file,
            fallback: None,
            related: &[],
        },
    ]
}

pub struct Registry {
    facts: BTreeMap<FactKind, FactSpec>,
    templates: Templates,
}

impl Registry {
    pub fn builtin() -> Self {
        Self {
            facts: builtin_specs()
                .into_iter()
                .map(|spec| (spec.kind, spec))
                .collect(),
            templates: Templates::default(),
        }
    }

    pub fn templates(&self) -> &Templates {
        &self.templates
    }

    pub fn spec(&self, kind: FactKind) -> Result<&FactSpec, GatherFailure> {
        self.facts
            .get(&kind)
            .ok_or_else(|| GatherFailure::Arguments(format!("no fact registered for {kind}")))
    }

    /// Render the exact command string for a fact key.
    pub fn command_for(&self, key: &FactKey) -> Result<String, GatherFailure> {
        let spec = self.spec(key.kind)?;
        if spec.params.len() != key.args.len() {
            return Err(GatherFailure::Arguments(format!(
                "{} expects {} argument(s), got {}",
                key.kind,
                spec.params.len(),
                key.args.len()
            )));
        }
        let ctx: BTreeMap<&str, &str> = spec
            .params
            .iter()
            .copied()
            .zip(key.args.iter().map(String::as_str))
            .collect();
        self.templates
            .render(spec.command, &ctx)
            .map_err(|err| GatherFailure::Arguments(err.to_string()))
    }

    pub fn parse(&self, key: &FactKey, lines: &[String]) -> Result<FactValue, GatherFailure> {
        let spec = self.spec(key.kind)?;
        (spec.parse)(lines).map_err(GatherFailure::Parse)
    }

    pub fn fallback(&self, kind: FactKind) -> Option<FactValue> {
        self.facts
            .get(&kind)
            .and_then(|spec| spec.fallback)
            .map(|make| make())
    }

    /// Kinds to invalidate after mutating `kinds`, including related kinds.
    pub fn invalidation_scope(&self, kinds: &[FactKind]) -> BTreeSet<FactKind> {
        let mut scope: BTreeSet<FactKind> = kinds.iter().copied().collect();
        for kind in kinds {
            if let Some(spec) = self.facts.get(kind) {
                scope.extend(spec.related.iter().copied());
            }
        }
        scope
    }
}
