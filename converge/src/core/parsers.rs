//! Pure parsers from fact command output to [`FactValue`].
//!
//! Every parser takes the ordered stdout lines of one command and returns a
//! value or a [`ParseError`]. Several parsers keep legacy tolerant behavior
//! (dropping lines they do not recognize, returning `Unknown`/`Absent`) so
//! that hosts with unusual output keep working the way they always have.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime};
use regex::Regex;

use crate::core::facts::{
    Distribution, FactValue, PathInfo, PathKind, UserInfo, WindowsAttributes, WindowsFileInfo,
};
use crate::error::ParseError;

/// Printed by the `file_lines` command ahead of the file body. No output at
/// all means the path is not a regular file.
pub const PRESENT_MARKER: &str = "__converge_file__";

static USER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^uid=[0-9]+\(([a-z\-]+)\) gid=[0-9]+\(([a-z\-]+)\) groups=([,0-9a-z\-\(\)]+)(.*)$")
        .expect("user regex")
});

static GROUP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+\(([a-z\-]+)\)$").expect("group regex"));

static DISTRIBUTION_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(Ubuntu) ([0-9]{2})\.([0-9]{2})",
        r"(CentOS) release ([0-9]).([0-9])",
        r"(CentOS) Linux release ([0-9]).([0-9])",
        r"(Debian) GNU/Linux ([0-9])()",
    ]
    .into_iter()
    .map(|re| Regex::new(re).expect("distribution regex"))
    .collect()
});

static LS_LD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([dlbcps\-])([rwxsStT\-]{9})[.+@]?\s+[0-9]+\s+(\S+)\s+(\S+)\s+")
        .expect("ls regex")
});

// d-----        1/25/2020  10:27 AM                WinSxS
// -a----        9/15/2018  12:12 AM          78848 bfsvc.exe
static WIN_LS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^([darhs\-]{6})\s+",
        r"([0-9]{1,2}/[0-9]{1,2}/[0-9]{4})\s+([0-9]{1,2}:[0-9]{1,2}\s[AP][M])\s+",
        r"([0-9]+)\s+",
        r"([\w/\.@-]+)",
    ))
    .expect("windows listing regex")
});

/// Whole output joined with newlines.
pub fn parse_text(lines: &[String]) -> Result<FactValue, ParseError> {
    Ok(FactValue::Text(lines.join("\n")))
}

/// First non-empty line as an RFC 3339-like timestamp with numeric offset.
pub fn parse_date(lines: &[String]) -> Result<FactValue, ParseError> {
    let line = lines
        .iter()
        .map(|l| l.trim())
        .find(|l| !l.is_empty())
        .ok_or_else(|| ParseError::new("empty date output"))?;
    let parsed = DateTime::parse_from_str(line, "%Y-%m-%dT%H:%M:%S%z")
        .map_err(|err| ParseError::new(format!("unrecognized date '{line}': {err}")))?;
    Ok(FactValue::Timestamp(parsed))
}

/// Users from `id <user>` output followed by `home:shell` from passwd.
///
/// Lines that do not look like `id` output are dropped. A trailing-colon
/// suffix (`/home/x:` with no shell) yields only the first character of the
/// home path; this is how the established parser has always behaved and it
/// is kept until confirmed against real passwd samples.
pub fn parse_users(lines: &[String]) -> Result<FactValue, ParseError> {
    let mut users = BTreeMap::new();

    for line in lines {
        let Some(caps) = USER_RE.captures(line) else {
            continue;
        };
        let name = caps[1].to_string();
        let group = caps[2].to_string();
        let home_shell = &caps[4];

        let (home, shell) = if home_shell.ends_with(':') {
            (home_shell.chars().next().map(String::from), None)
        } else if let Some(shell) = home_shell.strip_prefix(':') {
            (None, Some(shell.to_string()))
        } else if home_shell.contains(':') {
            let parts: Vec<&str> = home_shell.split(':').collect();
            let [home, shell] = parts.as_slice() else {
                return Err(ParseError::new(format!(
                    "user {name}: expected home:shell, got '{home_shell}'"
                )));
            };
            (Some(home.to_string()), Some(shell.to_string()))
        } else {
            (None, None)
        };

        let mut groups = Vec::new();
        for entry in caps[3].split(',') {
            let group_caps = GROUP_RE.captures(entry).ok_or_else(|| {
                ParseError::new(format!("user {name}: malformed group entry '{entry}'"))
            })?;
            let group_name = &group_caps[1];
            if group_name != group {
                groups.push(group_name.to_string());
            }
        }

        users.insert(
            name,
            UserInfo {
                group,
                groups,
                home,
                shell,
            },
        );
    }

    Ok(FactValue::Users(users))
}

/// Distribution name and version from `/etc/*-release`.
///
/// Unsupported distributions resolve to `Unknown` rather than an error.
pub fn parse_linux_distribution(lines: &[String]) -> Result<FactValue, ParseError> {
    let output = lines.join("\n");
    let Some(caps) = DISTRIBUTION_RES.iter().find_map(|re| re.captures(&output)) else {
        return Ok(FactValue::Unknown(lines.to_vec()));
    };
    Ok(FactValue::Distribution(Distribution {
        name: caps[1].to_string(),
        major: caps.get(2).map(|m| m.as_str().to_string()),
        minor: caps.get(3).map(|m| m.as_str().to_string()),
    }))
}

pub fn parse_file_lines(lines: &[String]) -> Result<FactValue, ParseError> {
    match lines.split_first() {
        None => Ok(FactValue::Absent),
        Some((first, body)) if first == PRESENT_MARKER => Ok(FactValue::Lines(body.to_vec())),
        Some((first, _)) => Err(ParseError::new(format!(
            "expected file marker first, got '{first}'"
        ))),
    }
}

/// One `ls -ld` line; empty output means the path does not exist.
pub fn parse_directory(lines: &[String]) -> Result<FactValue, ParseError> {
    let Some(line) = lines.iter().find(|l| !l.trim().is_empty()) else {
        return Ok(FactValue::Absent);
    };
    let caps = LS_LD_RE
        .captures(line)
        .ok_or_else(|| ParseError::new(format!("unrecognized ls output '{line}'")))?;
    let kind = match &caps[1] {
        "d" => PathKind::Directory,
        "-" => PathKind::File,
        "l" => PathKind::Link,
        _ => PathKind::Other,
    };
    Ok(FactValue::Path(PathInfo {
        kind,
        mode: octal_mode(&caps[2]),
        user: caps[3].to_string(),
        group: caps[4].to_string(),
    }))
}

/// Convert a symbolic `rwxr-xr-x` string to an octal mode like `755`.
fn octal_mode(symbolic: &str) -> String {
    let bytes = symbolic.as_bytes();
    let mut special = 0u32;
    let mut digits = String::with_capacity(4);

    for (idx, triplet) in bytes.chunks(3).enumerate() {
        let mut value = 0u32;
        if triplet[0] == b'r' {
            value += 4;
        }
        if triplet[1] == b'w' {
            value += 2;
        }
        match triplet[2] {
            b'x' => value += 1,
            b's' | b't' => {
                value += 1;
                special += 4 >> idx;
            }
            b'S' | b'T' => special += 4 >> idx,
            _ => {}
        }
        digits.push(char::from_digit(value, 8).unwrap_or('0'));
    }

    if special > 0 {
        return format!("{special}{digits}");
    }
    let trimmed = digits.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// A PowerShell directory listing row for a file.
///
/// The first row matching the listing pattern wins; header and separator
/// rows are dropped. Directory rows carry no size column and never match,
/// and a matching row of the wrong type resolves to `Absent`. The time is
/// read as a 24-hour clock with the AM/PM marker ignored, which mirrors the
/// established parser; an unreadable time yields `mtime: None`.
pub fn parse_windows_file(lines: &[String]) -> Result<FactValue, ParseError> {
    for line in lines {
        let Some(caps) = WIN_LS_RE.captures(line) else {
            continue;
        };

        let kind = match line.as_bytes().first() {
            Some(b'd') => PathKind::Directory,
            Some(b'-') => PathKind::File,
            _ => return Err(ParseError::new(format!("unknown file type in '{line}'"))),
        };
        if kind != PathKind::File {
            return Ok(FactValue::Absent);
        }

        let mut attributes = WindowsAttributes::default();
        for flag in caps[1].chars().skip(1) {
            match flag {
                'a' => attributes.archive = true,
                'r' => attributes.readonly = true,
                'h' => attributes.hidden = true,
                's' => attributes.system = true,
                '-' => {}
                other => {
                    return Err(ParseError::new(format!(
                        "unknown attribute flag '{other}' in '{line}'"
                    )));
                }
            }
        }

        return Ok(FactValue::WindowsFile(WindowsFileInfo {
            kind,
            attributes,
            mtime: parse_windows_time(&caps[2], &caps[3]),
            size: caps[4].to_string(),
            name: caps[5].to_string(),
        }));
    }
    Ok(FactValue::Absent)
}

fn parse_windows_time(date: &str, time: &str) -> Option<NaiveDateTime> {
    let clock = time.split_whitespace().next()?;
    NaiveDateTime::parse_from_str(&format!("{date} {clock}"), "%m/%d/%Y %H:%M").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|l| l.to_string()).collect()
    }

    fn users(raw: &[&str]) -> BTreeMap<String, UserInfo> {
        match parse_users(&lines(raw)).expect("parse users") {
            FactValue::Users(users) => users,
            other => panic!("expected users, got {other:?}"),
        }
    }

    #[test]
    fn users_parses_home_shell_and_secondary_groups() {
        let parsed = users(&[
            "uid=0(root) gid=0(root) groups=0(root)/root:/bin/bash",
            "uid=1000(deploy) gid=1000(deploy) groups=1000(deploy),27(sudo),999(docker)/home/deploy:/bin/zsh",
        ]);

        let root = &parsed["root"];
        assert_eq!(root.group, "root");
        assert!(root.groups.is_empty());
        assert_eq!(root.home.as_deref(), Some("/root"));
        assert_eq!(root.shell.as_deref(), Some("/bin/bash"));

        let deploy = &parsed["deploy"];
        assert_eq!(deploy.groups, vec!["sudo", "docker"]);
        assert_eq!(deploy.shell.as_deref(), Some("/bin/zsh"));
    }

    #[test]
    fn users_home_only_suffix_keeps_first_character() {
        let parsed = users(&["uid=5(games) gid=60(games) groups=60(games)/usr/games:"]);
        assert_eq!(parsed["games"].home.as_deref(), Some("/"));
        assert_eq!(parsed["games"].shell, None);
    }

    #[test]
    fn users_shell_only_suffix() {
        let parsed = users(&["uid=2(bin) gid=2(bin) groups=2(bin):/usr/sbin/nologin"]);
        assert_eq!(parsed["bin"].home, None);
        assert_eq!(parsed["bin"].shell.as_deref(), Some("/usr/sbin/nologin"));
    }

    #[test]
    fn users_drops_unrecognized_lines() {
        let parsed = users(&[
            "garbage",
            "uid=1001(svc_1) gid=1001(svc_1) groups=1001(svc_1)/srv:/bin/sh",
            "uid=0(root) gid=0(root) groups=0(root)/root:/bin/sh",
        ]);
        assert_eq!(parsed.keys().collect::<Vec<_>>(), vec!["root"]);
    }

    #[test]
    fn users_rejects_malformed_group_list() {
        let err = parse_users(&lines(&["uid=0(root) gid=0(root) groups=0(root),,/root:/bin/sh"]))
            .unwrap_err();
        assert!(err.0.contains("malformed group entry"));
    }

    #[test]
    fn distribution_matches_known_release_files() {
        let value = parse_linux_distribution(&lines(&["CentOS release 6.5 (Final)"])).unwrap();
        assert_eq!(
            value,
            FactValue::Distribution(Distribution {
                name: "CentOS".to_string(),
                major: Some("6".to_string()),
                minor: Some("5".to_string()),
            })
        );

        let value = parse_linux_distribution(&lines(&[
            "PRETTY_NAME=\"Debian GNU/Linux 8 (jessie)\"",
            "NAME=\"Debian GNU/Linux\"",
        ]))
        .unwrap();
        let FactValue::Distribution(debian) = value else {
            panic!("expected distribution");
        };
        assert_eq!(debian.name, "Debian");
        assert_eq!(debian.minor.as_deref(), Some(""));
    }

    #[test]
    fn distribution_unknown_keeps_raw_lines() {
        let raw = lines(&["NAME=Alpine"]);
        assert_eq!(
            parse_linux_distribution(&raw).unwrap(),
            FactValue::Unknown(raw.clone())
        );
    }

    #[test]
    fn date_requires_numeric_offset_timestamp() {
        let value = parse_date(&lines(&["2026-10-16T09:30:00+0200"])).unwrap();
        let FactValue::Timestamp(ts) = value else {
            panic!("expected timestamp");
        };
        assert_eq!(ts.to_rfc3339(), "2026-10-16T09:30:00+02:00");

        assert!(parse_date(&lines(&["Thu Oct 16 09:30:00 CEST 2026"])).is_err());
        assert!(parse_date(&[]).is_err());
    }

    #[test]
    fn file_lines_without_marker_means_absent() {
        assert_eq!(parse_file_lines(&[]).unwrap(), FactValue::Absent);
        assert_eq!(
            parse_file_lines(&lines(&[PRESENT_MARKER])).unwrap(),
            FactValue::Lines(Vec::new())
        );
        assert!(parse_file_lines(&lines(&["stray"])).is_err());
    }

    #[test]
    fn file_body_may_contain_the_marker_text() {
        assert_eq!(
            parse_file_lines(&lines(&[PRESENT_MARKER, PRESENT_MARKER, "x=1"])).unwrap(),
            FactValue::Lines(lines(&[PRESENT_MARKER, "x=1"]))
        );
    }

    #[test]
    fn directory_parses_ls_ld() {
        let value =
            parse_directory(&lines(&["drwxr-sr-x  2 www data 4096 Oct 16 10:00 /srv/app"]))
                .unwrap();
        assert_eq!(
            value,
            FactValue::Path(PathInfo {
                kind: PathKind::Directory,
                mode: "2755".to_string(),
                user: "www".to_string(),
                group: "data".to_string(),
            })
        );
        assert_eq!(parse_directory(&[]).unwrap(), FactValue::Absent);
        assert!(parse_directory(&lines(&["ls: weird"])).is_err());
    }

    #[test]
    fn octal_mode_strips_leading_zeros() {
        assert_eq!(octal_mode("rwxr-xr-x"), "755");
        assert_eq!(octal_mode("---r-----"), "40");
        assert_eq!(octal_mode("---------"), "0");
        assert_eq!(octal_mode("rwxrwxrwt"), "1777");
    }

    #[test]
    fn windows_file_row_is_parsed() {
        let value = parse_windows_file(&lines(&[
            "Mode                 LastWriteTime         Length Name",
            "----                 -------------         ------ ----",
            "-a--s-        1/25/2020   8:19 PM          67584 bootstat.dat",
        ]))
        .unwrap();
        let FactValue::WindowsFile(info) = value else {
            panic!("expected windows file");
        };
        assert!(info.attributes.archive);
        assert!(info.attributes.system);
        assert!(!info.attributes.hidden);
        assert_eq!(info.size, "67584");
        assert_eq!(info.name, "bootstat.dat");
        // PM is ignored by the hour parse.
        assert_eq!(
            info.mtime.map(|t| t.format("%H:%M").to_string()).as_deref(),
            Some("08:19")
        );
    }

    #[test]
    fn windows_directory_rows_resolve_absent() {
        let value = parse_windows_file(&lines(&[
            "d-----        1/25/2020  10:27 AM                WinSxS",
        ]))
        .unwrap();
        assert_eq!(value, FactValue::Absent);
    }
}
