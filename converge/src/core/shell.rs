//! Shell quoting and privilege-escalation wrapping.

use crate::core::types::Escalation;

/// Quote a string for POSIX `sh` using single quotes.
pub fn quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-=:,+@%".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r#"'"'"'"#))
}

/// Quote a string for PowerShell using single quotes.
pub fn quote_powershell(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Wrap a command so it runs under `sudo` when escalation is enabled.
///
/// `-n` makes sudo fail instead of prompting; `-H` sets `$HOME` to the
/// target user's home.
pub fn wrap(command: &str, escalation: &Escalation) -> String {
    if !escalation.enabled {
        return command.to_string();
    }
    let mut wrapped = String::from("sudo -H -n");
    if let Some(user) = &escalation.user {
        wrapped.push_str(" -u ");
        wrapped.push_str(&quote(user));
    }
    wrapped.push_str(" sh -c ");
    wrapped.push_str(&quote(command));
    wrapped
}
