//! Final run report persistence.

use std::path::Path;

use anyhow::{Context, Result};

use crate::core::types::RunReport;

/// Atomically write the report as pretty JSON.
pub fn write_report(path: &Path, report: &RunReport) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(report).context("serialize run report")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ExecutionResult, Status};

    #[test]
    fn report_is_written_as_json() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("out/report.json");
        let report = RunReport {
            operations: vec!["motd".to_string()],
            hosts: vec!["web1".to_string()],
            results: vec![ExecutionResult::new("web1", 0, "motd", Status::Changed)],
            aborted_at: None,
            unreachable: Vec::new(),
            success: true,
            exit_code: 0,
        };
        write_report(&path, &report).expect("write");

        let raw = std::fs::read_to_string(&path).expect("read");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(value["results"][0]["status"], "changed");
        let back: RunReport = serde_json::from_str(&raw).expect("decode");
        assert_eq!(back, report);
    }
}
