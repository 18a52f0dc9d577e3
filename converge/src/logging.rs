//! Diagnostic tracing for the engine, written to stderr.
//!
//! Operators read run progress from the event printer on stdout and from
//! `--report` files; neither depends on `RUST_LOG`. Tracing carries the
//! per-host detail (fact fetches, connection failures, invalidations) that
//! is only wanted while debugging a run.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset, empty or unparsable.
pub const DEFAULT_DIRECTIVE: &str = "converge=warn";

/// Install the global subscriber.
///
/// ```bash
/// RUST_LOG=converge::fact_store=debug converge run deploy.toml
/// ```
pub fn init() {
    let filter = filter_from(std::env::var("RUST_LOG").ok().as_deref());
    // A subscriber may already be installed when embedded; keep that one.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .try_init();
}

fn filter_from(raw: Option<&str>) -> EnvFilter {
    match raw.map(str::trim) {
        Some(directives) if !directives.is_empty() => EnvFilter::try_new(directives)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE)),
        _ => EnvFilter::new(DEFAULT_DIRECTIVE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_or_blank_env_uses_default() {
        assert_eq!(filter_from(None).to_string(), DEFAULT_DIRECTIVE);
        assert_eq!(filter_from(Some("  ")).to_string(), DEFAULT_DIRECTIVE);
    }

    #[test]
    fn env_directives_are_used_verbatim() {
        assert_eq!(
            filter_from(Some("converge::executor=debug")).to_string(),
            "converge::executor=debug"
        );
    }
}
