//! Template rendering for fact commands and per-host operation values.

use minijinja::{Environment, UndefinedBehavior, context};
use serde::Serialize;

use crate::core::inventory::Host;
use crate::core::shell;
use crate::error::PlanError;

/// Template environment with the `quote` and `ps_quote` filters installed.
pub struct Templates {
    env: Environment<'static>,
}

impl Default for Templates {
    fn default() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.add_filter("quote", |value: String| shell::quote(&value));
        env.add_filter("ps_quote", |value: String| shell::quote_powershell(&value));
        Self { env }
    }
}

impl Templates {
    pub fn render<S: Serialize>(&self, source: &str, ctx: S) -> Result<String, minijinja::Error> {
        self.env.render_str(source, ctx)
    }

    /// Render an operation value with `host` in scope.
    ///
    /// Values without `{{` are returned untouched so shell syntax such as
    /// `${#array[@]}` never reaches the template engine.
    pub fn render_for_host(&self, source: &str, host: &Host) -> Result<String, PlanError> {
        if !source.contains("{{") {
            return Ok(source.to_string());
        }
        self.render(source, context! { host => host })
            .map_err(|err| PlanError::Template(format!("{source}: {err}")))
    }
}
