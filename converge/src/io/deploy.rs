//! Deploy file loading (`deploy.toml`): the ordered operation list.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::operations::Operation;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployFile {
    #[serde(default)]
    pub operations: Vec<Operation>,
}

impl DeployFile {
    pub fn validate(&self) -> Result<()> {
        if self.operations.is_empty() {
            return Err(anyhow!("deploy declares no operations"));
        }
        for (index, op) in self.operations.iter().enumerate() {
            op.validate()
                .map_err(|e| anyhow!("operation #{index}: {e}"))?;
        }
        Ok(())
    }
}

pub fn parse_deploy(contents: &str) -> Result<DeployFile> {
    let deploy: DeployFile = toml::from_str(contents).context("parse deploy toml")?;
    deploy.validate()?;
    Ok(deploy)
}

pub fn load_deploy(path: &Path) -> Result<DeployFile> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_deploy(&contents).with_context(|| format!("load deploy {}", path.display()))
}
