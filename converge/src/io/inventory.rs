//! Inventory file loading (`inventory.toml`).

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;

use crate::core::inventory::{GroupDecl, HostDecl, Inventory, resolve};

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct InventoryFile {
    /// Kept as a raw table so declaration order survives.
    hosts: toml::Table,
    groups: BTreeMap<String, GroupDecl>,
}

pub fn parse_inventory(contents: &str) -> Result<Inventory> {
    let raw: InventoryFile = toml::from_str(contents).context("parse inventory toml")?;
    let mut order = Vec::with_capacity(raw.hosts.len());
    let mut hosts = BTreeMap::new();
    for (name, value) in raw.hosts {
        let decl: HostDecl = value
            .try_into()
            .with_context(|| format!("host '{name}'"))?;
        order.push(name.clone());
        hosts.insert(name, decl);
    }
    resolve(&hosts, &order, &raw.groups).map_err(|e| anyhow!(e))
}

pub fn load_inventory(path: &Path) -> Result<Inventory> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_inventory(&contents).with_context(|| format!("load inventory {}", path.display()))
}
