//! Inventory model and group resolution.
//!
//! Resolution is pure: it takes the declared hosts and groups and produces
//! the ordered, de-duplicated target list with merged per-host data.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub type HostData = BTreeMap<String, serde_json::Value>;

/// One target host. Lives for the whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    /// Alternate connection address; the name is used when unset.
    pub address: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    /// Groups this host belongs to, directly or through nesting, sorted.
    pub groups: Vec<String>,
    pub data: HostData,
}

impl Host {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            address: None,
            user: None,
            port: None,
            groups: Vec::new(),
            data: HostData::new(),
        }
    }

    pub fn connect_address(&self) -> &str {
        self.address.as_deref().unwrap_or(&self.name)
    }
}

/// Per-host declaration as written in the inventory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostDecl {
    pub address: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub data: HostData,
}

/// Named set of hosts and nested groups with shared data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupDecl {
    pub hosts: Vec<String>,
    pub groups: Vec<String>,
    pub data: HostData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Inventory {
    hosts: Vec<Host>,
    groups: BTreeMap<String, Vec<String>>,
}

impl Inventory {
    /// All hosts, de-duplicated, in first-declaration order.
    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    /// Narrow the target set to the given host and group names.
    ///
    /// An empty `limits` slice selects every host.
    pub fn select(&self, limits: &[String]) -> Result<Vec<Host>, String> {
        if limits.is_empty() {
            return Ok(self.hosts.clone());
        }
        let mut wanted = BTreeSet::new();
        for limit in limits {
            if let Some(members) = self.groups.get(limit) {
                wanted.extend(members.iter().cloned());
            } else if self.hosts.iter().any(|h| &h.name == limit) {
                wanted.insert(limit.clone());
            } else {
                return Err(format!("no host or group named '{limit}'"));
            }
        }
        Ok(self
            .hosts
            .iter()
            .filter(|h| wanted.contains(&h.name))
            .cloned()
            .collect())
    }
}

/// Build an [`Inventory`] from declared hosts and groups.
///
/// Host order: the hosts table first, then hosts first mentioned by groups
/// (groups visited in name order). Data precedence, lowest first: groups in
/// the order they were reached, then the host's own data.
pub fn resolve(
    hosts: &BTreeMap<String, HostDecl>,
    host_order: &[String],
    groups: &BTreeMap<String, GroupDecl>,
) -> Result<Inventory, String> {
    let mut members: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for name in groups.keys() {
        let mut stack = Vec::new();
        let expanded = expand_group(name, groups, &mut stack)?;
        members.insert(name.clone(), expanded);
    }

    let mut order: Vec<String> = Vec::new();
    let mut seen = BTreeSet::new();
    for name in host_order.iter().chain(hosts.keys()) {
        if hosts.contains_key(name) && seen.insert(name.clone()) {
            order.push(name.clone());
        }
    }
    for expanded in members.values() {
        for name in expanded {
            if seen.insert(name.clone()) {
                order.push(name.clone());
            }
        }
    }

    let mut resolved = Vec::with_capacity(order.len());
    for name in order {
        let decl = hosts.get(&name).cloned().unwrap_or_default();
        let mut host = Host {
            name: name.clone(),
            address: decl.address,
            user: decl.user,
            port: decl.port,
            groups: Vec::new(),
            data: HostData::new(),
        };
        for (group_name, expanded) in &members {
            if expanded.contains(&name) {
                host.groups.push(group_name.clone());
            }
        }
        for group_name in group_data_order(&name, groups) {
            if let Some(group) = groups.get(&group_name) {
                merge(&mut host.data, &group.data);
            }
        }
        merge(&mut host.data, &decl.data);
        resolved.push(host);
    }

    Ok(Inventory {
        hosts: resolved,
        groups: members,
    })
}

fn expand_group(
    name: &str,
    groups: &BTreeMap<String, GroupDecl>,
    stack: &mut Vec<String>,
) -> Result<Vec<String>, String> {
    if stack.iter().any(|g| g == name) {
        stack.push(name.to_string());
        return Err(format!("group cycle: {}", stack.join(" -> ")));
    }
    let group = groups
        .get(name)
        .ok_or_else(|| format!("unknown group '{name}'"))?;

    stack.push(name.to_string());
    let mut out: Vec<String> = Vec::new();
    for host in &group.hosts {
        if !out.contains(host) {
            out.push(host.clone());
        }
    }
    for nested in &group.groups {
        for host in expand_group(nested, groups, stack)? {
            if !out.contains(&host) {
                out.push(host);
            }
        }
    }
    stack.pop();
    Ok(out)
}

/// Groups contributing data to `host`, outermost first.
///
/// A group that includes another group is applied before it, so the more
/// specific group's values win.
fn group_data_order(host: &str, groups: &BTreeMap<String, GroupDecl>) -> Vec<String> {
    fn depth(name: &str, groups: &BTreeMap<String, GroupDecl>, seen: &mut Vec<String>) -> usize {
        if seen.iter().any(|g| g == name) {
            return 0;
        }
        seen.push(name.to_string());
        let d = groups
            .iter()
            .filter(|(_, g)| g.groups.iter().any(|n| n == name))
            .map(|(parent, _)| depth(parent, groups, seen) + 1)
            .max()
            .unwrap_or(0);
        seen.pop();
        d
    }

    let mut direct: Vec<(usize, String)> = Vec::new();
    for name in groups.keys() {
        let mut stack = Vec::new();
        let contains = expand_group(name, groups, &mut stack)
            .map(|members| members.iter().any(|m| m == host))
            .unwrap_or(false);
        if contains {
            direct.push((depth(name, groups, &mut Vec::new()), name.clone()));
        }
    }
    direct.sort();
    direct.into_iter().map(|(_, name)| name).collect()
}

fn merge(target: &mut HostData, source: &HostData) {
    for (key, value) in source {
        target.insert(key.clone(), value.clone());
    }
}
