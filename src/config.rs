// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::schema::{ResourceAgent, StaticSchema};

/// Config is the model of a cluster as written in the description file. The file is
/// deserialized into a Config object, which `Cluster::from_description` turns into the in-memory
/// registry.
///
/// The two models are kept apart on purpose: the registry tracks three snapshots of every value
/// and the dependency graph, none of which belong in the file.
#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub hosts: Vec<Host>,

    #[serde(default)]
    pub schema: StaticSchema,

    #[serde(default)]
    pub primitives: Vec<Primitive>,

    #[serde(default)]
    pub groups: Vec<Group>,

    #[serde(default)]
    pub clones: Vec<CloneSet>,

    #[serde(default)]
    pub placeholders: Vec<Placeholder>,

    #[serde(default)]
    pub drbd: Vec<Drbd>,

    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Host {
    pub name: String,
    /// Addresses the host can replicate on. The first one inside the replication network is
    /// the default.
    #[serde(default)]
    pub addresses: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Primitive {
    pub id: String,
    pub agent: ResourceAgent,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Keyed `<operation>:<parameter>`.
    #[serde(default)]
    pub operations: BTreeMap<String, String>,
    /// Host to location score.
    #[serde(default)]
    pub locations: BTreeMap<String, String>,
    pub meta_same_as: Option<String>,
    pub operations_same_as: Option<String>,
    /// The resource already exists on the cluster with these values.
    #[serde(default)]
    pub applied: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Group {
    pub id: String,
    pub members: Vec<String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub applied: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct CloneSet {
    pub id: String,
    pub wrapped: Option<String>,
    #[serde(default)]
    pub master_slave: bool,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub applied: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Placeholder {
    pub id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Drbd {
    pub name: String,
    pub hosts: Vec<String>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    /// Data host to its replication endpoint.
    #[serde(default)]
    pub endpoints: BTreeMap<String, Endpoint>,
    #[serde(default)]
    pub proxies: Vec<Proxy>,
    #[serde(default)]
    pub applied: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Volume {
    pub number: u32,
    pub device: Option<String>,
    /// Host to backing block device.
    pub disks: BTreeMap<String, String>,
    #[serde(default)]
    pub meta_disks: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Endpoint {
    pub address: Option<String>,
    pub port: Option<String>,
    /// Proxy host the link goes through.
    pub proxy: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Proxy {
    pub host: String,
    pub inside_ip: Option<String>,
    pub inside_port: Option<String>,
    pub outside_ip: Option<String>,
    pub outside_port: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintKinds {
    Order,
    Colocation,
    Both,
}

/// `then` depends on `first`: it is started after it and placed with it.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Constraint {
    pub kind: ConstraintKinds,
    pub first: String,
    pub then: String,
    /// The constraint already exists on the cluster.
    #[serde(default)]
    pub applied: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_description() {
        let config = Config::from_toml(
            r#"
            [[hosts]]
            name = "alpha"
            addresses = ["10.0.0.1"]

            [schema.agents."ocf:heartbeat:IPaddr2"]
            params = [{ name = "ip", required = true }]
            operations = [{ name = "monitor", params = [["interval", "10s"]] }]

            [[primitives]]
            id = "vip"
            agent = "ocf:heartbeat:IPaddr2"
            params = { ip = "10.0.0.5" }

            [[drbd]]
            name = "r0"
            hosts = ["alpha"]
            volumes = [{ number = 0, device = "/dev/drbd0", disks = { alpha = "/dev/sda1" } }]
            endpoints = { alpha = { address = "10.0.0.1", proxy = "gw" } }
            proxies = [{ host = "gw", inside-ip = "127.0.0.1" }]

            [[constraints]]
            kind = "both"
            first = "vip"
            then = "web"
            "#,
        )
        .unwrap();

        assert_eq!(config.hosts[0].addresses, vec!["10.0.0.1"]);
        assert_eq!(config.primitives[0].agent.kind, "IPaddr2");
        assert!(config.schema.agents.contains_key("ocf:heartbeat:IPaddr2"));
        assert_eq!(config.drbd[0].endpoints["alpha"].proxy.as_deref(), Some("gw"));
        assert_eq!(config.drbd[0].proxies[0].inside_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(config.constraints[0].kind, ConstraintKinds::Both);
    }
}
