// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Snapshots of the live cluster, as delivered by whatever polls the cluster's status.
//!
//! Resources and constraints are keyed by their cluster ids. `Cluster::refresh_from_live` maps
//! them back onto console resources.

use std::{collections::BTreeMap, future::Future};

use serde::Deserialize;

use crate::{
    graph::ConstraintKind,
    resource::{LiveStatus, RunState},
    schema::ResourceAgent,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiveState {
    #[default]
    Unknown,
    Running,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LiveKind {
    #[default]
    Primitive,
    Group {
        #[serde(default)]
        children: Vec<String>,
    },
    Clone {
        #[serde(default)]
        master_slave: bool,
        child: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LiveResource {
    pub agent: ResourceAgent,

    #[serde(default)]
    pub kind: LiveKind,

    #[serde(default)]
    pub state: LiveState,

    /// Hosts the resource runs on.
    #[serde(default)]
    pub running_on: Vec<String>,

    /// Failure reason, for failed resources.
    pub failure: Option<String>,

    #[serde(default)]
    pub fail_counts: BTreeMap<String, u32>,

    /// Instance parameters and meta attributes.
    #[serde(default)]
    pub params: BTreeMap<String, String>,

    /// Operation parameters keyed `<operation>:<parameter>`.
    #[serde(default)]
    pub operations: BTreeMap<String, String>,

    /// Location scores keyed by host.
    #[serde(default)]
    pub locations: BTreeMap<String, String>,

    /// Cluster id of the resource whose meta attributes this resource uses.
    pub meta_ref: Option<String>,
    pub operations_ref: Option<String>,
}

impl LiveResource {
    pub fn status(&self) -> LiveStatus {
        let run_state = match self.state {
            LiveState::Unknown => RunState::Unknown,
            LiveState::Stopped => RunState::Stopped,
            LiveState::Running => RunState::Running(self.running_on.clone()),
            LiveState::Failed => {
                RunState::Failed(self.failure.clone().unwrap_or_else(|| "unknown".to_string()))
            }
        };
        LiveStatus {
            run_state,
            fail_counts: self.fail_counts.clone(),
        }
    }
}

/// A constraint between two resources. `parent` is the resource that is started first, or that
/// the other one is placed with.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LiveConstraint {
    pub id: String,
    pub kind: LiveConstraintKind,
    pub parent: String,
    pub child: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiveConstraintKind {
    Order,
    Colocation,
}

impl From<LiveConstraintKind> for ConstraintKind {
    fn from(kind: LiveConstraintKind) -> Self {
        match kind {
            LiveConstraintKind::Order => ConstraintKind::Order,
            LiveConstraintKind::Colocation => ConstraintKind::Colocation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LiveResourceSet {
    pub members: Vec<String>,
    #[serde(default)]
    pub sequential: bool,
    #[serde(default = "default_require_all")]
    pub require_all: bool,
}

fn default_require_all() -> bool {
    true
}

/// A resource-set constraint, with its sets in the order the cluster lists them.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LiveSetConstraint {
    pub id: String,
    pub kind: LiveConstraintKind,
    pub sets: Vec<LiveResourceSet>,
}

/// Configuration of a DRBD resource as read from the hosts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LiveDrbd {
    #[serde(default)]
    pub options: BTreeMap<String, String>,

    /// Keyed like `DrbdResource::endpoints`.
    #[serde(default)]
    pub endpoints: BTreeMap<String, String>,

    /// Volume number to volume parameters, keyed like `DrbdVolume::store`. The numbers are
    /// kept as text, since TOML table keys always are.
    #[serde(default)]
    pub volumes: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LiveSnapshot {
    #[serde(default)]
    pub resources: BTreeMap<String, LiveResource>,

    #[serde(default)]
    pub constraints: Vec<LiveConstraint>,

    #[serde(default)]
    pub sets: Vec<LiveSetConstraint>,

    #[serde(default)]
    pub drbd: BTreeMap<String, LiveDrbd>,
}

impl LiveSnapshot {
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

/// Source of live snapshots. Polled by `Cluster::poll`.
pub trait StatusProvider: Send + Sync {
    /// The current state of the cluster, or `None` if it could not be read this time.
    fn snapshot(&self) -> impl Future<Output = Option<LiveSnapshot>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_snapshot() {
        let snapshot = LiveSnapshot::from_toml(
            r#"
            [resources.vip]
            agent = "ocf:heartbeat:IPaddr2"
            state = "running"
            running_on = ["alpha"]
            fail_counts = { beta = 2 }
            params = { ip = "10.0.0.5" }

            [resources.grp]
            agent = "crm:group"
            kind = { type = "group", children = ["vip"] }

            [[constraints]]
            id = "ord_vip_web"
            kind = "order"
            parent = "vip"
            child = "web"

            [[sets]]
            id = "col_ph1"
            kind = "colocation"
            sets = [{ members = ["a", "b"] }, { members = ["c"], sequential = true }]
            "#,
        )
        .unwrap();

        let vip = &snapshot.resources["vip"];
        assert_eq!(
            vip.status().run_state,
            RunState::Running(vec!["alpha".to_string()])
        );
        assert_eq!(vip.status().fail_counts["beta"], 2);
        assert_eq!(
            snapshot.resources["grp"].kind,
            LiveKind::Group {
                children: vec!["vip".to_string()]
            }
        );
        assert_eq!(snapshot.constraints[0].kind, LiveConstraintKind::Order);
        assert!(snapshot.sets[0].sets[0].require_all);
        assert!(snapshot.sets[0].sets[1].sequential);
    }

    #[test]
    fn parse_drbd_volumes() {
        let snapshot = LiveSnapshot::from_toml(
            r#"
            [drbd.r0]
            options = { protocol = "C" }
            endpoints = { "alpha:port" = "7788" }

            [drbd.r0.volumes.0]
            device = "/dev/drbd0"
            "alpha:disk" = "/dev/sda1"
            "#,
        )
        .unwrap();

        let r0 = &snapshot.drbd["r0"];
        assert_eq!(r0.endpoints["alpha:port"], "7788");
        assert_eq!(r0.volumes["0"]["device"], "/dev/drbd0");
        assert_eq!(r0.volumes["0"]["alpha:disk"], "/dev/sda1");
    }
}
