// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Parameter schemas for resource agents and DRBD resources.
//!
//! The schemas themselves come from outside (resource agent metadata, DRBD's own XML option
//! description). This module only defines what the engine needs from them and a simple static
//! implementation that can be loaded from the cluster description file.

use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};

/// Identifies the kind of a resource, for example `ocf:heartbeat:IPaddr2`, `stonith:fence_ipmilan`,
/// or `drbd:resource` for the options of a DRBD resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceAgent {
    pub class: String,
    pub provider: Option<String>,
    pub kind: String,
}

impl ResourceAgent {
    pub fn new(class: &str, provider: Option<&str>, kind: &str) -> Self {
        ResourceAgent {
            class: class.to_string(),
            provider: provider.map(str::to_string),
            kind: kind.to_string(),
        }
    }

    pub fn drbd_resource() -> Self {
        Self::new("drbd", None, "resource")
    }

    /// Groups and clones have no agent of their own; their meta attributes are described under
    /// this pseudo agent.
    pub fn group() -> Self {
        Self::new("crm", None, "group")
    }

    pub fn clone_set() -> Self {
        Self::new("crm", None, "clone")
    }

    /// Placeholders are never rendered as resources.
    pub fn placeholder() -> Self {
        Self::new("crm", None, "placeholder")
    }
}

impl fmt::Display for ResourceAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.provider {
            Some(provider) => write!(f, "{}:{}:{}", self.class, provider, self.kind),
            None => write!(f, "{}:{}", self.class, self.kind),
        }
    }
}

impl TryFrom<String> for ResourceAgent {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceAgent> for String {
    fn from(agent: ResourceAgent) -> Self {
        agent.to_string()
    }
}

impl std::str::FromStr for ResourceAgent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(':').collect();
        match fields.as_slice() {
            [class, kind] if !class.is_empty() && !kind.is_empty() => {
                Ok(ResourceAgent::new(class, None, kind))
            }
            [class, provider, kind]
                if !class.is_empty() && !provider.is_empty() && !kind.is_empty() =>
            {
                Ok(ResourceAgent::new(class, Some(provider), kind))
            }
            _ => Err(format!("'{s}' is not of the form class[:provider]:type")),
        }
    }
}

/// What the engine consumes from a parameter schema.
///
/// Every lookup takes the agent the parameter belongs to. `parameter_names` returning `None`
/// means no schema is loaded for that agent yet; resources of such an agent stay locked.
pub trait SchemaProvider: fmt::Debug + Send + Sync {
    fn parameter_names(&self, agent: &ResourceAgent) -> Option<Vec<String>>;

    fn default_value(&self, agent: &ResourceAgent, name: &str) -> Option<String>;

    fn section(&self, agent: &ResourceAgent, name: &str) -> String;

    fn is_required(&self, agent: &ResourceAgent, name: &str) -> bool;

    fn is_advanced(&self, agent: &ResourceAgent, name: &str) -> bool;

    fn is_meta_attr(&self, agent: &ResourceAgent, name: &str) -> bool;

    fn is_integer(&self, agent: &ResourceAgent, name: &str) -> bool;

    fn is_checkbox(&self, agent: &ResourceAgent, name: &str) -> bool;

    fn validate(&self, agent: &ResourceAgent, name: &str, value: &str) -> bool;

    /// Declared operations with their parameters and defaults, e.g. `start` with
    /// `timeout = 20s`.
    fn operations(&self, agent: &ResourceAgent) -> Vec<OperationSpec>;

    /// Whether rendering should include parameters that equal their default.
    fn ignore_defaults(&self, agent: &ResourceAgent) -> bool;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    #[default]
    String,
    Integer,
    Boolean,
    Select,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ParamSpec {
    pub name: String,
    pub default: Option<String>,
    #[serde(default = "default_section")]
    pub section: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub advanced: bool,
    #[serde(default)]
    pub meta: bool,
    #[serde(default, rename = "type")]
    pub kind: ParamType,
    /// Allowed values for `select` parameters.
    #[serde(default)]
    pub choices: Vec<String>,
}

fn default_section() -> String {
    "parameters".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationSpec {
    pub name: String,
    /// Operation parameters (`timeout`, `interval`, ...) and their defaults.
    #[serde(default)]
    pub params: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AgentSchema {
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    #[serde(default)]
    pub operations: Vec<OperationSpec>,
    #[serde(default)]
    pub ignore_defaults: bool,
}

impl AgentSchema {
    fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }
}

/// A schema that is fully known up front, typically loaded from the `[schema]` table of the
/// cluster description.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticSchema {
    #[serde(default)]
    pub agents: HashMap<String, AgentSchema>,
}

impl StaticSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_agent(&mut self, agent: &ResourceAgent, schema: AgentSchema) {
        self.agents.insert(agent.to_string(), schema);
    }

    fn agent(&self, agent: &ResourceAgent) -> Option<&AgentSchema> {
        self.agents.get(&agent.to_string())
    }

    fn param(&self, agent: &ResourceAgent, name: &str) -> Option<&ParamSpec> {
        self.agent(agent)?.param(name)
    }
}

impl SchemaProvider for StaticSchema {
    fn parameter_names(&self, agent: &ResourceAgent) -> Option<Vec<String>> {
        self.agent(agent)
            .map(|a| a.params.iter().map(|p| p.name.clone()).collect())
    }

    fn default_value(&self, agent: &ResourceAgent, name: &str) -> Option<String> {
        self.param(agent, name).and_then(|p| p.default.clone())
    }

    fn section(&self, agent: &ResourceAgent, name: &str) -> String {
        self.param(agent, name)
            .map(|p| p.section.clone())
            .unwrap_or_else(default_section)
    }

    fn is_required(&self, agent: &ResourceAgent, name: &str) -> bool {
        self.param(agent, name).is_some_and(|p| p.required)
    }

    fn is_advanced(&self, agent: &ResourceAgent, name: &str) -> bool {
        self.param(agent, name).is_some_and(|p| p.advanced)
    }

    fn is_meta_attr(&self, agent: &ResourceAgent, name: &str) -> bool {
        self.param(agent, name).is_some_and(|p| p.meta)
    }

    fn is_integer(&self, agent: &ResourceAgent, name: &str) -> bool {
        self.param(agent, name)
            .is_some_and(|p| p.kind == ParamType::Integer)
    }

    fn is_checkbox(&self, agent: &ResourceAgent, name: &str) -> bool {
        self.param(agent, name)
            .is_some_and(|p| p.kind == ParamType::Boolean)
    }

    /// Empty values are left to the required check of the attribute store; this only checks
    /// the shape of non-empty values.
    fn validate(&self, agent: &ResourceAgent, name: &str, value: &str) -> bool {
        let Some(spec) = self.param(agent, name) else {
            return false;
        };
        if value.is_empty() {
            return true;
        }
        match spec.kind {
            ParamType::String => true,
            ParamType::Integer => {
                let value = value.trim_start_matches(['-', '+']);
                value == "INFINITY"
                    || value == "infinity"
                    || (!value.is_empty() && value.chars().all(|c| c.is_ascii_digit()))
            }
            ParamType::Boolean => matches!(value, "true" | "false"),
            ParamType::Select => spec.choices.iter().any(|c| c == value),
        }
    }

    fn operations(&self, agent: &ResourceAgent) -> Vec<OperationSpec> {
        self.agent(agent)
            .map(|a| a.operations.clone())
            .unwrap_or_default()
    }

    fn ignore_defaults(&self, agent: &ResourceAgent) -> bool {
        self.agent(agent).is_some_and(|a| a.ignore_defaults)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_agent() {
        let agent: ResourceAgent = "ocf:heartbeat:IPaddr2".parse().unwrap();
        assert_eq!(agent.class, "ocf");
        assert_eq!(agent.provider.as_deref(), Some("heartbeat"));
        assert_eq!(agent.kind, "IPaddr2");
        assert_eq!(agent.to_string(), "ocf:heartbeat:IPaddr2");

        let agent: ResourceAgent = "stonith:fence_ipmilan".parse().unwrap();
        assert_eq!(agent.provider, None);

        assert!("IPaddr2".parse::<ResourceAgent>().is_err());
        assert!("ocf::IPaddr2".parse::<ResourceAgent>().is_err());
    }

    #[test]
    fn validate_types() {
        let agent = ResourceAgent::drbd_resource();
        let mut schema = StaticSchema::new();
        schema.add_agent(
            &agent,
            AgentSchema {
                params: vec![
                    ParamSpec {
                        name: "al-extents".to_string(),
                        kind: ParamType::Integer,
                        ..Default::default()
                    },
                    ParamSpec {
                        name: "protocol".to_string(),
                        kind: ParamType::Select,
                        choices: vec!["A".into(), "B".into(), "C".into()],
                        ..Default::default()
                    },
                    ParamSpec {
                        name: "allow-two-primaries".to_string(),
                        kind: ParamType::Boolean,
                        ..Default::default()
                    },
                ],
                ..Default::default()
            },
        );

        assert!(schema.validate(&agent, "al-extents", "1237"));
        assert!(!schema.validate(&agent, "al-extents", "12a"));
        assert!(schema.validate(&agent, "protocol", "C"));
        assert!(!schema.validate(&agent, "protocol", "D"));
        assert!(schema.validate(&agent, "allow-two-primaries", "true"));
        assert!(!schema.validate(&agent, "allow-two-primaries", "yes"));
        assert!(!schema.validate(&agent, "no-such-param", "x"));
        assert!(schema.is_integer(&agent, "al-extents"));
        assert!(schema.is_checkbox(&agent, "allow-two-primaries"));
    }
}
