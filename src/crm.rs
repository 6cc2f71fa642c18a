// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! CRM command bundles and their rendering from resources and the dependency graph.
//!
//! The structured commands are what the command layer consumes. Their `Display` form is crmsh
//! syntax, used in dry-run reports and by the `render` subcommand.

use std::{collections::BTreeMap, fmt, sync::Arc};

use log::warn;

use crate::{
    graph::{Change, ConstraintKind, DependencyGraph, NodeInfo, ResourceSet, SetConstraint},
    reference::{AttrGroup, Reference},
    resource::{split_operation_key, Resource, ResourceId, ResourceKind},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Score {
    Infinity,
    NegInfinity,
    Value(i64),
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Score::Infinity => write!(f, "inf"),
            Score::NegInfinity => write!(f, "-inf"),
            Score::Value(v) => write!(f, "{v}"),
        }
    }
}

impl std::str::FromStr for Score {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inf" | "+inf" | "infinity" | "+infinity" => Ok(Score::Infinity),
            "-inf" | "-infinity" => Ok(Score::NegInfinity),
            other => other
                .parse::<i64>()
                .map(Score::Value)
                .map_err(|_| format!("'{s}' is not a score")),
        }
    }
}

/// Whether the command layer has to create the resource or update an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Create,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleKind {
    Primitive,
    Group { children: Vec<String> },
    Clone { master_slave: bool, child: Option<String> },
}

/// Everything needed to create or update one CRM resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceBundle {
    pub verb: Verb,
    pub id: String,
    pub class: String,
    pub provider: Option<String>,
    pub kind: String,
    pub body: BundleKind,
    pub params: BTreeMap<String, String>,
    pub meta: BTreeMap<String, String>,
    /// Operation name to operation parameters.
    pub operations: BTreeMap<String, BTreeMap<String, String>>,
    /// Id of the attribute set this resource's meta attributes are the same as.
    pub meta_ref: Option<String>,
    pub operations_ref: Option<String>,
}

impl ResourceBundle {
    /// The identity attributes as the command layer expects them.
    pub fn identity(&self) -> BTreeMap<&'static str, String> {
        let mut identity = BTreeMap::from([
            ("id", self.id.clone()),
            ("class", self.class.clone()),
            ("type", self.kind.clone()),
        ]);
        if let Some(provider) = &self.provider {
            identity.insert("provider", provider.clone());
        }
        identity
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedSet {
    pub members: Vec<String>,
    pub sequential: bool,
    pub require_all: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrmCommand {
    SetResource(ResourceBundle),
    RemoveResource {
        id: String,
    },
    SetLocation {
        id: String,
        resource: String,
        host: String,
        score: Score,
    },
    RemoveLocation {
        id: String,
    },
    SetOrder {
        id: String,
        first: String,
        first_action: Option<String>,
        then: String,
        then_action: Option<String>,
        score: Score,
    },
    RemoveOrder {
        id: String,
    },
    SetColocation {
        id: String,
        resource: String,
        with_resource: String,
        with_role: Option<String>,
        score: Score,
    },
    RemoveColocation {
        id: String,
    },
    SetResourceSet {
        id: String,
        kind: ConstraintKind,
        sets: Vec<RenderedSet>,
        score: Score,
    },
}

/// A list of commands, all meant either as a dry run or for real.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrmArtifact {
    pub commands: Vec<CrmCommand>,
    pub test_only: bool,
}

impl CrmArtifact {
    pub fn new(commands: Vec<CrmCommand>, test_only: bool) -> Self {
        CrmArtifact {
            commands,
            test_only,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl fmt::Display for CrmArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for command in &self.commands {
            writeln!(f, "{command}")?;
        }
        Ok(())
    }
}

fn quote(value: &str) -> String {
    if value.is_empty() || value.contains(['/', '=', ' ', '\t', '"']) {
        format!("\"{}\"", value.replace('"', "\\\""))
    } else {
        value.to_string()
    }
}

fn write_nvpairs(
    f: &mut fmt::Formatter<'_>,
    header: &str,
    nvpairs: &BTreeMap<String, String>,
) -> fmt::Result {
    if nvpairs.is_empty() {
        return Ok(());
    }
    write!(f, " {header}")?;
    for (name, value) in nvpairs {
        write!(f, " {name}={}", quote(value))?;
    }
    Ok(())
}

fn write_set(f: &mut fmt::Formatter<'_>, set: &RenderedSet) -> fmt::Result {
    let (open, close) = if set.require_all { ("(", ")") } else { ("[", "]") };
    write!(f, " {open}")?;
    for member in &set.members {
        write!(f, " {member}")?;
    }
    if set.sequential {
        write!(f, " sequential=true")?;
    }
    write!(f, " {close}")
}

impl fmt::Display for CrmCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrmCommand::SetResource(bundle) => {
                match &bundle.body {
                    BundleKind::Primitive => {
                        write!(f, "primitive {} {}", bundle.id, bundle.class)?;
                        if let Some(provider) = &bundle.provider {
                            write!(f, ":{provider}")?;
                        }
                        write!(f, ":{}", bundle.kind)?;
                    }
                    BundleKind::Group { children } => {
                        write!(f, "group {}", bundle.id)?;
                        for child in children {
                            write!(f, " {child}")?;
                        }
                    }
                    BundleKind::Clone {
                        master_slave,
                        child,
                    } => {
                        let word = if *master_slave { "ms" } else { "clone" };
                        write!(f, "{word} {}", bundle.id)?;
                        if let Some(child) = child {
                            write!(f, " {child}")?;
                        }
                    }
                }
                write_nvpairs(f, "params", &bundle.params)?;
                match &bundle.meta_ref {
                    Some(id) => write!(f, " meta $id-ref={id}")?,
                    None => write_nvpairs(f, "meta", &bundle.meta)?,
                }
                match &bundle.operations_ref {
                    Some(id) => write!(f, " operations $id-ref={id}")?,
                    None => {
                        for (op, params) in &bundle.operations {
                            write!(f, " op {op}")?;
                            for (name, value) in params {
                                write!(f, " {name}={}", quote(value))?;
                            }
                        }
                    }
                }
                Ok(())
            }
            CrmCommand::RemoveResource { id }
            | CrmCommand::RemoveLocation { id }
            | CrmCommand::RemoveOrder { id }
            | CrmCommand::RemoveColocation { id } => write!(f, "delete {id}"),
            CrmCommand::SetLocation {
                id,
                resource,
                host,
                score,
            } => write!(f, "location {id} {resource} {score}: {host}"),
            CrmCommand::SetOrder {
                id,
                first,
                first_action,
                then,
                then_action,
                score,
            } => {
                write!(f, "order {id} {score}: {first}")?;
                if let Some(action) = first_action {
                    write!(f, ":{action}")?;
                }
                write!(f, " {then}")?;
                if let Some(action) = then_action {
                    write!(f, ":{action}")?;
                }
                Ok(())
            }
            CrmCommand::SetColocation {
                id,
                resource,
                with_resource,
                with_role,
                score,
            } => {
                write!(f, "colocation {id} {score}: {resource} {with_resource}")?;
                if let Some(role) = with_role {
                    write!(f, ":{role}")?;
                }
                Ok(())
            }
            CrmCommand::SetResourceSet {
                id,
                kind,
                sets,
                score,
            } => {
                let word = match kind {
                    ConstraintKind::Order => "order",
                    ConstraintKind::Colocation => "colocation",
                };
                write!(f, "{word} {id} {score}:")?;
                for set in sets {
                    write_set(f, set)?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("{0} has no id usable in constraints")]
    NoId(ResourceId),
    #[error("{0} is not a placeholder")]
    NotAPlaceholder(ResourceId),
    #[error("{0} is a placeholder and has no resource of its own")]
    Placeholder(ResourceId),
    #[error("{0} is not a known resource")]
    Unknown(ResourceId),
}

/// What rendering needs beyond the graph's view of resources.
pub trait RenderContext: NodeInfo {
    fn resource(&self, id: ResourceId) -> Option<Arc<Resource>>;
}

fn constraint_id(ctx: &impl RenderContext, id: ResourceId) -> Result<String, RenderError> {
    ctx.constraint_id(id).ok_or(RenderError::NoId(id))
}

/// The id a direct constraint gets when the cluster has not named it already.
pub fn direct_constraint_id(kind: ConstraintKind, parent: &str, child: &str) -> String {
    match kind {
        ConstraintKind::Order => format!("ord_{parent}_{child}"),
        ConstraintKind::Colocation => format!("col_{child}_{parent}"),
    }
}

/// The id a placeholder's set constraint gets when it has none yet.
pub fn set_constraint_id(kind: ConstraintKind, placeholder: &str) -> String {
    match kind {
        ConstraintKind::Order => format!("ord_{placeholder}"),
        ConstraintKind::Colocation => format!("col_{placeholder}"),
    }
}

/// Render the create/update command for one resource from its pending values.
///
/// Instance parameters and meta attributes equal to their default are left out, unless the
/// agent asks for defaults to be written. Operation parameters equal to their default are
/// always left out.
pub fn render_crm_resource(
    resource: &Resource,
    ctx: &impl RenderContext,
) -> Result<ResourceBundle, RenderError> {
    let (schema, agent) = match resource.params.schema() {
        Some(s) => (Some(s.0), s.1),
        None => (None, resource.agent.clone()),
    };
    let ignore_defaults = schema
        .as_ref()
        .is_some_and(|s| s.ignore_defaults(&agent));

    let meta_ref = match resource.reference(AttrGroup::Meta).pending {
        Reference::To(target) => Some(format!(
            "{}-{}",
            constraint_id(ctx, target)?,
            AttrGroup::Meta
        )),
        _ => None,
    };
    let operations_ref = match resource.reference(AttrGroup::Operations).pending {
        Reference::To(target) => Some(format!(
            "{}-{}",
            constraint_id(ctx, target)?,
            AttrGroup::Operations
        )),
        _ => None,
    };

    let mut params = BTreeMap::new();
    let mut meta = BTreeMap::new();
    for name in resource.params.names() {
        let Some(value) = resource.params.get(&name).filter(|v| !v.is_empty()) else {
            continue;
        };
        let is_default = resource.params.default_value(&name).as_deref() == Some(value.as_str());
        if is_default && !ignore_defaults {
            continue;
        }
        let is_meta = schema.as_ref().is_some_and(|s| s.is_meta_attr(&agent, &name));
        if is_meta {
            if meta_ref.is_none() {
                meta.insert(name, value);
            }
        } else {
            params.insert(name, value);
        }
    }

    let mut operations: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    if operations_ref.is_none() {
        for key in resource.operations.names() {
            let Some((op, param)) = split_operation_key(&key) else {
                continue;
            };
            let Some(value) = resource.operations.get(&key).filter(|v| !v.is_empty()) else {
                continue;
            };
            if resource.operations.default_value(&key).as_deref() == Some(value.as_str()) {
                continue;
            }
            operations
                .entry(op.to_string())
                .or_default()
                .insert(param.to_string(), value);
        }
    }

    let body = match resource.kind() {
        ResourceKind::Primitive => BundleKind::Primitive,
        ResourceKind::Group { children } => BundleKind::Group {
            children: children
                .iter()
                .map(|c| member_name(ctx, *c))
                .collect::<Result<_, _>>()?,
        },
        ResourceKind::Clone {
            master_slave,
            wrapped,
        } => BundleKind::Clone {
            master_slave,
            child: wrapped.map(|c| member_name(ctx, c)).transpose()?,
        },
        ResourceKind::Placeholder => return Err(RenderError::Placeholder(resource.id)),
    };

    Ok(ResourceBundle {
        verb: if resource.is_new() {
            Verb::Create
        } else {
            Verb::Update
        },
        id: resource.name(),
        class: resource.agent.class.clone(),
        provider: resource.agent.provider.clone(),
        kind: resource.agent.kind.clone(),
        body,
        params,
        meta,
        operations,
        meta_ref,
        operations_ref,
    })
}

/// Group and clone members are created together with their container, so their pending name
/// is used even if they were never applied.
fn member_name(ctx: &impl RenderContext, id: ResourceId) -> Result<String, RenderError> {
    ctx.resource(id)
        .map(|r| r.name())
        .ok_or(RenderError::Unknown(id))
}

/// Location commands for every location score of `resource` that differs from what was
/// applied. With `all`, every location score is rendered, changed or not.
pub fn render_locations(resource: &Resource, all: bool) -> Vec<CrmCommand> {
    let name = resource.name();
    let mut commands = Vec::new();
    for host in resource.locations.names() {
        if !all && !resource.locations.is_changed(Some(&host)) {
            continue;
        }
        let id = format!("loc_{name}_{host}");
        match resource.locations.get(&host) {
            Some(score) if !score.is_empty() => match score.parse::<Score>() {
                Ok(score) => commands.push(CrmCommand::SetLocation {
                    id,
                    resource: name.clone(),
                    host,
                    score,
                }),
                Err(e) => warn!("skipping location of {name} on {host}: {e}"),
            },
            _ => {
                if resource.locations.saved(&host).is_some() {
                    commands.push(CrmCommand::RemoveLocation { id });
                }
            }
        }
    }
    commands
}

fn render_direct(
    parent: ResourceId,
    child: ResourceId,
    kind: ConstraintKind,
    id: Option<&str>,
    ctx: &impl RenderContext,
) -> Result<CrmCommand, RenderError> {
    let parent_id = constraint_id(ctx, parent)?;
    let child_id = constraint_id(ctx, child)?;
    let master_slave = ctx.is_master_slave(parent);
    let id = id
        .map(str::to_string)
        .unwrap_or_else(|| direct_constraint_id(kind, &parent_id, &child_id));
    Ok(match kind {
        ConstraintKind::Order => CrmCommand::SetOrder {
            id,
            first: parent_id,
            first_action: master_slave.then(|| "promote".to_string()),
            then: child_id,
            then_action: master_slave.then(|| "start".to_string()),
            score: Score::Infinity,
        },
        ConstraintKind::Colocation => CrmCommand::SetColocation {
            id,
            resource: child_id,
            with_resource: parent_id,
            with_role: master_slave.then(|| "Master".to_string()),
            score: Score::Infinity,
        },
    })
}

fn render_list(list: &ResourceSet, ctx: &impl RenderContext) -> RenderedSet {
    let members = list
        .members
        .iter()
        .filter_map(|m| {
            let id = ctx.constraint_id(*m);
            if id.is_none() {
                warn!("leaving {m} out of a resource set, it has no id yet");
            }
            id
        })
        .collect();
    RenderedSet {
        members,
        sequential: list.sequential,
        require_all: list.require_all,
    }
}

/// Render a placeholder's set constraint. Order sets are written before-then-after; colocation
/// sets list the dependent resources first.
pub fn render_set(
    placeholder: ResourceId,
    kind: ConstraintKind,
    set: &SetConstraint,
    ctx: &impl RenderContext,
) -> Result<CrmCommand, RenderError> {
    let name = constraint_id(ctx, placeholder)?;
    let id = set
        .id
        .clone()
        .unwrap_or_else(|| set_constraint_id(kind, &name));
    let (before, after) = set.oriented();
    let lists = match kind {
        ConstraintKind::Order => [before, after],
        ConstraintKind::Colocation => [after, before],
    };
    let sets = lists
        .iter()
        .filter(|l| !l.members.is_empty())
        .map(|l| render_list(l, ctx))
        .collect();
    Ok(CrmCommand::SetResourceSet {
        id,
        kind,
        sets,
        score: Score::Infinity,
    })
}

fn remove_command(kind: ConstraintKind, id: String) -> CrmCommand {
    match kind {
        ConstraintKind::Order => CrmCommand::RemoveOrder { id },
        ConstraintKind::Colocation => CrmCommand::RemoveColocation { id },
    }
}

/// Turn graph changes into commands, reading the current graph for what the changes refer to.
pub fn render_changes(
    changes: &[Change],
    graph: &DependencyGraph,
    ctx: &impl RenderContext,
) -> Result<Vec<CrmCommand>, RenderError> {
    let mut commands = Vec::new();
    for change in changes {
        match change {
            Change::AddDirect {
                parent,
                child,
                kind,
            } => {
                let id = graph.edge(*parent, *child).and_then(|e| e.id(*kind));
                commands.push(render_direct(*parent, *child, *kind, id, ctx)?);
            }
            Change::RemoveDirect {
                parent,
                child,
                kind,
                id,
            } => {
                let id = match id {
                    Some(id) => id.clone(),
                    None => direct_constraint_id(
                        *kind,
                        &constraint_id(ctx, *parent)?,
                        &constraint_id(ctx, *child)?,
                    ),
                };
                commands.push(remove_command(*kind, id));
            }
            Change::RewriteSet { placeholder, kind } => {
                let ph = graph
                    .placeholder(*placeholder)
                    .ok_or(RenderError::NotAPlaceholder(*placeholder))?;
                commands.push(render_set(*placeholder, *kind, ph.pending.get(*kind), ctx)?);
            }
            Change::DeleteSet { kind, id, .. } => {
                if let Some(id) = id {
                    commands.push(remove_command(*kind, id.clone()));
                }
            }
        }
    }
    Ok(commands)
}

/// Render every constraint in the graph, direct edges first, then placeholder sets. Deferred
/// edges are left out. Rendering the same graph twice gives the same commands.
pub fn render_constraints(
    graph: &DependencyGraph,
    ctx: &impl RenderContext,
) -> Result<Vec<CrmCommand>, RenderError> {
    let mut commands = Vec::new();
    for (parent, child, edge) in graph.edges() {
        for kind in edge.kinds.kinds() {
            commands.push(render_direct(parent, child, kind, edge.id(kind), ctx)?);
        }
    }
    for (placeholder, ph) in graph.placeholders() {
        for kind in [ConstraintKind::Order, ConstraintKind::Colocation] {
            let set = ph.pending.get(kind);
            if !set.is_empty() {
                commands.push(render_set(placeholder, kind, set, ctx)?);
            }
        }
    }
    Ok(commands)
}
