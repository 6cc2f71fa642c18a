// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Applying edits to the cluster.
//!
//! Every apply runs the same pipeline: check that everything involved is correct, render the
//! artifacts, run them in test mode, run them for real, and only then copy pending values to
//! saved. A failure at any step leaves every snapshot as it was, so the edits stay pending and
//! can be applied again.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    future::Future,
    sync::Arc,
};

use futures::{
    channel::oneshot,
    future::{BoxFuture, Shared},
    FutureExt,
};
use log::{debug, info, warn};

use crate::{
    cluster::{Applying, Cluster, ClusterError},
    crm::{self, CrmArtifact, CrmCommand, RenderError},
    drbd::{self, ConfigError},
    graph::{Change, ConstraintKind, DependencyGraph, EdgeKinds, GraphError, NodeInfo},
    ports::PortError,
    reference::{self, AttrGroup},
    resource::{ApplyEvent, Resource, ResourceId, ResourceKind},
};

/// What is handed to the command layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    /// The full resource-file text of a DRBD resource.
    Drbd {
        resource: String,
        text: String,
        test_only: bool,
    },
    /// Take a DRBD resource down and delete its resource file.
    DrbdRemove { resource: String, test_only: bool },
    Crm(CrmArtifact),
}

impl Artifact {
    pub fn test_only(&self) -> bool {
        match self {
            Artifact::Drbd { test_only, .. } | Artifact::DrbdRemove { test_only, .. } => {
                *test_only
            }
            Artifact::Crm(crm) => crm.test_only,
        }
    }

    /// The same artifact, for real.
    fn for_real(&self) -> Artifact {
        let mut artifact = self.clone();
        match &mut artifact {
            Artifact::Drbd { test_only, .. } | Artifact::DrbdRemove { test_only, .. } => {
                *test_only = false
            }
            Artifact::Crm(crm) => crm.test_only = false,
        }
        artifact
    }

    fn is_empty(&self) -> bool {
        matches!(self, Artifact::Crm(crm) if crm.is_empty())
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Artifact::Drbd { text, .. } => write!(f, "{text}"),
            Artifact::DrbdRemove { resource, .. } => writeln!(f, "remove drbd resource {resource}"),
            Artifact::Crm(crm) => write!(f, "{crm}"),
        }
    }
}

/// Outcome of running an artifact. In test mode `report` describes what would change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecReport {
    pub report: String,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ExecError {
    #[error("command failed: {0}")]
    Failed(String),
}

/// Runs artifacts against the cluster. How, and on which hosts, is up to the implementation.
pub trait CommandExecutor: Send + Sync {
    fn execute(
        &self,
        artifact: &Artifact,
    ) -> impl Future<Output = Result<ExecReport, ExecError>> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("{0} is not correct and cannot be applied")]
    Incorrect(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error(transparent)]
    Exec(#[from] ExecError),
}

impl From<GraphError> for ApplyError {
    fn from(e: GraphError) -> Self {
        ApplyError::Cluster(ClusterError::Graph(e))
    }
}

/// Signals of one background apply. Each fires at most once, `started` always before
/// `finished`, and any number of tasks may wait on either.
#[derive(Clone)]
pub struct ApplyTicket {
    started: Shared<BoxFuture<'static, bool>>,
    finished: Shared<BoxFuture<'static, Option<Result<ExecReport, String>>>>,
}

impl ApplyTicket {
    /// Resolves to true once the apply began, or false if it never will.
    pub fn started(&self) -> impl Future<Output = bool> {
        self.started.clone()
    }

    /// Resolves to the outcome of the apply, or `None` if the task went away without one.
    pub fn finished(&self) -> impl Future<Output = Option<Result<ExecReport, String>>> {
        self.finished.clone()
    }
}

/// Drives the apply pipeline against a cluster registry.
pub struct ApplyController<E> {
    cluster: Arc<Cluster>,
    executor: Arc<E>,
}

/// Everything one apply of a CRM resource will do.
struct Plan {
    artifact: Artifact,
    graph: DependencyGraph,
    changes: Vec<Change>,
    unit: Vec<Arc<Resource>>,
    ids: BTreeSet<ResourceId>,
}

impl<E: CommandExecutor> ApplyController<E> {
    pub fn new(cluster: Arc<Cluster>, executor: Arc<E>) -> Self {
        ApplyController { cluster, executor }
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// The resources that are applied together with `id`: its outermost container and
    /// everything inside it, members before their containers.
    fn unit(&self, id: ResourceId) -> Result<Vec<Arc<Resource>>, ClusterError> {
        let resource = self.cluster.require(id)?;
        let mut top = Arc::clone(&resource);
        if let Some(group) = top.parents().group.and_then(|g| self.cluster.resource(g)) {
            top = group;
        }
        if let Some(clone) = top.parents().clone.and_then(|c| self.cluster.resource(c)) {
            top = clone;
        }

        let mut unit = Vec::new();
        let mut stack = vec![(top, false)];
        while let Some((resource, expanded)) = stack.pop() {
            if expanded {
                unit.push(resource);
                continue;
            }
            let children = match resource.kind() {
                ResourceKind::Group { children } => children,
                ResourceKind::Clone {
                    wrapped: Some(wrapped),
                    ..
                } => vec![wrapped],
                _ => Vec::new(),
            };
            stack.push((Arc::clone(&resource), true));
            for child in children.iter().rev() {
                if let Some(child) = self.cluster.resource(*child) {
                    stack.push((child, false));
                }
            }
        }
        Ok(unit.into_iter().filter(|r| !r.is_placeholder()).collect())
    }

    /// Check and render everything an apply of `id` involves, without touching any state.
    fn plan(&self, id: ResourceId, test_only: bool) -> Result<Plan, ApplyError> {
        let unit = self.unit(id)?;
        for resource in &unit {
            if !self.cluster.is_correct(resource.id) {
                return Err(ApplyError::Incorrect(resource.name()));
            }
        }

        let ids: BTreeSet<ResourceId> = unit.iter().map(|r| r.id).collect();
        let ctx = Applying {
            cluster: self.cluster.as_ref(),
            ids: ids.clone(),
        };

        // Members are rendered only if they changed; containers are always rewritten, since
        // their member list is not tracked as an edit.
        let mut commands = Vec::new();
        for resource in &unit {
            let container = matches!(
                resource.kind(),
                ResourceKind::Group { .. } | ResourceKind::Clone { .. }
            );
            if container || resource.is_changed() {
                let bundle = crm::render_crm_resource(resource, &ctx)?;
                commands.push(CrmCommand::SetResource(bundle));
            }
            commands.extend(crm::render_locations(resource, false));
        }

        // New resources get their ids above, so edges waiting for them can go out now, along
        // with any constraint of the unit that never reached the cluster.
        let (graph, changes) = self.cluster.plan(|graph, _| {
            let mut changes = graph.flush_deferred(&ctx);
            for change in graph.unapplied_touching(&ids, &ctx) {
                if !changes.contains(&change) {
                    changes.push(change);
                }
            }
            Ok(changes)
        })?;
        commands.extend(crm::render_changes(&changes, &graph, &ctx)?);

        Ok(Plan {
            artifact: Artifact::Crm(CrmArtifact::new(commands, test_only)),
            graph,
            changes,
            unit,
            ids,
        })
    }

    /// Run `artifact` in test mode, then for real. Returns the test-mode report.
    async fn execute_both(&self, artifact: &Artifact) -> Result<ExecReport, ExecError> {
        let report = self.executor.execute(artifact).await?;
        self.executor.execute(&artifact.for_real()).await?;
        Ok(report)
    }

    /// Apply a CRM resource together with its containers and members.
    pub async fn apply(&self, id: ResourceId) -> Result<ExecReport, ApplyError> {
        let _status = self.cluster.status_lock().lock().await;
        let Plan {
            artifact,
            mut graph,
            changes,
            unit,
            ids,
        } = self.plan(id, true)?;

        for resource in &unit {
            resource.transition(ApplyEvent::DryRun);
        }
        let report = match self.execute_both(&artifact).await {
            Ok(report) => report,
            Err(e) => {
                warn!("applying {id} failed: {e}");
                for resource in &unit {
                    fail(resource);
                }
                return Err(e.into());
            }
        };

        let ctx = Applying {
            cluster: self.cluster.as_ref(),
            ids,
        };
        record_applied(&mut graph, &changes, &ctx);
        for resource in &unit {
            resource.commit();
            resource.transition(ApplyEvent::Commit);
        }
        self.cluster.install_graph(graph);
        info!(
            "applied {}",
            unit.iter().map(|r| r.name()).collect::<Vec<_>>().join(", ")
        );
        Ok(report)
    }

    /// Run what an apply of `id` would do in test mode only. Nothing changes locally.
    pub async fn dry_run(&self, id: ResourceId) -> Result<ExecReport, ApplyError> {
        let _dry_run = self.cluster.dry_run_lock().lock().await;
        let plan = self.plan(id, true)?;
        if plan.artifact.is_empty() {
            return Ok(ExecReport::default());
        }
        Ok(self.executor.execute(&plan.artifact).await?)
    }

    /// A debounced dry run. Waits for the debounce window, then gives up without doing any
    /// work if `still_wanted` says the preview is no longer needed.
    pub async fn preview<F>(
        &self,
        id: ResourceId,
        still_wanted: F,
    ) -> Result<Option<ExecReport>, ApplyError>
    where
        F: Fn() -> bool,
    {
        tokio::time::sleep(self.cluster.settings.dry_run_debounce).await;
        if !still_wanted() {
            debug!("preview of {id} no longer wanted");
            return Ok(None);
        }
        self.dry_run(id).await.map(Some)
    }

    /// Apply a DRBD resource: allocate its endpoints, render its resource file and run it.
    pub async fn apply_drbd(&self, name: &str) -> Result<ExecReport, ApplyError> {
        let resource = self
            .cluster
            .drbd(name)
            .ok_or_else(|| ClusterError::UnknownDrbd(name.to_string()))?;
        let _status = self.cluster.status_lock().lock().await;

        self.cluster.allocate_drbd(&resource)?;
        if !self.cluster.is_drbd_correct(&resource) {
            return Err(ApplyError::Incorrect(name.to_string()));
        }
        let artifact = Artifact::Drbd {
            resource: name.to_string(),
            text: drbd::render_drbd_resource(&resource)?,
            test_only: true,
        };

        resource.transition(ApplyEvent::DryRun);
        match self.execute_both(&artifact).await {
            Ok(report) => {
                resource.commit();
                resource.transition(ApplyEvent::Commit);
                info!("applied DRBD resource {name}");
                Ok(report)
            }
            Err(e) => {
                warn!("applying DRBD resource {name} failed: {e}");
                resource.transition(ApplyEvent::Fail);
                Err(e.into())
            }
        }
    }

    /// Dry run of a DRBD resource. Its endpoints are allocated first, as for an apply.
    pub async fn dry_run_drbd(&self, name: &str) -> Result<ExecReport, ApplyError> {
        let resource = self
            .cluster
            .drbd(name)
            .ok_or_else(|| ClusterError::UnknownDrbd(name.to_string()))?;
        let _dry_run = self.cluster.dry_run_lock().lock().await;
        self.cluster.allocate_drbd(&resource)?;
        let artifact = Artifact::Drbd {
            resource: name.to_string(),
            text: drbd::render_drbd_resource(&resource)?,
            test_only: true,
        };
        Ok(self.executor.execute(&artifact).await?)
    }

    /// Remove a CRM resource from the cluster, with every constraint it takes part in.
    pub async fn remove(&self, id: ResourceId) -> Result<ExecReport, ApplyError> {
        let resource = self.cluster.require(id)?;
        let _status = self.cluster.status_lock().lock().await;

        let (graph, changes) = self
            .cluster
            .plan(|graph, info| Ok(graph.remove_resource(id, info)))?;
        let mut commands = crm::render_changes(&changes, &graph, self.cluster.as_ref())?;
        resource.transition(ApplyEvent::Remove);
        let report = match resource.server_id() {
            Some(server_id) if !resource.is_placeholder() => {
                for host in resource.locations.names() {
                    if resource.locations.saved(&host).is_some() {
                        commands.push(CrmCommand::RemoveLocation {
                            id: format!("loc_{server_id}_{host}"),
                        });
                    }
                }
                commands.push(CrmCommand::RemoveResource { id: server_id });
                let artifact = Artifact::Crm(CrmArtifact::new(commands, true));
                match self.execute_both(&artifact).await {
                    Ok(report) => report,
                    Err(e) => {
                        warn!("removing {} failed: {e}", resource.name());
                        resource.transition(ApplyEvent::Fail);
                        return Err(e.into());
                    }
                }
            }
            _ => {
                // Never applied, or a placeholder: only its sets may exist on the cluster.
                let artifact = Artifact::Crm(CrmArtifact::new(commands, true));
                if artifact.is_empty() {
                    ExecReport::default()
                } else {
                    self.execute_both(&artifact).await.inspect_err(|_| {
                        resource.transition(ApplyEvent::Fail);
                    })?
                }
            }
        };

        self.cluster.install_graph(graph);
        self.cluster.unregister(id);
        resource.transition(ApplyEvent::Commit);

        let all = self.cluster.resources();
        for other in &all {
            for group in [AttrGroup::Meta, AttrGroup::Operations] {
                reference::sync_reference(other, group, &all);
            }
        }
        info!("removed {}", resource.name());
        Ok(report)
    }

    pub async fn remove_drbd(&self, name: &str) -> Result<ExecReport, ApplyError> {
        let resource = self
            .cluster
            .drbd(name)
            .ok_or_else(|| ClusterError::UnknownDrbd(name.to_string()))?;
        let _status = self.cluster.status_lock().lock().await;
        resource.transition(ApplyEvent::Remove);

        let report = if resource.is_applied() {
            let artifact = Artifact::DrbdRemove {
                resource: name.to_string(),
                test_only: true,
            };
            self.execute_both(&artifact).await.inspect_err(|_| {
                resource.transition(ApplyEvent::Fail);
            })?
        } else {
            ExecReport::default()
        };
        self.cluster.unregister_drbd(name);
        resource.transition(ApplyEvent::Commit);
        Ok(report)
    }

    /// Discard the edits of `id`, of its containers and members, and of every placeholder set
    /// it touched. Returns the placeholders whose sets were restored.
    pub fn revert(&self, id: ResourceId) -> Result<Vec<ResourceId>, ClusterError> {
        let unit = self.unit(id)?;
        let all = self.cluster.resources();
        for resource in &unit {
            resource.revert();
            for group in [AttrGroup::Meta, AttrGroup::Operations] {
                if resource.reference(group).pending.target().is_some() {
                    reference::sync_reference(resource, group, &all);
                } else {
                    let store = resource.store(group);
                    for param in resource.group_params(group) {
                        store.untrack(&param);
                    }
                }
            }
            resource.note_edit();
        }

        let (graph, reverted) = {
            let mut graph = self.cluster.graph();
            let mut reverted = Vec::new();
            for resource in &unit {
                reverted.extend(graph.revert_touching(resource.id));
            }
            (graph, reverted)
        };
        self.cluster.install_graph(graph);
        debug!("reverted {id} and placeholders {reverted:?}");
        Ok(reverted)
    }

    pub fn revert_drbd(&self, name: &str) -> Result<(), ClusterError> {
        let resource = self
            .cluster
            .drbd(name)
            .ok_or_else(|| ClusterError::UnknownDrbd(name.to_string()))?;
        resource.revert();
        Ok(())
    }

    /// Run a graph edit. In test mode the commands are only run in test mode and the graph is
    /// left as it was.
    async fn edit_graph<F>(&self, test_only: bool, edit: F) -> Result<ExecReport, ApplyError>
    where
        F: FnOnce(&mut DependencyGraph, &Cluster) -> Result<Vec<Change>, GraphError>,
    {
        let _status = self.cluster.status_lock().lock().await;
        let (mut graph, changes) = self.cluster.plan(edit)?;
        let commands = crm::render_changes(&changes, &graph, self.cluster.as_ref())?;
        let artifact = Artifact::Crm(CrmArtifact::new(commands, true));

        if test_only {
            if artifact.is_empty() {
                return Ok(ExecReport::default());
            }
            return Ok(self.executor.execute(&artifact).await?);
        }
        let report = if artifact.is_empty() {
            ExecReport::default()
        } else {
            self.execute_both(&artifact).await?
        };
        record_applied(&mut graph, &changes, self.cluster.as_ref());
        self.cluster.install_graph(graph);
        Ok(report)
    }

    /// Make `child` depend on `parent`. Edges touching resources that were never applied wait
    /// until those resources are.
    pub async fn add_edge(
        &self,
        parent: ResourceId,
        child: ResourceId,
        kinds: EdgeKinds,
        test_only: bool,
    ) -> Result<ExecReport, ApplyError> {
        self.edit_graph(test_only, |graph, info| {
            graph.add_edge(parent, child, kinds, info)
        })
        .await
    }

    pub async fn remove_edge(
        &self,
        parent: ResourceId,
        child: ResourceId,
        kinds: EdgeKinds,
        test_only: bool,
    ) -> Result<ExecReport, ApplyError> {
        self.edit_graph(test_only, |graph, info| {
            Ok(graph.remove_edge(parent, child, kinds, info))
        })
        .await
    }

    pub async fn reverse(
        &self,
        placeholder: ResourceId,
        kind: ConstraintKind,
        test_only: bool,
    ) -> Result<ExecReport, ApplyError> {
        self.edit_graph(test_only, |graph, _| graph.reverse(placeholder, kind))
            .await
    }

    pub async fn set_sequencing(
        &self,
        placeholder: ResourceId,
        kind: ConstraintKind,
        first: bool,
        sequential: bool,
        require_all: bool,
        test_only: bool,
    ) -> Result<ExecReport, ApplyError> {
        self.edit_graph(test_only, |graph, _| {
            graph.set_sequencing(placeholder, kind, first, sequential, require_all)
        })
        .await
    }
}

impl<E: CommandExecutor + 'static> ApplyController<E> {
    /// Apply `id` on a background task. The ticket tells when it started and how it ended.
    pub fn spawn_apply(self: &Arc<Self>, id: ResourceId) -> ApplyTicket {
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (finished_tx, finished_rx) = oneshot::channel();
        let controller = Arc::clone(self);

        tokio::spawn(async move {
            let _ = started_tx.send(());
            let result = controller.apply(id).await.map_err(|e| e.to_string());
            let _ = finished_tx.send(result);
        });

        ApplyTicket {
            started: started_rx.map(|r| r.is_ok()).boxed().shared(),
            finished: finished_rx.map(Result::ok).boxed().shared(),
        }
    }
}

/// Fall back from a failed run. Members that were only carried along settle back to applied.
fn fail(resource: &Resource) {
    resource.transition(ApplyEvent::Fail);
    resource.note_edit();
}

/// After a successful run, give new constraints the ids they were created with and make the
/// touched placeholder sets the saved ones.
fn record_applied(graph: &mut DependencyGraph, changes: &[Change], info: &impl NodeInfo) {
    let mut placeholders = BTreeMap::new();
    for change in changes {
        match change {
            Change::AddDirect {
                parent,
                child,
                kind,
            } => {
                let known = graph
                    .edge(*parent, *child)
                    .is_some_and(|e| e.id(*kind).is_some());
                if known {
                    continue;
                }
                if let (Some(p), Some(c)) = (info.constraint_id(*parent), info.constraint_id(*child))
                {
                    let id = crm::direct_constraint_id(*kind, &p, &c);
                    graph.set_direct_id(*parent, *child, *kind, &id);
                }
            }
            Change::RemoveDirect { .. } => {}
            Change::RewriteSet { placeholder, kind } => {
                let known = graph
                    .placeholder(*placeholder)
                    .is_some_and(|ph| ph.pending.get(*kind).id.is_some());
                if !known {
                    if let Some(name) = info.constraint_id(*placeholder) {
                        let id = crm::set_constraint_id(*kind, &name);
                        graph.set_set_id(*placeholder, *kind, Some(id));
                    }
                }
                placeholders.insert(*placeholder, ());
            }
            Change::DeleteSet {
                placeholder, kind, ..
            } => {
                graph.set_set_id(*placeholder, *kind, None);
                placeholders.insert(*placeholder, ());
            }
        }
    }
    for placeholder in placeholders.into_keys() {
        graph.commit_placeholder(placeholder);
    }
}
