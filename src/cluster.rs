// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use log::{debug, info, warn};

use crate::{
    commands::{Handle, HandledResult},
    config::{self, Config, ConstraintKinds},
    crm::{self, RenderContext, RenderError},
    drbd::{self, ConfigError, DrbdResource, DrbdVolume},
    graph::{
        Change, ConstraintKind, DependencyGraph, EdgeKinds, GraphError, NodeInfo, SetConstraint,
    },
    live::{LiveKind, LiveSnapshot, StatusProvider},
    ports::{self, PortError, PortRegistry, PortSpace},
    reference::{self, AttrGroup, Reference, ReferenceError},
    resource::{Resource, ResourceId, ResourceKind},
    schema::{ResourceAgent, SchemaProvider},
    store::{AttributeStore, RefreshOutcome},
    Settings,
};

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("{0} is not a known resource")]
    Unknown(ResourceId),
    #[error("no resource named '{0}'")]
    UnknownName(String),
    #[error("no DRBD resource named '{0}'")]
    UnknownDrbd(String),
    #[error("{0} is not a group")]
    NotAGroup(ResourceId),
    #[error("{0} already belongs to {1}")]
    AlreadyContained(ResourceId, ResourceId),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Reference(#[from] ReferenceError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// What a live refresh did beyond updating values.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// Resources found on the cluster that the console did not know.
    pub adopted: Vec<ResourceId>,
    /// Applied resources that are gone from the cluster.
    pub destroyed: Vec<ResourceId>,
    /// Parameters whose cluster value moved underneath an unsaved edit.
    pub stale: Vec<(ResourceId, String)>,
    /// Resources whose same-as reference pointed at a destroyed resource.
    pub dropped_references: Vec<ResourceId>,
}

/// Cluster is the registry every component works against: the CRM resources, the DRBD
/// resources, the dependency graph between CRM resources and the port bookkeeping.
///
/// Lock order: `resources` and `drbd` are never held while taking `graph` or `ports`.
/// `status_lock` is held by a multi-resource apply and by live refreshes, so that an apply
/// composes its commands against one consistent view. `dry_run_lock` serializes dry runs.
#[derive(Debug)]
pub struct Cluster {
    pub settings: Settings,
    schema: Arc<dyn SchemaProvider>,
    hosts: BTreeMap<String, Vec<String>>,
    resources: Mutex<BTreeMap<ResourceId, Arc<Resource>>>,
    drbd: Mutex<BTreeMap<String, Arc<DrbdResource>>>,
    graph: Mutex<DependencyGraph>,
    ports: Mutex<PortRegistry>,
    next_id: AtomicU64,
    status_lock: tokio::sync::Mutex<()>,
    dry_run_lock: tokio::sync::Mutex<()>,
}

impl Cluster {
    /// `hosts` maps each host name to the addresses it can replicate on.
    pub fn new(
        settings: Settings,
        schema: Arc<dyn SchemaProvider>,
        hosts: BTreeMap<String, Vec<String>>,
    ) -> Self {
        let ports = PortRegistry::new(settings.base_port, settings.base_proxy_port);
        Cluster {
            settings,
            schema,
            hosts,
            resources: Mutex::new(BTreeMap::new()),
            drbd: Mutex::new(BTreeMap::new()),
            graph: Mutex::new(DependencyGraph::new()),
            ports: Mutex::new(ports),
            next_id: AtomicU64::new(1),
            status_lock: tokio::sync::Mutex::new(()),
            dry_run_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Load the cluster description from `path`, or from the default location.
    pub fn from_config(path: Option<String>) -> HandledResult<Self> {
        let path = path.unwrap_or_else(crate::default_config_path);
        let text = std::fs::read_to_string(&path)
            .handle_err(|e| eprintln!("Could not open config file \"{path}\": {e}"))?;
        let config = Config::from_toml(&text)
            .handle_err(|e| eprintln!("Could not parse config file \"{path}\": {e}"))?;
        Self::from_description(config, Settings::from_env())
            .handle_err(|e| eprintln!("Invalid cluster description in \"{path}\": {e}"))
    }

    pub fn schema(&self) -> Arc<dyn SchemaProvider> {
        Arc::clone(&self.schema)
    }

    pub fn hosts(&self) -> &BTreeMap<String, Vec<String>> {
        &self.hosts
    }

    pub fn status_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.status_lock
    }

    pub fn dry_run_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.dry_run_lock
    }

    fn insert(&self, name: &str, agent: ResourceAgent, kind: ResourceKind) -> Arc<Resource> {
        let id = ResourceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let resource = Arc::new(Resource::new(
            id,
            name,
            agent,
            kind,
            Arc::clone(&self.schema),
        ));
        self.resources
            .lock()
            .unwrap()
            .insert(id, Arc::clone(&resource));
        debug!("added {name} as {id}");
        resource
    }

    pub fn add_primitive(&self, name: &str, agent: ResourceAgent) -> Arc<Resource> {
        self.insert(name, agent, ResourceKind::Primitive)
    }

    pub fn add_group(
        &self,
        name: &str,
        members: &[ResourceId],
    ) -> Result<Arc<Resource>, ClusterError> {
        for member in members {
            let member = self.require(*member)?;
            if let Some(group) = member.parents().group {
                return Err(ClusterError::AlreadyContained(member.id, group));
            }
        }
        let group = self.insert(
            name,
            ResourceAgent::group(),
            ResourceKind::Group {
                children: members.to_vec(),
            },
        );
        for member in members {
            self.require(*member)?.set_group(Some(group.id));
        }
        Ok(group)
    }

    /// Append `child` to `group`. The group is rewritten with its new member list at the next
    /// apply of either of them.
    pub fn add_to_group(&self, group: ResourceId, child: ResourceId) -> Result<(), ClusterError> {
        let group = self.require(group)?;
        let child = self.require(child)?;
        let ResourceKind::Group { mut children } = group.kind() else {
            return Err(ClusterError::NotAGroup(group.id));
        };
        match child.parents().group {
            Some(g) if g == group.id => return Ok(()),
            Some(g) => return Err(ClusterError::AlreadyContained(child.id, g)),
            None => {}
        }
        children.push(child.id);
        group.set_kind(ResourceKind::Group { children });
        child.set_group(Some(group.id));
        Ok(())
    }

    pub fn add_clone(
        &self,
        name: &str,
        wrapped: Option<ResourceId>,
        master_slave: bool,
    ) -> Result<Arc<Resource>, ClusterError> {
        if let Some(wrapped) = wrapped {
            let wrapped = self.require(wrapped)?;
            if let Some(clone) = wrapped.parents().clone {
                return Err(ClusterError::AlreadyContained(wrapped.id, clone));
            }
        }
        let clone = self.insert(
            name,
            ResourceAgent::clone_set(),
            ResourceKind::Clone {
                master_slave,
                wrapped,
            },
        );
        if let Some(wrapped) = wrapped {
            self.require(wrapped)?.set_clone(Some(clone.id));
        }
        Ok(clone)
    }

    /// Placeholders exist only in the console; their name is final from the start.
    pub fn add_placeholder(&self, name: &str) -> Arc<Resource> {
        let placeholder = self.insert(name, ResourceAgent::placeholder(), ResourceKind::Placeholder);
        placeholder.set_applied_id(name);
        placeholder.mark_applied();
        self.graph.lock().unwrap().add_placeholder(placeholder.id);
        placeholder
    }

    pub fn resource(&self, id: ResourceId) -> Option<Arc<Resource>> {
        self.resources.lock().unwrap().get(&id).cloned()
    }

    pub fn require(&self, id: ResourceId) -> Result<Arc<Resource>, ClusterError> {
        self.resource(id).ok_or(ClusterError::Unknown(id))
    }

    pub fn resources(&self) -> Vec<Arc<Resource>> {
        self.resources.lock().unwrap().values().cloned().collect()
    }

    /// Find a resource by the id it will have after the next apply.
    pub fn find_by_name(&self, name: &str) -> Option<Arc<Resource>> {
        self.resources
            .lock()
            .unwrap()
            .values()
            .find(|r| r.name() == name)
            .cloned()
    }

    /// Find a resource by the id it has on the cluster.
    pub fn find_by_server_id(&self, id: &str) -> Option<Arc<Resource>> {
        self.resources
            .lock()
            .unwrap()
            .values()
            .find(|r| r.server_id().as_deref() == Some(id))
            .cloned()
    }

    pub fn add_drbd(&self, resource: DrbdResource) -> Arc<DrbdResource> {
        let resource = Arc::new(resource);
        self.drbd
            .lock()
            .unwrap()
            .insert(resource.name.clone(), Arc::clone(&resource));
        resource
    }

    pub fn drbd(&self, name: &str) -> Option<Arc<DrbdResource>> {
        self.drbd.lock().unwrap().get(name).cloned()
    }

    pub fn drbd_resources(&self) -> Vec<Arc<DrbdResource>> {
        self.drbd.lock().unwrap().values().cloned().collect()
    }

    /// Fill in default endpoints for a DRBD resource and register its ports.
    pub fn allocate_drbd(&self, resource: &DrbdResource) -> Result<(), PortError> {
        let mut ports = self.ports.lock().unwrap();
        drbd::allocate_endpoints(
            resource,
            &mut ports,
            &self.hosts,
            self.settings.replication_network.as_ref(),
        )
    }

    pub fn with_ports<T>(&self, f: impl FnOnce(&mut PortRegistry) -> T) -> T {
        f(&mut self.ports.lock().unwrap())
    }

    /// Forget a DRBD resource and release its ports.
    pub fn unregister_drbd(&self, name: &str) -> Option<Arc<DrbdResource>> {
        let removed = self.drbd.lock().unwrap().remove(name);
        if removed.is_some() {
            self.ports.lock().unwrap().deregister_owner(name);
            debug!("unregistered DRBD resource {name}");
        }
        removed
    }

    fn name_is_unique(&self, resource: &Resource) -> bool {
        let name = resource.name();
        !self
            .resources
            .lock()
            .unwrap()
            .values()
            .any(|r| r.id != resource.id && r.name() == name)
    }

    /// Schema checks of the resource, plus the checks that need the rest of the cluster: its id
    /// must not be used by another resource and its same-as targets must exist.
    pub fn is_correct(&self, id: ResourceId) -> bool {
        let Some(resource) = self.resource(id) else {
            return false;
        };
        resource.is_correct()
            && self.name_is_unique(&resource)
            && resource
                .references()
                .iter()
                .filter_map(|(_, r)| r.target())
                .all(|target| self.resource(target).is_some())
    }

    /// Checks of a DRBD resource, including ports reserved by other resources and its
    /// resync-after dependency.
    pub fn is_drbd_correct(&self, resource: &DrbdResource) -> bool {
        if !resource.is_correct() {
            return false;
        }
        if let Some(after) = resource.resync_after() {
            if !self.resync_after_candidates(&resource.name).contains(&after) {
                return false;
            }
        }
        let ports = self.ports.lock().unwrap();
        let taken = |space, host: &str, key: &str| {
            resource
                .endpoints
                .get(key)
                .and_then(|p| ports::parse_port(&p).ok())
                .is_some_and(|port| ports.is_reserved_by_other(space, host, port, &resource.name))
        };
        let replication_taken = resource
            .hosts_with_volumes()
            .iter()
            .any(|h| taken(PortSpace::Replication, h, &drbd::port_key(h)));
        let proxy_taken = resource.configured_proxy_hosts().iter().any(|p| {
            taken(
                PortSpace::Proxy,
                p,
                &drbd::proxy_endpoint_key(p, "outside-port"),
            )
        });
        !replication_taken && !proxy_taken
    }

    /// Human readable reasons why resources cannot be applied.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let invalid = |store: &AttributeStore| -> Vec<String> {
            store
                .names()
                .into_iter()
                .filter(|n| !store.is_valid(n))
                .collect()
        };
        for resource in self.resources() {
            if self.is_correct(resource.id) {
                continue;
            }
            let name = resource.name();
            let identity = resource.identity();
            if resource.params.is_locked() && resource.kind() == ResourceKind::Primitive {
                problems.push(format!("{name}: no schema for {}", resource.agent));
                continue;
            }
            if !identity.is_new() && identity.is_changed() {
                problems.push(format!(
                    "{name}: renamed from {}, ids on the cluster cannot change",
                    identity.applied.unwrap_or_default()
                ));
            }
            if !self.name_is_unique(&resource) {
                problems.push(format!("{name}: id is used by another resource"));
            }
            for param in invalid(&resource.params) {
                problems.push(format!("{name}: invalid value for {param}"));
            }
            for param in invalid(&resource.operations) {
                problems.push(format!("{name}: invalid value for operation {param}"));
            }
        }
        for resource in self.drbd_resources() {
            if self.is_drbd_correct(&resource) {
                continue;
            }
            match drbd::render_drbd_resource(&resource) {
                Err(e) => problems.push(e.to_string()),
                Ok(_) => problems.push(format!(
                    "{}: invalid option, port in use, or resync-after cycle",
                    resource.name
                )),
            }
        }
        problems
    }

    pub fn candidates(&self, id: ResourceId, group: AttrGroup) -> Vec<Reference> {
        match self.resource(id) {
            Some(resource) => reference::candidates(&resource, group, &self.resources()),
            None => Vec::new(),
        }
    }

    pub fn set_reference(
        &self,
        id: ResourceId,
        group: AttrGroup,
        to: Reference,
    ) -> Result<(), ClusterError> {
        let resource = self.require(id)?;
        reference::apply_reference(&resource, group, to, &self.resources())?;
        Ok(())
    }

    /// DRBD resources `name` may resync after without closing a cycle.
    pub fn resync_after_candidates(&self, name: &str) -> Vec<String> {
        let chains: BTreeMap<String, Option<String>> = self
            .drbd_resources()
            .iter()
            .map(|r| (r.name.clone(), r.resync_after()))
            .collect();
        reference::resync_after_candidates(name, &chains)
    }

    pub fn graph(&self) -> DependencyGraph {
        self.graph.lock().unwrap().clone()
    }

    /// Run a graph operation on a copy of the graph. The copy and the changes are returned;
    /// nothing is visible until `install_graph`.
    pub fn plan<F>(&self, f: F) -> Result<(DependencyGraph, Vec<Change>), ClusterError>
    where
        F: FnOnce(&mut DependencyGraph, &Self) -> Result<Vec<Change>, GraphError>,
    {
        let mut graph = self.graph();
        let changes = f(&mut graph, self)?;
        Ok((graph, changes))
    }

    pub fn install_graph(&self, graph: DependencyGraph) {
        *self.graph.lock().unwrap() = graph;
    }

    /// Forget a resource: sever its dependencies, take it out of its containers, and drop it
    /// from the registry. References to it fall back to defaults on the next sync.
    pub fn unregister(&self, id: ResourceId) -> Option<Arc<Resource>> {
        let resource = self.resources.lock().unwrap().remove(&id)?;
        {
            let mut graph = self.graph.lock().unwrap();
            graph.remove_resource(id, self);
        }

        let parents = resource.parents();
        if let Some(group) = parents.group.and_then(|g| self.resource(g)) {
            if let ResourceKind::Group { mut children } = group.kind() {
                children.retain(|c| *c != id);
                group.set_kind(ResourceKind::Group { children });
            }
        }
        if let Some(clone) = parents.clone.and_then(|c| self.resource(c)) {
            if let ResourceKind::Clone { master_slave, .. } = clone.kind() {
                clone.set_kind(ResourceKind::Clone {
                    master_slave,
                    wrapped: None,
                });
            }
        }
        match resource.kind() {
            ResourceKind::Group { children } => {
                for child in children.iter().filter_map(|c| self.resource(*c)) {
                    child.set_group(None);
                }
            }
            ResourceKind::Clone {
                wrapped: Some(wrapped),
                ..
            } => {
                if let Some(wrapped) = self.resource(wrapped) {
                    wrapped.set_clone(None);
                }
            }
            _ => {}
        }
        debug!("unregistered {} ({id})", resource.name());
        Some(resource)
    }

    /// Merge a live snapshot, holding the status lock.
    pub async fn refresh(&self, live: &LiveSnapshot) -> RefreshReport {
        let _status = self.status_lock.lock().await;
        self.refresh_from_live(live)
    }

    /// Take a snapshot from `provider` and merge it.
    pub async fn poll(&self, provider: &impl StatusProvider) -> Option<RefreshReport> {
        let snapshot = provider.snapshot().await?;
        Some(self.refresh(&snapshot).await)
    }

    /// Merge a live snapshot into every store, without clobbering unsaved edits.
    ///
    /// Resources on the cluster that the console does not know are adopted. Applied resources
    /// missing from the snapshot are destroyed, and references to them are dropped.
    pub fn refresh_from_live(&self, live: &LiveSnapshot) -> RefreshReport {
        let mut report = RefreshReport::default();
        self.adopt_unknown(live, &mut report);

        for resource in self.resources() {
            if resource.is_placeholder() {
                continue;
            }
            let Some(server_id) = resource.server_id() else {
                continue;
            };
            let Some(live_resource) = live.resources.get(&server_id) else {
                info!("{server_id} is gone from the cluster");
                self.unregister(resource.id);
                report.destroyed.push(resource.id);
                continue;
            };

            let stores = [
                (&resource.params, &live_resource.params),
                (&resource.operations, &live_resource.operations),
                (&resource.locations, &live_resource.locations),
            ];
            for (store, values) in stores {
                for name in refresh_store(store, values) {
                    report.stale.push((resource.id, name));
                }
            }

            let live_refs = [
                (AttrGroup::Meta, &live_resource.meta_ref),
                (AttrGroup::Operations, &live_resource.operations_ref),
            ];
            for (group, live_ref) in live_refs {
                let to = match live_ref {
                    Some(target) => match self.find_by_server_id(target) {
                        Some(target) => Reference::To(target.id),
                        None => {
                            warn!("{server_id} refers to unknown {target} for its {group}");
                            Reference::None
                        }
                    },
                    None => Reference::None,
                };
                let pending = resource.with_reference(group, |slot| {
                    slot.refresh(to);
                    slot.pending
                });
                if pending.target().is_none() {
                    let store = resource.store(group);
                    for param in resource.group_params(group) {
                        store.untrack(&param);
                    }
                }
            }

            resource.set_live_status(live_resource.status());
            resource.note_edit();
        }

        let all = self.resources();
        for resource in &all {
            for group in [AttrGroup::Meta, AttrGroup::Operations] {
                if reference::sync_reference(resource, group, &all) {
                    report.dropped_references.push(resource.id);
                }
            }
        }

        self.merge_live_constraints(live);
        self.merge_live_drbd(live);
        report
    }

    fn adopt_unknown(&self, live: &LiveSnapshot, report: &mut RefreshReport) {
        let mut adopted = Vec::new();
        for (server_id, live_resource) in &live.resources {
            if self.find_by_server_id(server_id).is_some() {
                continue;
            }
            let kind = match &live_resource.kind {
                LiveKind::Primitive => ResourceKind::Primitive,
                LiveKind::Group { .. } => ResourceKind::Group {
                    children: Vec::new(),
                },
                LiveKind::Clone { master_slave, .. } => ResourceKind::Clone {
                    master_slave: *master_slave,
                    wrapped: None,
                },
            };
            let resource = self.insert(server_id, live_resource.agent.clone(), kind);
            resource.set_applied_id(server_id);
            resource.mark_applied();
            info!("adopting {server_id} found on the cluster");
            adopted.push((Arc::clone(&resource), live_resource));
            report.adopted.push(resource.id);
        }

        // Containers are wired up once every member is known.
        for (resource, live_resource) in adopted {
            match &live_resource.kind {
                LiveKind::Group { children } => {
                    let children: Vec<_> = children
                        .iter()
                        .filter_map(|c| self.find_by_server_id(c))
                        .collect();
                    for child in &children {
                        child.set_group(Some(resource.id));
                    }
                    resource.set_kind(ResourceKind::Group {
                        children: children.iter().map(|c| c.id).collect(),
                    });
                }
                LiveKind::Clone {
                    master_slave,
                    child,
                } => {
                    let wrapped = child.as_deref().and_then(|c| self.find_by_server_id(c));
                    if let Some(wrapped) = &wrapped {
                        wrapped.set_clone(Some(resource.id));
                    }
                    resource.set_kind(ResourceKind::Clone {
                        master_slave: *master_slave,
                        wrapped: wrapped.map(|w| w.id),
                    });
                }
                LiveKind::Primitive => {}
            }
        }
    }

    fn placeholder_for_live_set(&self, set_id: &str) -> ResourceId {
        if let Some(placeholder) = self.graph.lock().unwrap().placeholder_for_set(set_id) {
            return placeholder;
        }
        let name = set_id
            .strip_prefix("ord_")
            .or_else(|| set_id.strip_prefix("col_"))
            .unwrap_or(set_id);
        match self.find_by_name(name).filter(|r| r.is_placeholder()) {
            Some(placeholder) => placeholder.id,
            None => {
                info!("adopting resource set {set_id}");
                self.add_placeholder(name).id
            }
        }
    }

    fn merge_live_constraints(&self, live: &LiveSnapshot) {
        let mut direct = Vec::new();
        for constraint in &live.constraints {
            let parent = self.find_by_server_id(&constraint.parent);
            let child = self.find_by_server_id(&constraint.child);
            match (parent, child) {
                (Some(parent), Some(child)) => direct.push((
                    parent.id,
                    child.id,
                    constraint.kind.into(),
                    constraint.id.clone(),
                )),
                _ => warn!("ignoring constraint {} on unknown resources", constraint.id),
            }
        }

        let mut sets = Vec::new();
        for live_set in &live.sets {
            let kind: ConstraintKind = live_set.kind.into();
            let placeholder = self.placeholder_for_live_set(&live_set.id);
            let mut set = SetConstraint {
                id: Some(live_set.id.clone()),
                ..Default::default()
            };
            for (index, list) in live_set.sets.iter().take(2).enumerate() {
                // Colocation sets list the dependent resources first.
                let slot = match kind {
                    ConstraintKind::Order => index,
                    ConstraintKind::Colocation => 1 - index,
                };
                set.lists[slot].sequential = list.sequential;
                set.lists[slot].require_all = list.require_all;
                set.lists[slot].members = list
                    .members
                    .iter()
                    .filter_map(|m| {
                        let member = self.find_by_server_id(m);
                        if member.is_none() {
                            warn!("leaving unknown {m} out of resource set {}", live_set.id);
                        }
                        member.map(|r| r.id)
                    })
                    .collect();
            }
            sets.push((placeholder, kind, set));
        }

        let mut graph = self.graph.lock().unwrap();
        graph.merge_live_direct(&direct);

        let live_ids: BTreeSet<&str> = live.sets.iter().map(|s| s.id.as_str()).collect();
        let mut vanished = Vec::new();
        for (id, ph) in graph.placeholders() {
            for kind in [ConstraintKind::Order, ConstraintKind::Colocation] {
                let saved_id = ph.saved.get(kind).id.as_deref();
                if saved_id.is_some_and(|set_id| !live_ids.contains(set_id)) {
                    vanished.push((id, kind));
                }
            }
        }
        for (placeholder, kind) in vanished {
            debug!("resource set of {placeholder} is gone from the cluster");
            graph.merge_live_set(placeholder, kind, SetConstraint::default());
        }
        for (placeholder, kind, set) in sets {
            graph.merge_live_set(placeholder, kind, set);
        }
    }

    fn merge_live_drbd(&self, live: &LiveSnapshot) {
        for (name, live_drbd) in &live.drbd {
            let Some(resource) = self.drbd(name) else {
                debug!("DRBD resource {name} is not managed here");
                continue;
            };
            refresh_store(&resource.options, &live_drbd.options);
            refresh_store(&resource.endpoints, &live_drbd.endpoints);
            for volume in resource.volumes() {
                if let Some(values) = live_drbd.volumes.get(&volume.number.to_string()) {
                    refresh_store(&volume.store, values);
                }
            }
            resource.note_applied();
        }
        // Live ports may differ from what was allocated.
        for resource in self.drbd_resources() {
            if let Err(e) = self.allocate_drbd(&resource) {
                warn!("{}: {e}", resource.name);
            }
        }
    }

    /// Build the registry from a cluster description.
    pub fn from_description(config: Config, settings: Settings) -> Result<Self, ClusterError> {
        let hosts = config
            .hosts
            .iter()
            .map(|h| (h.name.clone(), h.addresses.clone()))
            .collect();
        let cluster = Cluster::new(settings, Arc::new(config.schema), hosts);
        let mut applied = Vec::new();

        for primitive in &config.primitives {
            let resource = cluster.add_primitive(&primitive.id, primitive.agent.clone());
            for (name, value) in &primitive.params {
                resource.params.set_pending(name, Some(value.clone()));
            }
            for (key, value) in &primitive.operations {
                if !resource.operations.contains(key) {
                    resource.operations.declare(key, None);
                }
                resource.operations.set_pending(key, Some(value.clone()));
            }
            for (host, score) in &primitive.locations {
                resource.set_location(host, Some(score));
            }
            if primitive.applied {
                applied.push(resource.id);
            }
        }

        let lookup = |name: &str| {
            cluster
                .find_by_name(name)
                .ok_or_else(|| ClusterError::UnknownName(name.to_string()))
        };

        for group in &config.groups {
            let members = group
                .members
                .iter()
                .map(|m| lookup(m).map(|r| r.id))
                .collect::<Result<Vec<_>, _>>()?;
            let resource = cluster.add_group(&group.id, &members)?;
            for (name, value) in &group.params {
                resource.params.set_pending(name, Some(value.clone()));
            }
            if group.applied {
                applied.push(resource.id);
            }
        }

        for clone in &config.clones {
            let wrapped = clone
                .wrapped
                .as_deref()
                .map(|w| lookup(w).map(|r| r.id))
                .transpose()?;
            let resource = cluster.add_clone(&clone.id, wrapped, clone.master_slave)?;
            for (name, value) in &clone.params {
                resource.params.set_pending(name, Some(value.clone()));
            }
            if clone.applied {
                applied.push(resource.id);
            }
        }

        for placeholder in &config.placeholders {
            cluster.add_placeholder(&placeholder.id);
        }

        for primitive in &config.primitives {
            let resource = lookup(&primitive.id)?;
            let same_as = [
                (AttrGroup::Meta, &primitive.meta_same_as),
                (AttrGroup::Operations, &primitive.operations_same_as),
            ];
            for (group, target) in same_as {
                if let Some(target) = target {
                    let target = lookup(target)?;
                    cluster.set_reference(resource.id, group, Reference::To(target.id))?;
                }
            }
        }

        for id in applied {
            let resource = cluster.require(id)?;
            resource.commit();
            resource.mark_applied();
        }

        // Applied DRBD resources claim their ports before new ones get defaults.
        let mut drbds: Vec<&config::Drbd> = config.drbd.iter().collect();
        drbds.sort_by_key(|d| !d.applied);
        for description in drbds {
            let resource = cluster.add_drbd(drbd_from_description(description, cluster.schema()));
            cluster.allocate_drbd(&resource)?;
            if description.applied {
                resource.mark_applied();
            }
        }

        for constraint in &config.constraints {
            let first = lookup(&constraint.first)?;
            let then = lookup(&constraint.then)?;
            let kinds = match constraint.kind {
                ConstraintKinds::Order => EdgeKinds::ORDER,
                ConstraintKinds::Colocation => EdgeKinds::COLOCATION,
                ConstraintKinds::Both => EdgeKinds::BOTH,
            };
            let (mut graph, _) =
                cluster.plan(|graph, info| graph.add_edge(first.id, then.id, kinds, info))?;
            if constraint.applied {
                mark_constraint_applied(&mut graph, &first, &then, kinds);
            }
            cluster.install_graph(graph);
        }

        Ok(cluster)
    }
}

/// Merge live values into a store. Stores without a schema take every live key; stores with
/// one ignore keys the schema does not know. Returns the parameters that went stale.
fn refresh_store(store: &AttributeStore, values: &BTreeMap<String, String>) -> Vec<String> {
    for key in values.keys() {
        if !store.contains(key) && !store.has_schema() {
            store.declare(key, None);
        }
    }
    store
        .names()
        .into_iter()
        .filter(|name| {
            store.refresh_from_live(name, values.get(name).cloned()) == RefreshOutcome::Stale
        })
        .collect()
}

/// Record a constraint from the description as already present on the cluster, under the id
/// it would have been created with.
fn mark_constraint_applied(
    graph: &mut DependencyGraph,
    first: &Resource,
    then: &Resource,
    kinds: EdgeKinds,
) {
    let placeholder = [first, then].into_iter().find(|r| r.is_placeholder());
    match placeholder {
        Some(placeholder) => {
            for kind in kinds.kinds() {
                let id = crm::set_constraint_id(kind, &placeholder.name());
                graph.set_set_id(placeholder.id, kind, Some(id));
            }
            graph.commit_placeholder(placeholder.id);
        }
        None => {
            let (Some(first_id), Some(then_id)) = (first.server_id(), then.server_id()) else {
                return;
            };
            for kind in kinds.kinds() {
                if graph.has_edge(first.id, then.id, kind) {
                    let id = crm::direct_constraint_id(kind, &first_id, &then_id);
                    graph.set_direct_id(first.id, then.id, kind, &id);
                }
            }
        }
    }
}

fn drbd_from_description(
    description: &config::Drbd,
    schema: Arc<dyn SchemaProvider>,
) -> DrbdResource {
    let resource = DrbdResource::new(&description.name, schema);
    for host in &description.hosts {
        resource.add_host(host);
    }
    for (name, value) in &description.options {
        resource.options.set_pending(name, Some(value.clone()));
    }
    for volume in &description.volumes {
        let v = DrbdVolume::new(volume.number, volume.device.as_deref());
        for (host, disk) in &volume.disks {
            let meta_disk = volume.meta_disks.get(host).map(String::as_str);
            v.add_host(host, Some(disk), meta_disk);
        }
        resource.add_volume(v);
    }
    for (host, endpoint) in &description.endpoints {
        resource.add_host(host);
        resource.set_address(host, endpoint.address.as_deref(), endpoint.port.as_deref());
        if endpoint.proxy.is_some() {
            resource.set_proxy(host, endpoint.proxy.as_deref());
        }
    }
    for proxy in &description.proxies {
        resource.set_proxy_endpoints(
            &proxy.host,
            (proxy.inside_ip.as_deref(), proxy.inside_port.as_deref()),
            (proxy.outside_ip.as_deref(), proxy.outside_port.as_deref()),
        );
    }
    resource
}

impl NodeInfo for Cluster {
    fn is_placeholder(&self, id: ResourceId) -> bool {
        self.resource(id).is_some_and(|r| r.is_placeholder())
    }

    fn is_master_slave(&self, id: ResourceId) -> bool {
        self.resource(id).is_some_and(|r| r.is_master_slave())
    }

    fn constraint_id(&self, id: ResourceId) -> Option<String> {
        let resource = self.resource(id)?;
        if resource.is_placeholder() {
            Some(resource.name())
        } else {
            resource.server_id()
        }
    }
}

impl RenderContext for Cluster {
    fn resource(&self, id: ResourceId) -> Option<Arc<Resource>> {
        Cluster::resource(self, id)
    }
}

/// The cluster as seen while applying a set of resources: those resources are created before
/// any constraint is rendered, so their pending names count as their cluster ids.
pub struct Applying<'a> {
    pub cluster: &'a Cluster,
    pub ids: BTreeSet<ResourceId>,
}

impl NodeInfo for Applying<'_> {
    fn is_placeholder(&self, id: ResourceId) -> bool {
        self.cluster.is_placeholder(id)
    }

    fn is_master_slave(&self, id: ResourceId) -> bool {
        self.cluster.is_master_slave(id)
    }

    fn constraint_id(&self, id: ResourceId) -> Option<String> {
        if self.ids.contains(&id) {
            return self.cluster.resource(id).map(|r| r.name());
        }
        self.cluster.constraint_id(id)
    }
}

impl RenderContext for Applying<'_> {
    fn resource(&self, id: ResourceId) -> Option<Arc<Resource>> {
        self.cluster.resource(id)
    }
}
