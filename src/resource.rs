// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex},
};

use log::debug;

use crate::{
    reference::{AttrGroup, Reference, ReferenceSlot},
    schema::{ResourceAgent, SchemaProvider},
    store::AttributeStore,
};

/// A handle for a resource, stable for the lifetime of the console. It is unrelated to the id the
/// resource has on the cluster, which may not exist yet and may be renamed by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u64);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The shapes a CRM resource can take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceKind {
    Primitive,
    Group {
        children: Vec<ResourceId>,
    },
    Clone {
        master_slave: bool,
        wrapped: Option<ResourceId>,
    },
    /// Stands for a resource set. The set contents live in the dependency graph.
    Placeholder,
}

impl ResourceKind {
    pub fn category(&self) -> Category {
        match self {
            ResourceKind::Primitive => Category::Primitive,
            ResourceKind::Group { .. } => Category::Group,
            ResourceKind::Clone { .. } => Category::Clone,
            ResourceKind::Placeholder => Category::Placeholder,
        }
    }
}

/// Resources of the same category may share attribute groups through same-as references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Primitive,
    Group,
    Clone,
    Placeholder,
}

/// The id a resource has on the cluster (`applied`), and the id it will get at the next apply
/// (`pending`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub applied: Option<String>,
    pub pending: String,
}

impl Identity {
    pub fn new(pending: &str) -> Self {
        Identity {
            applied: None,
            pending: pending.to_string(),
        }
    }

    pub fn is_new(&self) -> bool {
        self.applied.is_none()
    }

    pub fn is_changed(&self) -> bool {
        self.applied.as_deref() != Some(self.pending.as_str())
    }
}

/// Where a resource is in its apply lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyState {
    /// Never applied.
    New,
    /// A test-mode pass produced a report; the real apply has not happened yet.
    DryRun,
    Applied,
    /// Applied before, with pending edits.
    Edited,
    Removing,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyEvent {
    Edit,
    /// Edits were reverted or the cluster caught up with them.
    Settle,
    DryRun,
    Commit,
    Fail,
    Remove,
}

impl ApplyState {
    /// The next state, or `None` if the event is not allowed in this state. `applied_before`
    /// decides where a failure falls back to.
    pub fn next(self, event: ApplyEvent, applied_before: bool) -> Option<ApplyState> {
        use ApplyEvent as E;
        use ApplyState as S;

        let fallback = if applied_before { S::Edited } else { S::New };
        match (self, event) {
            (S::Removed, _) => None,
            (_, E::Remove) => Some(S::Removing),
            (S::Removing, E::Commit) => Some(S::Removed),
            (S::Removing, E::Fail) => Some(if applied_before { S::Applied } else { S::New }),
            (S::Removing, _) => None,
            (S::New | S::Edited | S::Applied, E::DryRun) => Some(S::DryRun),
            (S::DryRun, E::DryRun) => Some(S::DryRun),
            (S::DryRun, E::Commit) => Some(S::Applied),
            (S::DryRun, E::Fail) => Some(fallback),
            (S::DryRun, E::Edit) => Some(fallback),
            (S::Applied | S::Edited, E::Edit) => Some(S::Edited),
            (S::New, E::Edit) => Some(S::New),
            (S::Edited | S::Applied, E::Settle) => Some(S::Applied),
            (S::New, E::Settle) => Some(S::New),
            _ => None,
        }
    }
}

/// Status of a resource as last seen on the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RunState {
    #[default]
    Unknown,
    Stopped,
    Running(Vec<String>),
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveStatus {
    pub run_state: RunState,
    pub fail_counts: BTreeMap<String, u32>,
}

/// The containers a resource belongs to. A resource is in at most one group and at most one
/// clone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Parents {
    pub group: Option<ResourceId>,
    pub clone: Option<ResourceId>,
}

/// A CRM resource as edited in the console.
#[derive(Debug)]
pub struct Resource {
    pub id: ResourceId,
    pub agent: ResourceAgent,

    /// Instance parameters and meta attributes.
    pub params: AttributeStore,

    /// Operation parameters, keyed `<operation>:<parameter>`, e.g. `start:timeout`.
    pub operations: AttributeStore,

    /// Location scores, keyed by host.
    pub locations: AttributeStore,

    kind: Mutex<ResourceKind>,
    identity: Mutex<Identity>,
    parents: Mutex<Parents>,
    meta_ref: Mutex<ReferenceSlot>,
    ops_ref: Mutex<ReferenceSlot>,
    state: Mutex<ApplyState>,
    status: Mutex<LiveStatus>,
}

pub fn operation_key(op: &str, param: &str) -> String {
    format!("{op}:{param}")
}

/// Split an operation key back into operation and parameter.
pub fn split_operation_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(':')
}

impl Resource {
    pub fn new(
        id: ResourceId,
        name: &str,
        agent: ResourceAgent,
        kind: ResourceKind,
        schema: Arc<dyn SchemaProvider>,
    ) -> Self {
        let params = AttributeStore::for_agent(Arc::clone(&schema), &agent);
        let operations = AttributeStore::locked();
        for op in schema.operations(&agent) {
            for (param, default) in op.params {
                operations.declare(&operation_key(&op.name, &param), Some(default));
            }
        }
        Resource {
            id,
            agent,
            params,
            operations,
            locations: AttributeStore::with_params(&[]),
            kind: Mutex::new(kind),
            identity: Mutex::new(Identity::new(name)),
            parents: Mutex::new(Parents::default()),
            meta_ref: Mutex::new(ReferenceSlot::default()),
            ops_ref: Mutex::new(ReferenceSlot::default()),
            state: Mutex::new(ApplyState::New),
            status: Mutex::new(LiveStatus::default()),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind.lock().unwrap().clone()
    }

    pub fn set_kind(&self, kind: ResourceKind) {
        *self.kind.lock().unwrap() = kind;
    }

    pub fn category(&self) -> Category {
        self.kind.lock().unwrap().category()
    }

    pub fn is_placeholder(&self) -> bool {
        self.category() == Category::Placeholder
    }

    pub fn is_master_slave(&self) -> bool {
        matches!(
            *self.kind.lock().unwrap(),
            ResourceKind::Clone {
                master_slave: true,
                ..
            }
        )
    }

    pub fn identity(&self) -> Identity {
        self.identity.lock().unwrap().clone()
    }

    /// The id the resource will have on the cluster after the next apply.
    pub fn name(&self) -> String {
        self.identity.lock().unwrap().pending.clone()
    }

    /// The id the resource has on the cluster, if it was ever applied.
    pub fn server_id(&self) -> Option<String> {
        self.identity.lock().unwrap().applied.clone()
    }

    pub fn is_new(&self) -> bool {
        self.identity.lock().unwrap().is_new()
    }

    pub fn rename(&self, name: &str) {
        self.identity.lock().unwrap().pending = name.to_string();
        self.note_edit();
    }

    /// Mark the resource as existing on the cluster under `id`.
    pub fn set_applied_id(&self, id: &str) {
        let mut identity = self.identity.lock().unwrap();
        identity.applied = Some(id.to_string());
        if identity.pending.is_empty() {
            identity.pending = id.to_string();
        }
    }

    pub fn parents(&self) -> Parents {
        *self.parents.lock().unwrap()
    }

    pub fn set_group(&self, group: Option<ResourceId>) {
        self.parents.lock().unwrap().group = group;
    }

    pub fn set_clone(&self, clone: Option<ResourceId>) {
        self.parents.lock().unwrap().clone = clone;
    }

    pub fn reference(&self, group: AttrGroup) -> ReferenceSlot {
        match group {
            AttrGroup::Meta => *self.meta_ref.lock().unwrap(),
            AttrGroup::Operations => *self.ops_ref.lock().unwrap(),
        }
    }

    pub(crate) fn with_reference<T>(
        &self,
        group: AttrGroup,
        f: impl FnOnce(&mut ReferenceSlot) -> T,
    ) -> T {
        match group {
            AttrGroup::Meta => f(&mut self.meta_ref.lock().unwrap()),
            AttrGroup::Operations => f(&mut self.ops_ref.lock().unwrap()),
        }
    }

    /// The store holding the parameters of an attribute group.
    pub fn store(&self, group: AttrGroup) -> &AttributeStore {
        match group {
            AttrGroup::Meta => &self.params,
            AttrGroup::Operations => &self.operations,
        }
    }

    /// Parameter names belonging to an attribute group.
    pub fn group_params(&self, group: AttrGroup) -> Vec<String> {
        match group {
            AttrGroup::Meta => match self.params.schema() {
                Some((schema, agent)) => self
                    .params
                    .names()
                    .into_iter()
                    .filter(|name| schema.is_meta_attr(&agent, name))
                    .collect(),
                None => Vec::new(),
            },
            AttrGroup::Operations => self.operations.names(),
        }
    }

    /// Whether applying would change anything on the cluster: a parameter, an operation, a
    /// same-as reference, or the resource's id.
    pub fn is_changed(&self) -> bool {
        self.identity.lock().unwrap().is_changed()
            || self.params.is_changed(None)
            || self.operations.is_changed(None)
            || self.locations.is_changed(None)
            || self.meta_ref.lock().unwrap().is_changed()
            || self.ops_ref.lock().unwrap().is_changed()
    }

    /// Set or clear the location score of this resource on `host`.
    pub fn set_location(&self, host: &str, score: Option<&str>) {
        if !self.locations.contains(host) {
            self.locations.declare(host, None);
        }
        self.locations.set_pending(host, score.map(str::to_string));
        self.note_edit();
    }

    /// Schema checks only. Port and id collisions are checked by the cluster.
    pub fn is_correct(&self) -> bool {
        if self.is_placeholder() {
            return true;
        }
        let identity = self.identity();
        // Ids on the cluster cannot be changed; a renamed resource has to be reverted.
        if !identity.is_new() && identity.is_changed() {
            return false;
        }
        // Containers need no schema as long as nothing was set on them.
        let container = matches!(self.category(), Category::Group | Category::Clone);
        let params_correct = self.params.is_correct(None)
            || (container && self.params.is_locked() && !self.params.is_changed(None));
        let name = identity.pending;
        !name.is_empty()
            && !name.contains(char::is_whitespace)
            && params_correct
            && (self.operations.names().is_empty() || self.operations.is_correct(None))
    }

    pub fn state(&self) -> ApplyState {
        *self.state.lock().unwrap()
    }

    /// Drive the lifecycle. Returns the new state, or `None` if the event was rejected.
    pub fn transition(&self, event: ApplyEvent) -> Option<ApplyState> {
        let applied_before = !self.is_new();
        let mut state = self.state.lock().unwrap();
        let next = state.next(event, applied_before);
        match next {
            Some(next) => {
                if *state != next {
                    debug!("{} ({}): {:?} -> {:?}", self.name(), self.id, *state, next);
                }
                *state = next;
            }
            None => debug!(
                "{} ({}): {:?} not allowed in {:?}",
                self.name(),
                self.id,
                event,
                *state
            ),
        }
        next
    }

    /// For resources found on the cluster rather than created in the console.
    pub(crate) fn mark_applied(&self) {
        *self.state.lock().unwrap() = ApplyState::Applied;
    }

    /// Call after an edit, so the lifecycle follows the edit buffer.
    pub fn note_edit(&self) {
        if self.is_changed() {
            self.transition(ApplyEvent::Edit);
        } else {
            self.transition(ApplyEvent::Settle);
        }
    }

    /// Copy every pending value, reference, and the id to their saved counterparts.
    pub fn commit(&self) {
        self.params.commit_all();
        self.operations.commit_all();
        self.locations.commit_all();
        self.meta_ref.lock().unwrap().commit();
        self.ops_ref.lock().unwrap().commit();
        let mut identity = self.identity.lock().unwrap();
        identity.applied = Some(identity.pending.clone());
    }

    /// Discard every edit.
    pub fn revert(&self) {
        self.params.revert_all();
        self.operations.revert_all();
        self.locations.revert_all();
        self.meta_ref.lock().unwrap().revert();
        self.ops_ref.lock().unwrap().revert();
        let mut identity = self.identity.lock().unwrap();
        if let Some(applied) = &identity.applied {
            identity.pending = applied.clone();
        }
    }

    pub fn live_status(&self) -> LiveStatus {
        self.status.lock().unwrap().clone()
    }

    pub fn set_live_status(&self, status: LiveStatus) {
        let mut old = self.status.lock().unwrap();
        if *old != status {
            debug!(
                "status of {} changed from {:?} to {:?}",
                self.name(),
                old.run_state,
                status.run_state
            );
        }
        *old = status;
    }

    pub fn references(&self) -> [(AttrGroup, Reference); 2] {
        [
            (AttrGroup::Meta, self.meta_ref.lock().unwrap().pending),
            (AttrGroup::Operations, self.ops_ref.lock().unwrap().pending),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle() {
        use ApplyEvent as E;
        use ApplyState as S;

        assert_eq!(S::New.next(E::DryRun, false), Some(S::DryRun));
        assert_eq!(S::DryRun.next(E::Commit, false), Some(S::Applied));
        assert_eq!(S::DryRun.next(E::Fail, false), Some(S::New));
        assert_eq!(S::DryRun.next(E::Fail, true), Some(S::Edited));
        assert_eq!(S::Applied.next(E::Edit, true), Some(S::Edited));
        assert_eq!(S::Edited.next(E::Settle, true), Some(S::Applied));
        assert_eq!(S::Edited.next(E::Commit, true), None);
        assert_eq!(S::Applied.next(E::Remove, true), Some(S::Removing));
        assert_eq!(S::Removing.next(E::Commit, true), Some(S::Removed));
        assert_eq!(S::Removed.next(E::Remove, true), None);
        assert_eq!(S::Removed.next(E::DryRun, true), None);
    }

    #[test]
    fn identity_changes() {
        let mut identity = Identity::new("res_IPaddr2_1");
        assert!(identity.is_new());
        assert!(identity.is_changed());

        identity.applied = Some("res_IPaddr2_1".to_string());
        assert!(!identity.is_changed());

        identity.pending = "vip".to_string();
        assert!(identity.is_changed());
    }
}
