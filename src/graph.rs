// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The order and colocation dependencies between CRM resources.
//!
//! Edges between two ordinary resources become one constraint each. Edges that end at a
//! placeholder are folded into that placeholder's resource-set constraint instead, so that many
//! resources can share one set-based constraint.
//!
//! Graph operations do not produce commands themselves. They return the list of `Change`s they
//! made; `crm::render_changes` turns those into commands.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::resource::ResourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConstraintKind {
    Order,
    Colocation,
}

/// Which constraint kinds an operation applies to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EdgeKinds {
    pub order: bool,
    pub colocation: bool,
}

impl EdgeKinds {
    pub const ORDER: EdgeKinds = EdgeKinds {
        order: true,
        colocation: false,
    };
    pub const COLOCATION: EdgeKinds = EdgeKinds {
        order: false,
        colocation: true,
    };
    pub const BOTH: EdgeKinds = EdgeKinds {
        order: true,
        colocation: true,
    };

    pub fn kinds(self) -> impl Iterator<Item = ConstraintKind> {
        [
            self.order.then_some(ConstraintKind::Order),
            self.colocation.then_some(ConstraintKind::Colocation),
        ]
        .into_iter()
        .flatten()
    }

    pub fn contains(self, kind: ConstraintKind) -> bool {
        match kind {
            ConstraintKind::Order => self.order,
            ConstraintKind::Colocation => self.colocation,
        }
    }

    fn set(&mut self, kind: ConstraintKind, on: bool) {
        match kind {
            ConstraintKind::Order => self.order = on,
            ConstraintKind::Colocation => self.colocation = on,
        }
    }

    pub fn is_empty(self) -> bool {
        !self.order && !self.colocation
    }
}

/// A dependency between two ordinary resources. `parent` is started first, and `child` is placed
/// with `parent`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectEdge {
    pub kinds: EdgeKinds,
    /// Constraint ids as known on the cluster.
    pub order_id: Option<String>,
    pub colocation_id: Option<String>,
}

impl DirectEdge {
    pub fn id(&self, kind: ConstraintKind) -> Option<&str> {
        match kind {
            ConstraintKind::Order => self.order_id.as_deref(),
            ConstraintKind::Colocation => self.colocation_id.as_deref(),
        }
    }

    fn set_id(&mut self, kind: ConstraintKind, id: Option<String>) {
        match kind {
            ConstraintKind::Order => self.order_id = id,
            ConstraintKind::Colocation => self.colocation_id = id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSet {
    pub members: Vec<ResourceId>,
    pub sequential: bool,
    pub require_all: bool,
}

impl Default for ResourceSet {
    fn default() -> Self {
        ResourceSet {
            members: Vec::new(),
            sequential: false,
            require_all: true,
        }
    }
}

/// One set-based constraint: two ordered member lists. The first list holds the resources that
/// come before the placeholder, the second the ones that come after it, unless `reversed` is
/// set, in which case the roles of the two lists are swapped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetConstraint {
    pub id: Option<String>,
    pub lists: [ResourceSet; 2],
    pub reversed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Before,
    After,
}

impl SetConstraint {
    fn index(&self, side: Side) -> usize {
        match (side, self.reversed) {
            (Side::Before, false) | (Side::After, true) => 0,
            (Side::After, false) | (Side::Before, true) => 1,
        }
    }

    /// The member lists in their effective orientation: (before, after).
    pub fn oriented(&self) -> (&ResourceSet, &ResourceSet) {
        (
            &self.lists[self.index(Side::Before)],
            &self.lists[self.index(Side::After)],
        )
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        self.lists.iter().any(|l| l.members.contains(&id))
    }

    pub fn is_empty(&self) -> bool {
        self.lists.iter().all(|l| l.members.is_empty())
    }

    pub fn members(&self) -> impl Iterator<Item = ResourceId> + '_ {
        self.lists.iter().flat_map(|l| l.members.iter().copied())
    }

    fn insert(&mut self, side: Side, id: ResourceId) -> bool {
        if self.contains(id) {
            return false;
        }
        let index = self.index(side);
        self.lists[index].members.push(id);
        true
    }

    fn remove(&mut self, id: ResourceId) -> bool {
        let mut removed = false;
        for list in self.lists.iter_mut() {
            let before = list.members.len();
            list.members.retain(|m| *m != id);
            removed |= list.members.len() != before;
        }
        removed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaceholderSets {
    pub order: SetConstraint,
    pub colocation: SetConstraint,
}

impl PlaceholderSets {
    pub fn get(&self, kind: ConstraintKind) -> &SetConstraint {
        match kind {
            ConstraintKind::Order => &self.order,
            ConstraintKind::Colocation => &self.colocation,
        }
    }

    fn get_mut(&mut self, kind: ConstraintKind) -> &mut SetConstraint {
        match kind {
            ConstraintKind::Order => &mut self.order,
            ConstraintKind::Colocation => &mut self.colocation,
        }
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        self.order.contains(id) || self.colocation.contains(id)
    }
}

/// A placeholder's set constraints as last applied and as currently edited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Placeholder {
    pub saved: PlaceholderSets,
    pub pending: PlaceholderSets,
}

impl Placeholder {
    pub fn is_changed(&self) -> bool {
        self.saved != self.pending
    }
}

/// What a graph operation changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    AddDirect {
        parent: ResourceId,
        child: ResourceId,
        kind: ConstraintKind,
    },
    RemoveDirect {
        parent: ResourceId,
        child: ResourceId,
        kind: ConstraintKind,
        id: Option<String>,
    },
    /// The placeholder's set constraint must be (re)written with its current members.
    RewriteSet {
        placeholder: ResourceId,
        kind: ConstraintKind,
    },
    /// The placeholder's set constraint has no members left and can go.
    DeleteSet {
        placeholder: ResourceId,
        kind: ConstraintKind,
        id: Option<String>,
    },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("{0} cannot depend on itself")]
    SelfEdge(ResourceId),
    #[error("placeholders {0} and {1} cannot be connected directly")]
    PlaceholderToPlaceholder(ResourceId, ResourceId),
    #[error("{0} is not a placeholder")]
    NotAPlaceholder(ResourceId),
}

/// What the graph needs to know about the resources it connects.
pub trait NodeInfo {
    fn is_placeholder(&self, id: ResourceId) -> bool;

    fn is_master_slave(&self, id: ResourceId) -> bool;

    /// The id to use for the resource in constraints, or `None` while it has none.
    fn constraint_id(&self, id: ResourceId) -> Option<String>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    edges: BTreeMap<(ResourceId, ResourceId), DirectEdge>,
    placeholders: BTreeMap<ResourceId, Placeholder>,

    /// Edges touching a resource that has no id on the cluster yet.
    deferred: BTreeSet<(ResourceId, ResourceId, ConstraintKind)>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_placeholder(&mut self, id: ResourceId) {
        self.placeholders.entry(id).or_default();
    }

    pub fn placeholder(&self, id: ResourceId) -> Option<&Placeholder> {
        self.placeholders.get(&id)
    }

    pub fn placeholders(&self) -> impl Iterator<Item = (ResourceId, &Placeholder)> {
        self.placeholders.iter().map(|(id, ph)| (*id, ph))
    }

    pub fn edge(&self, parent: ResourceId, child: ResourceId) -> Option<&DirectEdge> {
        self.edges.get(&(parent, child))
    }

    pub fn edges(&self) -> impl Iterator<Item = (ResourceId, ResourceId, &DirectEdge)> {
        self.edges.iter().map(|((p, c), e)| (*p, *c, e))
    }

    pub fn deferred(&self) -> impl Iterator<Item = &(ResourceId, ResourceId, ConstraintKind)> {
        self.deferred.iter()
    }

    /// Whether any dependency of the given kinds runs from `parent` to `child`.
    pub fn has_edge(&self, parent: ResourceId, child: ResourceId, kind: ConstraintKind) -> bool {
        if self
            .edges
            .get(&(parent, child))
            .is_some_and(|e| e.kinds.contains(kind))
        {
            return true;
        }
        if let Some(ph) = self.placeholders.get(&parent) {
            let set = ph.pending.get(kind);
            return set.oriented().1.members.contains(&child);
        }
        if let Some(ph) = self.placeholders.get(&child) {
            let set = ph.pending.get(kind);
            return set.oriented().0.members.contains(&parent);
        }
        false
    }

    /// Add a dependency. Edges touching a resource without a cluster id are kept aside until
    /// `flush_deferred` finds both ends applied.
    pub fn add_edge(
        &mut self,
        parent: ResourceId,
        child: ResourceId,
        kinds: EdgeKinds,
        info: &impl NodeInfo,
    ) -> Result<Vec<Change>, GraphError> {
        if parent == child {
            return Err(GraphError::SelfEdge(parent));
        }
        let parent_ph = info.is_placeholder(parent);
        let child_ph = info.is_placeholder(child);
        if parent_ph && child_ph {
            return Err(GraphError::PlaceholderToPlaceholder(parent, child));
        }

        let mut changes = Vec::new();
        for kind in kinds.kinds() {
            let waiting = [(parent, parent_ph), (child, child_ph)]
                .iter()
                .any(|(id, ph)| !ph && info.constraint_id(*id).is_none());
            if waiting {
                debug!("deferring {kind:?} edge {parent} -> {child} until both are applied");
                self.deferred.insert((parent, child, kind));
                continue;
            }

            if parent_ph || child_ph {
                let (placeholder, member, side) = if parent_ph {
                    (parent, child, Side::After)
                } else {
                    (child, parent, Side::Before)
                };
                let ph = self.placeholders.entry(placeholder).or_default();
                if ph.pending.get_mut(kind).insert(side, member) {
                    changes.push(Change::RewriteSet { placeholder, kind });
                }
            } else {
                let edge = self.edges.entry((parent, child)).or_default();
                if !edge.kinds.contains(kind) {
                    edge.kinds.set(kind, true);
                    changes.push(Change::AddDirect {
                        parent,
                        child,
                        kind,
                    });
                }
            }
        }
        Ok(changes)
    }

    /// Remove a dependency. For a placeholder edge the member is dropped from its set; a set
    /// left without members is deleted, otherwise it is rewritten.
    pub fn remove_edge(
        &mut self,
        parent: ResourceId,
        child: ResourceId,
        kinds: EdgeKinds,
        info: &impl NodeInfo,
    ) -> Vec<Change> {
        let mut changes = Vec::new();
        for kind in kinds.kinds() {
            if self.deferred.remove(&(parent, child, kind)) {
                continue;
            }
            let placeholder = if info.is_placeholder(parent) {
                Some((parent, child))
            } else if info.is_placeholder(child) {
                Some((child, parent))
            } else {
                None
            };
            match placeholder {
                Some((placeholder, member)) => {
                    changes.extend(self.remove_member(placeholder, member, kind));
                }
                None => {
                    let Some(edge) = self.edges.get_mut(&(parent, child)) else {
                        continue;
                    };
                    if !edge.kinds.contains(kind) {
                        continue;
                    }
                    edge.kinds.set(kind, false);
                    let id = edge.id(kind).map(str::to_string);
                    edge.set_id(kind, None);
                    if edge.kinds.is_empty() {
                        self.edges.remove(&(parent, child));
                    }
                    changes.push(Change::RemoveDirect {
                        parent,
                        child,
                        kind,
                        id,
                    });
                }
            }
        }
        changes
    }

    fn remove_member(
        &mut self,
        placeholder: ResourceId,
        member: ResourceId,
        kind: ConstraintKind,
    ) -> Option<Change> {
        let ph = self.placeholders.get_mut(&placeholder)?;
        let set = ph.pending.get_mut(kind);
        if !set.remove(member) {
            return None;
        }
        if set.is_empty() {
            Some(Change::DeleteSet {
                placeholder,
                kind,
                id: set.id.clone(),
            })
        } else {
            Some(Change::RewriteSet { placeholder, kind })
        }
    }

    /// Flip the orientation of a placeholder's set constraint, keeping its members.
    pub fn reverse(
        &mut self,
        placeholder: ResourceId,
        kind: ConstraintKind,
    ) -> Result<Vec<Change>, GraphError> {
        let ph = self
            .placeholders
            .get_mut(&placeholder)
            .ok_or(GraphError::NotAPlaceholder(placeholder))?;
        let set = ph.pending.get_mut(kind);
        set.reversed = !set.reversed;
        if set.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(vec![Change::RewriteSet { placeholder, kind }])
        }
    }

    /// Set the sequencing flags of one of a placeholder's lists. `first` selects the list that
    /// comes first in the effective orientation.
    pub fn set_sequencing(
        &mut self,
        placeholder: ResourceId,
        kind: ConstraintKind,
        first: bool,
        sequential: bool,
        require_all: bool,
    ) -> Result<Vec<Change>, GraphError> {
        let ph = self
            .placeholders
            .get_mut(&placeholder)
            .ok_or(GraphError::NotAPlaceholder(placeholder))?;
        let set = ph.pending.get_mut(kind);
        let index = set.index(if first { Side::Before } else { Side::After });
        let list = &mut set.lists[index];
        if list.sequential == sequential && list.require_all == require_all {
            return Ok(Vec::new());
        }
        list.sequential = sequential;
        list.require_all = require_all;
        Ok(if set.is_empty() {
            Vec::new()
        } else {
            vec![Change::RewriteSet { placeholder, kind }]
        })
    }

    /// Fold in every deferred edge whose ends now have cluster ids.
    pub fn flush_deferred(&mut self, info: &impl NodeInfo) -> Vec<Change> {
        let ready: Vec<_> = self
            .deferred
            .iter()
            .filter(|(parent, child, _)| {
                [*parent, *child]
                    .iter()
                    .all(|id| info.is_placeholder(*id) || info.constraint_id(*id).is_some())
            })
            .copied()
            .collect();

        let mut changes = Vec::new();
        for (parent, child, kind) in ready {
            self.deferred.remove(&(parent, child, kind));
            let kinds = match kind {
                ConstraintKind::Order => EdgeKinds::ORDER,
                ConstraintKind::Colocation => EdgeKinds::COLOCATION,
            };
            if let Ok(c) = self.add_edge(parent, child, kinds, info) {
                changes.extend(c);
            }
        }
        changes
    }

    /// Sever every dependency of `id`, and drop it as a placeholder if it is one.
    pub fn remove_resource(&mut self, id: ResourceId, info: &impl NodeInfo) -> Vec<Change> {
        let mut changes = Vec::new();
        self.deferred.retain(|(p, c, _)| *p != id && *c != id);

        let touching: Vec<_> = self
            .edges
            .keys()
            .filter(|(p, c)| *p == id || *c == id)
            .copied()
            .collect();
        for (parent, child) in touching {
            changes.extend(self.remove_edge(parent, child, EdgeKinds::BOTH, info));
        }

        let placeholders: Vec<_> = self.placeholders.keys().copied().collect();
        for placeholder in placeholders {
            for kind in [ConstraintKind::Order, ConstraintKind::Colocation] {
                changes.extend(self.remove_member(placeholder, id, kind));
            }
        }

        if let Some(ph) = self.placeholders.remove(&id) {
            for kind in [ConstraintKind::Order, ConstraintKind::Colocation] {
                let saved = ph.saved.get(kind);
                if !saved.is_empty() || saved.id.is_some() {
                    changes.push(Change::DeleteSet {
                        placeholder: id,
                        kind,
                        id: saved.id.clone(),
                    });
                }
            }
        }
        changes
    }

    /// Record the cluster id of a direct constraint.
    pub fn set_direct_id(
        &mut self,
        parent: ResourceId,
        child: ResourceId,
        kind: ConstraintKind,
        id: &str,
    ) {
        let edge = self.edges.entry((parent, child)).or_default();
        edge.kinds.set(kind, true);
        edge.set_id(kind, Some(id.to_string()));
    }

    /// Replace the direct edges with what the cluster reports. Edges the cluster does not know
    /// are kept only if they have no cluster id yet (they are waiting for an apply).
    pub fn merge_live_direct(
        &mut self,
        live: &[(ResourceId, ResourceId, ConstraintKind, String)],
    ) {
        let seen: BTreeSet<_> = live.iter().map(|(p, c, k, _)| (*p, *c, *k)).collect();
        for ((parent, child), edge) in self.edges.iter_mut() {
            for kind in [ConstraintKind::Order, ConstraintKind::Colocation] {
                if edge.kinds.contains(kind)
                    && edge.id(kind).is_some()
                    && !seen.contains(&(*parent, *child, kind))
                {
                    debug!("{kind:?} constraint {parent} -> {child} is gone from the cluster");
                    edge.kinds.set(kind, false);
                    edge.set_id(kind, None);
                }
            }
        }
        self.edges.retain(|_, e| !e.kinds.is_empty());
        for (parent, child, kind, id) in live {
            self.set_direct_id(*parent, *child, *kind, id);
        }
    }

    /// Merge a set constraint reported by the cluster. Unsaved edits to the placeholder are kept.
    pub fn merge_live_set(&mut self, placeholder: ResourceId, kind: ConstraintKind, live: SetConstraint) {
        let ph = self.placeholders.entry(placeholder).or_default();
        let unchanged = ph.saved.get(kind) == ph.pending.get(kind);
        *ph.saved.get_mut(kind) = live.clone();
        if unchanged {
            *ph.pending.get_mut(kind) = live;
        }
    }

    /// The placeholder holding the live set constraint `id`, if any.
    pub fn placeholder_for_set(&self, id: &str) -> Option<ResourceId> {
        self.placeholders.iter().find_map(|(ph_id, ph)| {
            [&ph.saved.order, &ph.saved.colocation]
                .iter()
                .any(|s| s.id.as_deref() == Some(id))
                .then_some(*ph_id)
        })
    }

    pub fn commit_placeholder(&mut self, placeholder: ResourceId) {
        if let Some(ph) = self.placeholders.get_mut(&placeholder) {
            ph.saved = ph.pending.clone();
        }
    }

    /// Set the cluster id of a placeholder's set constraint, in both snapshots.
    pub fn set_set_id(&mut self, placeholder: ResourceId, kind: ConstraintKind, id: Option<String>) {
        if let Some(ph) = self.placeholders.get_mut(&placeholder) {
            ph.saved.get_mut(kind).id = id.clone();
            ph.pending.get_mut(kind).id = id;
        }
    }

    /// Restore the saved sets of every placeholder that `id` is, or is a member of.
    pub fn revert_touching(&mut self, id: ResourceId) -> Vec<ResourceId> {
        let mut reverted = Vec::new();
        for (ph_id, ph) in self.placeholders.iter_mut() {
            let touches = *ph_id == id || ph.pending.contains(id) || ph.saved.contains(id);
            if touches && ph.is_changed() {
                ph.pending = ph.saved.clone();
                reverted.push(*ph_id);
            }
        }
        self.deferred.retain(|(p, c, _)| *p != id && *c != id);
        reverted
    }

    /// Constraints touching any of `ids` that exist only locally: direct edges without a
    /// cluster id, and placeholder sets whose pending members differ from the saved ones.
    pub fn unapplied_touching(
        &self,
        ids: &BTreeSet<ResourceId>,
        info: &impl NodeInfo,
    ) -> Vec<Change> {
        let mut changes = Vec::new();
        for ((parent, child), edge) in &self.edges {
            if !ids.contains(parent) && !ids.contains(child) {
                continue;
            }
            let named = [*parent, *child]
                .iter()
                .all(|id| info.constraint_id(*id).is_some());
            if !named {
                continue;
            }
            for kind in edge.kinds.kinds() {
                if edge.id(kind).is_none() {
                    changes.push(Change::AddDirect {
                        parent: *parent,
                        child: *child,
                        kind,
                    });
                }
            }
        }

        for (placeholder, ph) in &self.placeholders {
            if !ids.iter().any(|id| ph.pending.contains(*id) || ph.saved.contains(*id)) {
                continue;
            }
            for kind in [ConstraintKind::Order, ConstraintKind::Colocation] {
                let pending = ph.pending.get(kind);
                let saved = ph.saved.get(kind);
                if pending == saved {
                    continue;
                }
                if !pending.is_empty() {
                    changes.push(Change::RewriteSet {
                        placeholder: *placeholder,
                        kind,
                    });
                } else if !saved.is_empty() || saved.id.is_some() {
                    changes.push(Change::DeleteSet {
                        placeholder: *placeholder,
                        kind,
                        id: saved.id.clone(),
                    });
                }
            }
        }
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Resource 100 and up are placeholders; 50 and up have no cluster id yet.
    struct Info;

    impl NodeInfo for Info {
        fn is_placeholder(&self, id: ResourceId) -> bool {
            id.0 >= 100
        }

        fn is_master_slave(&self, _id: ResourceId) -> bool {
            false
        }

        fn constraint_id(&self, id: ResourceId) -> Option<String> {
            (id.0 < 50).then(|| format!("res{}", id.0))
        }
    }

    const A: ResourceId = ResourceId(1);
    const B: ResourceId = ResourceId(2);
    const C: ResourceId = ResourceId(3);
    const NEW: ResourceId = ResourceId(50);
    const PH: ResourceId = ResourceId(100);

    #[test]
    fn direct_edges() {
        let mut graph = DependencyGraph::new();
        let changes = graph.add_edge(A, B, EdgeKinds::BOTH, &Info).unwrap();
        assert_eq!(changes.len(), 2);
        assert!(graph.has_edge(A, B, ConstraintKind::Order));
        assert!(graph.has_edge(A, B, ConstraintKind::Colocation));

        // Adding again changes nothing.
        assert!(graph.add_edge(A, B, EdgeKinds::ORDER, &Info).unwrap().is_empty());

        let changes = graph.remove_edge(A, B, EdgeKinds::ORDER, &Info);
        assert_eq!(
            changes,
            vec![Change::RemoveDirect {
                parent: A,
                child: B,
                kind: ConstraintKind::Order,
                id: None
            }]
        );
        assert!(!graph.has_edge(A, B, ConstraintKind::Order));
        assert!(graph.has_edge(A, B, ConstraintKind::Colocation));

        graph.remove_edge(A, B, EdgeKinds::COLOCATION, &Info);
        assert!(graph.edge(A, B).is_none());
    }

    #[test]
    fn invalid_edges() {
        let mut graph = DependencyGraph::new();
        assert_eq!(
            graph.add_edge(A, A, EdgeKinds::ORDER, &Info),
            Err(GraphError::SelfEdge(A))
        );
        assert!(matches!(
            graph.add_edge(PH, ResourceId(101), EdgeKinds::ORDER, &Info),
            Err(GraphError::PlaceholderToPlaceholder(..))
        ));
    }

    #[test]
    fn placeholder_membership() {
        let mut graph = DependencyGraph::new();
        graph.add_placeholder(PH);

        graph.add_edge(A, PH, EdgeKinds::ORDER, &Info).unwrap();
        graph.add_edge(B, PH, EdgeKinds::ORDER, &Info).unwrap();
        graph.add_edge(PH, C, EdgeKinds::ORDER, &Info).unwrap();

        let set = &graph.placeholder(PH).unwrap().pending.order;
        let (before, after) = set.oriented();
        assert_eq!(before.members, vec![A, B]);
        assert_eq!(after.members, vec![C]);
        assert!(graph.edges().next().is_none());
        assert!(graph.has_edge(A, PH, ConstraintKind::Order));
        assert!(graph.has_edge(PH, C, ConstraintKind::Order));

        // Removing one member rewrites the set, keeping the order of the others.
        graph.add_edge(C, PH, EdgeKinds::ORDER, &Info).unwrap();
        let changes = graph.remove_edge(A, PH, EdgeKinds::ORDER, &Info);
        assert_eq!(
            changes,
            vec![Change::RewriteSet {
                placeholder: PH,
                kind: ConstraintKind::Order
            }]
        );
        let set = &graph.placeholder(PH).unwrap().pending.order;
        assert_eq!(set.oriented().0.members, vec![B]);

        graph.remove_edge(B, PH, EdgeKinds::ORDER, &Info);
        let changes = graph.remove_edge(PH, C, EdgeKinds::ORDER, &Info);
        assert!(matches!(changes.as_slice(), [Change::DeleteSet { .. }]));
    }

    #[test]
    fn add_remove_restores_set() {
        let mut graph = DependencyGraph::new();
        graph.add_placeholder(PH);
        graph.add_edge(B, PH, EdgeKinds::ORDER, &Info).unwrap();
        graph
            .set_sequencing(PH, ConstraintKind::Order, true, true, false)
            .unwrap();
        let before = graph.placeholder(PH).unwrap().pending.clone();

        graph.add_edge(A, PH, EdgeKinds::ORDER, &Info).unwrap();
        graph.remove_edge(A, PH, EdgeKinds::ORDER, &Info);
        assert_eq!(graph.placeholder(PH).unwrap().pending, before);
    }

    #[test]
    fn reverse_is_idempotent_for_readd() {
        let mut graph = DependencyGraph::new();
        graph.add_placeholder(PH);
        graph.add_edge(A, PH, EdgeKinds::COLOCATION, &Info).unwrap();
        graph.reverse(PH, ConstraintKind::Colocation).unwrap();

        let set = &graph.placeholder(PH).unwrap().pending.colocation;
        assert!(set.reversed);
        assert_eq!(set.oriented().1.members, vec![A]);

        // Dragging the same arrow again does not add a second copy.
        assert!(graph
            .add_edge(A, PH, EdgeKinds::COLOCATION, &Info)
            .unwrap()
            .is_empty());
        assert_eq!(set_len(&graph), 1);
    }

    fn set_len(graph: &DependencyGraph) -> usize {
        graph
            .placeholder(PH)
            .unwrap()
            .pending
            .colocation
            .members()
            .count()
    }

    #[test]
    fn new_resources_are_deferred() {
        struct Applied;
        impl NodeInfo for Applied {
            fn is_placeholder(&self, id: ResourceId) -> bool {
                id.0 >= 100
            }
            fn is_master_slave(&self, _id: ResourceId) -> bool {
                false
            }
            fn constraint_id(&self, id: ResourceId) -> Option<String> {
                Some(format!("res{}", id.0))
            }
        }

        let mut graph = DependencyGraph::new();
        assert!(graph.add_edge(A, NEW, EdgeKinds::BOTH, &Info).unwrap().is_empty());
        assert_eq!(graph.deferred().count(), 2);
        assert!(graph.flush_deferred(&Info).is_empty());

        let changes = graph.flush_deferred(&Applied);
        assert_eq!(changes.len(), 2);
        assert_eq!(graph.deferred().count(), 0);
        assert!(graph.has_edge(A, NEW, ConstraintKind::Order));
    }

    #[test]
    fn unapplied_constraints_are_found() {
        let mut graph = DependencyGraph::new();
        graph.add_placeholder(PH);
        graph.add_edge(A, B, EdgeKinds::ORDER, &Info).unwrap();
        graph.add_edge(B, PH, EdgeKinds::ORDER, &Info).unwrap();
        graph.add_edge(A, C, EdgeKinds::ORDER, &Info).unwrap();
        graph.set_direct_id(A, C, ConstraintKind::Order, "ord_res1_res3");

        let changes = graph.unapplied_touching(&BTreeSet::from([B]), &Info);
        assert_eq!(
            changes,
            vec![
                Change::AddDirect {
                    parent: A,
                    child: B,
                    kind: ConstraintKind::Order,
                },
                Change::RewriteSet {
                    placeholder: PH,
                    kind: ConstraintKind::Order,
                },
            ]
        );

        // Once saved, nothing is left to send.
        graph.set_direct_id(A, B, ConstraintKind::Order, "ord_res1_res2");
        graph.commit_placeholder(PH);
        assert!(graph.unapplied_touching(&BTreeSet::from([B]), &Info).is_empty());

        // A set emptied locally is deleted on the cluster.
        graph.set_set_id(PH, ConstraintKind::Order, Some("ord_ph".to_string()));
        graph.remove_edge(B, PH, EdgeKinds::ORDER, &Info);
        assert_eq!(
            graph.unapplied_touching(&BTreeSet::from([B]), &Info),
            vec![Change::DeleteSet {
                placeholder: PH,
                kind: ConstraintKind::Order,
                id: Some("ord_ph".to_string()),
            }]
        );
    }

    #[test]
    fn remove_resource_severs_everything() {
        let mut graph = DependencyGraph::new();
        graph.add_placeholder(PH);
        graph.add_edge(A, B, EdgeKinds::BOTH, &Info).unwrap();
        graph.add_edge(A, PH, EdgeKinds::ORDER, &Info).unwrap();
        graph.add_edge(C, PH, EdgeKinds::ORDER, &Info).unwrap();
        graph.add_edge(A, NEW, EdgeKinds::ORDER, &Info).unwrap();

        let changes = graph.remove_resource(A, &Info);
        assert_eq!(changes.len(), 3);
        assert!(graph.edge(A, B).is_none());
        assert_eq!(graph.deferred().count(), 0);
        assert!(!graph.placeholder(PH).unwrap().pending.contains(A));
        assert!(graph.placeholder(PH).unwrap().pending.contains(C));
    }
}
