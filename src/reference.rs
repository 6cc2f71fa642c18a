// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Same-as references: a resource may declare that its meta attributes or its operations are
//! the same as another resource's, instead of holding its own values.
//!
//! Candidates are filtered before they are offered, so an accepted reference never closes a
//! cycle. The same chain walk guards DRBD resync-after dependencies.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

use log::{debug, warn};

use crate::resource::{Category, Resource, ResourceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AttrGroup {
    Meta,
    Operations,
}

impl fmt::Display for AttrGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                AttrGroup::Meta => "meta_attributes",
                AttrGroup::Operations => "operations",
            }
        )
    }
}

/// What an attribute group of a resource refers to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reference {
    /// Nothing selected: the resource holds its own values.
    #[default]
    None,
    /// Reset every parameter of the group to its schema default.
    Defaults,
    To(ResourceId),
}

impl Reference {
    pub fn target(&self) -> Option<ResourceId> {
        match self {
            Reference::To(id) => Some(*id),
            _ => None,
        }
    }
}

/// The reference as applied on the cluster and as currently edited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReferenceSlot {
    pub saved: Reference,
    pub pending: Reference,
}

impl ReferenceSlot {
    pub fn is_changed(&self) -> bool {
        // Defaults is a one-shot action on the values, not something that is stored.
        let saved = match self.saved {
            Reference::Defaults => Reference::None,
            other => other,
        };
        let pending = match self.pending {
            Reference::Defaults => Reference::None,
            other => other,
        };
        saved != pending
    }

    pub fn commit(&mut self) {
        self.saved = match self.pending {
            Reference::Defaults => Reference::None,
            other => other,
        };
        self.pending = self.saved;
    }

    pub fn revert(&mut self) {
        self.pending = self.saved;
    }

    /// Merge a reference observed on the cluster, keeping an unsaved edit.
    pub fn refresh(&mut self, live: Reference) {
        if !self.is_changed() {
            self.pending = live;
        }
        self.saved = live;
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("{0} cannot refer to itself")]
    SelfReference(ResourceId),
    #[error("{target} is not a valid {group} reference for {id}")]
    NotACandidate {
        id: ResourceId,
        group: AttrGroup,
        target: ResourceId,
    },
}

/// Follow `next` from `start` and report whether `target` is reached. Revisiting a node ends
/// the walk, so a broken chain that already contains a cycle cannot loop forever.
pub fn chain_reaches<K, F>(start: &K, target: &K, next: F) -> bool
where
    K: Ord + Clone,
    F: Fn(&K) -> Option<K>,
{
    let mut seen = BTreeSet::new();
    let mut current = start.clone();
    loop {
        if &current == target {
            return true;
        }
        if !seen.insert(current.clone()) {
            return false;
        }
        match next(&current) {
            Some(n) => current = n,
            None => return false,
        }
    }
}

fn compatible(me: &Resource, other: &Resource, group: AttrGroup) -> bool {
    let category = me.category();
    if category == Category::Placeholder || category != other.category() {
        return false;
    }
    match group {
        AttrGroup::Meta => true,
        // Operations differ from agent to agent.
        AttrGroup::Operations => me.agent == other.agent,
    }
}

/// The references that may be offered for `me`'s attribute group: the two sentinels, then every
/// compatible resource that holds its own values and whose reference chain does not lead back
/// to `me`.
pub fn candidates(me: &Resource, group: AttrGroup, all: &[Arc<Resource>]) -> Vec<Reference> {
    let by_id: BTreeMap<ResourceId, &Arc<Resource>> = all.iter().map(|r| (r.id, r)).collect();
    let next = |id: &ResourceId| {
        by_id
            .get(id)
            .and_then(|r| r.reference(group).pending.target())
    };

    let mut refs = vec![Reference::None, Reference::Defaults];
    refs.extend(
        all.iter()
            .filter(|other| other.id != me.id)
            .filter(|other| compatible(me, other, group))
            .filter(|other| other.reference(group).pending.target().is_none())
            .filter(|other| !chain_reaches(&other.id, &me.id, next))
            .map(|other| Reference::To(other.id)),
    );
    refs
}

/// Point `me`'s attribute group at `reference`.
///
/// With a target, every parameter of the group becomes tracked and takes the target's saved
/// value. `Defaults` resets every parameter to its default; `None` keeps the current values as
/// the resource's own.
pub fn apply_reference(
    me: &Resource,
    group: AttrGroup,
    reference: Reference,
    all: &[Arc<Resource>],
) -> Result<(), ReferenceError> {
    let target = match reference {
        Reference::To(target) if target == me.id => {
            return Err(ReferenceError::SelfReference(me.id))
        }
        Reference::To(target) => {
            if !candidates(me, group, all).contains(&reference) {
                return Err(ReferenceError::NotACandidate {
                    id: me.id,
                    group,
                    target,
                });
            }
            all.iter().find(|r| r.id == target)
        }
        _ => None,
    };

    me.with_reference(group, |slot| slot.pending = reference);
    let store = me.store(group);
    for param in me.group_params(group) {
        match (reference, target) {
            (Reference::To(_), Some(target)) => {
                store.set_tracked(&param, target.store(group).saved(&param))
            }
            (Reference::Defaults, _) => {
                store.untrack(&param);
                store.set_pending(&param, None);
            }
            _ => store.untrack(&param),
        }
    }
    debug!("{} {group} now refers to {reference:?}", me.name());
    me.note_edit();
    Ok(())
}

/// Bring tracked parameters up to date with their target, and fall back to defaults if the
/// target is gone. Returns true if the reference had to be dropped.
pub fn sync_reference(me: &Resource, group: AttrGroup, all: &[Arc<Resource>]) -> bool {
    let Reference::To(target_id) = me.reference(group).pending else {
        return false;
    };
    match all.iter().find(|r| r.id == target_id) {
        Some(target) => {
            let store = me.store(group);
            for param in me.group_params(group) {
                store.set_tracked(&param, target.store(group).saved(&param));
            }
            false
        }
        None => {
            warn!(
                "{} referred to removed resource {target_id} for its {group}, using defaults",
                me.name()
            );
            let store = me.store(group);
            me.with_reference(group, |slot| slot.pending = Reference::Defaults);
            for param in me.group_params(group) {
                store.untrack(&param);
                store.set_pending(&param, None);
            }
            me.note_edit();
            true
        }
    }
}

/// DRBD resources that `me` may resync after: every other resource whose resync-after chain
/// does not pass through `me`. `resync_after` maps each resource name to the resource it
/// resyncs after.
pub fn resync_after_candidates(
    me: &str,
    resync_after: &BTreeMap<String, Option<String>>,
) -> Vec<String> {
    let next = |name: &String| resync_after.get(name).cloned().flatten();
    let me = me.to_string();
    resync_after
        .keys()
        .filter(|name| **name != me)
        .filter(|name| !chain_reaches(*name, &me, next))
        .cloned()
        .collect()
}
