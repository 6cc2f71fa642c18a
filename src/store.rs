// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The attribute store keeps, per parameter, the schema default, the last value known to be
//! applied on the cluster ("saved") and the value currently being edited ("pending").
//!
//! Edits and live refreshes may come from different tasks. The parameter table is behind a
//! read-write lock that is only taken for writing when the set of parameters changes (schema
//! load, declaring a new parameter); everything else locks one parameter at a time.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, RwLock},
};

use log::debug;

use crate::schema::{ResourceAgent, SchemaProvider};

/// The three values tracked for one parameter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamState {
    pub default: Option<String>,
    pub saved: Option<String>,
    pub pending: Option<String>,

    /// Set when a refresh changed `saved` underneath an unsaved edit.
    pub stale: bool,

    /// Set while the parameter mirrors another resource through a same-as reference. Its
    /// pending value is then owned by the reference resolver.
    pub tracking: bool,
}

impl ParamState {
    fn new(default: Option<String>) -> Self {
        ParamState {
            default,
            ..Default::default()
        }
    }

    /// The effective value: the edit buffer, or the default if nothing was ever set.
    pub fn value(&self) -> Option<&str> {
        self.pending.as_deref().or(self.default.as_deref())
    }

    pub fn is_changed(&self) -> bool {
        normalize(&self.pending) != normalize(&self.saved)
    }
}

/// Empty strings and absent values are the same thing as far as diffing is concerned.
fn normalize(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Both saved and pending took the live value.
    Updated,
    /// Only saved took the live value; an unsaved edit was kept.
    Stale,
    /// Nothing to do.
    Unchanged,
    /// The parameter is not known to this store.
    Unknown,
}

#[derive(Debug)]
struct Schema {
    provider: Arc<dyn SchemaProvider>,
    agent: ResourceAgent,
}

/// Per-resource parameter values.
#[derive(Debug)]
pub struct AttributeStore {
    schema: RwLock<Option<Schema>>,
    params: RwLock<BTreeMap<String, Mutex<ParamState>>>,

    /// Writes made while no schema is available. They are replayed as pending edits once the
    /// schema is loaded.
    unloaded: Mutex<HashMap<String, Option<String>>>,
}

impl Default for AttributeStore {
    fn default() -> Self {
        Self::locked()
    }
}

impl AttributeStore {
    /// A store whose schema is not available yet. Every parameter is incorrect until
    /// `load_schema` succeeds.
    pub fn locked() -> Self {
        AttributeStore {
            schema: RwLock::new(None),
            params: RwLock::new(BTreeMap::new()),
            unloaded: Mutex::new(HashMap::new()),
        }
    }

    /// A store for an agent, populated from the schema if the schema knows the agent.
    pub fn for_agent(provider: Arc<dyn SchemaProvider>, agent: &ResourceAgent) -> Self {
        let store = Self::locked();
        store.load_schema(provider, agent);
        store
    }

    /// A store without a schema but with a fixed parameter list. Used for values the engine
    /// owns itself, like per-host endpoints and per-volume devices.
    pub fn with_params(params: &[(&str, Option<&str>)]) -> Self {
        let store = Self::locked();
        for (name, default) in params {
            store.declare(name, default.map(str::to_string));
        }
        store
    }

    /// Attach the schema and declare all of its parameters. Returns false if the schema does
    /// not know the agent, in which case the store stays locked.
    pub fn load_schema(&self, provider: Arc<dyn SchemaProvider>, agent: &ResourceAgent) -> bool {
        let Some(names) = provider.parameter_names(agent) else {
            debug!("no schema for {agent} yet");
            return false;
        };
        {
            let mut params = self.params.write().unwrap();
            for name in names {
                let default = provider.default_value(agent, &name);
                params
                    .entry(name)
                    .and_modify(|p| p.get_mut().unwrap().default = default.clone())
                    .or_insert_with(|| Mutex::new(ParamState::new(default)));
            }
        }
        *self.schema.write().unwrap() = Some(Schema {
            provider,
            agent: agent.clone(),
        });

        let cached: Vec<_> = self.unloaded.lock().unwrap().drain().collect();
        for (name, value) in cached {
            self.set_pending(&name, value);
        }
        true
    }

    /// A store is locked when it has neither a schema nor any declared parameter.
    pub fn is_locked(&self) -> bool {
        self.schema.read().unwrap().is_none() && self.params.read().unwrap().is_empty()
    }

    pub fn has_schema(&self) -> bool {
        self.schema.read().unwrap().is_some()
    }

    /// Add a parameter that the schema does not describe. Declaring an existing parameter only
    /// updates its default.
    pub fn declare(&self, name: &str, default: Option<String>) {
        let mut params = self.params.write().unwrap();
        params
            .entry(name.to_string())
            .and_modify(|p| p.get_mut().unwrap().default = default.clone())
            .or_insert_with(|| Mutex::new(ParamState::new(default)));
    }

    /// Drop a parameter entirely, e.g. when a host is removed from a DRBD resource.
    pub fn undeclare(&self, name: &str) {
        self.params.write().unwrap().remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.read().unwrap().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.params.read().unwrap().keys().cloned().collect()
    }

    pub fn state(&self, name: &str) -> Option<ParamState> {
        self.with_param(name, |p| p.clone())
    }

    fn with_param<T>(&self, name: &str, f: impl FnOnce(&mut ParamState) -> T) -> Option<T> {
        let params = self.params.read().unwrap();
        let param = params.get(name)?;
        let mut param = param.lock().unwrap();
        Some(f(&mut param))
    }

    /// The value in the edit buffer, or the default if the buffer is empty.
    pub fn get(&self, name: &str) -> Option<String> {
        if let Some(value) = self.unloaded.lock().unwrap().get(name) {
            return value.clone();
        }
        self.with_param(name, |p| p.value().map(str::to_string))
            .flatten()
    }

    pub fn saved(&self, name: &str) -> Option<String> {
        self.with_param(name, |p| p.saved.clone()).flatten()
    }

    pub fn default_value(&self, name: &str) -> Option<String> {
        self.with_param(name, |p| p.default.clone()).flatten()
    }

    pub fn set_default(&self, name: &str, value: Option<String>) {
        self.with_param(name, |p| p.default = value);
    }

    /// Overwrite the edit buffer. Never touches the saved value.
    pub fn set_pending(&self, name: &str, value: Option<String>) {
        if !self.has_schema() && !self.contains(name) {
            debug!("caching '{name}' until the schema is loaded");
            self.unloaded
                .lock()
                .unwrap()
                .insert(name.to_string(), value);
            return;
        }
        if self.with_param(name, |p| p.pending = value).is_none() {
            debug!("ignoring write to unknown parameter '{name}'");
        }
    }

    /// Set a pending value on a parameter owned by a same-as reference.
    pub(crate) fn set_tracked(&self, name: &str, value: Option<String>) {
        self.with_param(name, |p| {
            p.tracking = true;
            p.pending = value;
        });
    }

    pub(crate) fn untrack(&self, name: &str) {
        self.with_param(name, |p| p.tracking = false);
    }

    pub fn is_tracking(&self, name: &str) -> bool {
        self.with_param(name, |p| p.tracking).unwrap_or(false)
    }

    /// Merge a value observed on the live cluster.
    ///
    /// Without an unsaved edit both saved and pending take the live value. With one, only saved
    /// moves and the parameter is flagged stale. Tracked parameters only update saved.
    pub fn refresh_from_live(&self, name: &str, live: Option<String>) -> RefreshOutcome {
        let live = live.filter(|v| !v.is_empty());
        self.with_param(name, |p| {
            if p.tracking {
                let changed = p.saved != live;
                p.saved = live;
                return if changed {
                    RefreshOutcome::Updated
                } else {
                    RefreshOutcome::Unchanged
                };
            }
            if normalize(&p.saved) == live.as_deref() {
                return RefreshOutcome::Unchanged;
            }
            if !p.is_changed() {
                p.saved = live.clone();
                p.pending = live;
                p.stale = false;
                RefreshOutcome::Updated
            } else {
                debug!("'{name}' changed on the cluster while being edited");
                p.saved = live;
                p.stale = p.is_changed();
                RefreshOutcome::Stale
            }
        })
        .unwrap_or(RefreshOutcome::Unknown)
    }

    pub fn is_stale(&self, name: &str) -> bool {
        self.with_param(name, |p| p.stale).unwrap_or(false)
    }

    /// Whether the given parameter, or any parameter if `name` is `None`, has an unsaved edit.
    pub fn is_changed(&self, name: Option<&str>) -> bool {
        let cached = {
            let unloaded = self.unloaded.lock().unwrap();
            match name {
                Some(name) => unloaded.contains_key(name),
                None => !unloaded.is_empty(),
            }
        };
        if cached {
            return true;
        }
        match name {
            Some(name) => self.with_param(name, |p| p.is_changed()).unwrap_or(false),
            None => self
                .params
                .read()
                .unwrap()
                .values()
                .any(|p| p.lock().unwrap().is_changed()),
        }
    }

    /// Names of parameters with an unsaved edit.
    pub fn changed_params(&self) -> Vec<String> {
        self.params
            .read()
            .unwrap()
            .iter()
            .filter(|(_, p)| p.lock().unwrap().is_changed())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Check the pending value of one parameter against the schema. Without a schema nothing
    /// is correct, except parameters the engine declared itself.
    pub fn is_valid(&self, name: &str) -> bool {
        let Some(state) = self.state(name) else {
            return false;
        };
        let schema = self.schema.read().unwrap();
        let value = state.value().unwrap_or("");
        match schema.as_ref() {
            Some(Schema { provider, agent }) => {
                let Some(names) = provider.parameter_names(agent) else {
                    return false;
                };
                // Declared by the engine, not by the schema.
                if !names.iter().any(|n| n == name) {
                    return true;
                }
                if value.is_empty() {
                    return !provider.is_required(agent, name);
                }
                provider.validate(agent, name, value)
            }
            None => !self.params.read().unwrap().is_empty(),
        }
    }

    /// Whether every parameter, or the given one, passes `is_valid`.
    pub fn is_correct(&self, name: Option<&str>) -> bool {
        if self.is_locked() {
            return false;
        }
        match name {
            Some(name) => self.is_valid(name),
            None => self.names().iter().all(|n| self.is_valid(n)),
        }
    }

    /// Copy pending to saved for the given parameters, after they were applied successfully.
    pub fn commit(&self, names: &[String]) {
        for name in names {
            self.with_param(name, |p| {
                p.saved = p.pending.clone();
                p.stale = false;
            });
        }
    }

    /// Copy saved to pending for the given parameters, discarding edits.
    pub fn revert(&self, names: &[String]) {
        for name in names {
            self.with_param(name, |p| {
                p.pending = p.saved.clone();
                p.stale = false;
            });
        }
    }

    pub fn commit_all(&self) {
        self.commit(&self.names());
    }

    pub fn revert_all(&self) {
        self.unloaded.lock().unwrap().clear();
        self.revert(&self.names());
    }

    /// Snapshot of every effective value, in name order.
    pub fn values(&self) -> BTreeMap<String, Option<String>> {
        self.params
            .read()
            .unwrap()
            .iter()
            .map(|(name, p)| (name.clone(), p.lock().unwrap().value().map(str::to_string)))
            .collect()
    }

    pub fn schema(&self) -> Option<(Arc<dyn SchemaProvider>, ResourceAgent)> {
        self.schema
            .read()
            .unwrap()
            .as_ref()
            .map(|s| (Arc::clone(&s.provider), s.agent.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> AttributeStore {
        AttributeStore::with_params(&[("ip", None), ("cidr_netmask", Some("24"))])
    }

    #[test]
    fn get_falls_back_to_default() {
        let store = store();
        assert_eq!(store.get("cidr_netmask").as_deref(), Some("24"));
        assert_eq!(store.get("ip"), None);

        store.set_pending("cidr_netmask", Some("16".to_string()));
        assert_eq!(store.get("cidr_netmask").as_deref(), Some("16"));
        assert_eq!(store.saved("cidr_netmask"), None);
    }

    #[test]
    fn refresh_without_edit_moves_both() {
        let store = store();
        assert_eq!(
            store.refresh_from_live("ip", Some("10.0.0.5".to_string())),
            RefreshOutcome::Updated
        );
        assert_eq!(store.saved("ip").as_deref(), Some("10.0.0.5"));
        assert_eq!(store.get("ip").as_deref(), Some("10.0.0.5"));
        assert!(!store.is_changed(None));
    }

    #[test]
    fn refresh_keeps_unsaved_edit() {
        let store = store();
        store.refresh_from_live("ip", Some("10.0.0.5".to_string()));
        store.set_pending("ip", Some("10.0.0.6".to_string()));

        assert_eq!(
            store.refresh_from_live("ip", Some("10.0.0.7".to_string())),
            RefreshOutcome::Stale
        );
        assert_eq!(store.saved("ip").as_deref(), Some("10.0.0.7"));
        assert_eq!(store.get("ip").as_deref(), Some("10.0.0.6"));
        assert!(store.is_stale("ip"));
        assert!(store.is_changed(Some("ip")));
    }

    #[test]
    fn empty_and_unset_are_equal() {
        let store = store();
        store.set_pending("ip", Some(String::new()));
        assert!(!store.is_changed(None));
    }

    #[test]
    fn locked_store_caches_writes() {
        let store = AttributeStore::locked();
        assert!(store.is_locked());
        assert!(!store.is_correct(None));

        store.set_pending("ip", Some("10.0.0.5".to_string()));
        assert_eq!(store.get("ip").as_deref(), Some("10.0.0.5"));
        assert!(store.is_changed(None));
        assert!(store.is_changed(Some("ip")));
        assert!(!store.is_changed(Some("cidr_netmask")));
        assert!(!store.is_correct(None));
    }

    #[test]
    fn commit_then_revert_is_noop() {
        let store = store();
        store.set_pending("ip", Some("10.0.0.5".to_string()));
        let names = store.names();
        store.commit(&names);
        let before = store.values();
        store.revert(&names);
        assert_eq!(before, store.values());
        assert!(!store.is_changed(None));
    }
}
