// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use crate::apply::{ApplyController, Artifact, CommandExecutor, ExecError, ExecReport};
use crate::cluster::Cluster;
use crate::config::Config;
use crate::crm::CrmCommand;
use crate::live::{LiveSnapshot, StatusProvider};
use crate::resource::{Resource, ResourceId};
use crate::Settings;

/// Given a relative `path` in the test directory, prepend the
/// full path to the test directory.
pub fn test_path(path: &str) -> String {
    env!("CARGO_MANIFEST_DIR").to_string() + "/tests/" + path
}

/// The hosts and parameter schema every test starts from.
pub fn fixture_description() -> String {
    std::fs::read_to_string(test_path("cluster.toml")).unwrap()
}

/// Default settings, with a debounce short enough to keep the tests fast.
pub fn test_settings() -> Settings {
    Settings {
        dry_run_debounce: Duration::from_millis(20),
        ..Default::default()
    }
}

/// Build a cluster from the fixture description with `extra` appended to it.
pub fn cluster_with(extra: &str) -> Cluster {
    let text = fixture_description() + "\n" + extra;
    let config = Config::from_toml(&text).unwrap();
    Cluster::from_description(config, test_settings()).unwrap()
}

/// Records every artifact it is given. Test runs report the artifact text; either kind of
/// run can be made to fail. Notes whether two runs were ever in progress at once.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    artifacts: Mutex<Vec<Artifact>>,
    fail_test: AtomicBool,
    fail_real: AtomicBool,
    delay: Mutex<Option<Duration>>,
    running: AtomicUsize,
    overlapped: AtomicBool,
}

impl RecordingExecutor {
    pub fn fail_test_runs(&self, fail: bool) {
        self.fail_test.store(fail, Ordering::SeqCst);
    }

    pub fn fail_real_runs(&self, fail: bool) {
        self.fail_real.store(fail, Ordering::SeqCst);
    }

    /// Make every run take `delay` before it is recorded.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn artifacts(&self) -> Vec<Artifact> {
        self.artifacts.lock().unwrap().clone()
    }

    /// The artifacts that were run for real.
    pub fn real_runs(&self) -> Vec<Artifact> {
        self.artifacts()
            .into_iter()
            .filter(|a| !a.test_only())
            .collect()
    }

    /// Every CRM command that was run for real, in order.
    pub fn real_crm_commands(&self) -> Vec<CrmCommand> {
        self.real_runs()
            .into_iter()
            .filter_map(|a| match a {
                Artifact::Crm(crm) => Some(crm.commands),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn clear(&self) {
        self.artifacts.lock().unwrap().clear();
    }

    /// Whether a run started while another one was still in progress.
    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }
}

impl CommandExecutor for RecordingExecutor {
    async fn execute(&self, artifact: &Artifact) -> Result<ExecReport, ExecError> {
        if self.running.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.artifacts.lock().unwrap().push(artifact.clone());
        self.running.fetch_sub(1, Ordering::SeqCst);

        let fail = if artifact.test_only() {
            &self.fail_test
        } else {
            &self.fail_real
        };
        if fail.load(Ordering::SeqCst) {
            return Err(ExecError::Failed("injected failure".to_string()));
        }
        Ok(ExecReport {
            report: if artifact.test_only() {
                artifact.to_string()
            } else {
                String::new()
            },
        })
    }
}

/// A status provider that hands out whatever snapshot it was last given.
#[derive(Debug, Default)]
pub struct StaticStatus {
    snapshot: Mutex<Option<LiveSnapshot>>,
}

impl StaticStatus {
    pub fn new(snapshot: LiveSnapshot) -> Self {
        StaticStatus {
            snapshot: Mutex::new(Some(snapshot)),
        }
    }

    pub fn set(&self, snapshot: Option<LiveSnapshot>) {
        *self.snapshot.lock().unwrap() = snapshot;
    }
}

impl StatusProvider for StaticStatus {
    async fn snapshot(&self) -> Option<LiveSnapshot> {
        self.snapshot.lock().unwrap().clone()
    }
}

/// A TestEnvironment holds a cluster built from the fixture description, together with a
/// recording executor and an apply controller driving it.
pub struct TestEnvironment {
    pub cluster: Arc<Cluster>,
    pub executor: Arc<RecordingExecutor>,
    pub controller: Arc<ApplyController<RecordingExecutor>>,
}

impl TestEnvironment {
    /// Set up an environment whose description is the fixture plus `extra`.
    pub fn new(extra: &str) -> Self {
        let cluster = Arc::new(cluster_with(extra));
        let executor = Arc::new(RecordingExecutor::default());
        let controller = Arc::new(ApplyController::new(
            Arc::clone(&cluster),
            Arc::clone(&executor),
        ));
        TestEnvironment {
            cluster,
            executor,
            controller,
        }
    }

    /// Look up a resource by name. Panics if there is none.
    pub fn resource(&self, name: &str) -> Arc<Resource> {
        self.cluster
            .find_by_name(name)
            .unwrap_or_else(|| panic!("no resource named {name}"))
    }

    pub fn id(&self, name: &str) -> ResourceId {
        self.resource(name).id
    }
}
