// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::sync::Arc;

use clap::Args;

use crate::{
    apply::{ApplyController, ApplyError, Artifact, CommandExecutor, ExecError, ExecReport},
    cluster::Cluster,
    commands::{handled_error, Cli, Handle, HandledResult},
};

#[derive(Args, Debug, Clone)]
pub struct DryRunArgs {
    /// A CRM resource id or a DRBD resource name. Without one, every resource with something
    /// to apply is dry-run.
    resource: Option<String>,
}

/// Runs nothing: the report of a test run is the artifact itself, and real runs are refused.
#[derive(Debug, Default)]
pub struct ReportingExecutor {}

impl CommandExecutor for ReportingExecutor {
    async fn execute(&self, artifact: &Artifact) -> Result<ExecReport, ExecError> {
        if !artifact.test_only() {
            return Err(ExecError::Failed(
                "only dry runs are possible from the command line".to_string(),
            ));
        }
        Ok(ExecReport {
            report: artifact.to_string(),
        })
    }
}

pub async fn dry_run(cli: &Cli, args: &DryRunArgs) -> HandledResult<()> {
    let cluster = Arc::new(Cluster::from_config(cli.config.clone())?);
    let controller = ApplyController::new(Arc::clone(&cluster), Arc::new(ReportingExecutor {}));

    let Some(name) = &args.resource else {
        let mut failed = false;
        for resource in cluster.resources() {
            if resource.is_placeholder() || !resource.is_changed() {
                continue;
            }
            let report = controller.dry_run(resource.id).await;
            failed |= print_report(&resource.name(), report).is_err();
        }
        for resource in cluster.drbd_resources() {
            if !resource.is_changed() {
                continue;
            }
            let report = controller.dry_run_drbd(&resource.name).await;
            failed |= print_report(&resource.name, report).is_err();
        }
        return if failed { handled_error() } else { Ok(()) };
    };

    let report = if let Some(resource) = cluster.find_by_name(name) {
        controller.dry_run(resource.id).await
    } else if cluster.drbd(name).is_some() {
        controller.dry_run_drbd(name).await
    } else {
        eprintln!("No resource named \"{name}\".");
        return handled_error();
    };
    print_report(name, report)
}

fn print_report(name: &str, report: Result<ExecReport, ApplyError>) -> HandledResult<()> {
    let report = report.handle_err(|e| eprintln!("Dry run of {name} failed: {e}"))?;
    if report.report.is_empty() {
        println!("{name} has nothing to apply.");
    } else {
        println!("# {name}");
        print!("{}", report.report);
    }
    Ok(())
}
