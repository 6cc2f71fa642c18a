// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use crate::{
    cluster::Cluster,
    commands::{handled_error, Cli, HandledResult},
};

pub fn validate(args: &Cli) -> HandledResult<()> {
    let cluster = Cluster::from_config(args.config.clone())?;

    if args.verbose {
        print_summary(&cluster);
    }

    let problems = cluster.problems();
    if problems.is_empty() {
        return Ok(());
    }
    for problem in &problems {
        eprintln!("{problem}");
    }
    handled_error()
}

fn print_summary(cluster: &Cluster) {
    for resource in cluster.resources() {
        let state = if cluster.is_correct(resource.id) {
            "ok"
        } else {
            "INCORRECT"
        };
        println!(
            "{} ({}) {:?} [{state}]",
            resource.name(),
            resource.agent,
            resource.state()
        );
    }
    for resource in cluster.drbd_resources() {
        let state = if cluster.is_drbd_correct(&resource) {
            "ok"
        } else {
            "INCORRECT"
        };
        println!(
            "drbd {} on {} [{state}]",
            resource.name,
            resource.hosts().join(", ")
        );
    }
}
