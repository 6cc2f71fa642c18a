// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Args;

use crate::{
    cluster::Cluster,
    commands::{handled_error, Cli, Handle, HandledResult},
    ports::PortError,
};

#[derive(Args, Debug, Clone)]
pub struct PortsArgs {
    /// Hosts the new resource would replicate between.
    #[arg(required = true)]
    hosts: Vec<String>,

    /// How many ports to suggest.
    #[arg(short, long, default_value_t = 5)]
    count: usize,
}

pub fn ports(cli: &Cli, args: &PortsArgs) -> HandledResult<()> {
    let cluster = Cluster::from_config(cli.config.clone())?;

    for host in &args.hosts {
        if !cluster.hosts().contains_key(host) {
            eprintln!("Unknown host \"{host}\".");
            return handled_error();
        }
    }

    // Resources that were never applied take part in the count too.
    for resource in cluster.drbd_resources() {
        cluster
            .allocate_drbd(&resource)
            .handle_err(|e| eprintln!("Could not allocate ports for {}: {e}", resource.name))?;
    }

    let hosts: Vec<&str> = args.hosts.iter().map(String::as_str).collect();
    let (next, next_proxy, suggestions) = cluster
        .with_ports(|ports| {
            let next = ports.lowest_unused_port(&hosts)?;
            let next_proxy = ports.lowest_unused_proxy_port(&hosts)?;
            Ok::<_, PortError>((next, next_proxy, ports.suggest_ports(next, args.count, &hosts)))
        })
        .handle_err(|e| eprintln!("No free port: {e}"))?;

    println!("next replication port: {next}");
    println!("next proxy port: {next_proxy}");
    for port in suggestions {
        println!("{port}");
    }
    Ok(())
}
