// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Args;

use crate::{
    cluster::Cluster,
    commands::{handled_error, Cli, Handle, HandledResult},
    crm::{self, CrmArtifact, CrmCommand},
    drbd,
};

#[derive(Args, Debug, Clone)]
pub struct RenderArgs {
    /// Only render this resource: a CRM resource id or a DRBD resource name.
    resource: Option<String>,

    /// Leave out the constraints between CRM resources.
    #[arg(long)]
    no_constraints: bool,
}

pub fn render(cli: &Cli, args: &RenderArgs) -> HandledResult<()> {
    let cluster = Cluster::from_config(cli.config.clone())?;
    let wanted = |name: &str| args.resource.as_deref().map_or(true, |r| r == name);
    let mut found = false;

    let mut commands = Vec::new();
    for resource in cluster.resources() {
        if resource.is_placeholder() || !wanted(&resource.name()) {
            continue;
        }
        found = true;
        let bundle = crm::render_crm_resource(&resource, &cluster)
            .handle_err(|e| eprintln!("Could not render {}: {e}", resource.name()))?;
        commands.push(CrmCommand::SetResource(bundle));
        commands.extend(crm::render_locations(&resource, true));
    }
    if args.resource.is_none() && !args.no_constraints {
        commands.extend(
            crm::render_constraints(&cluster.graph(), &cluster)
                .handle_err(|e| eprintln!("Could not render constraints: {e}"))?,
        );
    }
    if !commands.is_empty() {
        print!("{}", CrmArtifact::new(commands, false));
    }

    for resource in cluster.drbd_resources() {
        if !wanted(&resource.name) {
            continue;
        }
        found = true;
        cluster
            .allocate_drbd(&resource)
            .handle_err(|e| eprintln!("Could not allocate ports for {}: {e}", resource.name))?;
        let text = drbd::render_drbd_resource(&resource)
            .handle_err(|e| eprintln!("Could not render {}: {e}", resource.name))?;
        println!("{text}");
    }

    if let Some(name) = &args.resource {
        if !found {
            eprintln!("No resource named \"{name}\".");
            return handled_error();
        }
    }
    Ok(())
}
