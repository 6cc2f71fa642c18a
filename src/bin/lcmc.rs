// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;

use lcmc_lib::{
    self,
    commands::{self, Cli},
};

/// The lcmc binary checks, renders and dry-runs a cluster description.
fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("LCMC_LOG", "warn")).init();

    let args = Cli::parse();

    if commands::main(&args).is_err() {
        std::process::exit(1);
    }
}
