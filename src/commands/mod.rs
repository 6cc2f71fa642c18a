// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod dry_run;
pub mod ports;
pub mod render;
pub mod validate;

use {dry_run::DryRunArgs, ports::PortsArgs, render::RenderArgs};

use clap::{Parser, Subcommand};

/// A `HandledError` represents an error that has already been handled. When you call a function
/// that returns a `HandledError` or `HandledResult`, you don't need to do anything with that error,
/// other than just be aware that it happened, and return it on to your caller.
///
/// `main()` has a special responsibility: since its "caller" is, in a certain sense, the operating
/// system, `main()` must return a nonzero exit status when it gets a `HandledError`.
///
/// The primary way to construct a `HandledError` is with the `handle_err()` function, which turns a
/// generic error into a `HandledError`, and also runs some caller-provided code to handle the
/// error. That provided code would normally do something like report the error to stderr.
///
/// A `HandledError` intentionally has no data about what the specific error was; the process of
/// handling the error "consumes" that information, and it is no longer needed as the error was
/// already appropriately handled.
#[derive(Debug, PartialEq)]
pub struct HandledError {}

pub type HandledResult<T> = std::result::Result<T, HandledError>;

pub fn handled_error() -> HandledResult<()> {
    HandledResult::Err(HandledError {})
}

pub trait Handle<T, F> {
    fn handle_err(self, handler: F) -> HandledResult<T>;
}

impl<T, E, F: FnOnce(E)> Handle<T, F> for std::result::Result<T, E> {
    /// Handle an error by running the provided `handler` code, giving it the error.
    ///
    /// Then, return a `HandledResult`, so that transitive callers of this function know that they
    /// do not need to do anything further to handle the error.
    fn handle_err(self, handler: F) -> HandledResult<T> {
        self.map_err(|e| {
            handler(e);
            HandledError {}
        })
    }
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check the cluster description and report everything that could not be applied.
    Validate,
    /// Print the CRM commands and DRBD resource files the description corresponds to.
    Render(RenderArgs),
    /// Show what applying a resource would do, without changing anything.
    DryRun(DryRunArgs),
    /// Suggest free replication ports for a set of hosts.
    Ports(PortsArgs),
}

pub fn main(cli: &Cli) -> HandledResult<()> {
    match &cli.command {
        Commands::Validate => return validate::validate(cli),
        Commands::Render(args) => return render::render(cli, args),
        Commands::Ports(args) => return ports::ports(cli, args),
        _ => {}
    }

    let rt = tokio::runtime::Runtime::new()
        .handle_err(|e| eprintln!("Error launching tokio runtime: {e}"))?;

    rt.block_on(async {
        match &cli.command {
            Commands::DryRun(args) => dry_run::dry_run(cli, args).await,
            _ => unreachable!(),
        }
    })
}
