// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod apply;
pub mod cluster;
pub mod commands;
pub mod config;
pub mod crm;
pub mod drbd;
pub mod graph;
pub mod live;
pub mod ports;
pub mod reference;
pub mod resource;
pub mod schema;
pub mod store;
pub mod test_env;

use std::time::Duration;

/// First replication port handed out when no port is in use on the relevant hosts yet.
pub const DEFAULT_BASE_PORT: u16 = 7788;

/// How long a hover-triggered dry run waits before doing any work.
pub const DRY_RUN_DEBOUNCE: Duration = Duration::from_millis(250);

pub fn default_config_path() -> String {
    match std::env::var("LCMC_CONFIG") {
        Ok(conf) => conf,
        Err(_) => "/etc/lcmc/cluster.toml".to_string(),
    }
}

/// Gets the baseline replication port, used when no replication port is in use yet.
pub fn default_base_port() -> u16 {
    match std::env::var("LCMC_BASE_PORT") {
        Ok(port) => port.parse::<u16>().unwrap_or_else(|_| {
            log::warn!("LCMC_BASE_PORT '{port}' is not a valid port, using {DEFAULT_BASE_PORT}");
            DEFAULT_BASE_PORT
        }),
        Err(_) => DEFAULT_BASE_PORT,
    }
}

/// Gets the baseline proxy outside port, used when no proxy port is in use yet.
pub fn default_base_proxy_port() -> u16 {
    match std::env::var("LCMC_BASE_PROXY_PORT") {
        Ok(port) => port.parse::<u16>().unwrap_or_else(|_| {
            log::warn!(
                "LCMC_BASE_PROXY_PORT '{port}' is not a valid port, using {DEFAULT_BASE_PORT}"
            );
            DEFAULT_BASE_PORT
        }),
        Err(_) => DEFAULT_BASE_PORT,
    }
}

/// The network in which replication addresses are preferably chosen, if any.
pub fn default_network() -> Option<String> {
    std::env::var("LCMC_NET").ok()
}

/// Cluster-wide knobs that are not part of any single resource's configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub base_port: u16,
    pub base_proxy_port: u16,
    pub dry_run_debounce: Duration,
    pub replication_network: Option<cidr::IpCidr>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            base_port: DEFAULT_BASE_PORT,
            base_proxy_port: DEFAULT_BASE_PORT,
            dry_run_debounce: DRY_RUN_DEBOUNCE,
            replication_network: None,
        }
    }
}

impl Settings {
    /// Build settings from the `LCMC_*` environment variables, falling back to the defaults.
    pub fn from_env() -> Self {
        let replication_network = default_network().and_then(|net| {
            net.parse::<cidr::IpCidr>()
                .inspect_err(|e| log::warn!("ignoring LCMC_NET '{net}': {e}"))
                .ok()
        });
        Settings {
            base_port: default_base_port(),
            base_proxy_port: default_base_proxy_port(),
            dry_run_debounce: DRY_RUN_DEBOUNCE,
            replication_network,
        }
    }
}
