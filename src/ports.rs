// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Bookkeeping of the TCP ports used by DRBD replication links and DRBD proxy outside links.
//!
//! The registry is advisory: registering a port that someone else already holds is allowed and
//! only logged. Collisions surface through `is_reserved_by_other`, which marks the offending
//! parameter incorrect and so blocks the apply of the resource that holds it.

use std::collections::{BTreeMap, BTreeSet};

use log::warn;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PortError {
    #[error("'{0}' is not a port number")]
    NotNumeric(String),
    #[error("port {0} is out of range")]
    OutOfRange(i64),
    #[error("no free port above {0}")]
    Exhausted(u16),
}

/// Parse a port value as entered by the user. Anything that is not an integer in
/// `[0, 65535]` is rejected.
pub fn parse_port(value: &str) -> Result<u16, PortError> {
    let value = value.trim();
    let port = value
        .parse::<i64>()
        .map_err(|_| PortError::NotNumeric(value.to_string()))?;
    u16::try_from(port).map_err(|_| PortError::OutOfRange(port))
}

pub fn is_valid_port(value: &str) -> bool {
    parse_port(value).is_ok()
}

/// Which namespace a port belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSpace {
    Replication,
    Proxy,
}

/// Ports in use, per host, with the names of the resources holding them.
type PortTable = BTreeMap<String, BTreeMap<u16, BTreeSet<String>>>;

#[derive(Debug, Clone)]
pub struct PortRegistry {
    base_port: u16,
    base_proxy_port: u16,
    used: PortTable,
    used_proxy: PortTable,
}

impl PortRegistry {
    pub fn new(base_port: u16, base_proxy_port: u16) -> Self {
        PortRegistry {
            base_port,
            base_proxy_port,
            used: BTreeMap::new(),
            used_proxy: BTreeMap::new(),
        }
    }

    fn table(&self, space: PortSpace) -> &PortTable {
        match space {
            PortSpace::Replication => &self.used,
            PortSpace::Proxy => &self.used_proxy,
        }
    }

    fn table_mut(&mut self, space: PortSpace) -> &mut PortTable {
        match space {
            PortSpace::Replication => &mut self.used,
            PortSpace::Proxy => &mut self.used_proxy,
        }
    }

    fn base(&self, space: PortSpace) -> u16 {
        match space {
            PortSpace::Replication => self.base_port,
            PortSpace::Proxy => self.base_proxy_port,
        }
    }

    /// Record that `owner` uses `port` on `host`.
    pub fn register(&mut self, space: PortSpace, host: &str, port: u16, owner: &str) {
        let owners = self
            .table_mut(space)
            .entry(host.to_string())
            .or_default()
            .entry(port)
            .or_default();
        if owners.iter().any(|o| o != owner) {
            warn!("port {port} on {host} is already used by {owners:?}, also registering {owner}");
        }
        owners.insert(owner.to_string());
    }

    pub fn deregister(&mut self, space: PortSpace, host: &str, port: u16, owner: &str) {
        let table = self.table_mut(space);
        let Some(ports) = table.get_mut(host) else {
            return;
        };
        if let Some(owners) = ports.get_mut(&port) {
            owners.remove(owner);
            if owners.is_empty() {
                ports.remove(&port);
            }
        }
        if ports.is_empty() {
            table.remove(host);
        }
    }

    /// Forget every port held by `owner`, in both namespaces.
    pub fn deregister_owner(&mut self, owner: &str) {
        for space in [PortSpace::Replication, PortSpace::Proxy] {
            let table = self.table_mut(space);
            for ports in table.values_mut() {
                for owners in ports.values_mut() {
                    owners.remove(owner);
                }
                ports.retain(|_, owners| !owners.is_empty());
            }
            table.retain(|_, ports| !ports.is_empty());
        }
    }

    /// Whether a resource other than `owner` holds `port` on `host`.
    pub fn is_reserved_by_other(&self, space: PortSpace, host: &str, port: u16, owner: &str) -> bool {
        self.table(space)
            .get(host)
            .and_then(|ports| ports.get(&port))
            .is_some_and(|owners| owners.iter().any(|o| o != owner))
    }

    pub fn used_ports<'a>(
        &'a self,
        space: PortSpace,
        hosts: &'a [&'a str],
    ) -> impl Iterator<Item = u16> + 'a {
        let table = self.table(space);
        hosts
            .iter()
            .filter_map(move |host| table.get(*host))
            .flat_map(|ports| ports.keys().copied())
    }

    fn lowest_unused(&self, space: PortSpace, hosts: &[&str]) -> Result<u16, PortError> {
        match self.used_ports(space, hosts).max() {
            Some(max) => max.checked_add(1).ok_or(PortError::Exhausted(max)),
            None => Ok(self.base(space)),
        }
    }

    /// One above the highest replication port in use on any of `hosts`, or the base port.
    pub fn lowest_unused_port(&self, hosts: &[&str]) -> Result<u16, PortError> {
        self.lowest_unused(PortSpace::Replication, hosts)
    }

    /// Same as `lowest_unused_port`, for proxy outside ports on the given proxy hosts.
    pub fn lowest_unused_proxy_port(&self, proxy_hosts: &[&str]) -> Result<u16, PortError> {
        self.lowest_unused(PortSpace::Proxy, proxy_hosts)
    }

    /// Up to `count` ports starting at `base`, skipping ports used on any of `hosts`. `base`
    /// itself is always offered so that a resource can keep the port it already has.
    pub fn suggest_ports(&self, base: u16, count: usize, hosts: &[&str]) -> Vec<String> {
        let used: BTreeSet<u16> = self.used_ports(PortSpace::Replication, hosts).collect();
        let mut ports = vec![base.to_string()];
        let mut next = base;
        while ports.len() < count {
            let Some(port) = next.checked_add(1) else {
                break;
            };
            next = port;
            if !used.contains(&port) {
                ports.push(port.to_string());
            }
        }
        ports.truncate(count);
        ports
    }
}

/// The inside proxy port defaults to the replication port plus one.
pub fn derive_default_inside_port(
    saved_inside_port: Option<&str>,
    saved_replication_port: Option<&str>,
) -> Option<String> {
    if let Some(port) = saved_inside_port.filter(|p| !p.is_empty()) {
        return Some(port.to_string());
    }
    let replication = parse_port(saved_replication_port?).ok()?;
    replication.checked_add(1).map(|p| p.to_string())
}

/// The outside proxy port defaults to the lowest unused proxy port, but never goes below the
/// inside port minus one.
pub fn derive_default_outside_port(
    saved_outside_port: Option<&str>,
    lowest_unused_proxy_port: u16,
    inside_port: Option<&str>,
) -> Option<String> {
    if let Some(port) = saved_outside_port.filter(|p| !p.is_empty()) {
        return Some(port.to_string());
    }
    let floor = inside_port
        .and_then(|p| parse_port(p).ok())
        .map(|p| p.saturating_sub(1))
        .unwrap_or(0);
    Some(lowest_unused_proxy_port.max(floor).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse() {
        assert_eq!(parse_port("7788"), Ok(7788));
        assert_eq!(parse_port("0"), Ok(0));
        assert_eq!(parse_port("65535"), Ok(65535));
        assert_eq!(parse_port("65536"), Err(PortError::OutOfRange(65536)));
        assert_eq!(parse_port("-1"), Err(PortError::OutOfRange(-1)));
        assert!(matches!(parse_port("77a"), Err(PortError::NotNumeric(_))));
        assert!(matches!(parse_port(""), Err(PortError::NotNumeric(_))));
    }

    #[test]
    fn lowest_unused() {
        let mut ports = PortRegistry::new(7788, 7788);
        assert_eq!(ports.lowest_unused_port(&["alpha"]), Ok(7788));

        ports.register(PortSpace::Replication, "alpha", 7788, "r0");
        ports.register(PortSpace::Replication, "alpha", 7789, "r1");
        assert_eq!(ports.lowest_unused_port(&["alpha", "beta"]), Ok(7790));
        assert_eq!(ports.lowest_unused_port(&["beta"]), Ok(7788));

        // Separate namespace.
        assert_eq!(ports.lowest_unused_proxy_port(&["alpha"]), Ok(7788));

        ports.register(PortSpace::Replication, "beta", 65535, "r2");
        assert_eq!(
            ports.lowest_unused_port(&["beta"]),
            Err(PortError::Exhausted(65535))
        );
    }

    #[test]
    fn suggestions() {
        let mut ports = PortRegistry::new(7788, 7788);
        assert_eq!(ports.suggest_ports(7790, 3, &["alpha"]), vec!["7790", "7791", "7792"]);

        ports.register(PortSpace::Replication, "beta", 7791, "r1");
        ports.register(PortSpace::Replication, "alpha", 7790, "r0");
        assert_eq!(
            ports.suggest_ports(7790, 3, &["alpha", "beta"]),
            vec!["7790", "7792", "7793"]
        );
    }

    #[test]
    fn reservations() {
        let mut ports = PortRegistry::new(7788, 7788);
        ports.register(PortSpace::Replication, "alpha", 7788, "r0");
        assert!(!ports.is_reserved_by_other(PortSpace::Replication, "alpha", 7788, "r0"));
        assert!(ports.is_reserved_by_other(PortSpace::Replication, "alpha", 7788, "r1"));

        ports.deregister_owner("r0");
        assert!(!ports.is_reserved_by_other(PortSpace::Replication, "alpha", 7788, "r1"));
        assert_eq!(ports.lowest_unused_port(&["alpha"]), Ok(7788));
    }

    #[test]
    fn proxy_defaults() {
        assert_eq!(
            derive_default_inside_port(None, Some("7788")).as_deref(),
            Some("7789")
        );
        assert_eq!(
            derive_default_inside_port(Some("7800"), Some("7788")).as_deref(),
            Some("7800")
        );
        assert_eq!(derive_default_inside_port(None, None), None);

        assert_eq!(
            derive_default_outside_port(None, 7788, Some("7900")).as_deref(),
            Some("7899")
        );
        assert_eq!(
            derive_default_outside_port(None, 7950, Some("7900")).as_deref(),
            Some("7950")
        );
        assert_eq!(
            derive_default_outside_port(Some("7000"), 7950, Some("7900")).as_deref(),
            Some("7000")
        );
    }
}
