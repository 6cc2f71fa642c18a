// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! DRBD resources and volumes, the allocation of their network endpoints, and the rendering of
//! their resource-file text.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Write,
    net::IpAddr,
    sync::{Arc, Mutex},
};

use log::{debug, warn};

use crate::{
    ports::{self, PortError, PortRegistry, PortSpace},
    resource::{ApplyEvent, ApplyState},
    schema::{ResourceAgent, SchemaProvider},
    store::AttributeStore,
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{resource}: volume {volume} has no device set")]
    MissingDevice { resource: String, volume: u32 },
    #[error("{resource}: volume {volume} has no disk set on {host}")]
    MissingDisk {
        resource: String,
        volume: u32,
        host: String,
    },
    #[error("{resource}: no address selected on {host}")]
    MissingAddress { resource: String, host: String },
    #[error("{resource}: no port selected on {host}")]
    MissingPort { resource: String, host: String },
    #[error("{resource}: {field} of proxy {proxy} is not set")]
    MissingProxy {
        resource: String,
        proxy: String,
        field: &'static str,
    },
    #[error("{resource}: {source}")]
    Port {
        resource: String,
        #[source]
        source: PortError,
    },
    #[error("{resource}: no host has any volume")]
    NoHosts { resource: String },
}

pub fn disk_key(host: &str) -> String {
    format!("{host}:disk")
}

pub fn meta_disk_key(host: &str) -> String {
    format!("{host}:meta-disk")
}

pub fn address_key(host: &str) -> String {
    format!("{host}:address")
}

pub fn port_key(host: &str) -> String {
    format!("{host}:port")
}

/// Names the proxy host the data host's replication link goes through. Empty for a direct link.
pub fn proxy_key(host: &str) -> String {
    format!("{host}:proxy")
}

/// Proxy endpoints are keyed by the proxy host, since several data hosts may share one proxy.
pub fn proxy_endpoint_key(proxy: &str, field: &str) -> String {
    format!("proxy:{proxy}:{field}")
}

pub const DEVICE: &str = "device";
pub const DEFAULT_META_DISK: &str = "internal";

/// One replicated block device of a DRBD resource.
#[derive(Debug)]
pub struct DrbdVolume {
    pub number: u32,

    /// `device`, then `<host>:disk` and `<host>:meta-disk` for every host the volume is on.
    pub store: AttributeStore,

    hosts: Mutex<Vec<String>>,
}

impl DrbdVolume {
    pub fn new(number: u32, device: Option<&str>) -> Self {
        let store = AttributeStore::with_params(&[]);
        store.declare(DEVICE, None);
        store.set_pending(DEVICE, device.map(str::to_string));
        DrbdVolume {
            number,
            store,
            hosts: Mutex::new(Vec::new()),
        }
    }

    /// Put the volume on `host`, backed by `disk`.
    pub fn add_host(&self, host: &str, disk: Option<&str>, meta_disk: Option<&str>) {
        self.store.declare(&disk_key(host), None);
        self.store
            .declare(&meta_disk_key(host), Some(DEFAULT_META_DISK.to_string()));
        self.store.set_pending(&disk_key(host), disk.map(str::to_string));
        if let Some(meta_disk) = meta_disk {
            self.store
                .set_pending(&meta_disk_key(host), Some(meta_disk.to_string()));
        }
        let mut hosts = self.hosts.lock().unwrap();
        if !hosts.iter().any(|h| h == host) {
            hosts.push(host.to_string());
        }
    }

    pub fn remove_host(&self, host: &str) {
        self.store.undeclare(&disk_key(host));
        self.store.undeclare(&meta_disk_key(host));
        self.hosts.lock().unwrap().retain(|h| h != host);
    }

    pub fn hosts(&self) -> Vec<String> {
        self.hosts.lock().unwrap().clone()
    }

    pub fn is_on(&self, host: &str) -> bool {
        self.hosts.lock().unwrap().iter().any(|h| h == host)
    }
}

/// A DRBD resource: a set of volumes replicated between hosts over one network link per host.
#[derive(Debug)]
pub struct DrbdResource {
    pub name: String,

    /// Resource options from the DRBD schema, such as `protocol` or `resync-after`.
    pub options: AttributeStore,

    /// Per-host `address`, `port` and `proxy`, and per-proxy inside/outside endpoints.
    pub endpoints: AttributeStore,

    hosts: Mutex<Vec<String>>,
    volumes: Mutex<Vec<Arc<DrbdVolume>>>,
    state: Mutex<ApplyState>,
    applied: Mutex<bool>,
}

impl DrbdResource {
    pub fn new(name: &str, schema: Arc<dyn SchemaProvider>) -> Self {
        DrbdResource {
            name: name.to_string(),
            options: AttributeStore::for_agent(schema, &ResourceAgent::drbd_resource()),
            endpoints: AttributeStore::with_params(&[]),
            hosts: Mutex::new(Vec::new()),
            volumes: Mutex::new(Vec::new()),
            state: Mutex::new(ApplyState::New),
            applied: Mutex::new(false),
        }
    }

    pub fn add_host(&self, host: &str) {
        let mut hosts = self.hosts.lock().unwrap();
        if hosts.iter().any(|h| h == host) {
            return;
        }
        hosts.push(host.to_string());
        for key in [address_key(host), port_key(host), proxy_key(host)] {
            self.endpoints.declare(&key, None);
        }
    }

    pub fn hosts(&self) -> Vec<String> {
        self.hosts.lock().unwrap().clone()
    }

    pub fn add_volume(&self, volume: DrbdVolume) -> Arc<DrbdVolume> {
        let volume = Arc::new(volume);
        let mut volumes = self.volumes.lock().unwrap();
        volumes.retain(|v| v.number != volume.number);
        volumes.push(Arc::clone(&volume));
        volumes.sort_by_key(|v| v.number);
        volume
    }

    pub fn volumes(&self) -> Vec<Arc<DrbdVolume>> {
        self.volumes.lock().unwrap().clone()
    }

    /// Hosts that have at least one volume, in the order they were added.
    pub fn hosts_with_volumes(&self) -> Vec<String> {
        let volumes = self.volumes();
        self.hosts()
            .into_iter()
            .filter(|h| volumes.iter().any(|v| v.is_on(h)))
            .collect()
    }

    pub fn set_address(&self, host: &str, address: Option<&str>, port: Option<&str>) {
        self.endpoints
            .set_pending(&address_key(host), address.map(str::to_string));
        self.endpoints
            .set_pending(&port_key(host), port.map(str::to_string));
    }

    /// Route `host`'s replication link through `proxy`, or make it direct again with `None`.
    pub fn set_proxy(&self, host: &str, proxy: Option<&str>) {
        if let Some(proxy) = proxy {
            for field in ["inside-ip", "inside-port", "outside-ip", "outside-port"] {
                let key = proxy_endpoint_key(proxy, field);
                if !self.endpoints.contains(&key) {
                    self.endpoints.declare(&key, None);
                }
            }
        }
        self.endpoints
            .set_pending(&proxy_key(host), proxy.map(str::to_string));
    }

    pub fn set_proxy_endpoints(
        &self,
        proxy: &str,
        inside: (Option<&str>, Option<&str>),
        outside: (Option<&str>, Option<&str>),
    ) {
        let values = [
            ("inside-ip", inside.0),
            ("inside-port", inside.1),
            ("outside-ip", outside.0),
            ("outside-port", outside.1),
        ];
        for (field, value) in values {
            let key = proxy_endpoint_key(proxy, field);
            if !self.endpoints.contains(&key) {
                self.endpoints.declare(&key, None);
            }
            if value.is_some() {
                self.endpoints.set_pending(&key, value.map(str::to_string));
            }
        }
    }

    pub fn proxy_of(&self, host: &str) -> Option<String> {
        self.endpoints
            .get(&proxy_key(host))
            .filter(|p| !p.is_empty())
    }

    /// Every proxy host used by any data host of this resource, each once.
    pub fn configured_proxy_hosts(&self) -> BTreeSet<String> {
        self.hosts()
            .iter()
            .filter_map(|h| self.proxy_of(h))
            .collect()
    }

    pub fn resync_after(&self) -> Option<String> {
        self.options
            .get("resync-after")
            .filter(|v| !v.is_empty())
    }

    pub fn is_changed(&self) -> bool {
        !*self.applied.lock().unwrap()
            || self.options.is_changed(None)
            || self.endpoints.is_changed(None)
            || self.volumes().iter().any(|v| v.store.is_changed(None))
    }

    /// Every field that is needed to render is set and every value passes its check.
    pub fn is_correct(&self) -> bool {
        if !self.options.is_correct(None) || self.hosts_with_volumes().is_empty() {
            return false;
        }
        let filled = |store: &AttributeStore, key: &str| {
            store.get(key).is_some_and(|v| !v.trim().is_empty())
        };
        for volume in self.volumes() {
            if !filled(&volume.store, DEVICE) {
                return false;
            }
            if volume.hosts().iter().any(|h| !filled(&volume.store, &disk_key(h))) {
                return false;
            }
        }
        for host in self.hosts_with_volumes() {
            if !filled(&self.endpoints, &address_key(&host)) {
                return false;
            }
            match self.endpoints.get(&port_key(&host)) {
                Some(port) if ports::is_valid_port(&port) => {}
                _ => return false,
            }
        }
        for proxy in self.configured_proxy_hosts() {
            for field in ["inside-port", "outside-port"] {
                if let Some(port) = self.endpoints.get(&proxy_endpoint_key(&proxy, field)) {
                    if !ports::is_valid_port(&port) {
                        return false;
                    }
                }
            }
        }
        true
    }

    pub fn state(&self) -> ApplyState {
        *self.state.lock().unwrap()
    }

    pub fn is_applied(&self) -> bool {
        *self.applied.lock().unwrap()
    }

    pub fn transition(&self, event: ApplyEvent) -> Option<ApplyState> {
        let applied_before = self.is_applied();
        let mut state = self.state.lock().unwrap();
        let next = state.next(event, applied_before);
        if let Some(next) = next {
            if *state != next {
                debug!("{}: {:?} -> {:?}", self.name, *state, next);
            }
            *state = next;
        }
        next
    }

    pub fn commit(&self) {
        // Allocated defaults become the resource's own values once they are on the cluster.
        for name in self.endpoints.names() {
            if let Some(state) = self.endpoints.state(&name) {
                if state.pending.is_none() && state.default.is_some() {
                    self.endpoints.set_pending(&name, state.default);
                }
            }
        }
        self.options.commit_all();
        self.endpoints.commit_all();
        for volume in self.volumes() {
            volume.store.commit_all();
        }
        *self.applied.lock().unwrap() = true;
    }

    pub fn revert(&self) {
        self.options.revert_all();
        self.endpoints.revert_all();
        for volume in self.volumes() {
            volume.store.revert_all();
        }
    }

    /// The resource was seen on the hosts; its values came from there.
    pub(crate) fn note_applied(&self) {
        let mut applied = self.applied.lock().unwrap();
        if !*applied {
            *applied = true;
            *self.state.lock().unwrap() = ApplyState::Applied;
        }
    }

    /// Mark the resource as already configured on the cluster, with its current values.
    pub fn mark_applied(&self) {
        self.commit();
        *self.state.lock().unwrap() = ApplyState::Applied;
    }
}

/// Pick the default replication address of a host: the first address inside `network`, or the
/// first address at all.
pub fn suggest_address(addresses: &[String], network: Option<&cidr::IpCidr>) -> Option<String> {
    if let Some(network) = network {
        let inside = addresses.iter().find(|a| {
            a.parse::<IpAddr>()
                .map(|ip| network.contains(&ip))
                .unwrap_or(false)
        });
        if inside.is_some() {
            return inside.cloned();
        }
    }
    addresses.first().cloned()
}

/// Fill in default ports and addresses for a DRBD resource and register every port it uses.
///
/// Defaults only go into the default slot of a parameter; a value set by the user or read from
/// the cluster always wins.
pub fn allocate_endpoints(
    resource: &DrbdResource,
    registry: &mut PortRegistry,
    host_addresses: &BTreeMap<String, Vec<String>>,
    network: Option<&cidr::IpCidr>,
) -> Result<(), PortError> {
    let hosts = resource.hosts();
    let host_refs: Vec<&str> = hosts.iter().map(String::as_str).collect();
    let owner = resource.name.as_str();

    // Our own ports must not push the default up.
    registry.deregister_owner(owner);

    let needs_port = hosts
        .iter()
        .any(|h| resource.endpoints.get(&port_key(h)).is_none());
    if needs_port {
        let port = registry.lowest_unused_port(&host_refs)?.to_string();
        for host in &hosts {
            resource.endpoints.set_default(&port_key(host), Some(port.clone()));
        }
    }

    for host in &hosts {
        if resource.endpoints.get(&address_key(host)).is_none() {
            let addresses = host_addresses.get(host).map(Vec::as_slice).unwrap_or(&[]);
            resource
                .endpoints
                .set_default(&address_key(host), suggest_address(addresses, network));
        }
        if let Some(port) = resource.endpoints.get(&port_key(host)) {
            match ports::parse_port(&port) {
                Ok(port) => registry.register(PortSpace::Replication, host, port, owner),
                Err(e) => warn!("{owner}: not registering port of {host}: {e}"),
            }
        }
    }

    for proxy in resource.configured_proxy_hosts() {
        // The first data host going through this proxy decides the inside default.
        let replication_port = hosts
            .iter()
            .find(|h| resource.proxy_of(h).as_deref() == Some(proxy.as_str()))
            .and_then(|h| resource.endpoints.get(&port_key(h)));

        let inside_key = proxy_endpoint_key(&proxy, "inside-port");
        let inside = ports::derive_default_inside_port(
            resource.endpoints.saved(&inside_key).as_deref(),
            replication_port.as_deref(),
        );
        if resource.endpoints.get(&inside_key).is_none() {
            resource.endpoints.set_default(&inside_key, inside);
        }

        let outside_key = proxy_endpoint_key(&proxy, "outside-port");
        let lowest = registry.lowest_unused_proxy_port(&[proxy.as_str()])?;
        let outside = ports::derive_default_outside_port(
            resource.endpoints.saved(&outside_key).as_deref(),
            lowest,
            resource.endpoints.get(&inside_key).as_deref(),
        );
        if resource.endpoints.get(&outside_key).is_none() {
            resource.endpoints.set_default(&outside_key, outside);
        }
        if let Some(port) = resource.endpoints.get(&outside_key) {
            if let Ok(port) = ports::parse_port(&port) {
                registry.register(PortSpace::Proxy, &proxy, port, owner);
            }
        }
    }
    Ok(())
}

/// `addr:port`, or `ipv6 [addr]:port` for IPv6 addresses.
pub fn format_endpoint(address: &str, port: u16) -> String {
    match address.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => format!("ipv6 [{v6}]:{port}"),
        _ => format!("{address}:{port}"),
    }
}

fn required(
    store: &AttributeStore,
    key: &str,
    err: impl FnOnce() -> ConfigError,
) -> Result<String, ConfigError> {
    store
        .get(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(err)
}

fn required_port(
    resource: &DrbdResource,
    key: &str,
    err: impl FnOnce() -> ConfigError,
) -> Result<u16, ConfigError> {
    let port = required(&resource.endpoints, key, err)?;
    ports::parse_port(&port).map_err(|source| ConfigError::Port {
        resource: resource.name.clone(),
        source,
    })
}

fn proxy_endpoint(
    resource: &DrbdResource,
    proxy: &str,
    side: &'static str,
) -> Result<String, ConfigError> {
    let (ip_field, port_field) = match side {
        "inside" => ("inside-ip", "inside-port"),
        _ => ("outside-ip", "outside-port"),
    };
    let missing = |field| {
        move || ConfigError::MissingProxy {
            resource: resource.name.clone(),
            proxy: proxy.to_string(),
            field,
        }
    };
    let ip = required(
        &resource.endpoints,
        &proxy_endpoint_key(proxy, ip_field),
        missing(ip_field),
    )?;
    let port = required_port(
        resource,
        &proxy_endpoint_key(proxy, port_field),
        missing(port_field),
    )?;
    Ok(format_endpoint(&ip, port))
}

/// Render the options of a resource that differ from their defaults, grouped in sections.
fn render_options(resource: &DrbdResource, out: &mut String) {
    let Some((schema, agent)) = resource.options.schema() else {
        return;
    };
    let mut sections: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
    for (name, value) in resource.options.values() {
        let Some(value) = value.filter(|v| !v.is_empty()) else {
            continue;
        };
        if resource.options.default_value(&name).as_deref() == Some(value.as_str()) {
            continue;
        }
        sections
            .entry(schema.section(&agent, &name))
            .or_default()
            .push((name, value));
    }
    for (section, options) in sections {
        if section == "resource" {
            for (name, value) in options {
                let _ = writeln!(out, "    {name} {value};");
            }
            continue;
        }
        let _ = writeln!(out, "    {section} {{");
        for (name, value) in options {
            let _ = writeln!(out, "        {name} {value};");
        }
        let _ = writeln!(out, "    }}");
    }
}

/// Render the resource-file text of a DRBD resource.
///
/// Every host that has at least one volume gets an `on` section with its volumes, its address,
/// and its proxy if the replication link goes through one. Nothing is returned unless every
/// required field is set.
pub fn render_drbd_resource(resource: &DrbdResource) -> Result<String, ConfigError> {
    let hosts = resource.hosts_with_volumes();
    if hosts.is_empty() {
        return Err(ConfigError::NoHosts {
            resource: resource.name.clone(),
        });
    }
    let volumes = resource.volumes();

    let mut out = String::new();
    let _ = writeln!(out, "resource {} {{", resource.name);
    render_options(resource, &mut out);

    for host in &hosts {
        let _ = writeln!(out, "    on {host} {{");
        for volume in volumes.iter().filter(|v| v.is_on(host)) {
            let device = required(&volume.store, DEVICE, || ConfigError::MissingDevice {
                resource: resource.name.clone(),
                volume: volume.number,
            })?;
            let disk = required(&volume.store, &disk_key(host), || ConfigError::MissingDisk {
                resource: resource.name.clone(),
                volume: volume.number,
                host: host.clone(),
            })?;
            let meta_disk = volume
                .store
                .get(&meta_disk_key(host))
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_META_DISK.to_string());

            let _ = writeln!(out, "        volume {} {{", volume.number);
            let _ = writeln!(out, "            device {device};");
            let _ = writeln!(out, "            disk {disk};");
            let _ = writeln!(out, "            meta-disk {meta_disk};");
            let _ = writeln!(out, "        }}");
        }

        let address = required(&resource.endpoints, &address_key(host), || {
            ConfigError::MissingAddress {
                resource: resource.name.clone(),
                host: host.clone(),
            }
        })?;
        let port = required_port(resource, &port_key(host), || ConfigError::MissingPort {
            resource: resource.name.clone(),
            host: host.clone(),
        })?;
        let _ = writeln!(out, "        address {};", format_endpoint(&address, port));

        if let Some(proxy) = resource.proxy_of(host) {
            let inside = proxy_endpoint(resource, &proxy, "inside")?;
            let outside = proxy_endpoint(resource, &proxy, "outside")?;
            let _ = writeln!(out, "        proxy on {proxy} {{");
            let _ = writeln!(out, "            inside {inside};");
            let _ = writeln!(out, "            outside {outside};");
            let _ = writeln!(out, "        }}");
        }
        let _ = writeln!(out, "    }}");
    }
    let _ = writeln!(out, "}}");
    Ok(out)
}
