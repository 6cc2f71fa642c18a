// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use tokio::runtime::Runtime;

    use lcmc_lib::{
        drbd::{self, ConfigError},
        resource::ApplyState,
        test_env::*,
    };

    const TWO_HOSTS: &str = r#"
        [[drbd]]
        name = "r0"
        hosts = ["alpha", "beta"]
        volumes = [{ number = 0, device = "/dev/drbd0", disks = { alpha = "/dev/sda1", beta = "/dev/sda1" } }]
        endpoints = { alpha = { address = "10.0.0.1", port = "7788" }, beta = { address = "10.0.0.2", port = "7788" } }
    "#;

    #[test]
    fn render_two_hosts() {
        let cluster = cluster_with(TWO_HOSTS);
        let r0 = cluster.drbd("r0").unwrap();

        let text = drbd::render_drbd_resource(&r0).unwrap();
        assert!(text.starts_with("resource r0 {\n"));
        assert_eq!(text.matches("    on ").count(), 2);
        assert_eq!(text.matches("device /dev/drbd0;").count(), 2);
        assert_eq!(text.matches("            disk /dev/sda1;").count(), 2);
        assert_eq!(text.matches("meta-disk internal;").count(), 2);
        assert_eq!(text.matches("address 10.0.0.1:7788;").count(), 1);
        assert_eq!(text.matches("address 10.0.0.2:7788;").count(), 1);
        assert!(!text.contains("proxy"));
        // Protocol C is the default and is left out.
        assert!(!text.contains("net {"));
    }

    #[test]
    fn render_fails_without_address() {
        let cluster = cluster_with(TWO_HOSTS);
        let r0 = cluster.drbd("r0").unwrap();

        r0.endpoints.set_pending(&drbd::address_key("beta"), None);
        assert_eq!(
            drbd::render_drbd_resource(&r0),
            Err(ConfigError::MissingAddress {
                resource: "r0".to_string(),
                host: "beta".to_string(),
            })
        );
        assert!(!cluster.is_drbd_correct(&r0));
    }

    #[test]
    fn render_fails_without_disk() {
        let cluster = cluster_with(TWO_HOSTS);
        let r0 = cluster.drbd("r0").unwrap();

        let volume = &r0.volumes()[0];
        volume.store.set_pending(&drbd::disk_key("alpha"), None);
        assert_eq!(
            drbd::render_drbd_resource(&r0),
            Err(ConfigError::MissingDisk {
                resource: "r0".to_string(),
                volume: 0,
                host: "alpha".to_string(),
            })
        );
    }

    #[test]
    fn options_in_sections() {
        let cluster = cluster_with(
            r#"
            [[drbd]]
            name = "r0"
            hosts = ["alpha", "beta"]
            options = { protocol = "A", al-extents = "257" }
            volumes = [{ number = 0, device = "/dev/drbd0", disks = { alpha = "/dev/sda1", beta = "/dev/sdb1" } }]
            "#,
        );
        let r0 = cluster.drbd("r0").unwrap();

        let text = drbd::render_drbd_resource(&r0).unwrap();
        assert!(text.contains("    net {\n        protocol A;\n    }\n"));
        assert!(text.contains("    disk {\n        al-extents 257;\n    }\n"));
    }

    #[test]
    fn default_endpoints() {
        let cluster = cluster_with(
            r#"
            [[drbd]]
            name = "old"
            hosts = ["alpha", "beta"]
            volumes = [{ number = 0, device = "/dev/drbd0", disks = { alpha = "/dev/sda1", beta = "/dev/sda1" } }]
            endpoints = { alpha = { address = "10.0.0.1", port = "7788" }, beta = { address = "10.0.0.2", port = "7788" } }
            applied = true

            [[drbd]]
            name = "new"
            hosts = ["alpha", "beta"]
            volumes = [{ number = 0, device = "/dev/drbd1", disks = { alpha = "/dev/sdb1", beta = "/dev/sdb1" } }]
            "#,
        );
        let new = cluster.drbd("new").unwrap();

        // The default port is one above the highest port in use on the hosts, and the default
        // address is the first address of each host.
        let text = drbd::render_drbd_resource(&new).unwrap();
        assert!(text.contains("address 10.0.0.1:7789;"));
        assert!(text.contains("address 10.0.0.2:7789;"));
        assert!(cluster.is_drbd_correct(&new));
        assert!(new.is_changed());

        // Allocating again does not move the resource's own port.
        cluster.allocate_drbd(&new).unwrap();
        assert_eq!(
            new.endpoints.get(&drbd::port_key("alpha")).as_deref(),
            Some("7789")
        );
    }

    #[test]
    fn apply_pins_defaults() {
        let env = TestEnvironment::new(
            r#"
            [[drbd]]
            name = "r0"
            hosts = ["alpha", "beta"]
            volumes = [{ number = 0, device = "/dev/drbd0", disks = { alpha = "/dev/sda1", beta = "/dev/sda1" } }]
            "#,
        );
        let r0 = env.cluster.drbd("r0").unwrap();

        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            env.controller.apply_drbd("r0").await.unwrap();
        });

        assert_eq!(r0.state(), ApplyState::Applied);
        assert!(!r0.is_changed());
        assert_eq!(
            r0.endpoints.saved(&drbd::port_key("alpha")).as_deref(),
            Some("7788")
        );
        assert_eq!(
            r0.endpoints.saved(&drbd::address_key("beta")).as_deref(),
            Some("10.0.0.2")
        );

        let runs = env.executor.artifacts();
        assert_eq!(runs.len(), 2);
        assert!(runs[0].test_only());
        assert!(!runs[1].test_only());
    }

    #[test]
    fn failed_apply_keeps_edits() {
        let env = TestEnvironment::new(TWO_HOSTS);
        let r0 = env.cluster.drbd("r0").unwrap();
        env.executor.fail_real_runs(true);

        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            assert!(env.controller.apply_drbd("r0").await.is_err());
        });

        assert_eq!(r0.state(), ApplyState::New);
        assert!(!r0.is_applied());
        assert_eq!(r0.endpoints.saved(&drbd::port_key("alpha")), None);
        assert_eq!(
            r0.endpoints.get(&drbd::port_key("alpha")).as_deref(),
            Some("7788")
        );
    }

    #[test]
    fn proxy_hosts_counted_once() {
        let cluster = cluster_with(
            r#"
            [[drbd]]
            name = "r0"
            hosts = ["alpha", "beta"]
            volumes = [{ number = 0, device = "/dev/drbd0", disks = { alpha = "/dev/sda1", beta = "/dev/sda1" } }]
            endpoints = { alpha = { address = "10.0.0.1", proxy = "gw" }, beta = { address = "10.0.0.2", proxy = "gw" } }
            proxies = [{ host = "gw", inside-ip = "127.0.0.1", outside-ip = "10.0.1.1" }]
            "#,
        );
        let r0 = cluster.drbd("r0").unwrap();

        assert_eq!(
            r0.configured_proxy_hosts(),
            BTreeSet::from(["gw".to_string()])
        );

        // Inside defaults to the replication port plus one; outside to the lowest free proxy
        // port, but not below the inside port minus one.
        let text = drbd::render_drbd_resource(&r0).unwrap();
        assert_eq!(text.matches("proxy on gw {").count(), 2);
        assert_eq!(text.matches("inside 127.0.0.1:7789;").count(), 2);
        assert_eq!(text.matches("outside 10.0.1.1:7788;").count(), 2);
    }

    #[test]
    fn proxy_without_ip_fails() {
        let cluster = cluster_with(
            r#"
            [[drbd]]
            name = "r0"
            hosts = ["alpha", "beta"]
            volumes = [{ number = 0, device = "/dev/drbd0", disks = { alpha = "/dev/sda1", beta = "/dev/sda1" } }]
            endpoints = { alpha = { proxy = "gw" } }
            "#,
        );
        let r0 = cluster.drbd("r0").unwrap();

        assert_eq!(
            drbd::render_drbd_resource(&r0),
            Err(ConfigError::MissingProxy {
                resource: "r0".to_string(),
                proxy: "gw".to_string(),
                field: "inside-ip",
            })
        );
    }

    #[test]
    fn resync_after_candidates() {
        let cluster = cluster_with(
            r#"
            [[drbd]]
            name = "a"
            hosts = ["alpha"]
            options = { resync-after = "b" }

            [[drbd]]
            name = "b"
            hosts = ["alpha"]
            options = { resync-after = "c" }

            [[drbd]]
            name = "c"
            hosts = ["alpha"]

            [[drbd]]
            name = "d"
            hosts = ["alpha"]
            "#,
        );

        // a and b both reach c through their chains.
        assert_eq!(cluster.resync_after_candidates("c"), vec!["d"]);
        assert_eq!(cluster.resync_after_candidates("a"), vec!["b", "c", "d"]);
        assert_eq!(cluster.resync_after_candidates("d"), vec!["a", "b", "c"]);
    }

    #[test]
    fn colliding_port_is_incorrect() {
        let cluster = cluster_with(
            r#"
            [[drbd]]
            name = "r0"
            hosts = ["alpha", "beta"]
            volumes = [{ number = 0, device = "/dev/drbd0", disks = { alpha = "/dev/sda1", beta = "/dev/sda1" } }]
            endpoints = { alpha = { port = "7788" }, beta = { port = "7788" } }
            applied = true

            [[drbd]]
            name = "r1"
            hosts = ["alpha", "beta"]
            volumes = [{ number = 0, device = "/dev/drbd1", disks = { alpha = "/dev/sdb1", beta = "/dev/sdb1" } }]
            endpoints = { alpha = { port = "7788" }, beta = { port = "7789" } }
            "#,
        );
        let r1 = cluster.drbd("r1").unwrap();

        assert!(r1.is_correct());
        assert!(!cluster.is_drbd_correct(&r1));
        assert!(!cluster.problems().is_empty());

        r1.endpoints
            .set_pending(&drbd::port_key("alpha"), Some("7790".to_string()));
        cluster.allocate_drbd(&r1).unwrap();
        assert!(cluster.is_drbd_correct(&r1));
    }

    #[test]
    fn removal_releases_ports() {
        let env = TestEnvironment::new(TWO_HOSTS);

        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            env.controller.apply_drbd("r0").await.unwrap();
            env.controller.remove_drbd("r0").await.unwrap();
        });

        assert!(env.cluster.drbd("r0").is_none());
        let next = env
            .cluster
            .with_ports(|ports| ports.lowest_unused_port(&["alpha", "beta"]));
        assert_eq!(next, Ok(7788));
    }
}
