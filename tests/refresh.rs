// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tokio::runtime::Runtime;

    use lcmc_lib::{
        drbd,
        graph::{ConstraintKind, EdgeKinds},
        live::{LiveDrbd, LiveSnapshot},
        reference::{AttrGroup, Reference},
        resource::{ApplyState, ResourceKind, RunState},
        test_env::*,
    };

    const APPLIED: &str = r#"
        [[primitives]]
        id = "vip"
        agent = "ocf:heartbeat:IPaddr2"
        params = { ip = "10.0.0.100" }
        applied = true

        [[primitives]]
        id = "web"
        agent = "ocf:heartbeat:apache"
        applied = true

        [[placeholders]]
        id = "ph1"
    "#;

    /// The cluster exactly as described above, plus `extra`.
    fn snapshot(extra: &str) -> LiveSnapshot {
        let text = format!(
            r#"
            [resources.vip]
            agent = "ocf:heartbeat:IPaddr2"
            params = {{ ip = "10.0.0.100" }}

            [resources.web]
            agent = "ocf:heartbeat:apache"

            {extra}
            "#
        );
        LiveSnapshot::from_toml(&text).unwrap()
    }

    #[test]
    fn unedited_values_follow_the_cluster() {
        let env = TestEnvironment::new(APPLIED);
        let vip = env.resource("vip");

        let live = LiveSnapshot::from_toml(
            r#"
            [resources.vip]
            agent = "ocf:heartbeat:IPaddr2"
            params = { ip = "10.0.0.150", cidr_netmask = "16" }

            [resources.web]
            agent = "ocf:heartbeat:apache"
            "#,
        )
        .unwrap();
        let report = env.cluster.refresh_from_live(&live);

        assert!(report.stale.is_empty());
        assert_eq!(vip.params.get("ip").as_deref(), Some("10.0.0.150"));
        assert_eq!(vip.params.saved("ip").as_deref(), Some("10.0.0.150"));
        assert_eq!(vip.params.get("cidr_netmask").as_deref(), Some("16"));
        assert!(!vip.is_changed());
        assert_eq!(vip.state(), ApplyState::Applied);
    }

    #[test]
    fn edits_survive_a_refresh() {
        let env = TestEnvironment::new(APPLIED);
        let vip = env.resource("vip");
        vip.params.set_pending("ip", Some("10.0.0.200".to_string()));
        vip.note_edit();

        // Nothing moved on the cluster: the edit stays, nothing is stale.
        let report = env.cluster.refresh_from_live(&snapshot(""));
        assert!(report.stale.is_empty());
        assert_eq!(vip.params.get("ip").as_deref(), Some("10.0.0.200"));
        assert_eq!(vip.state(), ApplyState::Edited);

        // The cluster value moved underneath the edit.
        let live = LiveSnapshot::from_toml(
            r#"
            [resources.vip]
            agent = "ocf:heartbeat:IPaddr2"
            params = { ip = "10.0.0.150" }

            [resources.web]
            agent = "ocf:heartbeat:apache"
            "#,
        )
        .unwrap();
        let report = env.cluster.refresh_from_live(&live);

        assert_eq!(report.stale, vec![(vip.id, "ip".to_string())]);
        assert!(vip.params.is_stale("ip"));
        assert_eq!(vip.params.saved("ip").as_deref(), Some("10.0.0.150"));
        assert_eq!(vip.params.get("ip").as_deref(), Some("10.0.0.200"));
        assert!(vip.is_changed());
        assert_eq!(vip.state(), ApplyState::Edited);
    }

    #[test]
    fn unknown_resources_are_adopted() {
        let env = TestEnvironment::new(APPLIED);

        let report = env.cluster.refresh_from_live(&snapshot(
            r#"
            [resources.fs]
            agent = "ocf:heartbeat:apache"
            params = { configfile = "/etc/fs.conf" }

            [resources.grp]
            agent = "crm:group"
            kind = { type = "group", children = ["fs"] }
            "#,
        ));

        assert_eq!(report.adopted.len(), 2);
        let fs = env.cluster.find_by_server_id("fs").unwrap();
        let grp = env.cluster.find_by_server_id("grp").unwrap();
        assert!(report.adopted.contains(&fs.id));
        assert!(report.adopted.contains(&grp.id));

        assert_eq!(fs.state(), ApplyState::Applied);
        assert!(!fs.is_changed());
        assert_eq!(fs.params.get("configfile").as_deref(), Some("/etc/fs.conf"));
        assert_eq!(fs.parents().group, Some(grp.id));
        assert_eq!(grp.kind(), ResourceKind::Group { children: vec![fs.id] });

        // A second refresh knows them already.
        let report = env.cluster.refresh_from_live(&snapshot(
            r#"
            [resources.fs]
            agent = "ocf:heartbeat:apache"
            params = { configfile = "/etc/fs.conf" }

            [resources.grp]
            agent = "crm:group"
            kind = { type = "group", children = ["fs"] }
            "#,
        ));
        assert!(report.adopted.is_empty());
    }

    #[test]
    fn vanished_resources_are_destroyed() {
        let env = TestEnvironment::new(
            r#"
            [[primitives]]
            id = "vip"
            agent = "ocf:heartbeat:IPaddr2"
            params = { ip = "10.0.0.100" }
            applied = true

            [[primitives]]
            id = "web"
            agent = "ocf:heartbeat:apache"
            applied = true

            [[primitives]]
            id = "db"
            agent = "ocf:heartbeat:apache"
            applied = true

            [[primitives]]
            id = "new"
            agent = "ocf:heartbeat:apache"
            "#,
        );
        let web = env.id("web");
        let db = env.resource("db");
        let new = env.id("new");
        env.cluster
            .set_reference(db.id, AttrGroup::Meta, Reference::To(web))
            .unwrap();

        let live = LiveSnapshot::from_toml(
            r#"
            [resources.vip]
            agent = "ocf:heartbeat:IPaddr2"
            params = { ip = "10.0.0.100" }

            [resources.db]
            agent = "ocf:heartbeat:apache"
            "#,
        )
        .unwrap();
        let report = env.cluster.refresh_from_live(&live);

        // Only the applied resource that is gone goes; one that was never applied stays.
        assert_eq!(report.destroyed, vec![web]);
        assert!(env.cluster.resource(web).is_none());
        assert!(env.cluster.resource(new).is_some());

        // The unsaved reference to it falls back to defaults.
        assert_eq!(report.dropped_references, vec![db.id]);
        assert_eq!(db.reference(AttrGroup::Meta).pending, Reference::Defaults);
    }

    #[test]
    fn live_direct_constraints() {
        let env = TestEnvironment::new(APPLIED);
        let vip = env.id("vip");
        let web = env.id("web");

        env.cluster.refresh_from_live(&snapshot(
            r#"
            [[constraints]]
            id = "order-vip-web"
            kind = "order"
            parent = "vip"
            child = "web"
            "#,
        ));
        let graph = env.cluster.graph();
        let edge = graph.edge(vip, web).unwrap();
        assert_eq!(edge.id(ConstraintKind::Order), Some("order-vip-web"));
        assert_eq!(edge.id(ConstraintKind::Colocation), None);

        // An edge waiting for its first apply has no id and is kept.
        let (graph, _) = env
            .cluster
            .plan(|graph, info| graph.add_edge(web, vip, EdgeKinds::COLOCATION, info))
            .unwrap();
        env.cluster.install_graph(graph);

        env.cluster.refresh_from_live(&snapshot(""));
        let graph = env.cluster.graph();
        assert!(graph.edge(vip, web).is_none());
        assert!(graph.has_edge(web, vip, ConstraintKind::Colocation));
    }

    #[test]
    fn live_resource_sets() {
        let env = TestEnvironment::new(APPLIED);
        let vip = env.id("vip");
        let web = env.id("web");
        let ph1 = env.id("ph1");

        env.cluster.refresh_from_live(&snapshot(
            r#"
            [[sets]]
            id = "col_ph1"
            kind = "colocation"
            sets = [{ members = ["web"] }, { members = ["vip"] }]

            [[sets]]
            id = "ord_ph2"
            kind = "order"
            sets = [{ members = ["vip"], sequential = true }, { members = ["web"], require_all = false }]
            "#,
        ));

        let graph = env.cluster.graph();

        // Colocation sets come dependents first; the placeholder keeps them before-then-after.
        let colocation = graph.placeholder(ph1).unwrap().saved.get(ConstraintKind::Colocation);
        assert_eq!(colocation.id.as_deref(), Some("col_ph1"));
        assert_eq!(colocation.lists[0].members, vec![vip]);
        assert_eq!(colocation.lists[1].members, vec![web]);

        let ph2 = env.cluster.find_by_name("ph2").unwrap();
        assert!(ph2.is_placeholder());
        let order = graph.placeholder(ph2.id).unwrap();
        assert!(!order.is_changed());
        let order = order.saved.get(ConstraintKind::Order);
        assert_eq!(order.lists[0].members, vec![vip]);
        assert!(order.lists[0].sequential);
        assert_eq!(order.lists[1].members, vec![web]);
        assert!(!order.lists[1].require_all);

        // Sets that vanish from the cluster are emptied.
        env.cluster.refresh_from_live(&snapshot(""));
        let graph = env.cluster.graph();
        assert!(graph
            .placeholder(ph2.id)
            .unwrap()
            .saved
            .get(ConstraintKind::Order)
            .is_empty());
    }

    #[test]
    fn poll_status() {
        let env = TestEnvironment::new(APPLIED);
        let vip = env.resource("vip");
        let status = StaticStatus::new(snapshot(""));
        status.set(Some(
            LiveSnapshot::from_toml(
                r#"
                [resources.vip]
                agent = "ocf:heartbeat:IPaddr2"
                params = { ip = "10.0.0.100" }
                state = "running"
                running_on = ["alpha"]
                fail_counts = { beta = 2 }

                [resources.web]
                agent = "ocf:heartbeat:apache"
                state = "failed"
                failure = "not installed"
                "#,
            )
            .unwrap(),
        ));

        let rt = Runtime::new().unwrap();
        let report = rt.block_on(async { env.cluster.poll(&status).await });
        assert!(report.is_some());

        let live = vip.live_status();
        assert_eq!(live.run_state, RunState::Running(vec!["alpha".to_string()]));
        assert_eq!(live.fail_counts, BTreeMap::from([("beta".to_string(), 2)]));
        assert_eq!(
            env.resource("web").live_status().run_state,
            RunState::Failed("not installed".to_string())
        );

        // An unreadable cluster changes nothing.
        status.set(None);
        let report = rt.block_on(async { env.cluster.poll(&status).await });
        assert!(report.is_none());
        assert!(env.cluster.find_by_name("vip").is_some());
    }

    #[test]
    fn live_drbd_values() {
        let env = TestEnvironment::new(
            r#"
            [[drbd]]
            name = "r0"
            hosts = ["alpha", "beta"]
            volumes = [{ number = 0, device = "/dev/drbd0", disks = { alpha = "/dev/sda1", beta = "/dev/sda1" } }]
            "#,
        );
        let r0 = env.cluster.drbd("r0").unwrap();
        assert!(!r0.is_applied());

        let live = LiveSnapshot {
            drbd: BTreeMap::from([(
                "r0".to_string(),
                LiveDrbd {
                    endpoints: BTreeMap::from([
                        (drbd::address_key("alpha"), "10.0.0.1".to_string()),
                        (drbd::port_key("alpha"), "7795".to_string()),
                        (drbd::address_key("beta"), "10.0.0.2".to_string()),
                        (drbd::port_key("beta"), "7795".to_string()),
                    ]),
                    ..Default::default()
                },
            )]),
            ..Default::default()
        };
        env.cluster.refresh_from_live(&live);

        assert!(r0.is_applied());
        assert_eq!(r0.state(), ApplyState::Applied);
        assert_eq!(
            r0.endpoints.saved(&drbd::port_key("alpha")).as_deref(),
            Some("7795")
        );

        // Volume values arrive keyed by volume number.
        let live = LiveSnapshot::from_toml(
            r#"
            [drbd.r0]
            endpoints = { "alpha:address" = "10.0.0.1", "alpha:port" = "7795", "beta:address" = "10.0.0.2", "beta:port" = "7795" }

            [drbd.r0.volumes.0]
            device = "/dev/drbd0"
            "alpha:disk" = "/dev/sda1"
            "beta:disk" = "/dev/sda1"
            "#,
        )
        .unwrap();
        env.cluster.refresh_from_live(&live);
        let volume = &r0.volumes()[0];
        assert_eq!(volume.store.saved(drbd::DEVICE).as_deref(), Some("/dev/drbd0"));
        assert_eq!(
            volume.store.saved(&drbd::disk_key("beta")).as_deref(),
            Some("/dev/sda1")
        );
        assert!(!volume.store.is_changed(None));

        // The live port is reserved, so the next resource starts above it.
        let next = env
            .cluster
            .with_ports(|ports| ports.lowest_unused_port(&["alpha", "beta"]));
        assert_eq!(next, Ok(7796));
    }
}
