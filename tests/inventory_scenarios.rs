//! End-to-end inventory generation scenarios.

use fleetrun::inventory::{Fleet, GroupNames, build_inventory, plan_topology};

fn fleet() -> Fleet {
    Fleet {
        clients: vec![
            String::from("ci-client-1.net"),
            String::from("ci-client-2.net"),
        ],
        servers: vec![
            String::from("ci-server-1.net"),
            String::from("ci-server-2.net"),
            String::from("ci-server-3.net"),
        ],
    }
}

#[test]
fn two_clients_and_two_server_groups() {
    let topology =
        plan_topology(2, &[2, 1], &fleet()).unwrap_or_else(|err| panic!("plan: {err}"));
    let groups = GroupNames::for_test("replication");
    let doc = build_inventory(&topology, &groups, "root");

    assert_eq!(doc.section("clients-replication").map(<[String]>::len), Some(2));
    assert_eq!(doc.section("servers-1").map(<[String]>::len), Some(2));
    assert_eq!(doc.section("servers-2").map(<[String]>::len), Some(1));
    assert_eq!(
        doc.section("servers:children"),
        Some(&[String::from("servers-replication")][..])
    );
    assert_eq!(
        doc.section("servers-replication:children"),
        Some(&[String::from("servers-1"), String::from("servers-2")][..])
    );
}

#[test]
fn test_alias_unites_clients_and_servers_without_duplicates() {
    let topology =
        plan_topology(1, &[1, 1], &fleet()).unwrap_or_else(|err| panic!("plan: {err}"));
    let groups = GroupNames::for_test("mixed");
    let doc = build_inventory(&topology, &groups, "root");

    let combined = doc
        .section("test-mixed:children")
        .unwrap_or_else(|| panic!("combined alias missing"));
    assert_eq!(
        combined,
        &[String::from("clients-mixed"), String::from("servers-mixed")][..]
    );

    let mut seen = std::collections::BTreeSet::new();
    for group in combined {
        assert!(seen.insert(group), "duplicate member in test alias: {group}");
    }
}

#[test]
fn whole_fleet_layout_uses_a_single_server_group() {
    let fleet = fleet();
    let topology = plan_topology(fleet.clients.len(), &[fleet.servers.len()], &fleet)
        .unwrap_or_else(|err| panic!("plan: {err}"));
    let groups = GroupNames::for_test("setup");
    let doc = build_inventory(&topology, &groups, "root");

    assert_eq!(doc.section("servers-1").map(<[String]>::len), Some(3));
    assert!(doc.section("servers-2").is_none());
    assert_eq!(
        doc.section("servers-setup:children"),
        Some(&[String::from("servers-1")][..])
    );
}

#[test]
fn rendered_total_matches_the_group_sums() {
    for per_group in [&[1_usize][..], &[2, 1][..], &[1, 1, 1][..]] {
        let topology = plan_topology(1, per_group, &fleet())
            .unwrap_or_else(|err| panic!("plan: {err}"));
        let doc = build_inventory(&topology, &GroupNames::for_test("sum"), "root");

        let total: usize = (1..=per_group.len())
            .map(|index| {
                doc.section(&format!("servers-{index}"))
                    .map_or(0, <[String]>::len)
            })
            .sum();
        assert_eq!(total, per_group.iter().sum::<usize>());
    }
}
