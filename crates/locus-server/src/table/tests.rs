use super::*;
use locus_common::curve::node_id_for_hilbert;

fn addr(port: u16) -> Address {
    format!("127.0.0.1:{port}").parse().unwrap()
}

fn left_half() -> NodeIdRange {
    NodeIdRange::UNIVERSAL.split().0
}

fn right_half() -> NodeIdRange {
    NodeIdRange::UNIVERSAL.split().1
}

/// A point in the southern/western grid quadrant (low Hilbert values).
fn south_point() -> GeoPoint {
    GeoPoint::new(-45.0, -90.0)
}

/// A point in the northern/eastern grid quadrant.
fn north_point() -> GeoPoint {
    GeoPoint::new(45.0, 90.0)
}

#[test]
fn test_new_table_is_unknown_remote() {
    let table = Table::new(8).unwrap();
    table.check_coverage().unwrap();

    let id = node_id_for_hilbert(5, 8).unwrap();
    let entry = table.find_authority(&id);
    assert!(!entry.authority.is_local());
    assert_eq!(entry.range, NodeIdRange::UNIVERSAL);
}

#[test]
fn test_rejects_bad_resolution() {
    assert!(Table::new(0).is_err());
    assert!(Table::new(7).is_err());
    assert!(Table::new(200).is_err());
}

#[test]
fn test_add_local_universal_and_register() {
    let mut table = Table::new(8).unwrap();
    table.add_local(NodeIdRange::UNIVERSAL, None);
    table.check_coverage().unwrap();

    let lookup = table
        .get_or_create_client(NodeId::ZERO, south_point())
        .unwrap();
    let ClientLookup::Created(id) = lookup else {
        panic!("expected creation, got {lookup:?}");
    };
    assert!(id.is_set());
    assert!(table.client(&id).is_some());

    // registering again with the id finds the same record
    assert_eq!(
        table.get_or_create_client(id, south_point()).unwrap(),
        ClientLookup::Existing(id)
    );
    table.check_coverage().unwrap();
}

#[test]
fn test_get_or_create_rejects_foreign_ids() {
    let mut table = Table::new(8).unwrap();
    table.add_local(NodeIdRange::UNIVERSAL, None);

    // an id carrying coordinate bits beyond the resolution
    let mut bogus = NodeId::ZERO;
    bogus.set_bit_at(20, true);
    bogus.mark_set();
    assert!(table.get_or_create_client(bogus, south_point()).is_err());
}

#[test]
fn test_not_ours_when_authority_is_remote() {
    let mut table = Table::new(8).unwrap();
    table.add_local(left_half(), None);
    table.check_coverage().unwrap();

    assert_eq!(
        table
            .get_or_create_client(NodeId::ZERO, north_point())
            .unwrap(),
        ClientLookup::NotOurs
    );
    assert!(matches!(
        table
            .get_or_create_client(NodeId::ZERO, south_point())
            .unwrap(),
        ClientLookup::Created(_)
    ));
}

#[test]
fn test_add_remote_splits_down() {
    let mut table = Table::new(8).unwrap();

    // claim the second quarter of the space for a peer
    let (_, lr) = left_half().split();
    table.add_remote(lr, None, Some(addr(9001))).unwrap();
    table.check_coverage().unwrap();

    let inside = node_id_for_hilbert(64, 8).unwrap(); // 01...
    let entry = table.find_authority(&inside);
    assert_eq!(entry.range, lr);
    match &entry.authority {
        Authority::Remote(remote) => assert_eq!(remote.address, Some(addr(9001))),
        Authority::Local(_) => panic!("expected remote"),
    }

    // the rest of the space kept the unknown authority
    let outside = node_id_for_hilbert(5, 8).unwrap();
    match &table.find_authority(&outside).authority {
        Authority::Remote(remote) => assert_eq!(remote.address, None),
        Authority::Local(_) => panic!("expected remote"),
    }
}

#[test]
fn test_add_remote_never_overwrites_local() {
    let mut table = Table::new(8).unwrap();
    table.add_local(NodeIdRange::UNIVERSAL, None);

    // equal range
    let err = table
        .add_remote(NodeIdRange::UNIVERSAL, None, Some(addr(9001)))
        .unwrap_err();
    assert!(matches!(err, LocusError::AccessDenied));

    // contained range
    let err = table.add_remote(left_half(), None, Some(addr(9001))).unwrap_err();
    assert!(matches!(err, LocusError::AccessDenied));
    table.check_coverage().unwrap();
}

#[test]
fn test_add_remote_merges_covered_entries() {
    let mut table = Table::new(8).unwrap();
    let (ll, lr) = left_half().split();
    table.add_remote(ll, None, Some(addr(9001))).unwrap();
    table.add_remote(lr, None, Some(addr(9002))).unwrap();
    assert_eq!(table.ranges().len(), 3);

    // one announcement covering both quarters collapses them
    table.add_remote(left_half(), None, Some(addr(9003))).unwrap();
    table.check_coverage().unwrap();
    let id = node_id_for_hilbert(3, 8).unwrap();
    let entry = table.find_authority(&id);
    assert_eq!(entry.range, left_half());
    match &entry.authority {
        Authority::Remote(remote) => assert_eq!(remote.address, Some(addr(9003))),
        Authority::Local(_) => panic!("expected remote"),
    }

    // but not when a local entry hides underneath
    let mut table = Table::new(8).unwrap();
    table.add_local(ll, None);
    let err = table.add_remote(left_half(), None, Some(addr(9001))).unwrap_err();
    assert!(matches!(err, LocusError::AccessDenied));
    table.check_coverage().unwrap();
}

#[test]
fn test_rebind_equal_remote_range() {
    let mut table = Table::new(8).unwrap();
    table.add_remote(right_half(), None, Some(addr(9001))).unwrap();
    table.add_remote(right_half(), None, Some(addr(9002))).unwrap();

    let id = node_id_for_hilbert(200, 8).unwrap();
    match &table.find_authority(&id).authority {
        Authority::Remote(remote) => assert_eq!(remote.address, Some(addr(9002))),
        Authority::Local(_) => panic!("expected remote"),
    }
}

#[test]
fn test_local_split_partitions_clients_by_bit() {
    let mut table = Table::new(8).unwrap();
    table.add_local(NodeIdRange::UNIVERSAL, None);

    let ClientLookup::Created(south) = table
        .get_or_create_client(NodeId::ZERO, south_point())
        .unwrap()
    else {
        panic!("expected creation");
    };
    let ClientLookup::Created(north) = table
        .get_or_create_client(NodeId::ZERO, north_point())
        .unwrap()
    else {
        panic!("expected creation");
    };
    assert!(!south.bit_at(0));
    assert!(north.bit_at(0));

    // carving out the right half forces a split of the local owner
    table.add_local(right_half(), None);
    table.check_coverage().unwrap();

    let left_clients = table.clients_in_range(&left_half());
    let right_clients = table.clients_in_range(&right_half());
    assert_eq!(left_clients.len(), 1);
    assert_eq!(right_clients.len(), 1);
    assert_eq!(left_clients[0].id, south);
    assert_eq!(right_clients[0].id, north);
}

#[test]
fn test_move_client_within_and_across() {
    let mut table = Table::new(8).unwrap();
    table.add_local(left_half(), None);
    table.add_remote(right_half(), None, Some(addr(9001))).unwrap();

    let ClientLookup::Created(id) = table
        .get_or_create_client(NodeId::ZERO, south_point())
        .unwrap()
    else {
        panic!("expected creation");
    };

    // a tiny move that stays in the same cell keeps the id
    match table.move_client(&id, GeoPoint::new(-45.0, -90.0)).unwrap() {
        MoveOutcome::Local { new_id } => assert_eq!(new_id, id),
        other => panic!("unexpected outcome {other:?}"),
    }

    // a move within the local half changes the id but not the server
    let moved = table.move_client(&id, GeoPoint::new(-10.0, -30.0)).unwrap();
    let MoveOutcome::Local { new_id } = moved else {
        panic!("unexpected outcome {moved:?}");
    };
    assert_ne!(new_id, id);
    assert!(table.client(&id).is_none(), "old key must be gone");
    assert!(table.client(&new_id).is_some());
    table.check_coverage().unwrap();

    // a move into the remote half surfaces the new authority
    let moved = table.move_client(&new_id, north_point()).unwrap();
    let MoveOutcome::Moved { new_id: final_id, target } = moved else {
        panic!("unexpected outcome {moved:?}");
    };
    assert_eq!(target.address, Some(addr(9001)));
    // the record stays in the registry until the handoff completes
    assert!(table.client(&final_id).is_some());
    assert!(table.clients_in_range(&left_half()).is_empty());

    table.forget_client(&final_id);
    assert!(table.client(&final_id).is_none());
    table.check_coverage().unwrap();
}

#[test]
fn test_move_of_unknown_client_is_no_such_device() {
    let mut table = Table::new(8).unwrap();
    table.add_local(NodeIdRange::UNIVERSAL, None);
    let id = node_id_for_hilbert(9, 8).unwrap();
    let err = table.move_client(&id, south_point()).unwrap_err();
    assert!(matches!(err, LocusError::NoSuchDevice));
}

#[test]
fn test_load_balance_coarse_range_always_splits() {
    let mut table = Table::new(8).unwrap();
    table.add_local(NodeIdRange::UNIVERSAL, None);

    let ClientLookup::Created(south) = table
        .get_or_create_client(NodeId::ZERO, south_point())
        .unwrap()
    else {
        panic!("expected creation");
    };

    let actions = table.load_balance();
    assert_eq!(
        actions,
        vec![
            BalanceAction::InformOwn { range: left_half() },
            BalanceAction::Relinquish {
                range: right_half()
            },
        ]
    );
    // both halves stay local until the handoff completes
    table.check_coverage().unwrap();
    assert!(table.find_authority(&south).authority.is_local());

    // complete the handoff
    table.release_range(&right_half(), None, Some(addr(9001)));
    table.check_coverage().unwrap();
    let in_right = node_id_for_hilbert(200, 8).unwrap();
    assert!(!table.find_authority(&in_right).authority.is_local());
    // the southern client was in the kept half and survives
    assert!(table.client(&south).is_some());
}

#[test]
fn test_load_balance_informs_known_remotes() {
    let mut table = Table::new(8).unwrap();
    table.add_remote(right_half(), None, Some(addr(9001))).unwrap();

    let actions = table.load_balance();
    // the unknown left half is skipped, the known right half announced
    assert_eq!(
        actions,
        vec![BalanceAction::InformOther {
            range: right_half(),
            address: addr(9001)
        }]
    );
}

#[test]
fn test_load_balance_sheds_load_above_threshold() {
    let mut table = Table::new(64).unwrap();
    // a half-resolution range so the coarse rule does not apply
    let mut range = NodeIdRange::UNIVERSAL;
    for _ in 0..32 {
        range = range.split().0;
    }
    table.add_local(range, None);

    let population = LOAD_THRESHOLD + 1000;
    for d in 0..population as u128 {
        let id = node_id_for_hilbert(d, 64).unwrap();
        let ClientLookup::Created(_) = table.get_or_create_client(id, south_point()).unwrap()
        else {
            panic!("expected creation of client {d}");
        };
    }

    let actions = table.load_balance();
    table.check_coverage().unwrap();

    // nothing was lost: every client is in a kept or offered range
    assert_eq!(table.client_count(), population);

    let informed: Vec<_> = actions
        .iter()
        .filter_map(|a| match a {
            BalanceAction::InformOwn { range } => Some(*range),
            _ => None,
        })
        .collect();
    let offered: Vec<_> = actions
        .iter()
        .filter_map(|a| match a {
            BalanceAction::Relinquish { range } => Some(*range),
            _ => None,
        })
        .collect();
    assert!(!informed.is_empty());
    assert!(!offered.is_empty());

    // the kept ranges end up at or under the threshold, and the offers
    // carry the rest
    let kept: usize = informed
        .iter()
        .map(|r| table.clients_in_range(r).len())
        .sum();
    let given: usize = offered
        .iter()
        .map(|r| table.clients_in_range(r).len())
        .sum();
    assert_eq!(kept + given, population);
    for r in &informed {
        assert!(table.clients_in_range(r).len() <= LOAD_THRESHOLD);
    }
}

#[test]
fn test_plan_search_splits_local_and_remote() {
    let mut table = Table::new(8).unwrap();
    table.add_local(left_half(), None);
    table.add_remote(right_half(), None, Some(addr(9001))).unwrap();

    let ClientLookup::Created(south) = table
        .get_or_create_client(NodeId::ZERO, south_point())
        .unwrap()
    else {
        panic!("expected creation");
    };

    // a rectangle covering the whole planet touches both authorities
    let lower = GeoPoint::new(-90.0, -180.0);
    let upper = GeoPoint::new(90.0, 179.9);
    let (local, remote) = table.plan_search(&lower, &upper).unwrap();
    assert_eq!(local, vec![south]);
    assert_eq!(remote.len(), 1);
    assert_eq!(remote[0].address, Some(addr(9001)));

    // a rectangle confined to the south half stays local
    let (local, remote) = table
        .plan_search(&GeoPoint::new(-89.0, -179.0), &GeoPoint::new(-1.0, 179.0))
        .unwrap();
    assert_eq!(local, vec![south]);
    assert!(remote.is_empty());
}

#[test]
fn test_plan_search_deduplicates_one_peer_many_ranges() {
    let mut table = Table::new(8).unwrap();
    let (ll, lr) = left_half().split();
    table.add_remote(ll, None, Some(addr(9001))).unwrap();
    table.add_remote(lr, None, Some(addr(9001))).unwrap();
    table.add_remote(right_half(), None, Some(addr(9002))).unwrap();

    let lower = GeoPoint::new(-90.0, -180.0);
    let upper = GeoPoint::new(90.0, 179.9);
    let (local, remote) = table.plan_search(&lower, &upper).unwrap();
    assert!(local.is_empty());
    let mut addrs: Vec<_> = remote.iter().filter_map(|t| t.address).collect();
    addrs.sort_unstable_by_key(Address::port);
    assert_eq!(addrs, vec![addr(9001), addr(9002)]);
}

#[test]
fn test_search_local_ignores_remote_ranges() {
    let mut table = Table::new(8).unwrap();
    table.add_local(left_half(), None);
    table.add_remote(right_half(), None, Some(addr(9001))).unwrap();

    let ClientLookup::Created(south) = table
        .get_or_create_client(NodeId::ZERO, south_point())
        .unwrap()
    else {
        panic!("expected creation");
    };

    let hits = table.search_local(&GeoPoint::new(-90.0, -180.0), &GeoPoint::new(90.0, 179.9));
    assert_eq!(hits, vec![south]);
}

#[test]
fn test_empty_area_search_is_empty() {
    let mut table = Table::new(8).unwrap();
    table.add_local(NodeIdRange::UNIVERSAL, None);
    let (local, remote) = table
        .plan_search(&GeoPoint::new(10.0, 10.0), &GeoPoint::new(20.0, 20.0))
        .unwrap();
    assert!(local.is_empty());
    assert!(remote.is_empty());
}
