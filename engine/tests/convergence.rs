//! Multi-replica scenarios: snapshot fan-out, concurrent edits delivered in
//! both orders, rebase conflict resolution, mirror relays, and resync.

use std::cell::RefCell;
use std::rc::Rc;

use weft_engine::{apply_update, encode_state_as_update, Doc, Error, Value};

/// A document with a fixed priority and a counting id source, so scenarios
/// are reproducible. Give each replica a disjoint id range.
fn det_doc(priority: u32, id_base: u64) -> Doc {
    let mut doc = Doc::new();
    doc.set_resolve_priority(priority);
    let mut next = id_base;
    doc.set_id_source(move || {
        next += 1;
        next
    });
    doc
}

/// Collect every update buffer the document commits.
fn record_updates(doc: &mut Doc) -> Rc<RefCell<Vec<Vec<u8>>>> {
    let updates = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&updates);
    doc.observe_update(move |bytes, _| seen.borrow_mut().push(bytes.to_vec()));
    updates
}

fn deliver_all(doc: &mut Doc, updates: &Rc<RefCell<Vec<Vec<u8>>>>) {
    for bytes in updates.borrow().iter() {
        apply_update(doc, bytes, None).unwrap();
    }
}

// ---------------------------------------------------------------------------
// Snapshot fan-out
// ---------------------------------------------------------------------------

#[test]
fn snapshot_brings_a_fresh_replica_up_to_date() {
    let mut alice = det_doc(1, 0);
    let profile = alice.get_map("profile").unwrap();
    profile.set(&mut alice, "name", "Alice").unwrap();
    let scores = alice.get_array("scores").unwrap();
    scores.push(&mut alice, vec![Value::Int(7)]).unwrap();
    scores.push(&mut alice, vec![Value::Int(9)]).unwrap();

    let snapshot = encode_state_as_update(&alice).unwrap();

    let mut bob = det_doc(2, 1000);
    let mut carol = det_doc(3, 2000);
    apply_update(&mut bob, &snapshot, None).unwrap();
    apply_update(&mut carol, &snapshot, None).unwrap();

    assert_eq!(bob.to_value(), alice.to_value());
    assert_eq!(carol.to_value(), alice.to_value());
    assert_eq!(bob.clock(), alice.clock());

    // All three replicas agree on element identity.
    let bob_scores = bob.get_array("scores").unwrap();
    let carol_scores = carol.get_array("scores").unwrap();
    assert_eq!(bob_scores.id_at(&bob, 0), scores.id_at(&alice, 0));
    assert_eq!(carol_scores.id_at(&carol, 1), scores.id_at(&alice, 1));
}

#[test]
fn snapshots_chain_through_intermediate_replicas() {
    let mut alice = det_doc(1, 0);
    let world = alice.get_map("world").unwrap();
    world.set(&mut alice, "round", 3).unwrap();
    let log = alice.get_array("log").unwrap();
    log.push(&mut alice, vec![Value::Str("start".into())]).unwrap();

    let mut bob = det_doc(2, 1000);
    apply_update(&mut bob, &encode_state_as_update(&alice).unwrap(), None).unwrap();
    // Carol syncs from Bob's state, not Alice's.
    let mut carol = det_doc(3, 2000);
    apply_update(&mut carol, &encode_state_as_update(&bob).unwrap(), None).unwrap();

    assert_eq!(carol.to_value(), alice.to_value());
    assert_eq!(carol.clock(), alice.clock());
    let carol_log = carol.get_array("log").unwrap();
    assert_eq!(carol_log.id_at(&carol, 0), log.id_at(&alice, 0));
}

#[test]
fn snapshot_fires_observers_on_preexisting_handles() {
    let mut alice = det_doc(1, 0);
    let profile = alice.get_map("profile").unwrap();
    profile.set(&mut alice, "name", "Alice").unwrap();

    let mut bob = det_doc(2, 1000);
    let bob_profile = bob.get_map("profile").unwrap();
    let added: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&added);
    bob_profile.observe(&mut bob, move |change| {
        seen.borrow_mut().extend(change.added.iter().cloned());
    });

    apply_update(&mut bob, &encode_state_as_update(&alice).unwrap(), None).unwrap();

    // The handle survived the resync and saw the population arrive.
    assert_eq!(*added.borrow(), vec!["name".to_string()]);
    assert_eq!(
        bob_profile.get(&bob, "name").unwrap().as_value(),
        Some(&Value::Str("Alice".into()))
    );
}

#[test]
fn snapshot_stales_handles_whose_kind_changed() {
    let mut alice = det_doc(1, 0);
    let log = alice.get_map("log").unwrap();
    log.set(&mut alice, "k", 1).unwrap();

    // Bob guessed wrong about the root's kind before syncing.
    let mut bob = det_doc(2, 1000);
    let bob_log = bob.get_array("log").unwrap();
    apply_update(&mut bob, &encode_state_as_update(&alice).unwrap(), None).unwrap();

    assert_eq!(
        bob_log.push(&mut bob, vec![Value::Int(1)]).unwrap_err(),
        Error::StaleHandle
    );
    assert!(bob.get_map("log").is_ok());
}

// ---------------------------------------------------------------------------
// Concurrent edits
// ---------------------------------------------------------------------------

#[test]
fn non_conflicting_concurrent_edits_merge() {
    let mut alice = det_doc(1, 0);
    let mut bob = det_doc(2, 1000);
    let from_alice = record_updates(&mut alice);
    let from_bob = record_updates(&mut bob);

    let a_map = alice.get_map("m").unwrap();
    a_map.set(&mut alice, "from_alice", 1).unwrap();
    let b_map = bob.get_map("m").unwrap();
    b_map.set(&mut bob, "from_bob", 2).unwrap();

    deliver_all(&mut bob, &from_alice);
    deliver_all(&mut alice, &from_bob);

    assert_eq!(alice.to_value(), bob.to_value());
    assert_eq!(alice.clock(), 2);
    assert_eq!(bob.clock(), 2);
    assert!(a_map.contains_key(&alice, "from_alice"));
    assert!(a_map.contains_key(&alice, "from_bob"));
}

#[test]
fn conflicting_map_sets_resolve_by_priority_in_both_orders() {
    for alice_first in [true, false] {
        let mut alice = det_doc(10, 0);
        let mut bob = det_doc(20, 1000);
        let from_alice = record_updates(&mut alice);
        let from_bob = record_updates(&mut bob);

        let a_map = alice.get_map("m").unwrap();
        a_map.set(&mut alice, "k", "from_alice").unwrap();
        let b_map = bob.get_map("m").unwrap();
        b_map.set(&mut bob, "k", "from_bob").unwrap();

        if alice_first {
            deliver_all(&mut bob, &from_alice);
            deliver_all(&mut alice, &from_bob);
        } else {
            deliver_all(&mut alice, &from_bob);
            deliver_all(&mut bob, &from_alice);
        }

        // Bob's higher priority wins on both replicas.
        assert_eq!(alice.to_value(), bob.to_value());
        assert_eq!(
            a_map.get(&alice, "k").unwrap().as_value(),
            Some(&Value::Str("from_bob".into()))
        );
        // Nulled or not, the losing transaction still ticked the clock.
        assert_eq!(alice.clock(), 2);
        assert_eq!(bob.clock(), 2);
    }
}

#[test]
fn set_versus_delete_conflict_resolves_by_priority() {
    // Start from a shared state holding m.k, then race a delete against an
    // overwrite. The higher-priority overwrite must survive everywhere.
    let mut alice = det_doc(10, 0);
    let a_map = alice.get_map("m").unwrap();
    a_map.set(&mut alice, "k", "old").unwrap();

    let mut bob = det_doc(20, 1000);
    apply_update(&mut bob, &encode_state_as_update(&alice).unwrap(), None).unwrap();

    let from_alice = record_updates(&mut alice);
    let from_bob = record_updates(&mut bob);

    a_map.delete(&mut alice, "k").unwrap();
    let b_map = bob.get_map("m").unwrap();
    b_map.set(&mut bob, "k", "new").unwrap();

    deliver_all(&mut bob, &from_alice);
    deliver_all(&mut alice, &from_bob);

    assert_eq!(alice.to_value(), bob.to_value());
    assert_eq!(
        b_map.get(&bob, "k").unwrap().as_value(),
        Some(&Value::Str("new".into()))
    );
}

#[test]
fn ancestor_overwrite_nulls_descendant_writes_regardless_of_priority() {
    // Alice holds the higher priority but writes under a subtree that Bob
    // concurrently replaces wholesale. The replacement wins.
    let mut alice = det_doc(100, 0);
    let a_map = alice.get_map("m").unwrap();
    a_map
        .set(&mut alice, "inner", Value::Map(indexmap::IndexMap::new()))
        .unwrap();

    let mut bob = det_doc(1, 1000);
    apply_update(&mut bob, &encode_state_as_update(&alice).unwrap(), None).unwrap();

    let from_alice = record_updates(&mut alice);
    let from_bob = record_updates(&mut bob);

    let a_inner = a_map.get(&alice, "inner").unwrap().map().unwrap();
    a_inner.set(&mut alice, "x", 1).unwrap();
    let b_map = bob.get_map("m").unwrap();
    b_map.set(&mut bob, "inner", "flat").unwrap();

    deliver_all(&mut bob, &from_alice);
    deliver_all(&mut alice, &from_bob);

    assert_eq!(alice.to_value(), bob.to_value());
    assert_eq!(
        a_map.get(&alice, "inner").unwrap().as_value(),
        Some(&Value::Str("flat".into()))
    );
}

// ---------------------------------------------------------------------------
// Array convergence
// ---------------------------------------------------------------------------

#[test]
fn concurrent_array_deletes_converge_in_both_orders() {
    for alice_first in [true, false] {
        // Shared state: [1, 2, 3] on three replicas.
        let mut alice = det_doc(10, 0);
        let log = alice.get_array("log").unwrap();
        alice
            .transact(|doc| {
                log.push(doc, vec![Value::Int(1)])?;
                log.push(doc, vec![Value::Int(2)])?;
                log.push(doc, vec![Value::Int(3)])?;
                Ok(())
            })
            .unwrap();
        let snapshot = encode_state_as_update(&alice).unwrap();
        let mut bob = det_doc(20, 1000);
        let mut carol = det_doc(30, 2000);
        apply_update(&mut bob, &snapshot, None).unwrap();
        apply_update(&mut carol, &snapshot, None).unwrap();

        let from_alice = record_updates(&mut alice);
        let from_bob = record_updates(&mut bob);

        // Alice deletes the head, Bob deletes the tail.
        log.delete(&mut alice, 0).unwrap();
        let bob_log = bob.get_array("log").unwrap();
        bob_log.delete(&mut bob, 2).unwrap();

        deliver_all(&mut bob, &from_alice);
        deliver_all(&mut alice, &from_bob);
        if alice_first {
            deliver_all(&mut carol, &from_alice);
            deliver_all(&mut carol, &from_bob);
        } else {
            deliver_all(&mut carol, &from_bob);
            deliver_all(&mut carol, &from_alice);
        }

        let expected = Value::List(vec![Value::Int(2)]);
        assert_eq!(log.to_value(&alice), expected);
        assert_eq!(bob_log.to_value(&bob), expected);
        let carol_log = carol.get_array("log").unwrap();
        assert_eq!(carol_log.to_value(&carol), expected);
    }
}

#[test]
fn deleting_the_same_element_twice_is_idempotent() {
    let mut alice = det_doc(10, 0);
    let log = alice.get_array("log").unwrap();
    log.push(&mut alice, vec![Value::Str("only".into())]).unwrap();

    let mut bob = det_doc(20, 1000);
    apply_update(&mut bob, &encode_state_as_update(&alice).unwrap(), None).unwrap();

    let from_alice = record_updates(&mut alice);
    let from_bob = record_updates(&mut bob);

    log.delete(&mut alice, 0).unwrap();
    let bob_log = bob.get_array("log").unwrap();
    bob_log.delete(&mut bob, 0).unwrap();

    deliver_all(&mut bob, &from_alice);
    deliver_all(&mut alice, &from_bob);

    assert!(log.is_empty(&alice));
    assert!(bob_log.is_empty(&bob));
    assert_eq!(alice.clock(), bob.clock());
    assert_eq!(alice.to_value(), bob.to_value());
}

#[test]
fn concurrent_pushes_converge_as_sets() {
    let mut alice = det_doc(10, 0);
    let mut bob = det_doc(20, 1000);
    let from_alice = record_updates(&mut alice);
    let from_bob = record_updates(&mut bob);

    let a_log = alice.get_array("log").unwrap();
    a_log.push(&mut alice, vec![Value::Str("a".into())]).unwrap();
    let b_log = bob.get_array("log").unwrap();
    b_log.push(&mut bob, vec![Value::Str("b".into())]).unwrap();

    deliver_all(&mut bob, &from_alice);
    deliver_all(&mut alice, &from_bob);

    // Both elements survive on both replicas. Relative order of concurrent
    // pushes is delivery-dependent, so compare as sets.
    let collect = |doc: &Doc, log: &weft_engine::ArrayRef| {
        let Value::List(items) = log.to_value(doc) else {
            panic!("expected list");
        };
        let mut items: Vec<Value> = items;
        items.sort_by_key(|v| format!("{v:?}"));
        items
    };
    assert_eq!(collect(&alice, &a_log), collect(&bob, &b_log));
    assert_eq!(a_log.len(&alice), 2);
}

// ---------------------------------------------------------------------------
// History and delivery guarantees
// ---------------------------------------------------------------------------

#[test]
fn skipped_history_is_rejected() {
    let mut alice = det_doc(1, 0);
    let from_alice = record_updates(&mut alice);
    let map = alice.get_map("m").unwrap();
    map.set(&mut alice, "a", 1).unwrap();
    map.set(&mut alice, "b", 2).unwrap();

    let mut bob = det_doc(2, 1000);
    let err = apply_update(&mut bob, &from_alice.borrow()[1], None).unwrap_err();
    assert_eq!(
        err,
        Error::SkippedHistory {
            start_clock: 1,
            clock: 0,
        }
    );

    // In-order delivery still works afterwards.
    deliver_all(&mut bob, &from_alice);
    assert_eq!(bob.to_value(), alice.to_value());
}

#[test]
fn transaction_older_than_retained_history_is_rejected() {
    let mut alice = det_doc(10, 0);
    let mut bob = det_doc(20, 1000);
    let from_bob = record_updates(&mut bob);

    // Bob writes once while offline.
    let b_map = bob.get_map("m").unwrap();
    b_map.set(&mut bob, "stale", 1).unwrap();

    // Alice meanwhile commits far more than her retention window holds.
    alice.set_history_limit(4);
    let a_map = alice.get_map("m").unwrap();
    for i in 0..10 {
        a_map.set(&mut alice, format!("k{i}"), i).unwrap();
    }

    let err = apply_update(&mut alice, &from_bob.borrow()[0], None).unwrap_err();
    assert!(matches!(err, Error::HistoryTrimmed { start_clock: 0, .. }));
}

#[test]
fn clock_is_monotonic_across_local_and_remote_transactions() {
    let mut alice = det_doc(10, 0);
    let mut bob = det_doc(20, 1000);
    let from_alice = record_updates(&mut alice);

    let map = alice.get_map("m").unwrap();
    let mut last = bob.clock();
    map.set(&mut alice, "a", 1).unwrap();
    map.set(&mut alice, "b", 2).unwrap();
    for bytes in from_alice.borrow().iter() {
        apply_update(&mut bob, bytes, None).unwrap();
        assert!(bob.clock() > last);
        last = bob.clock();
    }
    assert_eq!(bob.clock(), alice.clock());
}

// ---------------------------------------------------------------------------
// Transactions over the wire
// ---------------------------------------------------------------------------

#[test]
fn batched_transaction_applies_atomically_with_per_event_notifications() {
    let mut alice = det_doc(1, 0);
    let from_alice = record_updates(&mut alice);
    let a_map = alice.get_map("m").unwrap();
    alice
        .transact(|doc| {
            a_map.set(doc, "a", 1)?;
            a_map.set(doc, "b", 2)?;
            a_map.set(doc, "c", 3)?;
            Ok(())
        })
        .unwrap();
    assert_eq!(from_alice.borrow().len(), 1);

    let mut bob = det_doc(2, 1000);
    let b_map = bob.get_map("m").unwrap();
    let notifications = Rc::new(RefCell::new(0usize));
    let seen = Rc::clone(&notifications);
    b_map.observe(&mut bob, move |_| *seen.borrow_mut() += 1);

    deliver_all(&mut bob, &from_alice);
    assert_eq!(bob.clock(), 1);
    assert_eq!(*notifications.borrow(), 3);
    assert_eq!(bob.to_value(), alice.to_value());
}

// ---------------------------------------------------------------------------
// Mirror relays
// ---------------------------------------------------------------------------

#[test]
fn mirror_chain_propagates_edits_end_to_end() {
    let mut alice = det_doc(10, 0);
    let mut relay = det_doc(20, 1000);
    relay.set_mirror(true);
    let mut carol = det_doc(30, 2000);

    let from_alice = record_updates(&mut alice);
    let from_relay = record_updates(&mut relay);

    let map = alice.get_map("m").unwrap();
    map.set(&mut alice, "a", 1).unwrap();
    map.set(&mut alice, "b", 2).unwrap();

    deliver_all(&mut relay, &from_alice);
    for bytes in from_relay.borrow().iter() {
        apply_update(&mut carol, bytes, None).unwrap();
    }

    assert_eq!(relay.to_value(), alice.to_value());
    assert_eq!(carol.to_value(), alice.to_value());
    assert_eq!(carol.clock(), relay.clock());
}
