//! Lifecycle state transitions across persist, commit, rollback and removal.

mod common;

use common::{Fixture, Group, User};
use entityview::prelude::*;
use entityview::TransactionErrorKind;

fn exactly_one_state(entity: &Entity) -> bool {
    let flags = [
        entity.is_new(),
        entity.is_managed(),
        entity.is_detached(),
        entity.is_removed(),
    ];
    flags.iter().filter(|f| **f).count() == 1
}

#[test]
fn new_persist_commit_ends_detached() {
    let fx = Fixture::new();
    let user = User::create(fx.schema(), 10).unwrap();
    user.set_login("bob".to_string()).unwrap();
    assert!(user.entity().is_new());
    assert!(exactly_one_state(user.entity()));

    let mut tx = fx.begin();
    tx.entity_manager().persist(user.entity()).unwrap();
    assert!(user.entity().is_managed());
    assert!(exactly_one_state(user.entity()));

    tx.commit().unwrap();
    let e = user.entity();
    assert!(!e.is_new());
    assert!(!e.is_managed());
    assert!(e.is_detached());
    assert!(exactly_one_state(e));
    assert_eq!(fx.stored("User", 10, "login"), Some(Value::from("bob")));
}

#[test]
fn found_instances_are_managed_then_detached() {
    let fx = Fixture::new();
    let mut tx = fx.begin();
    let user = tx.entity_manager().find("User", 1, None).unwrap().unwrap();
    assert_eq!(user.state(), EntityState::Managed);
    tx.commit().unwrap();
    assert_eq!(user.state(), EntityState::Detached);
    assert!(exactly_one_state(&user));
}

#[test]
fn rollback_returns_persisted_instances_to_new() {
    let fx = Fixture::new();
    let group = Group::create(fx.schema(), 7).unwrap();

    let mut tx = fx.begin();
    let loaded = tx.entity_manager().find("Group", 1, None).unwrap().unwrap();
    tx.entity_manager().persist(group.entity()).unwrap();
    tx.entity_manager().flush().unwrap();
    tx.rollback().unwrap();

    assert!(group.entity().is_new());
    assert!(loaded.is_detached());
    assert!(fx.storage.row("Group", 7).is_none());

    // A new instance can be persisted again after the rollback.
    let mut tx = fx.begin();
    tx.entity_manager().persist(group.entity()).unwrap();
    tx.commit().unwrap();
    assert!(fx.storage.row("Group", 7).is_some());
}

#[test]
fn dropped_transaction_rolls_back() {
    let fx = Fixture::new();
    let user = {
        let mut tx = fx.begin();
        let user = tx.entity_manager().find("User", 2, None).unwrap().unwrap();
        user.set("name", "Changed").unwrap();
        tx.entity_manager().flush().unwrap();
        user
    };
    assert!(user.is_detached());
    assert_eq!(fx.storage.open_transactions(), 0);
    assert_eq!(fx.stored("User", 2, "name"), Some(Value::from("Alice")));
}

#[test]
fn remove_then_commit_detaches_and_deletes() {
    let fx = Fixture::new();
    let mut tx = fx.begin();
    let mut em = tx.entity_manager();
    let link = em.find("UserRole", 1, None).unwrap().unwrap();
    em.remove(&link).unwrap();
    assert!(link.is_removed());
    assert!(exactly_one_state(&link));
    assert!(!em.contains(&link));

    // Removing again is a no-op.
    em.remove(&link).unwrap();
    tx.commit().unwrap();

    assert!(link.is_detached());
    assert!(fx.storage.row("UserRole", 1).is_none());
}

#[test]
fn invalid_transitions_fail_immediately() {
    let fx = Fixture::new();
    let detached = fx.load_detached("User", 1, None);
    let fresh = Group::create(fx.schema(), 9).unwrap();

    let mut tx = fx.begin();
    let mut em = tx.entity_manager();

    let err = em.persist(&detached).unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
    assert!(err.is_programming_error());

    let err = em.remove(&detached).unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));

    let err = em.remove(fresh.entity()).unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));

    let err = em.merge(fresh.entity()).unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));

    let managed = em.find("User", 2, None).unwrap().unwrap();
    let err = em.merge(&managed).unwrap_err();
    assert!(err.to_string().contains("already managed"));

    // Nothing above changed any state.
    assert!(detached.is_detached());
    assert!(fresh.entity().is_new());
    assert!(managed.is_managed());
}

#[test]
fn retained_and_foreign_contexts() {
    let fx = Fixture::new();
    let mut tx = fx.begin();
    tx.commit_retaining().unwrap();
    assert!(tx.is_active());
    let user = tx.entity_manager().find("User", 1, None).unwrap().unwrap();
    assert!(user.is_managed());
    tx.commit().unwrap();

    let mut tx = fx.begin();
    let ctx_user = tx.entity_manager().find("User", 1, None).unwrap().unwrap();
    tx.rollback().unwrap();
    assert!(ctx_user.is_detached());

    let mut other = fx.begin();
    let err = other.entity_manager().remove(&ctx_user).unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
    let stranger = other.entity_manager().find("User", 2, None).unwrap().unwrap();

    let mut third = fx.begin();
    let err = third.entity_manager().remove(&stranger).unwrap_err();
    assert!(matches!(
        err,
        Error::Transaction(ref e) if e.kind == TransactionErrorKind::ForeignContext
    ));
}
