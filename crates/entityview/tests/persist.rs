//! Inserting new instances, including references to instances that are
//! never persisted themselves.

mod common;

use common::{Fixture, Group, User};
use entityview::prelude::*;

#[test]
fn reference_to_unpersisted_instance_stores_its_identity() {
    let fx = Fixture::new();
    // Stands in for the stored "Company" row without being loaded.
    let company = Group::create(fx.schema(), 1).unwrap();
    let user = User::create(fx.schema(), 10).unwrap();
    user.set_login("bob".to_string()).unwrap();
    user.set_group(Some(&company)).unwrap();

    let mut tx = fx.begin();
    tx.entity_manager().persist(user.entity()).unwrap();
    assert!(company.entity().is_new());
    tx.commit().unwrap();

    assert!(user.entity().is_detached());
    assert!(company.entity().is_new());
    assert_eq!(fx.stored("User", 10, "group"), Some(Value::BigInt(1)));
    assert_eq!(fx.stored("Group", 1, "name"), Some(Value::from("Company")));

    let view = View::new("User")
        .add_property("login")
        .add_reference("group", View::new("Group").add_property("name"))
        .load_partial_entities(true);
    let reloaded = User::cast(fx.load_detached("User", 10, Some(&view))).unwrap();
    assert_eq!(reloaded.login().unwrap(), "bob");
    let group = reloaded.group().unwrap().unwrap();
    assert_eq!(group.name().unwrap().as_deref(), Some("Company"));
    let id = reference_id(reloaded.entity(), "group").unwrap();
    assert_eq!(id.value().unwrap(), Some(&Identity::Int(1)));
}

#[test]
fn new_parents_are_inserted_first() {
    let fx = Fixture::new();
    let group = Group::create(fx.schema(), 3).unwrap();
    group.set_name(Some("Lab".to_string())).unwrap();
    let user = User::create(fx.schema(), 11).unwrap();
    user.set_login("carol".to_string()).unwrap();
    user.set_group(Some(&group)).unwrap();

    let mut tx = fx.begin();
    let mut em = tx.entity_manager();
    em.persist(user.entity()).unwrap();
    em.persist(group.entity()).unwrap();
    assert_eq!(em.context().pending_counts().new, 2);
    let result = em.flush().unwrap();
    assert_eq!(result.inserted, 2);
    tx.commit().unwrap();

    assert!(group.entity().is_detached());
    assert_eq!(fx.stored("User", 11, "group"), Some(Value::BigInt(3)));
    assert_eq!(fx.stored("Group", 3, "name"), Some(Value::from("Lab")));
}

#[test]
fn create_and_fill_through_the_entity_manager() {
    let fx = Fixture::new();
    let mut tx = fx.begin();
    let mut em = tx.entity_manager();
    let role = em.create("Role", 5).unwrap();
    role.set("name", "Auditors").unwrap();
    assert!(role.is_managed());

    let admin = em.get_reference("User", 1).unwrap();
    let link = em.create("UserRole", 5).unwrap();
    link.set_reference("user", Some(&admin)).unwrap();
    link.set_reference("role", Some(&role)).unwrap();
    tx.commit().unwrap();

    assert_eq!(fx.stored("Role", 5, "name"), Some(Value::from("Auditors")));
    assert_eq!(fx.stored("UserRole", 5, "user"), Some(Value::BigInt(1)));
    assert_eq!(fx.stored("UserRole", 5, "role"), Some(Value::BigInt(5)));
}

#[test]
fn persist_then_remove_cancels_the_insert() {
    let fx = Fixture::new();
    let group = Group::create(fx.schema(), 8).unwrap();

    let mut tx = fx.begin();
    let mut em = tx.entity_manager();
    em.persist(group.entity()).unwrap();
    em.remove(group.entity()).unwrap();
    assert_eq!(em.context().pending_counts().new, 0);
    assert_eq!(em.context().pending_counts().deleted, 0);
    fx.storage.reset_stats();
    tx.commit().unwrap();

    assert_eq!(fx.storage.stats().writes(), 0);
    assert!(fx.storage.row("Group", 8).is_none());
}

#[test]
fn duplicate_identity_is_rejected() {
    let fx = Fixture::new();
    let mut tx = fx.begin();
    let mut em = tx.entity_manager();
    em.find("Group", 1, None).unwrap().unwrap();

    let twin = Group::create(fx.schema(), 1).unwrap();
    let err = em.persist(twin.entity()).unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
    assert!(err.to_string().contains("already managed"));
}

#[test]
fn not_null_violation_fails_the_commit() {
    let fx = Fixture::new();
    let user = User::create(fx.schema(), 12).unwrap();

    let mut tx = fx.begin();
    tx.entity_manager().persist(user.entity()).unwrap();
    let err = tx.commit().unwrap_err();
    assert!(err.is_constraint_violation());
    assert!(err.to_string().contains("login"));

    // The failed commit rolled back: the instance is new again.
    assert!(user.entity().is_new());
    assert!(fx.storage.row("User", 12).is_none());
    assert_eq!(fx.storage.open_transactions(), 0);
}

#[test]
fn missing_referenced_row_fails_the_flush() {
    let fx = Fixture::new();
    let ghost = Group::create(fx.schema(), 99).unwrap();
    let user = User::create(fx.schema(), 13).unwrap();
    user.set_login("dave".to_string()).unwrap();
    user.set_group(Some(&ghost)).unwrap();

    let mut tx = fx.begin();
    let err = {
        let mut em = tx.entity_manager();
        em.persist(user.entity()).unwrap();
        em.flush().unwrap_err()
    };
    assert!(err.is_constraint_violation());
    assert!(err.to_string().contains("Group[99]"));
    tx.rollback().unwrap();
    assert!(fx.storage.row("User", 13).is_none());
}
