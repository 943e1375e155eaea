//! Shared fixture for the behavioural scenarios.
//!
//! Schema:
//!
//! ```text
//! Group  (name, users -> User.group)
//! User   (version, login, name, group -> Group, userRoles -> UserRole.user)
//! Role   (name)
//! UserRole (user -> User, role -> Role)
//! ```
//!
//! Seeded rows: groups 1 "Company" and 2 "Branch", users 1 "admin" (in
//! group 1) and 2 "alice" (in group 2), role 1 "Administrators", and user
//! role 1 linking admin to Administrators.

#![allow(dead_code)]

use std::sync::Arc;

use entityview::prelude::*;
use entityview::{AttributeInfo, EntityMeta};

entity_model! {
    pub struct Group: "Group" {
        scalar name / set_name: Option<String> = "name";
        collection users: User = "users";
    }
}

entity_model! {
    pub struct User: "User" {
        scalar version / set_version: Option<i32> = "version";
        scalar login / set_login: String = "login";
        scalar name / set_name: Option<String> = "name";
        reference group / set_group: Group = "group";
        collection user_roles: UserRole = "userRoles";
    }
}

entity_model! {
    pub struct Role: "Role" {
        scalar name / set_name: Option<String> = "name";
    }
}

entity_model! {
    pub struct UserRole: "UserRole" {
        reference user / set_user: User = "user";
        reference role / set_role: Role = "role";
    }
}

pub const USER_ATTRIBUTES: [&str; 6] = ["id", "version", "login", "name", "group", "userRoles"];

pub fn schema() -> Arc<Schema> {
    let schema = Schema::builder()
        .entity(
            EntityMeta::new("Group")
                .add_attribute(AttributeInfo::scalar("name"))
                .add_attribute(AttributeInfo::to_many("users", "User", "group")),
        )
        .entity(
            EntityMeta::new("User")
                .add_attribute(AttributeInfo::scalar("version").system())
                .add_attribute(AttributeInfo::scalar("login").nullable(false))
                .add_attribute(AttributeInfo::scalar("name"))
                .add_attribute(AttributeInfo::to_one("group", "Group"))
                .add_attribute(AttributeInfo::to_many("userRoles", "UserRole", "user")),
        )
        .entity(EntityMeta::new("Role").add_attribute(AttributeInfo::scalar("name")))
        .entity(
            EntityMeta::new("UserRole")
                .add_attribute(AttributeInfo::to_one("user", "User").nullable(false))
                .add_attribute(AttributeInfo::to_one("role", "Role").nullable(false)),
        )
        .build()
        .expect("fixture schema is valid");
    Arc::new(schema)
}

pub struct Fixture {
    pub storage: Arc<MemoryStorage>,
    pub persistence: Persistence,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(PersistenceConfig::default())
    }

    pub fn with_config(config: PersistenceConfig) -> Self {
        let schema = schema();
        let storage = Arc::new(MemoryStorage::new(Arc::clone(&schema)));
        seed(&storage);
        let persistence = Persistence::with_config(
            Arc::clone(&storage) as Arc<dyn Storage>,
            schema,
            config,
        );
        Self {
            storage,
            persistence,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        self.persistence.schema()
    }

    pub fn bridge(&self) -> SerializationBridge {
        self.persistence.bridge()
    }

    pub fn begin(&self) -> Transaction {
        self.persistence
            .create_transaction()
            .expect("begin transaction")
    }

    /// Find `entity[id]` in a transaction of its own and commit it, leaving
    /// the instance detached.
    pub fn load_detached(&self, entity: &str, id: i64, view: Option<&View>) -> Entity {
        let mut tx = self.begin();
        let found = tx
            .entity_manager()
            .find(entity, id, view)
            .expect("find")
            .expect("row exists");
        tx.commit().expect("commit");
        found
    }

    pub fn stored(&self, entity: &str, id: i64, attribute: &str) -> Option<Value> {
        self.storage
            .row(entity, id)
            .and_then(|row| row.get(attribute).cloned())
    }
}

fn seed(storage: &MemoryStorage) {
    let rows: [(&str, i64, Vec<(&str, Value)>); 6] = [
        ("Group", 1, vec![("name", Value::from("Company"))]),
        ("Group", 2, vec![("name", Value::from("Branch"))]),
        (
            "User",
            1,
            vec![
                ("version", Value::Int(1)),
                ("login", Value::from("admin")),
                ("name", Value::from("Administrator")),
                ("group", Value::BigInt(1)),
            ],
        ),
        (
            "User",
            2,
            vec![
                ("version", Value::Int(1)),
                ("login", Value::from("alice")),
                ("name", Value::from("Alice")),
                ("group", Value::BigInt(2)),
            ],
        ),
        ("Role", 1, vec![("name", Value::from("Administrators"))]),
        (
            "UserRole",
            1,
            vec![("user", Value::BigInt(1)), ("role", Value::BigInt(1))],
        ),
    ];
    for (entity, id, values) in rows {
        storage.seed(entity, id, values).expect("seed row");
    }
}

/// `login` only, nothing else fetched.
pub fn login_view() -> View {
    View::new("User")
        .add_property("login")
        .load_partial_entities(true)
}

/// `login` plus the `group` reference as a stub.
pub fn login_group_view() -> View {
    View::new("User")
        .add_property("login")
        .add_reference("group", View::new("Group"))
        .load_partial_entities(true)
}
