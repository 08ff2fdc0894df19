//! Polymorphic entity references and the registry that resolves them.
//!
//! A reference is a plain `(type_tag, id)` pair. Ids are strings so integer,
//! ULID and UUID keys all fit. Turning a reference back into data is the job
//! of a [`Resolver`] registered under the tag; the [`TypeRegistry`] is an
//! ordinary value owned by the caller, built once and passed by reference.

use crate::core::error::DecisioningError;
use crate::core::store::Store;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;

/// Weak reference to an entity owned by some other subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(rename = "type")]
    pub type_tag: String,
    pub id: String,
}

impl EntityRef {
    pub fn new(type_tag: impl Into<String>, id: impl ToString) -> Self {
        Self {
            type_tag: type_tag.into(),
            id: id.to_string(),
        }
    }

    pub fn from_entity<E: Entity + ?Sized>(entity: &E) -> Self {
        entity.entity_ref()
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_tag, self.id)
    }
}

/// Something that can be pointed at by an [`EntityRef`].
pub trait Entity {
    const TYPE_TAG: &'static str;

    fn entity_id(&self) -> String;

    fn entity_ref(&self) -> EntityRef {
        EntityRef::new(Self::TYPE_TAG, self.entity_id())
    }
}

/// Loads one entity type by id. `Ok(None)` means "no such row".
pub trait Resolver: Send + Sync {
    fn resolve(&self, conn: &Connection, id: &str) -> Result<Option<JsonValue>, DecisioningError>;
}

impl<F> Resolver for F
where
    F: Fn(&Connection, &str) -> Result<Option<JsonValue>, DecisioningError> + Send + Sync,
{
    fn resolve(&self, conn: &Connection, id: &str) -> Result<Option<JsonValue>, DecisioningError> {
        self(conn, id)
    }
}

#[derive(Default)]
pub struct TypeRegistry {
    resolvers: BTreeMap<String, Box<dyn Resolver>>,
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.resolvers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with this crate's own entity types.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(
            crate::plugins::decide::DecisionRecord::TYPE_TAG,
            crate::plugins::decide::resolve_decision_json,
        );
        registry.register(
            crate::plugins::roles::RoleAssignment::TYPE_TAG,
            crate::plugins::roles::resolve_assignment_json,
        );
        registry
    }

    /// Register a resolver, returning the one it replaced.
    pub fn register<R: Resolver + 'static>(
        &mut self,
        type_tag: &str,
        resolver: R,
    ) -> Option<Box<dyn Resolver>> {
        self.resolvers.insert(type_tag.to_string(), Box::new(resolver))
    }

    pub fn unregister(&mut self, type_tag: &str) -> Option<Box<dyn Resolver>> {
        self.resolvers.remove(type_tag)
    }

    pub fn clear(&mut self) {
        self.resolvers.clear();
    }

    pub fn get(&self, type_tag: &str) -> Option<&dyn Resolver> {
        self.resolvers.get(type_tag).map(|r| r.as_ref())
    }

    pub fn contains(&self, type_tag: &str) -> bool {
        self.resolvers.contains_key(type_tag)
    }

    pub fn type_tags(&self) -> Vec<&str> {
        self.resolvers.keys().map(|k| k.as_str()).collect()
    }

    pub fn resolve_with(&self, conn: &Connection, target: &EntityRef) -> Result<JsonValue, DecisioningError> {
        let resolver = self.get(&target.type_tag).ok_or_else(|| {
            DecisioningError::NotFound(format!("unknown entity type '{}'", target.type_tag))
        })?;
        resolver
            .resolve(conn, &target.id)?
            .ok_or_else(|| DecisioningError::NotFound(format!("entity {} does not exist", target)))
    }

    pub fn resolve(&self, store: &Store, target: &EntityRef) -> Result<JsonValue, DecisioningError> {
        let conn = store.connect()?;
        self.resolve_with(&conn, target)
    }
}
