//! Materialized query results.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use relshape_ir::{CompositeKey, Value};
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// One output value produced by shaping a row.
#[derive(Debug, Clone, PartialEq)]
pub enum Materialized {
    Null,
    Scalar(Value),
    Entity(EntityRef),
    Collection(Vec<Materialized>),
    Record(Vec<(String, Materialized)>),
}

impl Materialized {
    pub fn is_null(&self) -> bool {
        matches!(self, Materialized::Null)
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            Materialized::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<&EntityRef> {
        match self {
            Materialized::Entity(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&[Materialized]> {
        match self {
            Materialized::Collection(items) => Some(items),
            _ => None,
        }
    }

    /// Member of a record by name.
    pub fn member(&self, name: &str) -> Option<&Materialized> {
        match self {
            Materialized::Record(members) => {
                members.iter().find(|(n, _)| n == name).map(|(_, v)| v)
            }
            _ => None,
        }
    }

    /// Convert to JSON. Entities become objects of their fields and loaded
    /// navigations; a navigation back to an entity already being rendered is
    /// rendered without its navigations.
    pub fn to_json(&self) -> serde_json::Value {
        let mut stack = Vec::new();
        self.to_json_inner(&mut stack)
    }

    fn to_json_inner(&self, stack: &mut Vec<*const EntityInstance>) -> serde_json::Value {
        match self {
            Materialized::Null => serde_json::Value::Null,
            Materialized::Scalar(v) => v.to_json(),
            Materialized::Entity(e) => e.to_json_inner(stack),
            Materialized::Collection(items) => {
                serde_json::Value::Array(items.iter().map(|i| i.to_json_inner(stack)).collect())
            }
            Materialized::Record(members) => serde_json::Value::Object(
                members
                    .iter()
                    .map(|(name, value)| (name.clone(), value.to_json_inner(stack)))
                    .collect(),
            ),
        }
    }

    /// Deserialize into a caller type through its JSON form.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.to_json()).map_err(|e| Error::Ir(relshape_ir::Error::from(e)))
    }
}

/// A materialized entity.
pub struct EntityInstance {
    entity_type: String,
    key: Vec<Value>,
    fields: Vec<(String, Value)>,
    navigations: RwLock<Vec<(String, Materialized)>>,
}

/// Shared handle to an entity. Clones refer to the same instance.
#[derive(Clone)]
pub struct EntityRef(Arc<EntityInstance>);

impl EntityRef {
    /// Create a new entity instance.
    pub fn new(
        entity_type: impl Into<String>,
        key: Vec<Value>,
        fields: Vec<(String, Value)>,
    ) -> Self {
        Self(Arc::new(EntityInstance {
            entity_type: entity_type.into(),
            key,
            fields,
            navigations: RwLock::new(Vec::new()),
        }))
    }

    pub fn entity_type(&self) -> &str {
        &self.0.entity_type
    }

    pub fn key(&self) -> &[Value] {
        &self.0.key
    }

    pub fn identity_key(&self) -> CompositeKey {
        CompositeKey::from_values(&self.0.key)
    }

    pub fn fields(&self) -> &[(String, Value)] {
        &self.0.fields
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.0.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Loaded navigation value, if any.
    pub fn navigation(&self, name: &str) -> Option<Materialized> {
        self.0
            .navigations
            .read()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    }

    /// Set or replace a navigation.
    pub fn set_navigation(&self, name: &str, value: Materialized) {
        let mut navigations = self.0.navigations.write();
        match navigations.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => navigations.push((name.to_string(), value)),
        }
    }

    /// Whether both handles point at the same instance.
    pub fn ptr_eq(a: &EntityRef, b: &EntityRef) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut stack = Vec::new();
        self.to_json_inner(&mut stack)
    }

    fn to_json_inner(&self, stack: &mut Vec<*const EntityInstance>) -> serde_json::Value {
        let ptr = Arc::as_ptr(&self.0);
        let mut object: serde_json::Map<String, serde_json::Value> = self
            .0
            .fields
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect();
        if stack.contains(&ptr) {
            return serde_json::Value::Object(object);
        }
        stack.push(ptr);
        let navigations = self.0.navigations.read().clone();
        for (name, value) in navigations {
            object.insert(name, value.to_json_inner(stack));
        }
        stack.pop();
        serde_json::Value::Object(object)
    }
}

/// Entities compare by type, key and fields; navigations are not compared.
impl PartialEq for EntityRef {
    fn eq(&self, other: &Self) -> bool {
        EntityRef::ptr_eq(self, other)
            || (self.0.entity_type == other.0.entity_type
                && self.0.key == other.0.key
                && self.0.fields == other.0.fields)
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRef")
            .field("entity_type", &self.0.entity_type)
            .field("key", &self.0.key)
            .field("fields", &self.0.fields)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn blog() -> EntityRef {
        EntityRef::new(
            "Blog",
            vec![Value::Int32(1)],
            vec![("Id".into(), Value::Int32(1)), ("Name".into(), Value::String("rust".into()))],
        )
    }

    #[test]
    fn test_navigation_set_and_replace() {
        let blog = blog();
        blog.set_navigation("Posts", Materialized::Collection(vec![]));
        blog.set_navigation(
            "Posts",
            Materialized::Collection(vec![Materialized::Scalar(Value::Int32(3))]),
        );
        assert_eq!(blog.navigation("Posts").unwrap().as_collection().unwrap().len(), 1);
        assert!(blog.navigation("Owner").is_none());
    }

    #[test]
    fn test_cyclic_navigation_json_terminates() {
        let blog = blog();
        let post =
            EntityRef::new("Post", vec![Value::Int32(7)], vec![("Id".into(), Value::Int32(7))]);
        post.set_navigation("Blog", Materialized::Entity(blog.clone()));
        blog.set_navigation("Posts", Materialized::Collection(vec![Materialized::Entity(post)]));

        let json = blog.to_json();
        assert_eq!(json["Posts"][0]["Blog"]["Name"], "rust");
        assert!(json["Posts"][0]["Blog"].get("Posts").is_none());
    }

    #[test]
    fn test_deserialize_record() {
        #[derive(Deserialize)]
        struct Row {
            name: String,
            count: i64,
        }
        let record = Materialized::Record(vec![
            ("name".into(), Materialized::Scalar(Value::String("a".into()))),
            ("count".into(), Materialized::Scalar(Value::Int64(2))),
        ]);
        let row: Row = record.deserialize().unwrap();
        assert_eq!(row.name, "a");
        assert_eq!(row.count, 2);
    }

    #[test]
    fn test_entity_identity() {
        let a = blog();
        let b = a.clone();
        let c = blog();
        assert!(EntityRef::ptr_eq(&a, &b));
        assert!(!EntityRef::ptr_eq(&a, &c));
        assert_eq!(a, c);
    }
}
