//! Object and relation instances.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Property name to value mapping.
pub type PropertyMap = BTreeMap<String, Value>;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// A fresh random (UUID v4) identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Identifier of an object instance, unique across all object types.
    ObjectId
);
string_id!(
    /// Identifier of a relation instance.
    RelationId
);

/// A concrete entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectInstance {
    /// Assigned on first upsert when absent
    pub id: Option<ObjectId>,
    pub object_type: String,
    #[serde(default)]
    pub properties: PropertyMap,
}

impl ObjectInstance {
    pub fn new(object_type: impl Into<String>) -> Self {
        Self {
            id: None,
            object_type: object_type.into(),
            properties: PropertyMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<ObjectId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set a property value.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }
}

/// A concrete, directed edge between two objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationInstance {
    /// Assigned on first upsert when absent
    pub id: Option<RelationId>,
    pub relation_type: String,
    pub source: ObjectId,
    pub target: ObjectId,
    #[serde(default)]
    pub properties: PropertyMap,
}

impl RelationInstance {
    pub fn new(
        relation_type: impl Into<String>,
        source: impl Into<ObjectId>,
        target: impl Into<ObjectId>,
    ) -> Self {
        Self {
            id: None,
            relation_type: relation_type.into(),
            source: source.into(),
            target: target.into(),
            properties: PropertyMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<RelationId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = ObjectId::generate();
        let b = ObjectId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn test_builder() {
        let book = ObjectInstance::new("Book")
            .with_id("B1")
            .with("title", "Y")
            .with("year", 2000_i64);
        assert_eq!(book.id, Some(ObjectId::new("B1")));
        assert_eq!(book.get("year"), Some(&Value::Integer(2000)));
    }
}
