//! Type definitions and instance validation.

use crate::error::{Error, Result};
use crate::object::{ObjectId, ObjectInstance, PropertyMap};
use crate::value::{SemanticType, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::RESERVED_PREFIX;

/// A typed field on an object or relation type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDefinition {
    pub name: String,
    pub semantic_type: SemanticType,
    #[serde(default)]
    pub nullable: bool,
    /// Mirrors the object id; at most one per type
    #[serde(default)]
    pub identifier: bool,
}

impl PropertyDefinition {
    /// A required (non-nullable) property.
    pub fn new(name: impl Into<String>, semantic_type: SemanticType) -> Self {
        Self {
            name: name.into(),
            semantic_type,
            nullable: false,
            identifier: false,
        }
    }

    /// Build from a textual type name, e.g. `("year", "INTEGER")`.
    pub fn parse(name: impl Into<String>, semantic_type: &str) -> Result<Self> {
        Ok(Self::new(name, semantic_type.parse()?))
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Mark as the system identifier property.
    pub fn identifier(mut self) -> Self {
        self.identifier = true;
        self
    }
}

/// A user-defined entity kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectTypeDefinition {
    pub name: String,
    pub properties: Vec<PropertyDefinition>,
}

impl ObjectTypeDefinition {
    pub fn new(name: impl Into<String>, properties: Vec<PropertyDefinition>) -> Self {
        Self {
            name: name.into(),
            properties,
        }
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDefinition> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn identifier_property(&self) -> Option<&PropertyDefinition> {
        self.properties.iter().find(|p| p.identifier)
    }

    /// Structural checks on the definition itself.
    pub fn check(&self) -> Result<()> {
        check_name("object type", &self.name)?;
        check_properties(&self.name, &self.properties)?;

        let identifiers: Vec<_> = self.properties.iter().filter(|p| p.identifier).collect();
        if identifiers.len() > 1 {
            return Err(Error::Schema(format!(
                "type '{}' declares {} identifier properties, at most one is allowed",
                self.name,
                identifiers.len()
            )));
        }
        if let Some(id_prop) = identifiers.first() {
            if !matches!(id_prop.semantic_type, SemanticType::Text | SemanticType::Uuid) {
                return Err(Error::Schema(format!(
                    "identifier property '{}' must be TEXT or UUID",
                    id_prop.name
                )));
            }
        }
        Ok(())
    }

    /// Resolve the instance id against the identifier property, then check
    /// every property against its definition.
    ///
    /// Returns the id the instance will be stored under.
    pub fn validate(&self, instance: &mut ObjectInstance) -> Result<ObjectId> {
        if instance.object_type != self.name {
            return Err(Error::Validation(format!(
                "instance of '{}' validated against '{}'",
                instance.object_type, self.name
            )));
        }

        let id = match (self.identifier_property(), instance.id.clone()) {
            (Some(prop), id) => {
                let from_prop = match instance.properties.get(&prop.name) {
                    Some(Value::Text(s)) => Some(ObjectId::new(s.clone())),
                    Some(Value::Uuid(u)) => Some(ObjectId::new(u.to_string())),
                    Some(Value::Null) | None => None,
                    Some(other) => {
                        return Err(Error::Validation(format!(
                            "identifier '{}' holds a {} value",
                            prop.name,
                            other.kind()
                        )))
                    }
                };
                let id = match (id, from_prop) {
                    (Some(id), Some(p)) if id != p => {
                        return Err(Error::Validation(format!(
                            "id '{id}' disagrees with identifier property '{}' = '{p}'",
                            prop.name
                        )))
                    }
                    (Some(id), _) => id,
                    (None, Some(p)) => p,
                    (None, None) => ObjectId::generate(),
                };
                let mirrored = match prop.semantic_type {
                    SemanticType::Uuid => uuid::Uuid::parse_str(id.as_str())
                        .map(Value::Uuid)
                        .map_err(|_| {
                            Error::Validation(format!(
                                "id '{id}' is not a UUID but '{}' is a UUID identifier",
                                prop.name
                            ))
                        })?,
                    _ => Value::Text(id.to_string()),
                };
                instance.properties.insert(prop.name.clone(), mirrored);
                id
            }
            (None, Some(id)) => id,
            (None, None) => ObjectId::generate(),
        };

        if id.as_str().is_empty() {
            return Err(Error::Validation("object id must not be empty".to_string()));
        }
        validate_properties(&self.name, &self.properties, &mut instance.properties)?;
        instance.id = Some(id.clone());
        Ok(id)
    }
}

/// A typed, directed edge kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationTypeDefinition {
    pub name: String,
    pub source_type: String,
    pub target_type: String,
    #[serde(default)]
    pub properties: Vec<PropertyDefinition>,
}

impl RelationTypeDefinition {
    pub fn new(
        name: impl Into<String>,
        source_type: impl Into<String>,
        target_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source_type: source_type.into(),
            target_type: target_type.into(),
            properties: Vec::new(),
        }
    }

    pub fn with_properties(mut self, properties: Vec<PropertyDefinition>) -> Self {
        self.properties = properties;
        self
    }

    pub fn check(&self) -> Result<()> {
        check_name("relation type", &self.name)?;
        check_properties(&self.name, &self.properties)?;
        if self.properties.iter().any(|p| p.identifier) {
            return Err(Error::Schema(format!(
                "relation type '{}' cannot declare identifier properties",
                self.name
            )));
        }
        Ok(())
    }

    pub fn validate(&self, properties: &mut PropertyMap) -> Result<()> {
        validate_properties(&self.name, &self.properties, properties)
    }
}

/// Request to embed a TEXT property; the dimension is resolved from the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingSpec {
    pub object_type: String,
    pub source_property: String,
    pub model_id: String,
    /// Defaults to the source property name
    #[serde(default)]
    pub name: Option<String>,
}

impl EmbeddingSpec {
    pub fn new(
        object_type: impl Into<String>,
        source_property: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            object_type: object_type.into(),
            source_property: source_property.into(),
            model_id: model_id.into(),
            name: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Declares that a TEXT property is vectorized and searchable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingDefinition {
    pub name: String,
    pub object_type: String,
    pub source_property: String,
    pub model_id: String,
    pub dimension: usize,
}

fn check_name(what: &str, name: &str) -> Result<()> {
    if name.starts_with("__") || name.starts_with(RESERVED_PREFIX) {
        return Err(Error::Schema(format!("{what} name '{name}' uses a reserved prefix")));
    }
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(Error::Schema(format!("invalid {what} name '{name}'")));
    }
    Ok(())
}

fn check_properties(owner: &str, properties: &[PropertyDefinition]) -> Result<()> {
    let mut seen = HashSet::new();
    for prop in properties {
        check_name("property", &prop.name)?;
        if prop.name == crate::query::ID_FIELD {
            return Err(Error::Schema(format!(
                "'{owner}.id' is reserved; mark another property as identifier instead"
            )));
        }
        if !seen.insert(prop.name.as_str()) {
            return Err(Error::Schema(format!(
                "duplicate property '{}' on '{owner}'",
                prop.name
            )));
        }
    }
    Ok(())
}

/// Check `values` against `definitions`, normalizing stored values in place.
fn validate_properties(
    owner: &str,
    definitions: &[PropertyDefinition],
    values: &mut PropertyMap,
) -> Result<()> {
    if let Some(unknown) = values.keys().find(|k| !definitions.iter().any(|d| &d.name == *k)) {
        return Err(Error::Validation(format!(
            "'{owner}' has no property '{unknown}'"
        )));
    }

    for def in definitions {
        match values.get(&def.name) {
            None | Some(Value::Null) if def.nullable => {}
            None | Some(Value::Null) => {
                return Err(Error::Validation(format!(
                    "required property '{owner}.{}' is missing",
                    def.name
                )))
            }
            Some(value) if !def.semantic_type.accepts(value) => {
                return Err(Error::Validation(format!(
                    "property '{owner}.{}' expects {}, got {}",
                    def.name,
                    def.semantic_type,
                    value.kind()
                )))
            }
            Some(_) => {}
        }
    }

    for value in values.values_mut() {
        *value = std::mem::replace(value, Value::Null).normalized();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn author() -> ObjectTypeDefinition {
        ObjectTypeDefinition::new(
            "Author",
            vec![
                PropertyDefinition::new("name", SemanticType::Text),
                PropertyDefinition::new("born", SemanticType::Datetime).nullable(),
            ],
        )
    }

    #[test]
    fn test_check_rejects_duplicates_and_reserved() {
        let dup = ObjectTypeDefinition::new(
            "Dup",
            vec![
                PropertyDefinition::new("a", SemanticType::Text),
                PropertyDefinition::new("a", SemanticType::Integer),
            ],
        );
        assert!(matches!(dup.check(), Err(Error::Schema(_))));

        let reserved = ObjectTypeDefinition::new("__unimem__x", vec![]);
        assert!(matches!(reserved.check(), Err(Error::Schema(_))));

        let id_prop = ObjectTypeDefinition::new(
            "T",
            vec![PropertyDefinition::new("id", SemanticType::Text)],
        );
        assert!(id_prop.check().is_err());

        let two_ids = ObjectTypeDefinition::new(
            "T",
            vec![
                PropertyDefinition::new("a", SemanticType::Text).identifier(),
                PropertyDefinition::new("b", SemanticType::Text).identifier(),
            ],
        );
        assert!(two_ids.check().is_err());

        assert!(PropertyDefinition::parse("x", "MONEY").is_err());
    }

    #[test]
    fn test_validate_assigns_id() {
        let mut obj = ObjectInstance::new("Author").with("name", "X");
        let id = author().validate(&mut obj).unwrap();
        assert_eq!(obj.id, Some(id));
    }

    #[test]
    fn test_validate_rejects_bad_instances() {
        let def = author();

        let mut missing = ObjectInstance::new("Author");
        assert!(matches!(def.validate(&mut missing), Err(Error::Validation(_))));

        let mut wrong_type = ObjectInstance::new("Author").with("name", 5_i64);
        assert!(matches!(def.validate(&mut wrong_type), Err(Error::Validation(_))));

        let mut unknown = ObjectInstance::new("Author").with("name", "X").with("age", 3_i64);
        assert!(matches!(def.validate(&mut unknown), Err(Error::Validation(_))));

        let mut null_ok = ObjectInstance::new("Author")
            .with("name", "X")
            .with("born", Value::Null);
        def.validate(&mut null_ok).unwrap();
    }

    #[test]
    fn test_validate_rejects_non_finite_floats() {
        let def = ObjectTypeDefinition::new(
            "Reading",
            vec![PropertyDefinition::new("v", SemanticType::Float)],
        );
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let mut obj = ObjectInstance::new("Reading").with_id("R1").with("v", bad);
            assert!(
                matches!(def.validate(&mut obj), Err(Error::Validation(_))),
                "{bad} should be rejected"
            );
        }

        let mut finite = ObjectInstance::new("Reading").with_id("R1").with("v", 0.5_f64);
        def.validate(&mut finite).unwrap();
    }

    #[test]
    fn test_identifier_property_mirrors_id() {
        let def = ObjectTypeDefinition::new(
            "User",
            vec![PropertyDefinition::new("handle", SemanticType::Text).identifier()],
        );
        def.check().unwrap();

        let mut from_prop = ObjectInstance::new("User").with("handle", "ada");
        assert_eq!(def.validate(&mut from_prop).unwrap(), ObjectId::new("ada"));

        let mut from_id = ObjectInstance::new("User").with_id("bob");
        def.validate(&mut from_id).unwrap();
        assert_eq!(from_id.get("handle"), Some(&Value::text("bob")));

        let mut mismatch = ObjectInstance::new("User").with_id("bob").with("handle", "ada");
        assert!(matches!(def.validate(&mut mismatch), Err(Error::Validation(_))));
    }
}
