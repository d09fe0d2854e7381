//! Schema registry: the authoritative store of type definitions.

mod registry;
mod types;

pub use registry::{SchemaRegistry, SchemaSnapshot};
pub use types::{
    EmbeddingDefinition, EmbeddingSpec, ObjectTypeDefinition, PropertyDefinition,
    RelationTypeDefinition,
};

/// Prefix of every internal name in the relational store.
pub const RESERVED_PREFIX: &str = "__unimem__";

/// Relational namespace holding object type definitions.
pub const OBJECT_TYPES_NS: &str = "__unimem__object_type";
/// Relational namespace holding relation type definitions.
pub const RELATION_TYPES_NS: &str = "__unimem__relation_type";
/// Relational namespace holding embedding definitions.
pub const EMBEDDINGS_NS: &str = "__unimem__embedding";

/// Relational namespace holding the properties of one relation type's instances.
pub fn relation_properties_ns(relation_type: &str) -> String {
    format!("{RESERVED_PREFIX}rel__{relation_type}")
}
