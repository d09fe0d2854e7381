//! Complex query request and result types.

use super::filter::RelationalFilter;
use crate::cancel::CancelSignal;
use crate::object::ObjectInstance;
use crate::storage::Direction;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What an embedding clause searches with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchInput {
    /// Embedded with the definition's model before searching
    Text(String),
    /// Used as is; must match the definition's dimension
    Vector(Vec<f32>),
}

/// Similarity search over one embedding of a component's type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingSearch {
    pub query: SearchInput,
    /// Embedding name; may be omitted when the type has exactly one
    #[serde(default)]
    pub embedding: Option<String>,
    pub top_k: usize,
    #[serde(default)]
    pub min_score: Option<f32>,
}

impl EmbeddingSearch {
    pub fn text(text: impl Into<String>, top_k: usize) -> Self {
        Self {
            query: SearchInput::Text(text.into()),
            embedding: None,
            top_k,
            min_score: None,
        }
    }

    pub fn vector(vector: Vec<f32>, top_k: usize) -> Self {
        Self {
            query: SearchInput::Vector(vector),
            embedding: None,
            top_k,
            min_score: None,
        }
    }

    pub fn on(mut self, embedding: impl Into<String>) -> Self {
        self.embedding = Some(embedding.into());
        self
    }

    pub fn min_score(mut self, min_score: f32) -> Self {
        self.min_score = Some(min_score);
        self
    }
}

/// Joins a component to a later one over a relation type.
///
/// `direction` is seen from the linking component: `Outgoing` means its
/// objects are the relation's sources and the target component's objects
/// are the relation's targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationLink {
    pub relation: String,
    pub direction: Direction,
    /// Index of the linked component
    pub target: usize,
}

/// One clause group over one object type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryComponent {
    pub object_type: String,
    #[serde(default)]
    pub filters: Vec<RelationalFilter>,
    #[serde(default)]
    pub search: Option<EmbeddingSearch>,
    #[serde(default)]
    pub link: Option<RelationLink>,
}

impl QueryComponent {
    pub fn new(object_type: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            filters: Vec::new(),
            search: None,
            link: None,
        }
    }

    pub fn filter(mut self, filter: RelationalFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn search(mut self, search: EmbeddingSearch) -> Self {
        self.search = Some(search);
        self
    }

    pub fn link(mut self, relation: impl Into<String>, direction: Direction, target: usize) -> Self {
        self.link = Some(RelationLink {
            relation: relation.into(),
            direction,
            target,
        });
        self
    }
}

/// An ordered list of components; `result` picks the one whose objects are returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexQuery {
    pub components: Vec<QueryComponent>,
    #[serde(default)]
    pub result: usize,
}

impl ComplexQuery {
    pub fn new(components: Vec<QueryComponent>) -> Self {
        Self {
            components,
            result: 0,
        }
    }

    pub fn returning(mut self, component: usize) -> Self {
        self.result = component;
        self
    }
}

/// Per-call execution controls.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Overrides the configured default deadline
    pub deadline: Option<Duration>,
    pub cancel: CancelSignal,
}

impl QueryOptions {
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryHit {
    pub object: ObjectInstance,
    /// Similarity score when the result component carried an embedding clause
    pub score: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub hits: Vec<QueryHit>,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// Ids of the hits, in result order.
    pub fn ids(&self) -> Vec<String> {
        self.hits
            .iter()
            .filter_map(|h| h.object.id.as_ref().map(|id| id.to_string()))
            .collect()
    }

    pub fn objects(self) -> Vec<ObjectInstance> {
        self.hits.into_iter().map(|h| h.object).collect()
    }
}
