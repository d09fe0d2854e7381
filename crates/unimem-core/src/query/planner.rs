//! Query validation and planning.
//!
//! Planning is pure: it only consults a schema snapshot, so every malformed
//! query is rejected before any adapter is called.

use super::filter::RelationalFilter;
use super::types::{ComplexQuery, EmbeddingSearch, SearchInput};
use crate::config::SearchStrategy;
use crate::error::{Error, Result};
use crate::schema::{EmbeddingDefinition, SchemaSnapshot};
use crate::storage::Direction;

/// A validated similarity clause bound to its embedding definition.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityClause {
    pub embedding: EmbeddingDefinition,
    pub query: SearchInput,
    pub top_k: usize,
    pub min_score: Option<f32>,
}

/// How one component computes its own candidate ids.
#[derive(Debug, Clone, PartialEq)]
pub enum Access {
    /// Relational scan; no filters means every instance of the type
    Scan(Vec<RelationalFilter>),
    /// Similarity search over the whole type
    Search(SimilarityClause),
    /// Scan, then search restricted to the scanned ids, then truncate
    FilterThenSearch {
        filters: Vec<RelationalFilter>,
        search: SimilarityClause,
    },
    /// Search and truncate, then keep the hits passing the filters
    SearchThenFilter {
        search: SimilarityClause,
        filters: Vec<RelationalFilter>,
    },
}

impl Access {
    pub fn similarity(&self) -> Option<&SimilarityClause> {
        match self {
            Access::Scan(_) => None,
            Access::Search(search)
            | Access::FilterThenSearch { search, .. }
            | Access::SearchThenFilter { search, .. } => Some(search),
        }
    }
}

/// A link from an earlier component into the one holding this join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    /// Index of the linking component
    pub from: usize,
    pub relation: String,
    /// Seen from the linking component
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComponentPlan {
    pub object_type: String,
    pub access: Access,
    pub joins: Vec<Join>,
}

/// Components are evaluated in index order; every join points backwards,
/// so a component's linked predecessors are always done before it runs.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub components: Vec<ComponentPlan>,
    pub result: usize,
}

impl QueryPlan {
    /// Joins as `(from, to)` pairs in evaluation order.
    pub fn edges(&self) -> impl Iterator<Item = (usize, usize, &Join)> {
        self.components
            .iter()
            .enumerate()
            .flat_map(|(to, c)| c.joins.iter().map(move |j| (j.from, to, j)))
    }
}

pub struct QueryPlanner;

impl QueryPlanner {
    pub fn plan(
        schema: &SchemaSnapshot,
        query: &ComplexQuery,
        strategy: SearchStrategy,
    ) -> Result<QueryPlan> {
        let count = query.components.len();
        if count == 0 {
            return Err(Error::query("query has no components"));
        }
        if query.result >= count {
            return Err(Error::query(format!(
                "result component {} out of range ({count} components)",
                query.result
            )));
        }

        let mut components = Vec::with_capacity(count);
        for (index, component) in query.components.iter().enumerate() {
            let def = schema.object_type(&component.object_type).ok_or_else(|| {
                Error::query(format!(
                    "component {index}: object type '{}' is not defined",
                    component.object_type
                ))
            })?;
            for filter in &component.filters {
                filter
                    .check(def)
                    .map_err(|e| Error::query(format!("component {index}: {}", message_of(e))))?;
            }
            let search = component
                .search
                .as_ref()
                .map(|s| Self::similarity(schema, &component.object_type, s))
                .transpose()
                .map_err(|e| Error::query(format!("component {index}: {}", message_of(e))))?;

            let filters = component.filters.clone();
            let access = match (search, strategy) {
                (None, _) => Access::Scan(filters),
                (Some(search), _) if filters.is_empty() => Access::Search(search),
                (Some(search), SearchStrategy::FilterFirst) => {
                    Access::FilterThenSearch { filters, search }
                }
                (Some(search), SearchStrategy::SearchFirst) => {
                    Access::SearchThenFilter { search, filters }
                }
            };
            components.push(ComponentPlan {
                object_type: component.object_type.clone(),
                access,
                joins: Vec::new(),
            });
        }

        for (index, component) in query.components.iter().enumerate() {
            let Some(link) = &component.link else {
                if index + 1 != count {
                    return Err(Error::query(format!(
                        "component {index} is not linked to the rest of the query"
                    )));
                }
                continue;
            };
            if link.target <= index || link.target >= count {
                return Err(Error::query(format!(
                    "component {index}: link target {} must be a later component",
                    link.target
                )));
            }
            let relation = schema.relation_type(&link.relation).ok_or_else(|| {
                Error::query(format!(
                    "component {index}: relation type '{}' is not defined",
                    link.relation
                ))
            })?;
            let here = &component.object_type;
            let there = &query.components[link.target].object_type;
            let (source, target) = match link.direction {
                Direction::Outgoing => (here, there),
                Direction::Incoming => (there, here),
            };
            if &relation.source_type != source || &relation.target_type != target {
                return Err(Error::query(format!(
                    "component {index}: '{}' connects {} -> {}, not {source} -> {target}",
                    relation.name, relation.source_type, relation.target_type
                )));
            }
            components[link.target].joins.push(Join {
                from: index,
                relation: link.relation.clone(),
                direction: link.direction,
            });
        }

        Ok(QueryPlan {
            components,
            result: query.result,
        })
    }

    fn similarity(
        schema: &SchemaSnapshot,
        object_type: &str,
        search: &EmbeddingSearch,
    ) -> Result<SimilarityClause> {
        let embedding = match &search.embedding {
            Some(name) => schema.embedding(object_type, name).ok_or_else(|| {
                Error::query(format!("'{object_type}' has no embedding '{name}'"))
            })?,
            None => match schema.embeddings_for(object_type) {
                [only] => only,
                [] => return Err(Error::query(format!("'{object_type}' has no embeddings"))),
                _ => {
                    return Err(Error::query(format!(
                        "'{object_type}' has several embeddings, name one"
                    )))
                }
            },
        };

        if search.top_k == 0 {
            return Err(Error::query("top_k must be at least 1"));
        }
        if let Some(min) = search.min_score {
            if !min.is_finite() {
                return Err(Error::query("min_score must be finite"));
            }
        }
        if let SearchInput::Vector(vector) = &search.query {
            if vector.len() != embedding.dimension {
                return Err(Error::query(format!(
                    "query vector has {} dimensions, '{}.{}' has {}",
                    vector.len(),
                    object_type,
                    embedding.name,
                    embedding.dimension
                )));
            }
        }

        Ok(SimilarityClause {
            embedding: embedding.clone(),
            query: search.query.clone(),
            top_k: search.top_k,
            min_score: search.min_score,
        })
    }
}

fn message_of(err: Error) -> String {
    match err {
        Error::Query { message, .. } => message,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{EmbeddingSearch, FilterOp, QueryComponent};
    use crate::storage::SqliteRelationalStore;
    use crate::testutils;
    use std::sync::Arc;

    async fn library() -> Arc<SchemaSnapshot> {
        let store = Arc::new(SqliteRelationalStore::in_memory().unwrap());
        testutils::library_registry(store).await.snapshot()
    }

    fn book_by_author() -> ComplexQuery {
        ComplexQuery::new(vec![
            QueryComponent::new("Book")
                .filter(RelationalFilter::new("year", FilterOp::Ge, 1999_i64))
                .link("WRITTEN_BY", Direction::Outgoing, 1),
            QueryComponent::new("Author").filter(RelationalFilter::eq("name", "X")),
        ])
    }

    fn assert_rejected(schema: &SchemaSnapshot, query: &ComplexQuery) {
        let res = QueryPlanner::plan(schema, query, SearchStrategy::FilterFirst);
        assert!(matches!(res, Err(Error::Query { .. })), "{query:?} should be rejected");
    }

    #[tokio::test]
    async fn test_plan_linked_query() {
        let schema = library().await;
        let plan =
            QueryPlanner::plan(&schema, &book_by_author(), SearchStrategy::FilterFirst).unwrap();
        assert_eq!(plan.result, 0);
        assert_eq!(
            plan.components[1].joins,
            vec![Join {
                from: 0,
                relation: "WRITTEN_BY".into(),
                direction: Direction::Outgoing,
            }]
        );
        assert!(matches!(plan.components[0].access, Access::Scan(ref f) if f.len() == 1));
    }

    #[tokio::test]
    async fn test_strategy_selects_access_order() {
        let schema = library().await;
        let query = ComplexQuery::new(vec![QueryComponent::new("Book")
            .filter(RelationalFilter::new("year", FilterOp::Lt, 1970_i64))
            .search(EmbeddingSearch::text("desert", 2))]);

        let first = QueryPlanner::plan(&schema, &query, SearchStrategy::FilterFirst).unwrap();
        assert!(matches!(first.components[0].access, Access::FilterThenSearch { .. }));
        let second = QueryPlanner::plan(&schema, &query, SearchStrategy::SearchFirst).unwrap();
        assert!(matches!(second.components[0].access, Access::SearchThenFilter { .. }));

        let only_search =
            ComplexQuery::new(vec![QueryComponent::new("Book").search(EmbeddingSearch::text("x", 1))]);
        let plan = QueryPlanner::plan(&schema, &only_search, SearchStrategy::SearchFirst).unwrap();
        assert_eq!(plan.components[0].access.similarity().unwrap().embedding.name, "title");
    }

    #[tokio::test]
    async fn test_rejects_malformed_queries() {
        let schema = library().await;

        assert_rejected(&schema, &ComplexQuery::new(vec![]));
        assert_rejected(&schema, &ComplexQuery::new(vec![QueryComponent::new("Movie")]));
        assert_rejected(&schema, &book_by_author().returning(2));

        // Author has no embedding.
        assert_rejected(
            &schema,
            &ComplexQuery::new(vec![QueryComponent::new("Author").search(EmbeddingSearch::text("x", 3))]),
        );
        assert_rejected(
            &schema,
            &ComplexQuery::new(vec![
                QueryComponent::new("Book").search(EmbeddingSearch::text("x", 3).on("summary"))
            ]),
        );
        assert_rejected(
            &schema,
            &ComplexQuery::new(vec![QueryComponent::new("Book").search(EmbeddingSearch::text("x", 0))]),
        );
        assert_rejected(
            &schema,
            &ComplexQuery::new(vec![
                QueryComponent::new("Book").search(EmbeddingSearch::vector(vec![1.0; 3], 3))
            ]),
        );
        assert_rejected(
            &schema,
            &ComplexQuery::new(vec![
                QueryComponent::new("Book").filter(RelationalFilter::new("year", FilterOp::Like, "19%"))
            ]),
        );
    }

    #[tokio::test]
    async fn test_rejects_bad_links() {
        let schema = library().await;

        let wrong_direction = ComplexQuery::new(vec![
            QueryComponent::new("Book").link("WRITTEN_BY", Direction::Incoming, 1),
            QueryComponent::new("Author"),
        ]);
        assert_rejected(&schema, &wrong_direction);

        let backwards = ComplexQuery::new(vec![
            QueryComponent::new("Author"),
            QueryComponent::new("Book").link("WRITTEN_BY", Direction::Outgoing, 0),
        ]);
        assert_rejected(&schema, &backwards);

        let unknown = ComplexQuery::new(vec![
            QueryComponent::new("Book").link("EDITED_BY", Direction::Outgoing, 1),
            QueryComponent::new("Author"),
        ]);
        assert_rejected(&schema, &unknown);

        let disconnected = ComplexQuery::new(vec![
            QueryComponent::new("Book"),
            QueryComponent::new("Author"),
        ]);
        assert_rejected(&schema, &disconnected);
    }

    #[tokio::test]
    async fn test_incoming_link_from_author_side() {
        let schema = library().await;
        let query = ComplexQuery::new(vec![
            QueryComponent::new("Author").link("WRITTEN_BY", Direction::Incoming, 1),
            QueryComponent::new("Book"),
        ]);
        let plan = QueryPlanner::plan(&schema, &query, SearchStrategy::FilterFirst).unwrap();
        assert_eq!(plan.edges().count(), 1);
    }
}
