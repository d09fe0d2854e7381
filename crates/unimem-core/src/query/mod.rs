//! Complex queries: filters, similarity clauses and relation links across types.

mod executor;
mod filter;
mod planner;
mod types;

pub use executor::QueryExecutor;
pub use filter::{FilterOp, RelationalFilter, ID_FIELD};
pub use planner::{Access, ComponentPlan, Join, QueryPlan, QueryPlanner, SimilarityClause};
pub use types::{
    ComplexQuery, EmbeddingSearch, QueryComponent, QueryHit, QueryOptions, QueryResult,
    RelationLink, SearchInput,
};
