//! Relational filter clauses.

use crate::error::{Error, Result};
use crate::schema::ObjectTypeDefinition;
use crate::value::{SemanticType, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pseudo-field addressing the object id.
pub const ID_FIELD: &str = "id";

/// Comparison operator of a relational filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=", alias = "≠")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=", alias = "≤")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=", alias = "≥")]
    Ge,
    #[serde(rename = "IN")]
    In,
    #[serde(rename = "LIKE")]
    Like,
}

impl FilterOp {
    /// The SQL spelling of the operator.
    pub fn as_sql(&self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Ne => "<>",
            FilterOp::Lt => "<",
            FilterOp::Le => "<=",
            FilterOp::Gt => ">",
            FilterOp::Ge => ">=",
            FilterOp::In => "IN",
            FilterOp::Like => "LIKE",
        }
    }

    fn is_ordering(&self) -> bool {
        matches!(self, FilterOp::Lt | FilterOp::Le | FilterOp::Gt | FilterOp::Ge)
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FilterOp::Ne => "!=",
            other => other.as_sql(),
        };
        f.write_str(s)
    }
}

/// `field op value`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationalFilter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl RelationalFilter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }

    /// Check the clause against the type it filters.
    pub fn check(&self, def: &ObjectTypeDefinition) -> Result<()> {
        let semantic_type = if self.field == ID_FIELD {
            if !matches!(self.op, FilterOp::Eq | FilterOp::Ne | FilterOp::In) {
                return Err(Error::query(format!(
                    "operator {} does not apply to the id field",
                    self.op
                )));
            }
            SemanticType::Text
        } else {
            def.property(&self.field)
                .ok_or_else(|| {
                    Error::query(format!(
                        "type '{}' has no property '{}'",
                        def.name, self.field
                    ))
                })?
                .semantic_type
        };

        if !semantic_type.is_filterable() {
            return Err(Error::query(format!(
                "{} property '{}' cannot be filtered",
                semantic_type, self.field
            )));
        }
        if self.op.is_ordering() && !semantic_type.is_ordered() {
            return Err(Error::query(format!(
                "operator {} does not apply to {} property '{}'",
                self.op, semantic_type, self.field
            )));
        }
        if self.op == FilterOp::Like && semantic_type != SemanticType::Text {
            return Err(Error::query(format!(
                "LIKE only applies to TEXT, '{}' is {}",
                self.field, semantic_type
            )));
        }

        let operand_ok = match (&self.op, &self.value) {
            (FilterOp::In, Value::List(items)) => {
                !items.is_empty() && items.iter().all(|v| semantic_type.accepts(v))
            }
            (FilterOp::In, _) => false,
            (_, value) => semantic_type.accepts(value),
        };
        if !operand_ok {
            return Err(Error::query(format!(
                "operand {} is not valid for {} on {} property '{}'",
                self.value.kind(),
                self.op,
                semantic_type,
                self.field
            )));
        }
        Ok(())
    }
}
