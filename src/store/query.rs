//! WHERE-clause builder for model queries

use crate::models::Bind;
use tracing::warn;

/// SQLite's default host-parameter limit; callers chunk at 900 to stay
/// beneath it with room for other binds.
const IN_CLAUSE_SOFT_LIMIT: usize = 999;

/// Builds `WHERE` clauses with `=, >, >=, <, <=` predicates and `IN`
/// sets. Values bind positionally in the order clauses were added.
#[derive(Debug, Default, Clone)]
pub struct Query {
    clauses: Vec<String>,
    binds: Vec<Bind>,
}

impl Query {
    pub fn new() -> Self {
        Query::default()
    }

    pub fn equal(mut self, column: &str, value: impl Into<Bind>) -> Self {
        self.clauses.push(format!("{} = ?", column));
        self.binds.push(value.into());
        self
    }

    pub fn not_equal(mut self, column: &str, value: impl Into<Bind>) -> Self {
        self.clauses.push(format!("{} != ?", column));
        self.binds.push(value.into());
        self
    }

    pub fn gt(mut self, column: &str, value: impl Into<Bind>) -> Self {
        self.clauses.push(format!("{} > ?", column));
        self.binds.push(value.into());
        self
    }

    pub fn gte(mut self, column: &str, value: impl Into<Bind>) -> Self {
        self.clauses.push(format!("{} >= ?", column));
        self.binds.push(value.into());
        self
    }

    pub fn lt(mut self, column: &str, value: impl Into<Bind>) -> Self {
        self.clauses.push(format!("{} < ?", column));
        self.binds.push(value.into());
        self
    }

    pub fn lte(mut self, column: &str, value: impl Into<Bind>) -> Self {
        self.clauses.push(format!("{} <= ?", column));
        self.binds.push(value.into());
        self
    }

    pub fn equal_any<V: Into<Bind> + Clone>(mut self, column: &str, values: &[V]) -> Self {
        if values.len() > IN_CLAUSE_SOFT_LIMIT {
            warn!(
                column,
                count = values.len(),
                "IN clause exceeds SQLite parameter limit; chunk at 900"
            );
        }
        let placeholders = vec!["?"; values.len()].join(",");
        self.clauses
            .push(format!("{} IN ({})", column, placeholders));
        for v in values {
            self.binds.push(v.clone().into());
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// The `WHERE …` fragment, or an empty string when unconstrained.
    pub fn sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }

    pub fn binds(&self) -> &[Bind] {
        &self.binds
    }

    pub fn into_binds(self) -> Vec<Bind> {
        self.binds
    }
}

impl From<&str> for Bind {
    fn from(v: &str) -> Self {
        Bind::Text(v.to_string())
    }
}

impl From<String> for Bind {
    fn from(v: String) -> Self {
        Bind::Text(v)
    }
}

impl From<i64> for Bind {
    fn from(v: i64) -> Self {
        Bind::Int(v)
    }
}

impl From<u32> for Bind {
    fn from(v: u32) -> Self {
        Bind::Int(v as i64)
    }
}

impl From<bool> for Bind {
    fn from(v: bool) -> Self {
        Bind::Int(v as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clauses_join_with_and() {
        let q = Query::new()
            .equal("accountId", "a1")
            .gte("date", 100i64)
            .lt("remoteUID", 50u32);
        assert_eq!(
            q.sql(),
            " WHERE accountId = ? AND date >= ? AND remoteUID < ?"
        );
        assert_eq!(q.binds().len(), 3);
    }

    #[test]
    fn empty_query_produces_no_where() {
        assert_eq!(Query::new().sql(), "");
    }

    #[test]
    fn in_clause_binds_every_value() {
        let q = Query::new().equal_any("id", &["a", "b", "c"]);
        assert_eq!(q.sql(), " WHERE id IN (?,?,?)");
        assert_eq!(q.binds().len(), 3);
    }
}
