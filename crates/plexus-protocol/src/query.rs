//! Queries over service records
//!
//! Records are inspected through their serde representation, so any field
//! reachable by a dotted path (`Address.City`) can be filtered or sorted on.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Comparison operator of a [`Condition`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    /// Equal
    Eq,
    /// Not equal
    Ne,
    /// Greater than
    Gt,
    /// Greater than or equal
    Gte,
    /// Less than
    Lt,
    /// Less than or equal
    Lte,
    /// String field contains the value
    Contains,
}

/// A single `field <op> value` test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Dotted field path
    pub field: String,
    /// Operator
    pub op: Operator,
    /// Right-hand side
    pub value: Value,
}

/// Boolean tree of conditions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Criteria {
    /// Leaf condition
    Condition(Condition),
    /// All must match
    And(Vec<Criteria>),
    /// Any must match
    Or(Vec<Criteria>),
}

impl Criteria {
    /// `field == value`
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cond(field, Operator::Eq, value)
    }

    /// Leaf with an arbitrary operator
    pub fn cond(field: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        Self::Condition(Condition {
            field: field.into(),
            op,
            value: value.into(),
        })
    }

    /// Evaluate against a record
    pub fn matches(&self, record: &Value) -> bool {
        match self {
            Self::Condition(c) => c.matches(record),
            Self::And(all) => all.iter().all(|c| c.matches(record)),
            Self::Or(any) => any.iter().any(|c| c.matches(record)),
        }
    }
}

impl Condition {
    /// Evaluate against a record
    pub fn matches(&self, record: &Value) -> bool {
        let field = field_value(record, &self.field).unwrap_or(&Value::Null);
        match self.op {
            Operator::Eq => values_equal(field, &self.value),
            Operator::Ne => !values_equal(field, &self.value),
            Operator::Gt => compare_values(field, &self.value) == Some(Ordering::Greater),
            Operator::Gte => matches!(
                compare_values(field, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::Lt => compare_values(field, &self.value) == Some(Ordering::Less),
            Operator::Lte => matches!(
                compare_values(field, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Operator::Contains => match (field, &self.value) {
                (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
                (Value::Array(items), needle) => items.iter().any(|i| values_equal(i, needle)),
                _ => false,
            },
        }
    }
}

/// Paged read over a service
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Query {
    /// Filter; `None` selects everything
    pub criteria: Option<Criteria>,
    /// Dotted sort field; `None` keeps insertion order
    pub sort_by: Option<String>,
    /// Reverse the sort
    pub descending: bool,
    /// Page number, offset is `page * limit`
    pub page: usize,
    /// Page size; zero means unbounded
    pub limit: usize,
}

impl Query {
    /// Everything, unpaged
    pub fn all() -> Self {
        Self::default()
    }

    /// Everything, one page
    pub fn page(page: usize, limit: usize) -> Self {
        Self {
            page,
            limit,
            ..Self::default()
        }
    }

    /// Set the filter
    pub fn with_criteria(mut self, criteria: Criteria) -> Self {
        self.criteria = Some(criteria);
        self
    }

    /// Set the sort field
    pub fn sorted_by(mut self, field: impl Into<String>) -> Self {
        self.sort_by = Some(field.into());
        self
    }

    /// Reverse the sort
    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    /// The plan only depends on filter and sort, not on paging
    pub fn needs_plan(&self) -> bool {
        self.criteria.is_some() || self.sort_by.is_some()
    }

    /// Canonical text of the planning part of the query (criteria, sort,
    /// direction). Two queries that differ only in paging share it.
    pub fn plan_signature(&self) -> String {
        // object keys serialize sorted, so the text is stable
        serde_json::to_string(&(&self.criteria, &self.sort_by, self.descending))
            .unwrap_or_default()
    }

    /// Offset of the first row of the requested page
    pub fn offset(&self) -> usize {
        self.page.saturating_mul(self.limit)
    }
}

/// Resolve a dotted path inside a record
pub fn field_value<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(record);
    }
    path.split('.').try_fold(record, |current, part| match current {
        Value::Object(map) => map.get(part),
        Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_values(a, b) == Some(Ordering::Equal),
        _ => a == b,
    }
}

/// Order two field values.
///
/// Defined for numbers (signed, unsigned and floating point mixed freely),
/// strings and booleans. Anything else is incomparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
                return Some(x.cmp(&y));
            }
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                return Some(x.cmp(&y));
            }
            x.as_f64()?.partial_cmp(&y.as_f64()?)
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_value_paths() {
        let record = json!({"A": {"B": [10, 20]}, "C": "x"});
        assert_eq!(field_value(&record, "C"), Some(&json!("x")));
        assert_eq!(field_value(&record, "A.B.1"), Some(&json!(20)));
        assert_eq!(field_value(&record, "A.Missing"), None);
    }

    #[test]
    fn test_criteria() {
        let record = json!({"MyString": "alpha", "MyInt": 7, "Tags": ["a", "b"]});
        assert!(Criteria::eq("MyString", "alpha").matches(&record));
        assert!(Criteria::cond("MyInt", Operator::Gt, 3).matches(&record));
        assert!(Criteria::cond("MyInt", Operator::Lte, 7.0).matches(&record));
        assert!(Criteria::cond("MyString", Operator::Contains, "lph").matches(&record));
        assert!(Criteria::cond("Tags", Operator::Contains, "b").matches(&record));
        assert!(
            Criteria::Or(vec![Criteria::eq("MyInt", 1), Criteria::eq("MyInt", 7)]).matches(&record)
        );
        assert!(
            !Criteria::And(vec![Criteria::eq("MyInt", 7), Criteria::eq("MyString", "b")])
                .matches(&record)
        );
        // missing field compares as null
        assert!(Criteria::cond("Nope", Operator::Ne, 1).matches(&record));
    }

    #[test]
    fn test_compare_mixed_numbers() {
        assert_eq!(compare_values(&json!(1), &json!(1.5)), Some(Ordering::Less));
        assert_eq!(compare_values(&json!(-3), &json!(2u64)), Some(Ordering::Less));
        assert_eq!(compare_values(&json!(u64::MAX), &json!(1)), Some(Ordering::Greater));
        assert_eq!(compare_values(&json!("a"), &json!(1)), None);
    }

    #[test]
    fn test_plan_signature_ignores_paging() {
        let a = Query::page(0, 10).sorted_by("MyInt");
        let b = Query::page(3, 50).sorted_by("MyInt");
        let c = Query::page(0, 10).sorted_by("MyString");
        assert_eq!(a.plan_signature(), b.plan_signature());
        assert_ne!(a.plan_signature(), c.plan_signature());
        assert_eq!(b.offset(), 150);
    }
}
