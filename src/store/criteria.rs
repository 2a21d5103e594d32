use chrono::DateTime;
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    In,
    LessThan,
    GreaterThan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Composable query criterion. Field names are the serialized entity field names.
#[derive(Debug, Clone, PartialEq)]
pub enum Criterion {
    Field {
        field: String,
        op: Operator,
        values: Vec<String>,
    },
    OrderBy {
        field: String,
        order: SortOrder,
    },
    Limit(usize),
}

impl Criterion {
    pub fn equals(field: &str, value: impl Into<String>) -> Self {
        Self::field(field, Operator::Equals, vec![value.into()])
    }

    pub fn not_equals(field: &str, value: impl Into<String>) -> Self {
        Self::field(field, Operator::NotEquals, vec![value.into()])
    }

    pub fn in_values<I, V>(field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        Self::field(field, Operator::In, values.into_iter().map(Into::into).collect())
    }

    pub fn less_than(field: &str, value: impl Into<String>) -> Self {
        Self::field(field, Operator::LessThan, vec![value.into()])
    }

    pub fn greater_than(field: &str, value: impl Into<String>) -> Self {
        Self::field(field, Operator::GreaterThan, vec![value.into()])
    }

    pub fn order_by(field: &str, order: SortOrder) -> Self {
        Self::OrderBy {
            field: field.to_string(),
            order,
        }
    }

    pub fn limit(limit: usize) -> Self {
        Self::Limit(limit)
    }

    fn field(field: &str, op: Operator, values: Vec<String>) -> Self {
        Self::Field {
            field: field.to_string(),
            op,
            values,
        }
    }
}

/// Textual form of a JSON field, matching Postgres' `->>` operator.
pub fn field_text(document: &Value, field: &str) -> Option<String> {
    match document.get(field)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Compares two field texts as numbers or timestamps when both sides parse, else as text.
fn compare_text(left: &str, right: &str) -> Ordering {
    if let (Ok(l), Ok(r)) = (left.parse::<f64>(), right.parse::<f64>()) {
        return l.partial_cmp(&r).unwrap_or(Ordering::Equal);
    }
    if let (Ok(l), Ok(r)) = (
        DateTime::parse_from_rfc3339(left),
        DateTime::parse_from_rfc3339(right),
    ) {
        return l.cmp(&r);
    }
    left.cmp(right)
}

pub fn matches(document: &Value, criteria: &[Criterion]) -> bool {
    criteria.iter().all(|criterion| match criterion {
        Criterion::Field { field, op, values } => {
            let actual = field_text(document, field);
            match op {
                Operator::Equals => actual.as_deref() == values.first().map(String::as_str),
                Operator::NotEquals => actual.as_deref() != values.first().map(String::as_str),
                Operator::In => actual.is_some_and(|a| values.contains(&a)),
                Operator::LessThan => match (actual, values.first()) {
                    (Some(a), Some(v)) => compare_text(&a, v) == Ordering::Less,
                    _ => false,
                },
                Operator::GreaterThan => match (actual, values.first()) {
                    (Some(a), Some(v)) => compare_text(&a, v) == Ordering::Greater,
                    _ => false,
                },
            }
        }
        Criterion::OrderBy { .. } | Criterion::Limit(_) => true,
    })
}

/// Applies ordering and limit criteria to already filtered documents.
pub fn order_and_limit(mut documents: Vec<Value>, criteria: &[Criterion]) -> Vec<Value> {
    for criterion in criteria.iter().rev() {
        if let Criterion::OrderBy { field, order } = criterion {
            documents.sort_by(|a, b| {
                let ordering = match (field_text(a, field), field_text(b, field)) {
                    (Some(a), Some(b)) => compare_text(&a, &b),
                    (None, Some(_)) => Ordering::Less,
                    (Some(_), None) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                };
                match order {
                    SortOrder::Asc => ordering,
                    SortOrder::Desc => ordering.reverse(),
                }
            });
        }
    }
    if let Some(limit) = criteria.iter().find_map(|c| match c {
        Criterion::Limit(limit) => Some(*limit),
        _ => None,
    }) {
        documents.truncate(limit);
    }
    documents
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_criteria_compare_textual_values() {
        let doc = json!({"name": "a", "ready": true, "state": "in progress", "count": 10});
        assert!(matches(&doc, &[Criterion::equals("ready", "true")]));
        assert!(matches(&doc, &[Criterion::in_values("state", ["pending", "in progress"])]));
        assert!(matches(&doc, &[Criterion::not_equals("name", "b")]));
        assert!(!matches(&doc, &[Criterion::less_than("count", "9.5")]));
        assert!(matches(&doc, &[Criterion::greater_than("count", "9.5")]));
        assert!(!matches(&doc, &[Criterion::equals("missing", "x")]));
        assert!(matches(&doc, &[Criterion::not_equals("missing", "x")]));
    }

    #[test]
    fn timestamps_compare_chronologically() {
        let doc = json!({"created_at": "2026-01-01T00:00:00.5Z"});
        assert!(matches(&doc, &[Criterion::greater_than("created_at", "2026-01-01T00:00:00Z")]));
        assert!(matches(&doc, &[Criterion::less_than("created_at", "2026-01-01T00:00:01Z")]));
    }

    #[test]
    fn ordering_and_limit_are_applied() {
        let docs = vec![json!({"n": "b"}), json!({"n": "c"}), json!({"n": "a"})];
        let result = order_and_limit(
            docs,
            &[Criterion::order_by("n", SortOrder::Desc), Criterion::limit(2)],
        );
        assert_eq!(result, vec![json!({"n": "c"}), json!({"n": "b"})]);
    }
}
