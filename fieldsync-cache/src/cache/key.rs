//! Canonical cache keys for collection queries and single documents.
//!
//! A [`QueryKey`] can only be built through [`QueryKey::collection`] or
//! [`QueryKey::document`], and both canonicalize their input: filters are a
//! set, list operands are sets, integral floats collapse to integers and
//! native timestamp objects collapse to their RFC 3339 form. Two specs that
//! differ only in construction order therefore land on the same cache slot.

use std::fmt;

use fieldsync_core::{normalize_json_timestamps, Filter, QuerySpec};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Signature of the empty specification ("whole collection").
pub const NO_FILTER_SIGNATURE: &str = "*";

/// Cache slot address.
///
/// Equality and hashing cover the collection plus either the query digest or
/// the document id. The collection is kept as a separate field so collection
/// invalidation never matches a sibling collection sharing a name prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey {
    inner: KeyInner,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct KeyInner {
    collection: String,
    target: KeyTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum KeyTarget {
    Query { digest: String },
    Document { id: String },
}

impl QueryKey {
    /// Key for a collection read. `None` and an empty spec are the same key.
    pub fn collection(collection: impl Into<String>, query: Option<&QuerySpec>) -> Self {
        let signature = canonical_signature(query);
        Self {
            inner: KeyInner {
                collection: collection.into(),
                target: KeyTarget::Query {
                    digest: digest(&signature),
                },
            },
        }
    }

    /// Key for a single-document read.
    pub fn document(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            inner: KeyInner {
                collection: collection.into(),
                target: KeyTarget::Document { id: id.into() },
            },
        }
    }

    pub fn collection_name(&self) -> &str {
        &self.inner.collection
    }

    pub fn is_document(&self) -> bool {
        matches!(self.inner.target, KeyTarget::Document { .. })
    }

    /// Document id for document keys.
    pub fn document_id(&self) -> Option<&str> {
        match &self.inner.target {
            KeyTarget::Document { id } => Some(id),
            KeyTarget::Query { .. } => None,
        }
    }

    pub fn belongs_to(&self, collection: &str) -> bool {
        self.inner.collection == collection
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner.target {
            KeyTarget::Query { digest } => write!(f, "{}::q:{}", self.inner.collection, digest),
            KeyTarget::Document { id } => write!(f, "{}::doc:{}", self.inner.collection, id),
        }
    }
}

/// Canonical textual form of a query specification.
///
/// Never fails. An absent or empty spec maps to [`NO_FILTER_SIGNATURE`].
pub fn canonical_signature(query: Option<&QuerySpec>) -> String {
    let Some(spec) = query.filter(|spec| !spec.is_empty()) else {
        return NO_FILTER_SIGNATURE.to_string();
    };

    let mut filters: Vec<String> = spec.filters.iter().map(canonical_filter).collect();
    filters.sort();
    filters.dedup();

    let order = spec
        .order_by
        .as_ref()
        .map(|o| format!("{}:{}", quote(&o.field), o.direction.as_str()))
        .unwrap_or_else(|| "-".to_string());
    let limit = spec
        .limit
        .map(|l| l.to_string())
        .unwrap_or_else(|| "-".to_string());

    format!("f=[{}];o={};l={}", filters.join(","), order, limit)
}

fn canonical_filter(filter: &Filter) -> String {
    let mut value = filter.value.clone();
    normalize_json_timestamps(&mut value);

    let operand = match (&value, filter.operator.takes_list()) {
        (Value::Array(items), true) => {
            let mut members: Vec<String> = items.iter().map(canonical_value).collect();
            members.sort();
            members.dedup();
            format!("{{{}}}", members.join(","))
        }
        _ => canonical_value(&value),
    };

    format!("({} {} {})", quote(&filter.field), filter.operator.as_str(), operand)
}

/// JSON rendering with sorted object keys and collapsed numeric types.
fn canonical_value(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&canonical_number(n)),
        Value::String(s) => out.push_str(&quote(s)),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&quote(k));
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
    }
}

// 2^53: beyond this f64 no longer represents every integer.
const MAX_EXACT_F64: f64 = 9_007_199_254_740_992.0;

fn canonical_number(n: &serde_json::Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < MAX_EXACT_F64 => (f as i64).to_string(),
        Some(f) => f.to_string(),
        None => n.to_string(),
    }
}

fn quote(s: &str) -> String {
    Value::String(s.to_string()).to_string()
}

fn digest(signature: &str) -> String {
    hex::encode(Sha256::digest(signature.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_core::{Direction, FilterOperator};
    use serde_json::json;

    #[test]
    fn test_empty_spec_is_fixed_key() {
        let none = QueryKey::collection("tasks", None);
        let empty = QueryKey::collection("tasks", Some(&QuerySpec::new()));
        assert_eq!(none, empty);
        assert_eq!(canonical_signature(None), NO_FILTER_SIGNATURE);
    }

    #[test]
    fn test_filter_order_does_not_matter() {
        let a = QuerySpec::new()
            .filter(Filter::eq("status", "open"))
            .filter(Filter::gt("priority", 2));
        let b = QuerySpec::new()
            .filter(Filter::gt("priority", 2))
            .filter(Filter::eq("status", "open"));
        assert_eq!(
            QueryKey::collection("tasks", Some(&a)),
            QueryKey::collection("tasks", Some(&b))
        );
    }

    #[test]
    fn test_duplicate_filters_collapse() {
        let once = QuerySpec::new().filter(Filter::eq("status", "open"));
        let twice = once.clone().filter(Filter::eq("status", "open"));
        assert_eq!(canonical_signature(Some(&once)), canonical_signature(Some(&twice)));
    }

    #[test]
    fn test_list_operands_are_sets() {
        let a = QuerySpec::new().filter(Filter::is_in("status", vec![json!("a"), json!("b")]));
        let b = QuerySpec::new().filter(Filter::is_in("status", vec![json!("b"), json!("a")]));
        assert_eq!(canonical_signature(Some(&a)), canonical_signature(Some(&b)));
    }

    #[test]
    fn test_numeric_types_normalized() {
        let int = QuerySpec::new().filter(Filter::eq("priority", 3));
        let float = QuerySpec::new().filter(Filter::eq("priority", 3.0));
        assert_eq!(canonical_signature(Some(&int)), canonical_signature(Some(&float)));

        let fractional = QuerySpec::new().filter(Filter::eq("priority", 3.5));
        assert_ne!(canonical_signature(Some(&int)), canonical_signature(Some(&fractional)));
    }

    #[test]
    fn test_native_timestamp_matches_string_form() {
        let native = QuerySpec::new().filter(Filter::gt(
            "updatedAt",
            json!({"seconds": 1_700_000_000i64, "nanoseconds": 0}),
        ));
        let string = QuerySpec::new().filter(Filter::gt(
            "updatedAt",
            "2023-11-14T22:13:20.000000000Z",
        ));
        assert_eq!(canonical_signature(Some(&native)), canonical_signature(Some(&string)));
    }

    #[test]
    fn test_object_key_order_ignored() {
        let a = QuerySpec::new().filter(Filter::eq("site", json!({"a": 1, "b": 2})));
        let b = QuerySpec::new().filter(Filter::eq("site", json!({"b": 2, "a": 1})));
        assert_eq!(canonical_signature(Some(&a)), canonical_signature(Some(&b)));
    }

    #[test]
    fn test_sort_and_limit_distinguish_keys() {
        let base = QuerySpec::new().filter(Filter::eq("status", "open"));
        let sorted = base.clone().order_by("dueDate", Direction::Asc);
        let sorted_desc = base.clone().order_by("dueDate", Direction::Desc);
        let limited = base.clone().limit(10);

        let keys = [
            QueryKey::collection("tasks", Some(&base)),
            QueryKey::collection("tasks", Some(&sorted)),
            QueryKey::collection("tasks", Some(&sorted_desc)),
            QueryKey::collection("tasks", Some(&limited)),
        ];
        for i in 0..keys.len() {
            for j in (i + 1)..keys.len() {
                assert_ne!(keys[i], keys[j]);
            }
        }
    }

    #[test]
    fn test_operator_distinguishes_keys() {
        let gt = QuerySpec::new().filter(Filter::new("priority", FilterOperator::Gt, 2));
        let gte = QuerySpec::new().filter(Filter::new("priority", FilterOperator::Gte, 2));
        assert_ne!(canonical_signature(Some(&gt)), canonical_signature(Some(&gte)));
    }

    #[test]
    fn test_string_and_number_operands_differ() {
        let number = QuerySpec::new().filter(Filter::eq("code", 7));
        let string = QuerySpec::new().filter(Filter::eq("code", "7"));
        assert_ne!(canonical_signature(Some(&number)), canonical_signature(Some(&string)));
    }

    #[test]
    fn test_collection_and_document_keys() {
        let query = QueryKey::collection("tasks", None);
        let doc = QueryKey::document("tasks", "t-1");
        let other = QueryKey::collection("tasks_archive", None);

        assert!(query.belongs_to("tasks"));
        assert!(doc.belongs_to("tasks"));
        assert!(!other.belongs_to("tasks"));
        assert!(doc.is_document());
        assert_eq!(doc.document_id(), Some("t-1"));
        assert_eq!(query.document_id(), None);
        assert_ne!(query, doc);
        assert!(query.to_string().starts_with("tasks::q:"));
        assert_eq!(doc.to_string(), "tasks::doc:t-1");
    }

    #[test]
    fn test_field_names_are_quoted() {
        // A field containing the tuple syntax must not collide with a real tuple.
        let tricky = QuerySpec::new().filter(Filter::eq("a == 1) (b", 2));
        let plain = QuerySpec::new()
            .filter(Filter::eq("a", 1))
            .filter(Filter::eq("b", 2));
        assert_ne!(canonical_signature(Some(&tricky)), canonical_signature(Some(&plain)));
    }
}
