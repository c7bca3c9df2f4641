//! Filters over stored documents.
//!
//! Documents are compared as JSON, so any serialised field can be used for
//! sorting or matching. Field paths are dot-separated (`status.lastRunId`).

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde_json::Value;

/// Sort, page and match options for a `find`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    /// Fields to sort by, in priority order; `-field` sorts descending.
    pub sort: Vec<String>,
    pub skip: usize,
    /// Maximum number of documents returned; 0 means no limit.
    pub limit: usize,
    pub namespace: Option<String>,
    pub name: Option<String>,
    /// Field path -> required value.
    pub predicate: BTreeMap<String, Value>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>) -> Self {
        self.sort.push(field.into());
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn field(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.predicate.insert(path.into(), value.into());
        self
    }

    /// Filter, sort and page `docs`. `name_field` is the document field the
    /// `name` filter applies to for this collection.
    pub fn apply(&self, docs: Vec<Value>, name_field: &str) -> Vec<Value> {
        let mut matched: Vec<Value> = docs
            .into_iter()
            .filter(|doc| self.matches(doc, name_field))
            .collect();

        if !self.sort.is_empty() {
            // `sort_by` is stable, so equal keys keep their stored order.
            matched.sort_by(|a, b| self.compare(a, b));
        }

        let iter = matched.into_iter().skip(self.skip);
        if self.limit > 0 {
            iter.take(self.limit).collect()
        } else {
            iter.collect()
        }
    }

    fn matches(&self, doc: &Value, name_field: &str) -> bool {
        if let Some(ns) = &self.namespace {
            let doc_ns = lookup(doc, "namespace").and_then(Value::as_str).unwrap_or("");
            if doc_ns != ns {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if lookup(doc, name_field).and_then(Value::as_str) != Some(name.as_str()) {
                return false;
            }
        }
        self.predicate
            .iter()
            .all(|(path, want)| lookup(doc, path) == Some(want))
    }

    fn compare(&self, a: &Value, b: &Value) -> Ordering {
        for key in &self.sort {
            let (field, descending) = match key.strip_prefix('-') {
                Some(f) => (f, true),
                None => (key.as_str(), false),
            };
            let ord = compare_values(lookup(a, field), lookup(b, field));
            let ord = if descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |v, segment| v.get(segment))
}

/// Total order over optional JSON values: missing < null < bool < number <
/// string < everything else (compared by serialised text).
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None => 0,
            Some(Value::Null) => 1,
            Some(Value::Bool(_)) => 2,
            Some(Value::Number(_)) => 3,
            Some(Value::String(_)) => 4,
            Some(_) => 5,
        }
    }
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x), Some(y)) if rank(a) == 5 && rank(b) == 5 => x.to_string().cmp(&y.to_string()),
        _ => rank(a).cmp(&rank(b)),
    }
}
