//! Per-dependency outcomes and the composite result built from them.

use crate::error::DependencyUnavailable;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::time::Duration;

/// What one guarded dependency call produced.
///
/// `value` is always present: the real value on success, the dependency's fallback otherwise.
/// Equality ignores `elapsed`.
#[derive(Debug, Clone, Serialize)]
pub struct CallOutcome<V> {
    pub dependency: String,
    pub succeeded: bool,
    pub value: V,
    pub used_fallback: bool,
    pub attempts: u32,
    #[serde(rename = "elapsed_ms", serialize_with = "millis")]
    pub elapsed: Duration,
    #[serde(serialize_with = "display_opt")]
    pub failure: Option<DependencyUnavailable>,
}

impl<V> CallOutcome<V> {
    pub fn success(dependency: impl Into<String>, value: V, attempts: u32, elapsed: Duration) -> Self {
        Self {
            dependency: dependency.into(),
            succeeded: true,
            value,
            used_fallback: false,
            attempts,
            elapsed,
            failure: None,
        }
    }

    pub fn fallback(
        dependency: impl Into<String>,
        fallback: V,
        failure: DependencyUnavailable,
        attempts: u32,
        elapsed: Duration,
    ) -> Self {
        Self {
            dependency: dependency.into(),
            succeeded: false,
            value: fallback,
            used_fallback: true,
            attempts,
            elapsed,
            failure: Some(failure),
        }
    }
}

impl<V: PartialEq> PartialEq for CallOutcome<V> {
    fn eq(&self, other: &Self) -> bool {
        self.dependency == other.dependency
            && self.succeeded == other.succeeded
            && self.value == other.value
            && self.used_fallback == other.used_fallback
            && self.attempts == other.attempts
            && self.failure == other.failure
    }
}

fn millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

fn display_opt<S: Serializer>(f: &Option<DependencyUnavailable>, s: S) -> Result<S::Ok, S::Error> {
    match f {
        Some(failure) => s.collect_str(failure),
        None => s.serialize_none(),
    }
}

/// Primary entity plus exactly one outcome per required dependency.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompositeResult<P, V> {
    pub primary: P,
    pub parts: BTreeMap<String, CallOutcome<V>>,
}

impl<P, V> CompositeResult<P, V> {
    pub fn part(&self, dependency: &str) -> Option<&CallOutcome<V>> {
        self.parts.get(dependency)
    }

    /// The value for `dependency`, real or fallback.
    pub fn value(&self, dependency: &str) -> Option<&V> {
        self.parts.get(dependency).map(|o| &o.value)
    }

    /// Names of dependencies that fell back, in name order.
    pub fn degraded(&self) -> impl Iterator<Item = &str> {
        self.parts.values().filter(|o| o.used_fallback).map(|o| o.dependency.as_str())
    }

    pub fn is_degraded(&self) -> bool {
        self.parts.values().any(|o| o.used_fallback)
    }
}

/// Maps a composite result to the response shape a caller wants.
pub trait Assembler<P, V> {
    type Output;

    fn assemble(&self, composite: CompositeResult<P, V>) -> Self::Output;
}

impl<P, V, O, F> Assembler<P, V> for F
where
    F: Fn(CompositeResult<P, V>) -> O,
{
    type Output = O;

    fn assemble(&self, composite: CompositeResult<P, V>) -> O {
        self(composite)
    }
}

/// Flattens a composite into one JSON object: the primary's fields, one field per dependency
/// holding its value, and a `degraded` list naming the dependencies that fell back.
///
/// Nothing is overwritten. A dependency whose name is already taken (by a primary field,
/// `degraded` or `dependencies`) is placed under a `dependencies` object instead. A primary that
/// does not serialize to an object, or that has a `degraded` or `dependencies` field of its own,
/// is placed under `primary`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMerge;

const MERGE_RESERVED: [&str; 2] = ["degraded", "dependencies"];

impl<P: Serialize> Assembler<P, serde_json::Value> for JsonMerge {
    type Output = serde_json::Value;

    fn assemble(&self, composite: CompositeResult<P, serde_json::Value>) -> serde_json::Value {
        let degraded: Vec<String> = composite.degraded().map(str::to_owned).collect();
        let mut object = match serde_json::to_value(&composite.primary) {
            Ok(serde_json::Value::Object(map))
                if !MERGE_RESERVED.iter().any(|key| map.contains_key(*key)) =>
            {
                map
            }
            Ok(other) => serde_json::Map::from_iter([("primary".to_owned(), other)]),
            Err(e) => {
                tracing::warn!(error = %e, "primary entity did not serialize");
                serde_json::Map::new()
            }
        };

        let mut nested = serde_json::Map::new();
        for (name, outcome) in composite.parts {
            if object.contains_key(&name) || MERGE_RESERVED.contains(&name.as_str()) {
                nested.insert(name, outcome.value);
            } else {
                object.insert(name, outcome.value);
            }
        }
        if !nested.is_empty() {
            object.insert("dependencies".to_owned(), nested.into());
        }
        object.insert("degraded".to_owned(), degraded.into());
        serde_json::Value::Object(object)
    }
}

/// Result of creating a primary entity with an optional downstream side effect.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateOutcome<P, V> {
    pub key: u64,
    pub primary: P,
    pub side_effect: Option<CallOutcome<V>>,
    /// The side effect failed and was parked for redelivery.
    pub pending: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DependencyError;
    use serde_json::json;

    fn composite() -> CompositeResult<serde_json::Value, serde_json::Value> {
        let mut parts = BTreeMap::new();
        parts.insert(
            "details".to_owned(),
            CallOutcome::success("details", json!({"words": 120}), 1, Duration::from_millis(4)),
        );
        parts.insert(
            "comments".to_owned(),
            CallOutcome::fallback(
                "comments",
                json!([]),
                DependencyUnavailable::Exhausted {
                    attempts: 3,
                    last: DependencyError::Connect("refused".into()),
                },
                3,
                Duration::from_millis(700),
            ),
        );
        CompositeResult { primary: json!({"id": 1, "title": "hello"}), parts }
    }

    #[test]
    fn equality_ignores_elapsed() {
        let a = CallOutcome::success("details", 1, 1, Duration::from_millis(3));
        let b = CallOutcome::success("details", 1, 1, Duration::from_secs(9));
        assert_eq!(a, b);
        let c = CallOutcome::success("details", 1, 2, Duration::from_millis(3));
        assert_ne!(a, c);
    }

    #[test]
    fn serializes_elapsed_as_millis_and_failure_as_text() {
        let value = serde_json::to_value(composite()).unwrap();
        let comments = &value["parts"]["comments"];
        assert_eq!(comments["elapsed_ms"], 700);
        assert_eq!(comments["used_fallback"], true);
        assert!(comments["failure"].as_str().unwrap().contains("3 attempts"));
        assert!(value["parts"]["details"]["failure"].is_null());
    }

    #[test]
    fn degraded_lists_fallbacks() {
        let c = composite();
        assert!(c.is_degraded());
        assert_eq!(c.degraded().collect::<Vec<_>>(), vec!["comments"]);
        assert_eq!(c.value("details"), Some(&json!({"words": 120})));
    }

    #[test]
    fn closure_assembler() {
        let count = |c: CompositeResult<serde_json::Value, serde_json::Value>| c.parts.len();
        assert_eq!(count.assemble(composite()), 2);
    }

    #[test]
    fn json_merge_flattens() {
        let merged = JsonMerge.assemble(composite());
        assert_eq!(
            merged,
            json!({
                "id": 1,
                "title": "hello",
                "details": {"words": 120},
                "comments": [],
                "degraded": ["comments"],
            })
        );
    }

    #[test]
    fn json_merge_never_overwrites() {
        let mut c = composite();
        for name in ["title", "degraded"] {
            c.parts.insert(
                name.to_owned(),
                CallOutcome::success(name, json!(format!("from {name}")), 1, Duration::ZERO),
            );
        }

        let merged = JsonMerge.assemble(c);
        assert_eq!(merged["title"], "hello");
        assert_eq!(merged["degraded"], json!(["comments"]));
        assert_eq!(
            merged["dependencies"],
            json!({"title": "from title", "degraded": "from degraded"})
        );
        assert_eq!(merged["details"], json!({"words": 120}));
    }

    #[test]
    fn json_merge_nests_a_primary_with_reserved_fields() {
        let mut c = composite();
        c.primary = json!({"id": 1, "degraded": false});

        let merged = JsonMerge.assemble(c);
        assert_eq!(merged["primary"], json!({"id": 1, "degraded": false}));
        assert_eq!(merged["degraded"], json!(["comments"]));
    }
}
