//! Query Key Module
//!
//! Structured identifiers for cached reads: a resource name followed by any
//! number of filter segments, with one canonical serialization.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

// == Query Key ==
/// Identifies one cached result set.
///
/// Object segments are canonicalized with sorted fields, so
/// `{"page": 1, "level": 2}` and `{"level": 2, "page": 1}` produce the same
/// key. Equality, hashing and ordering all go through the canonical string.
#[derive(Clone)]
pub struct QueryKey {
    segments: Vec<Value>,
    canonical: String,
}

impl QueryKey {
    // == Constructors ==
    /// Key for a whole resource, e.g. `["students"]`.
    pub fn new(resource: impl Into<String>) -> Self {
        Self::from_segments(vec![Value::String(resource.into())])
    }

    /// Key from raw segments.
    pub fn from_segments(segments: impl IntoIterator<Item = Value>) -> Self {
        let segments: Vec<Value> = segments.into_iter().map(canonicalize).collect();
        let canonical = Value::Array(segments.clone()).to_string();
        Self {
            segments,
            canonical,
        }
    }

    /// Extends the key with one more segment, producing a new key.
    pub fn with(self, segment: impl Into<Value>) -> Self {
        let mut segments = self.segments;
        segments.push(segment.into());
        Self::from_segments(segments)
    }

    // == Accessors ==
    pub fn segments(&self) -> &[Value] {
        &self.segments
    }

    /// Leading resource name, if the first segment is a string.
    pub fn resource(&self) -> Option<&str> {
        self.segments.first().and_then(Value::as_str)
    }

    /// Canonical serialized form.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    // == Prefix Matching ==
    /// True if `prefix`'s segments are the leading segments of this key.
    ///
    /// Every key starts with itself; the empty key is a prefix of all keys.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        prefix.segments.len() <= self.segments.len()
            && prefix
                .segments
                .iter()
                .zip(&self.segments)
                .all(|(p, s)| p == s)
    }

    /// True if the key starts with any of `prefixes`.
    pub fn matches_any(&self, prefixes: &[QueryKey]) -> bool {
        prefixes.iter().any(|prefix| self.starts_with(prefix))
    }
}

/// Rebuilds objects with sorted fields, independent of serde_json's map flavor.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<(String, Value)> = map.into_iter().collect();
            fields.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (name, value) in fields {
                sorted.insert(name, canonicalize(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl PartialOrd for QueryKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueryKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryKey({})", self.canonical)
    }
}

impl Serialize for QueryKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.segments.serialize(serializer)
    }
}

impl From<&str> for QueryKey {
    fn from(resource: &str) -> Self {
        QueryKey::new(resource)
    }
}

/// Builds a [`QueryKey`] from a resource name and segment expressions.
///
/// ```
/// use campus_sync::query_key;
/// let key = query_key!["student", 42];
/// assert_eq!(key.canonical(), r#"["student",42]"#);
/// ```
#[macro_export]
macro_rules! query_key {
    ($resource:expr $(, $segment:expr)* $(,)?) => {
        $crate::query::QueryKey::new($resource)$(.with($segment))*
    };
}
