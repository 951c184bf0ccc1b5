//! Optimistic Edit Module
//!
//! Local cache edits applied before the server confirms a write.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::query::QueryKey;

type Apply<V> = Box<dyn FnOnce(Option<Value>, &V) -> Result<Value> + Send>;
type Reconcile<R> = Box<dyn FnOnce(Option<Value>, &R) -> Result<Value> + Send>;

// == Optimistic Edit ==
/// An edit to one cached key, computed from the mutation's variables.
///
/// ```
/// use campus_sync::mutation::Optimistic;
/// use campus_sync::query_key;
/// use serde_json::{json, Value};
///
/// let edit: Optimistic<String, Value> = Optimistic::new(
///     query_key!["student", 7],
///     |current: Option<Value>, name: &String| {
///         let mut student = current.unwrap_or_else(|| json!({}));
///         student["first_name"] = json!(name);
///         student
///     },
/// );
/// assert_eq!(edit.key(), &query_key!["student", 7]);
/// ```
pub struct Optimistic<V, R> {
    pub(crate) key: QueryKey,
    pub(crate) apply: Apply<V>,
    pub(crate) reconcile: Option<Reconcile<R>>,
}

impl<V, R> Optimistic<V, R> {
    /// Edit `key` with `apply(current, &variables)` before the write is sent.
    pub fn new<D, F>(key: QueryKey, apply: F) -> Self
    where
        D: Serialize + DeserializeOwned,
        F: FnOnce(Option<D>, &V) -> D + Send + 'static,
    {
        Self {
            key,
            apply: Box::new(move |current, variables| {
                let current = current.map(serde_json::from_value::<D>).transpose()?;
                Ok(serde_json::to_value(apply(current, variables))?)
            }),
            reconcile: None,
        }
    }

    /// On success, replace the optimistic value with `reconcile(current, &result)`.
    ///
    /// Skipped if the entry changed again after the optimistic edit.
    pub fn reconcile<D, F>(mut self, reconcile: F) -> Self
    where
        D: Serialize + DeserializeOwned,
        F: FnOnce(Option<D>, &R) -> D + Send + 'static,
    {
        self.reconcile = Some(Box::new(move |current, result| {
            let current = current.map(serde_json::from_value::<D>).transpose()?;
            Ok(serde_json::to_value(reconcile(current, result))?)
        }));
        self
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }
}

impl<V, R: Serialize> Optimistic<V, R> {
    /// On success, store the server's response as the entry's value.
    pub fn adopt_result(mut self) -> Self {
        self.reconcile = Some(Box::new(|_, result| Ok(serde_json::to_value(result)?)));
        self
    }
}

impl<V, R> std::fmt::Debug for Optimistic<V, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Optimistic")
            .field("key", &self.key)
            .field("reconciles", &self.reconcile.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_apply_is_typed_at_the_boundary() {
        let edit: Optimistic<u32, ()> =
            Optimistic::new(QueryKey::new("count"), |current: Option<u32>, by: &u32| {
                current.unwrap_or(0) + by
            });
        let next = (edit.apply)(Some(json!(2)), &3).unwrap();
        assert_eq!(next, json!(5));
    }

    #[test]
    fn test_apply_rejects_mismatched_cached_type() {
        let edit: Optimistic<u32, ()> =
            Optimistic::new(QueryKey::new("count"), |current: Option<u32>, by: &u32| {
                current.unwrap_or(0) + by
            });
        assert!((edit.apply)(Some(json!("two")), &3).is_err());
    }

    #[test]
    fn test_adopt_result() {
        let edit: Optimistic<(), Value> =
            Optimistic::new(QueryKey::new("student"), |_: Option<Value>, _: &()| json!({}))
                .adopt_result();
        let reconcile = edit.reconcile.unwrap();
        assert_eq!(
            reconcile(Some(json!({})), &json!({"id": 1})).unwrap(),
            json!({"id": 1})
        );
    }
}
