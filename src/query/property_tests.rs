//! Property-Based Tests for Query Module
//!
//! Uses proptest to check key canonicalization, fetch ordering and optimistic rollback.

use proptest::prelude::*;
use serde_json::{json, Map, Value};
use std::time::Duration;

use crate::error::RequestError;
use crate::query::{CacheEntry, QueryKey, QueryStatus};

// == Strategies ==
/// Flat filter objects as (field, value) pairs with unique fields
fn filter_fields_strategy() -> impl Strategy<Value = Vec<(String, i64)>> {
    prop::collection::btree_map("[a-z_]{1,12}", any::<i64>(), 0..6)
        .prop_map(|fields| fields.into_iter().collect())
}

fn segment_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        "[a-z-]{1,16}".prop_map(Value::String),
        any::<u32>().prop_map(|n| json!(n)),
        any::<bool>().prop_map(Value::Bool),
    ]
}

/// Fetch completions in some arbitrary order, each either a success or a failure
fn completion_order_strategy() -> impl Strategy<Value = Vec<(u64, bool)>> {
    (1u64..12).prop_flat_map(|n| {
        (
            Just((1..=n).collect::<Vec<u64>>()).prop_shuffle(),
            prop::collection::vec(any::<bool>(), n as usize),
        )
            .prop_map(|(order, outcomes)| order.into_iter().zip(outcomes).collect())
    })
}

fn object_from(fields: &[(String, i64)]) -> Value {
    let mut map = Map::new();
    for (name, value) in fields {
        map.insert(name.clone(), json!(value));
    }
    Value::Object(map)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    // Two keys built from the same filter fields in different insertion
    // orders are the same key.
    #[test]
    fn prop_field_order_does_not_change_key(fields in filter_fields_strategy()) {
        let mut reversed = fields.clone();
        reversed.reverse();

        let a = QueryKey::new("students").with(object_from(&fields));
        let b = QueryKey::new("students").with(object_from(&reversed));

        prop_assert_eq!(a.canonical(), b.canonical());
        prop_assert_eq!(a, b);
    }

    // Every leading slice of a key's segments is a prefix of that key, and
    // no longer key is.
    #[test]
    fn prop_leading_segments_are_prefixes(
        segments in prop::collection::vec(segment_strategy(), 1..6),
        extra in segment_strategy(),
    ) {
        let key = QueryKey::from_segments(segments.clone());
        for len in 0..=segments.len() {
            let prefix = QueryKey::from_segments(segments[..len].to_vec());
            prop_assert!(key.starts_with(&prefix));
        }

        let longer = key.clone().with(extra);
        prop_assert!(!key.starts_with(&longer));
    }

    // Whatever order completions arrive in, the entry ends up reflecting the
    // most recently issued fetch, and applied completions only move forward.
    #[test]
    fn prop_latest_issued_fetch_wins(completions in completion_order_strategy()) {
        let mut entry = CacheEntry::new(QueryKey::new("classes"), Duration::from_secs(60));
        let issued: Vec<u64> = completions.iter().map(|_| entry.begin_fetch()).collect();
        let latest = *issued.last().unwrap();

        let mut last_applied = 0;
        for (seq, ok) in &completions {
            let result = if *ok {
                Ok(json!(seq))
            } else {
                Err(RequestError::Network(format!("fetch {} failed", seq)))
            };
            if entry.apply_fetch(*seq, result) {
                prop_assert!(*seq > last_applied);
                last_applied = *seq;
            }
        }

        prop_assert_eq!(last_applied, latest);
        let latest_ok = completions.iter().any(|(seq, ok)| *seq == latest && *ok);
        if latest_ok {
            prop_assert_eq!(entry.status(), QueryStatus::Success);
            prop_assert_eq!(entry.data(), Some(&json!(latest)));
        } else {
            prop_assert_eq!(entry.status(), QueryStatus::Error);
        }
    }

    // However the outstanding optimistic edits on one entry are rolled back,
    // the entry ends up with the data and version it had before the first.
    #[test]
    fn prop_rollbacks_in_any_order_restore_base(
        order in (1usize..8).prop_flat_map(|n| Just((0..n).collect::<Vec<usize>>()).prop_shuffle()),
    ) {
        let mut entry = CacheEntry::new(QueryKey::new("levels"), Duration::ZERO);
        let base = entry.set_data(json!("base"));
        let edits: Vec<u64> = (0..order.len())
            .map(|i| entry.apply_optimistic(json!(i)))
            .collect();
        prop_assert!(edits.windows(2).all(|w| w[0] < w[1]));
        prop_assert!(edits[0] > base);

        for i in order {
            prop_assert!(entry.rollback_optimistic(edits[i]));
        }

        prop_assert_eq!(entry.data(), Some(&json!("base")));
        prop_assert_eq!(entry.version(), base);
        // The next change still gets a version never seen before
        let next = entry.set_data(json!("next"));
        prop_assert!(edits.iter().all(|v| next > *v));
    }
}
