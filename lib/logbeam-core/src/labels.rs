//! Deterministic canonical encoding of a label set, used as the keying
//! function for Loki-style streams and for local-file sink hashing.
//!
//! Design note (spec.md §9): JSON-serializing a `BTreeMap` for every batch
//! would allocate a `serde_json::Value` tree per call. Since labels are
//! already a `BTreeMap` (sorted by key), we instead write a flat
//! `key=value` form with explicit separators directly into a reusable
//! `String` buffer.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use std::collections::hash_map::DefaultHasher;

/// Writes labels into `out` as `k1=v1,k2=v2,...` (keys already sorted by
/// `BTreeMap`'s iteration order). Does not allocate beyond what `out`
/// already has reserved.
pub fn canonical_encode(labels: &BTreeMap<String, String>, out: &mut String) {
    out.clear();
    let mut first = true;
    for (k, v) in labels {
        if !first {
            out.push(',');
        }
        first = false;
        out.push_str(k);
        out.push('=');
        out.push_str(v);
    }
}

/// A stable hash of a label set's canonical encoding, used to key
/// per-stream files in the local-file sink and stream grouping in the
/// remote sink.
pub fn stream_key(labels: &BTreeMap<String, String>) -> u64 {
    let mut buf = String::new();
    canonical_encode(labels, &mut buf);
    let mut hasher = DefaultHasher::new();
    buf.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_encode_is_sorted_and_deterministic() {
        let mut labels = BTreeMap::new();
        labels.insert("b".to_string(), "2".to_string());
        labels.insert("a".to_string(), "1".to_string());
        let mut out = String::new();
        canonical_encode(&labels, &mut out);
        assert_eq!(out, "a=1,b=2");
    }

    #[test]
    fn stream_key_is_stable_across_insertion_order() {
        let mut l1 = BTreeMap::new();
        l1.insert("host".to_string(), "a".to_string());
        l1.insert("app".to_string(), "b".to_string());

        let mut l2 = BTreeMap::new();
        l2.insert("app".to_string(), "b".to_string());
        l2.insert("host".to_string(), "a".to_string());

        assert_eq!(stream_key(&l1), stream_key(&l2));
    }

    #[test]
    fn stream_key_differs_on_value_change() {
        let mut l1 = BTreeMap::new();
        l1.insert("host".to_string(), "a".to_string());
        let mut l2 = BTreeMap::new();
        l2.insert("host".to_string(), "b".to_string());
        assert_ne!(stream_key(&l1), stream_key(&l2));
    }
}
