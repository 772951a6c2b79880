//! Primary-key deduplication of row batches
//!
//! A multi-row upsert that touches the same key twice is rejected by most
//! destinations ("ON CONFLICT DO UPDATE command cannot affect row a second
//! time"). [`deduplicate`] splits a batch into buckets with unique keys;
//! applying the buckets in order makes the last occurrence of a key win.

use std::collections::{BTreeSet, HashSet};

use crate::types::{EventRow, Value};

/// Composite key of a row: the string form of each primary-key value, in
/// field order. A missing field counts as NULL.
pub fn composite_key(pk_fields: &BTreeSet<String>, row: &EventRow) -> Vec<String> {
    pk_fields
        .iter()
        .map(|field| row.get(field).unwrap_or(&Value::Null).to_string())
        .collect()
}

/// Partition `rows` into buckets whose composite keys are unique.
///
/// Each pass takes the first unseen occurrence of every key and defers the
/// rest to the next pass. Without duplicates the result is a single bucket;
/// an empty batch yields no buckets.
pub fn deduplicate(pk_fields: &BTreeSet<String>, rows: Vec<EventRow>) -> Vec<Vec<EventRow>> {
    let mut buckets = Vec::new();
    let mut pending = rows;

    while !pending.is_empty() {
        let mut seen = HashSet::with_capacity(pending.len());
        let mut bucket = Vec::with_capacity(pending.len());
        let mut deferred = Vec::new();

        for row in pending {
            if seen.insert(composite_key(pk_fields, &row)) {
                bucket.push(row);
            } else {
                deferred.push(row);
            }
        }

        buckets.push(bucket);
        pending = deferred;
    }

    buckets
}
