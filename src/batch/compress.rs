//! Batch compression: deduplication of structurally identical payloads.
//!
//! Many documents in a batch may yield identical feature payloads for some
//! component, e.g. the output of a shared lookup table. Compression replaces
//! repeated payloads with an index into a deduplicated list built in
//! first-seen order; decompression is the exact inverse. This step is
//! mandatory for data sources that cannot guarantee referential identity
//! between in-memory documents and their payloads (tabular or columnar
//! sources), and it must never change downstream results.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::batch::{ContentHashable, Feature, FeatureBatch};

/// One component's deduplicated column.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedColumn {
    /// Unique payloads in first-seen order.
    pub unique: Vec<Feature>,
    /// For each document, the index of its payload in `unique`.
    pub index: Vec<usize>,
}

/// A compressed batch: one deduplicated column per component name.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompressedBatch {
    /// Columns keyed by component name, order-preserving.
    pub columns: IndexMap<String, CompressedColumn>,
}

/// Deduplicate a batch of feature payloads.
///
/// Payloads are bucketed by structural hash where one exists; payloads
/// containing unhashable opaque leaves fall back to a linear scan over the
/// unique list using deep equality.
pub fn compress(batch: &FeatureBatch) -> CompressedBatch {
    let mut columns = IndexMap::with_capacity(batch.len());
    for (name, payloads) in batch {
        columns.insert(name.clone(), compress_column(payloads));
    }
    CompressedBatch { columns }
}

fn compress_column(payloads: &[Feature]) -> CompressedColumn {
    let mut unique: Vec<Feature> = Vec::new();
    let mut index = Vec::with_capacity(payloads.len());
    // hash -> indices of unique payloads with that hash
    let mut buckets: HashMap<String, Vec<usize>> = HashMap::new();

    for payload in payloads {
        let slot = match payload.content_hash() {
            Some(hash) => {
                let bucket = buckets.entry(hash).or_default();
                match bucket.iter().find(|i| unique[**i] == *payload) {
                    Some(found) => *found,
                    None => {
                        unique.push(payload.clone());
                        bucket.push(unique.len() - 1);
                        unique.len() - 1
                    },
                }
            },
            None => match unique.iter().position(|seen| seen == payload) {
                Some(found) => found,
                None => {
                    unique.push(payload.clone());
                    unique.len() - 1
                },
            },
        };
        index.push(slot);
    }

    CompressedColumn { unique, index }
}

/// Expand a compressed batch back into the original per-document columns.
///
/// Invariant: `decompress(&compress(batch)) == batch` for all batches.
pub fn decompress(compressed: &CompressedBatch) -> FeatureBatch {
    let mut batch = IndexMap::with_capacity(compressed.columns.len());
    for (name, column) in &compressed.columns {
        let payloads = column
            .index
            .iter()
            .map(|i| column.unique[*i].clone())
            .collect();
        batch.insert(name.clone(), payloads);
    }
    batch
}
