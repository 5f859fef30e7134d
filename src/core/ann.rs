//! Approximate nearest-neighbor index over a snapshot of the embedding store.
//!
//! The index is an HNSW graph under cosine distance. Records are inserted
//! under their dense slot positions `0..N`, so a position returned by a
//! query maps straight back to the record slice the index was built from.
//!
//! Graph construction draws random layer levels and is not seedable, so two
//! builds may differ internally. Results are sorted by distance and then by
//! position, which keeps the returned set stable when the search beam covers
//! the candidates.

use hnsw_rs::prelude::*;

use crate::error::{AppError, Result};
use crate::models::embedding::EmbeddingRecord;

/// Links kept per node and layer.
pub const DEFAULT_MAX_CONNECTIONS: usize = 32;
/// Candidate list size while inserting.
pub const DEFAULT_EF_CONSTRUCTION: usize = 400;
/// Candidate list size while searching; raised to `n` when smaller.
pub const DEFAULT_EF_SEARCH: usize = 128;

const MAX_LAYERS: usize = 16;

/// Read side of an ANN structure, addressed by dense positions `0..len`.
pub trait AnnIndex: Send + Sync {
    /// Up to `n` positions nearest to the item at `position`, nearest first.
    ///
    /// The item itself is not excluded and normally comes back first.
    fn nearest_to_item(&self, position: usize, n: usize) -> Result<Vec<usize>>;

    /// Number of indexed items.
    fn len(&self) -> usize;

    /// Whether the index holds no items.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Vector dimensionality.
    fn dims(&self) -> usize;
}

/// Builds an [`HnswIndex`] from a full set of records.
#[derive(Debug, Clone)]
pub struct AnnIndexBuilder {
    max_connections: usize,
    ef_construction: usize,
    ef_search: usize,
}

impl Default for AnnIndexBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_EF_CONSTRUCTION)
    }
}

impl AnnIndexBuilder {
    /// A builder inserting with a candidate list of `ef_construction`.
    pub fn new(ef_construction: usize) -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            ef_construction: ef_construction.max(1),
            ef_search: DEFAULT_EF_SEARCH,
        }
    }

    /// Candidate list size used by queries against the built index.
    pub fn with_ef_search(mut self, ef_search: usize) -> Self {
        self.ef_search = ef_search.max(1);
        self
    }

    /// Links kept per node and layer.
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    /// Index `records`, assigning each the position of its slot in the slice.
    pub fn build(&self, records: &[EmbeddingRecord]) -> Result<HnswIndex> {
        let first = records.first().ok_or(AppError::EmptyCorpus)?;
        let dims = first.dims();
        if dims == 0 {
            return Err(AppError::InvalidInput(format!(
                "record {} has an empty vector",
                first.identifier
            )));
        }
        if let Some(bad) = records.iter().find(|r| r.dims() != dims) {
            return Err(AppError::DimensionMismatch {
                identifier: bad.identifier.clone(),
                expected: dims,
                found: bad.dims(),
            });
        }

        let hnsw = Hnsw::<f32, DistCosine>::new(
            self.max_connections,
            records.len(),
            MAX_LAYERS,
            self.ef_construction,
            DistCosine,
        );
        for (position, record) in records.iter().enumerate() {
            hnsw.insert((record.vector.as_slice(), position));
        }

        log::debug!(
            "Built HNSW index: {} items, {} dims, ef_construction {}",
            records.len(),
            dims,
            self.ef_construction
        );
        Ok(HnswIndex {
            dims,
            vectors: records.iter().map(|r| r.vector.clone()).collect(),
            hnsw,
            ef_search: self.ef_search,
        })
    }
}

/// HNSW graph under cosine distance.
pub struct HnswIndex {
    dims: usize,
    vectors: Vec<Vec<f32>>,
    hnsw: Hnsw<'static, f32, DistCosine>,
    ef_search: usize,
}

impl std::fmt::Debug for HnswIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HnswIndex")
            .field("dims", &self.dims)
            .field("len", &self.vectors.len())
            .field("ef_search", &self.ef_search)
            .finish_non_exhaustive()
    }
}

impl AnnIndex for HnswIndex {
    fn nearest_to_item(&self, position: usize, n: usize) -> Result<Vec<usize>> {
        let query = self.vectors.get(position).ok_or_else(|| {
            AppError::InvalidInput(format!(
                "position {} outside index of {} items",
                position,
                self.vectors.len()
            ))
        })?;
        if n == 0 {
            return Ok(Vec::new());
        }

        let mut found: Vec<(f32, usize)> = self
            .hnsw
            .search(query, n, self.ef_search.max(n))
            .into_iter()
            .map(|neighbour| (neighbour.distance, neighbour.d_id))
            .collect();
        found.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        found.dedup_by_key(|(_, id)| *id);
        found.truncate(n);

        Ok(found.into_iter().map(|(_, id)| id).collect())
    }

    fn len(&self) -> usize {
        self.vectors.len()
    }

    fn dims(&self) -> usize {
        self.dims
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, v: &[f32]) -> EmbeddingRecord {
        EmbeddingRecord::new(id, v.to_vec())
    }

    fn sorted(mut ids: Vec<usize>) -> Vec<usize> {
        ids.sort_unstable();
        ids
    }

    fn spiral(count: usize) -> Vec<EmbeddingRecord> {
        (0..count)
            .map(|i| {
                let t = (i as f32).powf(1.3) * 0.07;
                record(&format!("r{}", i), &[t.cos(), t.sin(), 0.2 + 0.01 * i as f32])
            })
            .collect()
    }

    #[test]
    fn test_empty_corpus_fails() {
        let err = AnnIndexBuilder::default().build(&[]).unwrap_err();
        assert!(matches!(err, AppError::EmptyCorpus));
    }

    #[test]
    fn test_dimension_mismatch_fails_fast() {
        let records = vec![record("a", &[1.0, 0.0]), record("b", &[1.0, 0.0, 0.0])];
        match AnnIndexBuilder::default().build(&records) {
            Err(AppError::DimensionMismatch { identifier, expected, found }) => {
                assert_eq!(identifier, "b");
                assert_eq!(expected, 2);
                assert_eq!(found, 3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_empty_vectors_are_rejected() {
        let records = vec![record("a", &[])];
        assert!(matches!(
            AnnIndexBuilder::default().build(&records),
            Err(AppError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_self_is_nearest_and_results_are_capped() {
        let records = vec![
            record("a", &[1.0, 0.0, 0.0]),
            record("b", &[0.9, 0.1, 0.0]),
            record("c", &[0.0, 0.0, 1.0]),
        ];
        let index = AnnIndexBuilder::default().build(&records).unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(index.dims(), 3);
        assert_eq!(index.nearest_to_item(0, 30).unwrap(), vec![0, 1, 2]);
        assert_eq!(index.nearest_to_item(0, 2).unwrap(), vec![0, 1]);
        assert!(index.nearest_to_item(0, 0).unwrap().is_empty());
        assert!(matches!(index.nearest_to_item(7, 1), Err(AppError::InvalidInput(_))));
    }

    #[test]
    fn test_duplicates_are_ordered_by_position() {
        let records = vec![
            record("a", &[1.0, 0.0, 0.0]),
            record("b", &[1.0, 0.0, 0.0]),
            record("c", &[1.0, 0.0, 0.0]),
        ];
        let index = AnnIndexBuilder::default().build(&records).unwrap();
        assert_eq!(index.nearest_to_item(2, 3).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_clusters_stay_separate() {
        let mut records = Vec::new();
        for i in 0..40 {
            let jitter = i as f32 * 0.001;
            records.push(record(&format!("x{}", i), &[1.0, jitter, 0.0, 0.0]));
            records.push(record(&format!("y{}", i), &[0.0, 0.0, 1.0, jitter]));
        }
        let index = AnnIndexBuilder::new(64)
            .with_max_connections(8)
            .build(&records)
            .unwrap();

        let found = index.nearest_to_item(0, 10).unwrap();
        assert_eq!(found.len(), 10);
        assert_eq!(found[0], 0);
        assert!(found.iter().all(|&p| records[p].identifier.starts_with('x')));
    }

    #[test]
    fn test_unseeded_rebuilds_return_the_same_set() {
        let records = spiral(60);
        let builder = AnnIndexBuilder::default();

        for query in [0, 17, 59] {
            let first = builder.build(&records).unwrap().nearest_to_item(query, 8).unwrap();
            let second = builder.build(&records).unwrap().nearest_to_item(query, 8).unwrap();
            assert_eq!(first.len(), 8);
            assert_eq!(sorted(first), sorted(second));
        }
    }
}
