use ndarray::ArrayView1;

use crate::core::ann::AnnIndex;
use crate::error::{AppError, Result};
use crate::models::embedding::EmbeddingRecord;
use crate::models::results::NeighborResult;

/// Neighbors returned per query unless configured otherwise.
pub const DEFAULT_NEIGHBORS: usize = 30;

/// Attaches exact similarities to the approximate neighbors of a query.
#[derive(Debug, Clone, Copy)]
pub struct SimilarityRanker {
    n: usize,
}

impl Default for SimilarityRanker {
    fn default() -> Self {
        Self::new(DEFAULT_NEIGHBORS)
    }
}

impl SimilarityRanker {
    /// A ranker returning up to `n` neighbors.
    pub fn new(n: usize) -> Self {
        Self { n }
    }

    /// See [`rank`].
    pub fn rank(
        &self,
        index: &dyn AnnIndex,
        records: &[EmbeddingRecord],
        query_identifier: &str,
    ) -> Result<Vec<NeighborResult>> {
        rank(index, records, query_identifier, self.n)
    }
}

/// Top-`n` neighbors of `query_identifier` in the order the index returns them.
///
/// `records` must be the exact slice the index was built from: a record's
/// slot is its index position. Similarities are recomputed exactly from the
/// raw vectors but never used to reorder. The query itself is not excluded.
pub fn rank(
    index: &dyn AnnIndex,
    records: &[EmbeddingRecord],
    query_identifier: &str,
    n: usize,
) -> Result<Vec<NeighborResult>> {
    if index.len() != records.len() {
        return Err(AppError::Internal(format!(
            "index holds {} items but {} records were supplied",
            index.len(),
            records.len()
        )));
    }

    let position = records
        .iter()
        .position(|r| r.identifier == query_identifier)
        .ok_or_else(|| AppError::IdentifierNotFound(query_identifier.to_string()))?;
    let query = &records[position].vector;

    index
        .nearest_to_item(position, n)?
        .into_iter()
        .map(|neighbor| {
            let record = &records[neighbor];
            let similarity = cosine_similarity(query, &record.vector)?;
            Ok(NeighborResult {
                filename: record.identifier.clone(),
                similarity: truncate_similarity(similarity),
            })
        })
        .collect()
}

/// `1 - cosine_distance(a, b)` computed in double precision.
///
/// Matches the usual scientific-library definition: the distance is clipped
/// to `[0, 2]`, so the similarity lies in `[-1, 1]`. A zero vector has no
/// direction and scores 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f64> {
    if a.len() != b.len() {
        return Err(AppError::InvalidInput(format!(
            "cannot compare vectors of length {} and {}",
            a.len(),
            b.len()
        )));
    }

    let a = ArrayView1::from(a).mapv(f64::from);
    let b = ArrayView1::from(b).mapv(f64::from);
    let norm = (a.dot(&a) * b.dot(&b)).sqrt();
    if norm == 0.0 {
        return Ok(0.0);
    }

    let distance = (1.0 - a.dot(&b) / norm).clamp(0.0, 2.0);
    Ok(1.0 - distance)
}

/// Cut a similarity to 4 decimal places, discarding the rest (toward zero).
pub fn truncate_similarity(similarity: f64) -> f64 {
    (similarity * 10_000.0).trunc() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ann::AnnIndexBuilder;

    fn record(id: &str, v: &[f32]) -> EmbeddingRecord {
        EmbeddingRecord::new(id, v.to_vec())
    }

    #[test]
    fn test_truncation_not_rounding() {
        assert_eq!(truncate_similarity(0.99999), 0.9999);
        assert_eq!(truncate_similarity(0.12345), 0.1234);
        assert_eq!(truncate_similarity(1.0), 1.0);
        assert_eq!(truncate_similarity(-0.12345), -0.1234);
    }

    #[test]
    fn test_cosine_similarity() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]).unwrap(), 1.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 3.0]).unwrap(), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]).unwrap(), -1.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]).unwrap(), 0.0);
        assert!(cosine_similarity(&[1.0], &[1.0, 0.0]).is_err());
    }

    #[test]
    fn test_identical_vectors_rank_before_orthogonal() {
        let records = vec![
            record("A", &[1.0, 0.0, 0.0]),
            record("B", &[1.0, 0.0, 0.0]),
            record("C", &[0.0, 1.0, 0.0]),
        ];
        let index = AnnIndexBuilder::new(10).build(&records).unwrap();

        let all = rank(&index, &records, "A", 3).unwrap();
        let names: Vec<&str> = all.iter().map(|n| n.filename.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "C"]);
        assert_eq!(all[1].similarity, 1.0);
        assert_eq!(all[2].similarity, 0.0);

        let two = rank(&index, &records, "A", 2).unwrap();
        assert!(two.iter().any(|n| n.filename == "B"));
        assert!(two.iter().all(|n| n.filename != "C"));
    }

    #[test]
    fn test_unknown_identifier() {
        let records = vec![record("A", &[1.0, 0.0])];
        let index = AnnIndexBuilder::new(1).build(&records).unwrap();
        let err = rank(&index, &records, "Z", 5).unwrap_err();
        assert!(matches!(err, AppError::IdentifierNotFound(id) if id == "Z"));
    }

    #[test]
    fn test_result_count_and_precision() {
        let records: Vec<EmbeddingRecord> = (0..12)
            .map(|i| {
                let t = i as f32 * 0.37;
                record(&format!("img{}", i), &[t.cos(), t.sin(), 0.3])
            })
            .collect();
        let index = AnnIndexBuilder::new(4).build(&records).unwrap();
        let ranker = SimilarityRanker::new(30);

        let results = ranker.rank(&index, &records, "img5").unwrap();
        assert_eq!(results.len(), 12);
        for n in &results {
            assert!((-1.0..=1.0).contains(&n.similarity));
            let scaled = n.similarity * 10_000.0;
            assert!((scaled - scaled.round()).abs() < 1e-6);
        }
    }

    #[test]
    fn test_mismatched_snapshot_is_rejected() {
        let records = vec![record("A", &[1.0, 0.0]), record("B", &[0.0, 1.0])];
        let index = AnnIndexBuilder::new(1).build(&records).unwrap();
        assert!(matches!(
            rank(&index, &records[..1], "A", 1),
            Err(AppError::Internal(_))
        ));
    }
}
