//! Data types shared by the store, the ranker and the HTTP surface

/// Feature vectors and the records that own them.
pub mod embedding;
/// Neighbor lists, labels and the assembled response.
pub mod results;
