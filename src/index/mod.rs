//! # Similarity Index
//!
//! Approximate k-nearest-neighbor retrieval over track embeddings.
//!
//! The index is a multi-layer proximity graph (HNSW). Every vector lives on
//! layer 0; a geometrically shrinking subset also lives on the upper layers,
//! which lets a search descend greedily from a sparse overview to the dense
//! bottom layer in roughly logarithmic time.
//!
//! For personal-scale libraries the graph is not worth its approximation, so
//! [`SimilarityIndex::search_auto`] switches to an exact scan below
//! [`IndexConfig::brute_force_threshold`] vectors.
//!
//! ```
//! use muse_engine::index::{IndexConfig, SimilarityIndex};
//!
//! let mut index = SimilarityIndex::with_seed(IndexConfig { dimension: 3, ..IndexConfig::default() }, 7);
//! index.add("a", &[1.0, 0.0, 0.0]);
//! index.add("b", &[0.9, 0.1, 0.0]);
//! index.add("c", &[-1.0, 0.0, 0.0]);
//!
//! let hits = index.search(&[1.0, 0.0, 0.0], 2);
//! assert_eq!(hits[0].id, "a");
//! assert_eq!(hits[1].id, "b");
//! ```

pub mod distance;
mod hnsw;

pub use hnsw::{IndexStats, SearchResult, SimilarityIndex};

use serde::{Deserialize, Serialize};

/// Graph construction and search parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Dimensionality every stored vector is fitted to.
    pub dimension: usize,
    /// `M`: neighbor cap on upper layers. Layer 0 allows twice as many.
    pub max_connections: usize,
    /// Breadth of the best-first search used while inserting.
    pub ef_construction: usize,
    /// Minimum breadth of the best-first search used while querying.
    pub ef_search: usize,
    /// Below this size `search_auto` uses an exact scan.
    pub brute_force_threshold: usize,
    /// Fewer vectors than this and generators prefer catalog candidates.
    pub min_ready_size: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dimension: 128,
            max_connections: 16,
            ef_construction: 200,
            ef_search: 50,
            brute_force_threshold: 1000,
            min_ready_size: 10,
        }
    }
}

/// One indexed vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackEmbedding {
    pub track_id: String,
    pub vector: Vec<f32>,
}

/// Serializable index contents.
///
/// Only vectors are stored; the graph is rebuilt on restore, which keeps the
/// format independent of the random layer assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub config: IndexConfig,
    pub entries: Vec<TrackEmbedding>,
}
