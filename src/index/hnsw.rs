use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};

use log::{debug, trace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::Serialize;

use super::distance::{cosine_similarity, euclidean, fit_dimension, similarity_from_distance};
use super::{IndexConfig, IndexSnapshot, TrackEmbedding};

/// Hard cap on the random layer, far above anything `ln`-scaled levels reach.
const MAX_LEVEL: usize = 16;

/// A search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub id: String,
    pub distance: f32,
    /// `1 / (1 + distance)` for Euclidean searches, cosine for cosine searches.
    pub similarity: f32,
}

/// Shape of the graph, for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStats {
    pub len: usize,
    pub dimension: usize,
    pub max_layer: usize,
    pub entry_point: Option<String>,
    /// Number of nodes present on each layer, bottom first.
    pub nodes_per_layer: Vec<usize>,
    pub mean_degree_layer0: f64,
}

#[derive(Debug, Clone)]
struct Node {
    id: String,
    vector: Vec<f32>,
    level: usize,
    /// `neighbors[layer]` for every layer in `0..=level`.
    neighbors: Vec<Vec<usize>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    distance: f32,
    slot: usize,
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.slot.cmp(&other.slot))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// HNSW approximate nearest-neighbor index keyed by track id.
///
/// Not safe for concurrent mutation: the owner holds it by value and mutates
/// through `&mut self`. The random source for layer assignment is injected so
/// tests can build reproducible graphs.
#[derive(Debug)]
pub struct SimilarityIndex<R = StdRng> {
    config: IndexConfig,
    nodes: Vec<Option<Node>>,
    slots: HashMap<String, usize>,
    free: Vec<usize>,
    entry_point: Option<usize>,
    max_layer: usize,
    level_mult: f64,
    rng: R,
}

impl SimilarityIndex<StdRng> {
    /// Index with an entropy-seeded random source.
    pub fn new(config: IndexConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Index with a deterministic random source.
    pub fn with_seed(config: IndexConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }
}

impl<R: Rng> SimilarityIndex<R> {
    pub fn with_rng(config: IndexConfig, rng: R) -> Self {
        let level_mult = 1.0 / (config.max_connections.max(2) as f64).ln();
        Self {
            config,
            nodes: Vec::new(),
            slots: HashMap::new(),
            free: Vec::new(),
            entry_point: None,
            max_layer: 0,
            level_mult,
            rng,
        }
    }

    /// Rebuild an index from a snapshot by re-inserting every vector.
    pub fn from_snapshot(snapshot: IndexSnapshot, rng: R) -> Self {
        let mut index = Self::with_rng(snapshot.config, rng);
        for entry in snapshot.entries {
            index.add(&entry.track_id, &entry.vector);
        }
        index
    }

    pub fn snapshot(&self) -> IndexSnapshot {
        IndexSnapshot {
            config: self.config.clone(),
            entries: self
                .live_nodes()
                .map(|node| TrackEmbedding {
                    track_id: node.id.clone(),
                    vector: node.vector.clone(),
                })
                .collect(),
        }
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Whether there are enough vectors for similarity candidates to be useful.
    pub fn is_ready(&self) -> bool {
        self.len() >= self.config.min_ready_size.max(1)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slots.contains_key(id)
    }

    pub fn vector(&self, id: &str) -> Option<&[f32]> {
        self.slots
            .get(id)
            .and_then(|&slot| self.node(slot))
            .map(|node| node.vector.as_slice())
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.live_nodes().map(|node| node.id.as_str())
    }

    /// Neighbor ids of `id` on `layer`, or `None` if the node is absent or does
    /// not reach that layer.
    pub fn neighbors(&self, id: &str, layer: usize) -> Option<Vec<String>> {
        let node = self.node(*self.slots.get(id)?)?;
        let list = node.neighbors.get(layer)?;
        Some(
            list.iter()
                .filter_map(|&slot| self.node(slot).map(|n| n.id.clone()))
                .collect(),
        )
    }

    /// Insert a vector, or replace the vector of an existing id.
    ///
    /// Replacing keeps the node's edges as they are; after large embedding
    /// drift its neighbor lists may be stale until the node is re-added.
    /// Returns `true` if `id` was not indexed before.
    pub fn add(&mut self, id: &str, vector: &[f32]) -> bool {
        let vector = self.fit(vector);

        if let Some(&slot) = self.slots.get(id) {
            if let Some(node) = self.nodes[slot].as_mut() {
                node.vector = vector;
            }
            trace!("Updated vector for {id} in place");
            return false;
        }

        let level = self.random_level();
        let query = vector.clone();
        let slot = self.allocate(Node {
            id: id.to_string(),
            vector,
            level,
            neighbors: vec![Vec::new(); level + 1],
        });
        self.slots.insert(id.to_string(), slot);

        let Some(entry) = self.entry_point else {
            self.entry_point = Some(slot);
            self.max_layer = level;
            return true;
        };

        let mut nearest = entry;
        for layer in (level + 1..=self.max_layer).rev() {
            nearest = self.greedy_closest(&query, nearest, layer);
        }

        let mut entry_points = vec![nearest];
        for layer in (0..=level.min(self.max_layer)).rev() {
            let candidates =
                self.search_layer(&query, &entry_points, self.config.ef_construction, layer);
            let selected: Vec<usize> = candidates
                .iter()
                .filter(|c| c.slot != slot)
                .take(self.max_connections(layer))
                .map(|c| c.slot)
                .collect();

            for &neighbor in &selected {
                self.connect(neighbor, slot, layer);
            }
            if let Some(node) = self.nodes[slot].as_mut() {
                node.neighbors[layer] = selected;
            }

            entry_points = candidates.into_iter().map(|c| c.slot).collect();
            if entry_points.is_empty() {
                entry_points.push(nearest);
            }
        }

        if level > self.max_layer {
            debug!("{id} becomes entry point at layer {level}");
            self.max_layer = level;
            self.entry_point = Some(slot);
        }
        true
    }

    /// Remove `id` from the graph. Returns `false` if it was not indexed.
    pub fn remove(&mut self, id: &str) -> bool {
        let Some(slot) = self.slots.remove(id) else {
            return false;
        };
        let Some(removed) = self.nodes[slot].take() else {
            return false;
        };

        // Pruning can leave one-way edges, so every node is scanned rather
        // than only the removed node's own neighbors.
        for node in self.nodes.iter_mut().flatten() {
            for list in node.neighbors.iter_mut().take(removed.level + 1) {
                list.retain(|&n| n != slot);
            }
        }
        self.free.push(slot);

        if self.entry_point == Some(slot) {
            self.reelect_entry_point();
        }
        true
    }

    /// Approximate k-NN by Euclidean distance, nearest first.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<SearchResult> {
        let Some(entry) = self.entry_point else {
            return Vec::new();
        };
        if k == 0 {
            return Vec::new();
        }
        let query = self.fit(query);

        let mut nearest = entry;
        for layer in (1..=self.max_layer).rev() {
            nearest = self.greedy_closest(&query, nearest, layer);
        }

        let ef = k.max(self.config.ef_search);
        self.search_layer(&query, &[nearest], ef, 0)
            .into_iter()
            .take(k)
            .filter_map(|c| {
                self.node(c.slot).map(|node| SearchResult {
                    id: node.id.clone(),
                    distance: c.distance,
                    similarity: similarity_from_distance(c.distance),
                })
            })
            .collect()
    }

    /// Exact k-NN by Euclidean distance.
    pub fn brute_force_search(&self, query: &[f32], k: usize) -> Vec<SearchResult> {
        let query = self.fit(query);
        let mut hits: Vec<SearchResult> = self
            .nodes
            .par_iter()
            .filter_map(Option::as_ref)
            .map(|node| {
                let distance = euclidean(&query, &node.vector);
                SearchResult {
                    id: node.id.clone(),
                    distance,
                    similarity: similarity_from_distance(distance),
                }
            })
            .collect();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(k);
        hits
    }

    /// Exact k-NN by cosine similarity, most similar first.
    ///
    /// `distance` is reported as `1 - cosine`.
    pub fn search_cosine(&self, query: &[f32], k: usize) -> Vec<SearchResult> {
        let query = self.fit(query);
        let mut hits: Vec<SearchResult> = self
            .nodes
            .par_iter()
            .filter_map(Option::as_ref)
            .map(|node| {
                let similarity = cosine_similarity(&query, &node.vector);
                SearchResult {
                    id: node.id.clone(),
                    distance: 1.0 - similarity,
                    similarity,
                }
            })
            .collect();
        hits.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(k);
        hits
    }

    /// Exact scan for small indices, graph search beyond the threshold.
    pub fn search_auto(&self, query: &[f32], k: usize) -> Vec<SearchResult> {
        if self.len() < self.config.brute_force_threshold {
            self.brute_force_search(query, k)
        } else {
            self.search(query, k)
        }
    }

    pub fn stats(&self) -> IndexStats {
        let mut nodes_per_layer = vec![0; self.max_layer + 1];
        let mut degree_sum = 0usize;
        for node in self.live_nodes() {
            for count in nodes_per_layer.iter_mut().take(node.level + 1) {
                *count += 1;
            }
            degree_sum += node.neighbors.first().map_or(0, Vec::len);
        }
        let len = self.len();
        IndexStats {
            len,
            dimension: self.config.dimension,
            max_layer: self.max_layer,
            entry_point: self
                .entry_point
                .and_then(|slot| self.node(slot))
                .map(|node| node.id.clone()),
            nodes_per_layer: if len == 0 { Vec::new() } else { nodes_per_layer },
            mean_degree_layer0: if len == 0 {
                0.0
            } else {
                degree_sum as f64 / len as f64
            },
        }
    }

    fn fit(&self, vector: &[f32]) -> Vec<f32> {
        if vector.len() != self.config.dimension {
            debug!(
                "Fitting {}-dim vector to index dimension {}",
                vector.len(),
                self.config.dimension
            );
        }
        fit_dimension(vector, self.config.dimension)
    }

    fn max_connections(&self, layer: usize) -> usize {
        if layer == 0 {
            self.config.max_connections * 2
        } else {
            self.config.max_connections
        }
    }

    fn random_level(&mut self) -> usize {
        let uniform: f64 = self.rng.gen::<f64>().max(f64::MIN_POSITIVE);
        ((-uniform.ln() * self.level_mult).floor() as usize).min(MAX_LEVEL)
    }

    fn allocate(&mut self, node: Node) -> usize {
        if let Some(slot) = self.free.pop() {
            self.nodes[slot] = Some(node);
            slot
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn node(&self, slot: usize) -> Option<&Node> {
        self.nodes.get(slot).and_then(Option::as_ref)
    }

    fn live_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter_map(Option::as_ref)
    }

    fn neighbors_at(&self, slot: usize, layer: usize) -> &[usize] {
        self.node(slot)
            .and_then(|node| node.neighbors.get(layer))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn distance_to(&self, query: &[f32], slot: usize) -> f32 {
        self.node(slot)
            .map_or(f32::INFINITY, |node| euclidean(query, &node.vector))
    }

    /// Single-best greedy walk on one layer.
    fn greedy_closest(&self, query: &[f32], start: usize, layer: usize) -> usize {
        let mut current = start;
        let mut best = self.distance_to(query, current);
        loop {
            let mut moved = false;
            for &neighbor in self.neighbors_at(current, layer) {
                let distance = self.distance_to(query, neighbor);
                if distance < best {
                    best = distance;
                    current = neighbor;
                    moved = true;
                }
            }
            if !moved {
                return current;
            }
        }
    }

    /// Bounded best-first search on one layer, nearest first.
    fn search_layer(
        &self,
        query: &[f32],
        entry_points: &[usize],
        ef: usize,
        layer: usize,
    ) -> Vec<Candidate> {
        let ef = ef.max(1);
        let mut visited: HashSet<usize> = HashSet::with_capacity(ef * 4);
        let mut frontier: BinaryHeap<Reverse<Candidate>> = BinaryHeap::new();
        let mut results: BinaryHeap<Candidate> = BinaryHeap::new();

        for &slot in entry_points {
            if !visited.insert(slot) || self.node(slot).is_none() {
                continue;
            }
            let candidate = Candidate {
                distance: self.distance_to(query, slot),
                slot,
            };
            frontier.push(Reverse(candidate));
            results.push(candidate);
            if results.len() > ef {
                results.pop();
            }
        }

        while let Some(Reverse(current)) = frontier.pop() {
            let worst = results.peek().map_or(f32::INFINITY, |c| c.distance);
            if current.distance > worst && results.len() >= ef {
                break;
            }

            for &neighbor in self.neighbors_at(current.slot, layer) {
                if !visited.insert(neighbor) || self.node(neighbor).is_none() {
                    continue;
                }
                let distance = self.distance_to(query, neighbor);
                let worst = results.peek().map_or(f32::INFINITY, |c| c.distance);
                if results.len() < ef || distance < worst {
                    let candidate = Candidate {
                        distance,
                        slot: neighbor,
                    };
                    frontier.push(Reverse(candidate));
                    results.push(candidate);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        results.into_sorted_vec()
    }

    /// Add `to` to `from`'s list on `layer`, pruning `from` back to its cap.
    fn connect(&mut self, from: usize, to: usize, layer: usize) {
        let cap = self.max_connections(layer);
        let over_cap = match self.nodes[from].as_mut() {
            Some(node) if node.neighbors.len() > layer => {
                let list = &mut node.neighbors[layer];
                if !list.contains(&to) {
                    list.push(to);
                }
                list.len() > cap
            }
            _ => false,
        };
        if over_cap {
            self.prune(from, layer, cap);
        }
    }

    /// Keep only the `cap` nearest neighbors of `slot` on `layer`.
    fn prune(&mut self, slot: usize, layer: usize, cap: usize) {
        let Some(node) = self.node(slot) else {
            return;
        };
        let mut scored: Vec<Candidate> = node.neighbors[layer]
            .iter()
            .filter_map(|&n| {
                self.node(n).map(|other| Candidate {
                    distance: euclidean(&node.vector, &other.vector),
                    slot: n,
                })
            })
            .collect();
        scored.sort();
        let kept: Vec<usize> = scored.into_iter().take(cap).map(|c| c.slot).collect();
        if let Some(node) = self.nodes[slot].as_mut() {
            node.neighbors[layer] = kept;
        }
    }

    fn reelect_entry_point(&mut self) {
        let highest = self
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(slot, node)| node.as_ref().map(|n| (slot, n.level)))
            .max_by(|(slot_a, level_a), (slot_b, level_b)| {
                level_a.cmp(level_b).then_with(|| slot_b.cmp(slot_a))
            });
        match highest {
            Some((slot, level)) => {
                self.entry_point = Some(slot);
                self.max_layer = level;
            }
            None => {
                self.entry_point = None;
                self.max_layer = 0;
            }
        }
    }
}
