//! Hand-rolled incremental navigable-small-world graph used as the
//! approximate-nearest-neighbour index for history search. Nodes reference
//! each other by `Vec<usize>` index rather than by owning pointer, which
//! keeps insertion and search free of reference cycles.

use std::collections::HashMap;
use std::collections::HashSet;

const ENTRY_POINTS: usize = 3;
const NEIGHBORS_PER_NODE: usize = 8;
const MAX_DEGREE: usize = 16;
const SEARCH_BREADTH: usize = 32;

struct Node {
    hash: String,
    vector: Vec<f32>,
    neighbors: Vec<usize>,
}

#[derive(Default)]
pub struct AnnGraph {
    nodes: Vec<Node>,
    hash_to_index: HashMap<String, usize>,
}

impl AnnGraph {
    pub fn new() -> Self {
        AnnGraph::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains_hash(&self, hash: &str) -> bool {
        self.hash_to_index.contains_key(hash)
    }

    pub fn hash_at(&self, index: usize) -> Option<&str> {
        self.nodes.get(index).map(|n| n.hash.as_str())
    }

    pub fn vector_at(&self, index: usize) -> &[f32] {
        self.nodes[index].vector.as_slice()
    }

    /// No-op if `hash` is already present. Returns the node's index either
    /// way.
    pub fn insert(&mut self, hash: String, vector: Vec<f32>) -> usize {
        if let Some(&existing) = self.hash_to_index.get(&hash) {
            return existing;
        }

        let new_index = self.nodes.len();
        let entry_points = self.pick_entry_points();
        let neighbors = if entry_points.is_empty() {
            Vec::new()
        } else {
            let candidates = self.search_layer(&vector, &entry_points, SEARCH_BREADTH);
            candidates
                .into_iter()
                .take(NEIGHBORS_PER_NODE)
                .map(|(_, idx)| idx)
                .collect::<Vec<_>>()
        };

        for &neighbor in &neighbors {
            self.link(neighbor, new_index);
            self.link(new_index, neighbor);
        }

        self.nodes.push(Node {
            hash: hash.clone(),
            vector,
            neighbors,
        });
        self.hash_to_index.insert(hash, new_index);
        new_index
    }

    /// Returns up to `top_k` `(index, cosine_similarity)` pairs, best first.
    pub fn search(&self, query: &[f32], top_k: usize) -> Vec<(usize, f32)> {
        if top_k == 0 || self.nodes.is_empty() {
            return Vec::new();
        }
        let entry_points = self.pick_entry_points();
        let breadth = SEARCH_BREADTH.max(top_k);
        self.search_layer(query, &entry_points, breadth)
            .into_iter()
            .take(top_k)
            .map(|(sim, idx)| (idx, sim))
            .collect()
    }

    /// Deterministic entry points: first, middle, and last indices. Avoids
    /// pulling in a random-number dependency for a handful of starting
    /// points in a graph this small.
    fn pick_entry_points(&self) -> Vec<usize> {
        let n = self.nodes.len();
        if n == 0 {
            return Vec::new();
        }
        let mut points = vec![0];
        if n > 1 {
            points.push(n / 2);
        }
        if n > 2 {
            points.push(n - 1);
        }
        points.sort_unstable();
        points.dedup();
        points.truncate(ENTRY_POINTS);
        points
    }

    /// Greedy best-first search from `entry_points`, returning up to `ef`
    /// candidates sorted by descending similarity.
    fn search_layer(&self, query: &[f32], entry_points: &[usize], ef: usize) -> Vec<(f32, usize)> {
        let mut visited: HashSet<usize> = entry_points.iter().copied().collect();
        let mut frontier: Vec<(f32, usize)> = entry_points
            .iter()
            .map(|&idx| (cosine_similarity(query, &self.nodes[idx].vector), idx))
            .collect();
        let mut result = frontier.clone();

        while let Some(&(sim, idx)) = frontier
            .iter()
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
        {
            frontier.retain(|&(_, i)| i != idx);

            if result.len() >= ef {
                let worst = worst_similarity(&result);
                if sim < worst {
                    break;
                }
            }

            for &neighbor in &self.nodes[idx].neighbors {
                if visited.insert(neighbor) {
                    let neighbor_sim = cosine_similarity(query, &self.nodes[neighbor].vector);
                    frontier.push((neighbor_sim, neighbor));
                    result.push((neighbor_sim, neighbor));
                }
            }
        }

        result.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        result.truncate(ef);
        result
    }

    /// Add `to` as a neighbour of `from`, pruning the weakest edge if that
    /// pushes `from` over the degree cap.
    fn link(&mut self, from: usize, to: usize) {
        let from_vector = self.nodes[from].vector.clone();
        if self.nodes[from].neighbors.contains(&to) || from == to {
            return;
        }
        self.nodes[from].neighbors.push(to);
        if self.nodes[from].neighbors.len() > MAX_DEGREE {
            let weakest = self.nodes[from]
                .neighbors
                .iter()
                .enumerate()
                .map(|(pos, &n)| (pos, cosine_similarity(&from_vector, &self.node_vector(n))))
                .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(pos, _)| pos);
            if let Some(pos) = weakest {
                self.nodes[from].neighbors.remove(pos);
            }
        }
    }

    fn node_vector(&self, index: usize) -> Vec<f32> {
        self.nodes[index].vector.clone()
    }
}

fn worst_similarity(result: &[(f32, usize)]) -> f32 {
    result
        .iter()
        .map(|&(sim, _)| sim)
        .min_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .unwrap_or(f32::NEG_INFINITY)
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    #[test]
    fn cosine_similarity_identical_vectors_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_orthogonal_is_zero() {
        assert!((cosine_similarity(&[1.0, 0.0], &[0.0, 1.0])).abs() < 1e-6);
    }

    #[test]
    fn insert_is_idempotent_by_hash() {
        let mut graph = AnnGraph::new();
        let idx1 = graph.insert("h1".into(), vec![1.0, 0.0]);
        let idx2 = graph.insert("h1".into(), vec![0.0, 1.0]);
        assert_eq!(idx1, idx2);
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn search_returns_nearest_first() {
        let mut graph = AnnGraph::new();
        graph.insert("close".into(), vec![1.0, 0.0, 0.0]);
        graph.insert("far".into(), vec![0.0, 1.0, 0.0]);
        graph.insert("closer".into(), vec![0.9, 0.1, 0.0]);

        let results = graph.search(&[1.0, 0.0, 0.0], 2);
        assert_eq!(results.len(), 2);
        let top_hash = graph.hash_at(results[0].0).expect("node exists");
        assert_eq!(top_hash, "close");
    }

    #[test]
    fn search_on_empty_graph_returns_empty() {
        let graph = AnnGraph::new();
        assert!(graph.search(&[1.0, 0.0], 5).is_empty());
    }

    #[test]
    fn search_with_zero_top_k_returns_empty() {
        let mut graph = AnnGraph::new();
        graph.insert("h1".into(), vec![1.0, 0.0]);
        assert!(graph.search(&[1.0, 0.0], 0).is_empty());
    }

    #[test]
    fn degree_is_capped() {
        let mut graph = AnnGraph::new();
        for i in 0..40 {
            let angle = i as f32 * 0.01;
            graph.insert(format!("h{i}"), vec![angle.cos(), angle.sin()]);
        }
        for node in &graph.nodes {
            assert!(node.neighbors.len() <= MAX_DEGREE);
        }
    }
}
