//! Incremental all-pairs shortest paths.
use std::collections::{HashMap, HashSet};

/// Shortest paths over the part of a navigation graph discovered so far.
///
/// Edges are added as viewpoints are explored; [`FloydGraph::update`] relaxes every known
/// pair through a newly explored viewpoint, so distances and paths are exact with respect
/// to the discovered edges.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FloydGraph {
    distances: HashMap<String, HashMap<String, f64>>,
    /// Intermediate viewpoint of the shortest path between a pair; absent for a direct edge.
    via: HashMap<String, HashMap<String, String>>,
    visited: HashSet<String>,
}

impl FloydGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Known shortest distance between two viewpoints; infinite if not connected.
    pub fn distance(&self, x: &str, y: &str) -> f64 {
        if x == y {
            return 0.0;
        }
        self.distances
            .get(x)
            .and_then(|row| row.get(y))
            .copied()
            .unwrap_or(f64::INFINITY)
    }

    /// Add an undirected edge, keeping the shorter one if the pair is already connected.
    pub fn add_edge(&mut self, x: &str, y: &str, distance: f64) {
        if distance < self.distance(x, y) {
            self.set(x, y, distance, None);
            self.set(y, x, distance, None);
        }
    }

    fn set(&mut self, x: &str, y: &str, distance: f64, via: Option<&str>) {
        self.distances
            .entry(x.to_string())
            .or_default()
            .insert(y.to_string(), distance);
        let row = self.via.entry(x.to_string()).or_default();
        match via {
            Some(k) => {
                row.insert(y.to_string(), k.to_string());
            }
            None => {
                row.remove(y);
            }
        }
    }

    /// Relax every known pair through `k` and mark `k` as explored.
    pub fn update(&mut self, k: &str) {
        let nodes: Vec<String> = self.distances.keys().cloned().collect();
        for x in &nodes {
            for y in &nodes {
                if x == y {
                    continue;
                }
                let through = self.distance(x, k) + self.distance(k, y);
                if through < self.distance(x, y) {
                    self.set(x, y, through, Some(k));
                    self.set(y, x, through, Some(k));
                }
            }
        }
        self.visited.insert(k.to_string());
    }

    /// Whether `k` has been explored with [`FloydGraph::update`].
    pub fn visited(&self, k: &str) -> bool {
        self.visited.contains(k)
    }

    /// Viewpoints on the shortest known path from `x` to `y`, excluding `x` and including `y`.
    ///
    /// A pair without a known connection is treated as directly connected.
    pub fn path(&self, x: &str, y: &str) -> Vec<String> {
        if x == y {
            return Vec::new();
        }
        match self.via.get(x).and_then(|row| row.get(y)) {
            Some(k) => {
                let mut path = self.path(x, k);
                path.extend(self.path(k, y));
                path
            }
            None => vec![y.to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// a - b - c - d with unit edges, explored in order
    fn chain() -> FloydGraph {
        let mut graph = FloydGraph::new();
        for (x, y) in [("a", "b"), ("b", "c"), ("c", "d")] {
            graph.add_edge(x, y, 1.0);
            graph.update(x);
            graph.update(y);
        }
        graph
    }

    #[test]
    fn distances_are_transitive() {
        let graph = chain();
        assert_eq!(graph.distance("a", "d"), 3.0);
        assert_eq!(graph.distance("d", "a"), 3.0);
        assert_eq!(graph.distance("b", "b"), 0.0);
        assert_eq!(graph.distance("a", "z"), f64::INFINITY);
    }

    #[test]
    fn path_splices_intermediate_viewpoints() {
        let graph = chain();
        assert_eq!(graph.path("a", "d"), vec!["b", "c", "d"]);
        assert_eq!(graph.path("d", "b"), vec!["c", "b"]);
        assert!(graph.path("c", "c").is_empty());
    }

    #[test]
    fn shorter_edge_replaces_longer_path() {
        let mut graph = chain();
        graph.add_edge("a", "d", 1.5);
        assert_eq!(graph.path("a", "d"), vec!["d"]);
        assert_eq!(graph.distance("a", "d"), 1.5);
    }

    #[test]
    fn visited_tracks_updates() {
        let mut graph = FloydGraph::new();
        graph.add_edge("a", "b", 1.0);
        assert!(!graph.visited("a"));
        graph.update("a");
        assert!(graph.visited("a"));
        assert!(!graph.visited("b"));
    }
}
