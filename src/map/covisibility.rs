//! Covisibility graph between keyframes.
//!
//! Undirected, weighted by the number of shared points. Edges are derived
//! data: `check_connections` recomputes them, nothing persists them.

use std::collections::HashMap;

use super::types::FrameId;

#[derive(Debug, Default, Clone)]
pub struct CovisibilityGraph {
    adjacency: HashMap<FrameId, HashMap<FrameId, usize>>,
}

impl CovisibilityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or update the edge between `a` and `b`.
    ///
    /// # Arguments
    /// * `weight` - Number of shared points
    pub fn set_edge(&mut self, a: FrameId, b: FrameId, weight: usize) {
        if a == b {
            return; // Don't connect to self
        }
        self.adjacency.entry(a).or_default().insert(b, weight);
        self.adjacency.entry(b).or_default().insert(a, weight);
    }

    /// Remove the edge between `a` and `b`. Returns true if it existed.
    pub fn remove_edge(&mut self, a: FrameId, b: FrameId) -> bool {
        let removed = self
            .adjacency
            .get_mut(&a)
            .and_then(|n| n.remove(&b))
            .is_some();
        if let Some(n) = self.adjacency.get_mut(&b) {
            n.remove(&a);
        }
        self.prune(a);
        self.prune(b);
        removed
    }

    /// Remove a keyframe and all its edges.
    pub fn remove_node(&mut self, id: FrameId) {
        if let Some(neighbors) = self.adjacency.remove(&id) {
            for other in neighbors.keys() {
                if let Some(n) = self.adjacency.get_mut(other) {
                    n.remove(&id);
                }
                self.prune(*other);
            }
        }
    }

    /// Weight of the edge between `a` and `b`, 0 if not connected.
    pub fn weight(&self, a: FrameId, b: FrameId) -> usize {
        self.adjacency
            .get(&a)
            .and_then(|n| n.get(&b))
            .copied()
            .unwrap_or(0)
    }

    /// Sum of the weights of all edges touching `id`.
    pub fn total_weight(&self, id: FrameId) -> usize {
        self.adjacency
            .get(&id)
            .map(|n| n.values().sum())
            .unwrap_or(0)
    }

    pub fn neighbors(&self, id: FrameId) -> impl Iterator<Item = (FrameId, usize)> + '_ {
        self.adjacency
            .get(&id)
            .into_iter()
            .flat_map(|n| n.iter().map(|(k, w)| (*k, *w)))
    }

    /// The `n` neighbors sharing the most points, heaviest first.
    pub fn best_neighbors(&self, id: FrameId, n: usize) -> Vec<FrameId> {
        let mut neighbors: Vec<(FrameId, usize)> = self.neighbors(id).collect();
        // Descending by weight, ties by id for a stable order
        neighbors.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        neighbors.into_iter().take(n).map(|(id, _)| id).collect()
    }

    pub fn num_edges(&self) -> usize {
        self.adjacency.values().map(|n| n.len()).sum::<usize>() / 2
    }

    fn prune(&mut self, id: FrameId) {
        if self.adjacency.get(&id).is_some_and(|n| n.is_empty()) {
            self.adjacency.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> FrameId {
        FrameId::new(n)
    }

    #[test]
    fn test_edges_are_symmetric() {
        let mut graph = CovisibilityGraph::new();
        graph.set_edge(id(1), id(2), 50);
        graph.set_edge(id(1), id(3), 100);
        graph.set_edge(id(1), id(4), 25);

        assert_eq!(graph.weight(id(2), id(1)), 50);
        assert_eq!(graph.weight(id(1), id(5)), 0); // Not connected
        assert_eq!(graph.num_edges(), 3);
        assert_eq!(graph.total_weight(id(1)), 175);

        let best = graph.best_neighbors(id(1), 2);
        assert_eq!(best, vec![id(3), id(2)]);
    }

    #[test]
    fn test_no_self_edge() {
        let mut graph = CovisibilityGraph::new();
        graph.set_edge(id(1), id(1), 100);
        assert_eq!(graph.weight(id(1), id(1)), 0);
        assert_eq!(graph.num_edges(), 0);
    }

    #[test]
    fn test_remove_node_drops_all_edges() {
        let mut graph = CovisibilityGraph::new();
        graph.set_edge(id(1), id(2), 20);
        graph.set_edge(id(2), id(3), 30);

        graph.remove_node(id(2));
        assert_eq!(graph.num_edges(), 0);
        assert_eq!(graph.neighbors(id(1)).count(), 0);
        assert_eq!(graph.neighbors(id(3)).count(), 0);
    }

    #[test]
    fn test_remove_edge() {
        let mut graph = CovisibilityGraph::new();
        graph.set_edge(id(1), id(2), 20);
        assert!(graph.remove_edge(id(2), id(1)));
        assert!(!graph.remove_edge(id(1), id(2)));
        assert_eq!(graph.weight(id(1), id(2)), 0);
    }
}
