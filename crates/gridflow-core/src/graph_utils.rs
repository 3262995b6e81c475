//! Topology helpers over bus indices.
//!
//! Islands are the connected components of the bus graph (standard components
//! approach, see doi:10.1016/S0378-3758(96)00112-0). Two graphs matter:
//! the *modeled* topology, which includes every branch regardless of status
//! and decides slack placement, and the *energized* topology, which only
//! includes in-service branches and decides whether a bus can be solved.

use petgraph::graph::{NodeIndex, UnGraph};
use std::collections::VecDeque;

/// Build an undirected bus graph from `(from, to)` index pairs.
pub fn bus_graph(bus_count: usize, edges: impl IntoIterator<Item = (usize, usize)>) -> UnGraph<(), ()> {
    let mut graph = UnGraph::<(), ()>::with_capacity(bus_count, 0);
    for _ in 0..bus_count {
        graph.add_node(());
    }
    for (from, to) in edges {
        graph.add_edge(NodeIndex::new(from), NodeIndex::new(to), ());
    }
    graph
}

/// Island label per bus plus the number of islands. Labels are assigned in
/// order of the lowest bus index they contain.
pub fn island_labels(graph: &UnGraph<(), ()>) -> (Vec<usize>, usize) {
    let n = graph.node_count();
    let mut labels = vec![usize::MAX; n];
    let mut next = 0;
    let mut queue = VecDeque::new();

    for start in 0..n {
        if labels[start] != usize::MAX {
            continue;
        }
        labels[start] = next;
        queue.push_back(NodeIndex::new(start));
        while let Some(node) = queue.pop_front() {
            for neighbor in graph.neighbors(node) {
                if labels[neighbor.index()] == usize::MAX {
                    labels[neighbor.index()] = next;
                    queue.push_back(neighbor);
                }
            }
        }
        next += 1;
    }

    (labels, next)
}

/// Multi-source breadth-first reachability.
pub fn reachable_from(graph: &UnGraph<(), ()>, sources: impl IntoIterator<Item = usize>) -> Vec<bool> {
    let mut seen = vec![false; graph.node_count()];
    let mut queue: VecDeque<NodeIndex> = VecDeque::new();
    for s in sources {
        if !seen[s] {
            seen[s] = true;
            queue.push_back(NodeIndex::new(s));
        }
    }
    while let Some(node) = queue.pop_front() {
        for neighbor in graph.neighbors(node) {
            if !seen[neighbor.index()] {
                seen[neighbor.index()] = true;
                queue.push_back(neighbor);
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_components_in_index_order() {
        let graph = bus_graph(5, [(0, 1), (3, 4)]);
        let (labels, count) = island_labels(&graph);
        assert_eq!(count, 3);
        assert_eq!(labels, vec![0, 0, 1, 2, 2]);
    }

    #[test]
    fn reachability_from_several_sources() {
        let graph = bus_graph(6, [(0, 1), (1, 2), (4, 5)]);
        let seen = reachable_from(&graph, [0, 5]);
        assert_eq!(seen, vec![true, true, true, false, true, true]);
    }

    #[test]
    fn parallel_edges_are_harmless() {
        let graph = bus_graph(2, [(0, 1), (1, 0), (0, 1)]);
        let (_, count) = island_labels(&graph);
        assert_eq!(count, 1);
    }
}
