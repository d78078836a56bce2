//! Similarity-graph algorithms for cognate network analysis.

use ahash::AHashMap;
use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::visit::EdgeRef;
use std::collections::HashMap;

/// Undirected weighted graph over entry ids, thresholded at build time.
pub struct SimilarityGraph {
    graph: UnGraph<String, f64>,
    nodes: AHashMap<String, NodeIndex>,
}

/// One connected component with a canonical id.
///
/// Components are numbered in ascending order of their smallest member id,
/// so labels are invariant under permutation of the input edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    /// Canonical component id.
    pub id: usize,
    /// Member node ids, sorted.
    pub members: Vec<String>,
}

/// Summary statistics over the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphStats {
    /// Node count.
    pub nodes: usize,
    /// Edge count.
    pub edges: usize,
    /// Mean degree.
    pub avg_degree: f64,
    /// Edge density in `[0, 1]`.
    pub density: f64,
    /// Number of connected components.
    pub components: usize,
}

impl SimilarityGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self {
            graph: UnGraph::new_undirected(),
            nodes: AHashMap::new(),
        }
    }

    /// Builds a graph from weighted edges, keeping only `weight >= threshold`.
    pub fn from_edges<I>(edges: I, threshold: f64) -> Self
    where
        I: IntoIterator<Item = (String, String, f64)>,
    {
        let mut graph = Self::new();
        for (source, target, weight) in edges {
            if weight >= threshold {
                graph.add_edge(source, target, weight);
            }
        }
        graph
    }

    /// Adds a weighted edge, creating nodes as needed. A repeated pair
    /// replaces the previous weight instead of adding a parallel edge.
    pub fn add_edge(&mut self, source: String, target: String, weight: f64) {
        let a = self.intern(source);
        let b = self.intern(target);
        self.graph.update_edge(a, b, weight);
    }

    fn intern(&mut self, id: String) -> NodeIndex {
        if let Some(&idx) = self.nodes.get(&id) {
            return idx;
        }
        let idx = self.graph.add_node(id.clone());
        self.nodes.insert(id, idx);
        idx
    }

    /// Number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of edges in the graph.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Finds connected components with canonical labels.
    pub fn connected_components(&self) -> Vec<Component> {
        let mut visited = vec![false; self.graph.node_count()];
        let mut components: Vec<Vec<String>> = Vec::new();

        for start in self.graph.node_indices() {
            if visited[start.index()] {
                continue;
            }
            let mut members = Vec::new();
            let mut stack = vec![start];
            while let Some(node) = stack.pop() {
                if visited[node.index()] {
                    continue;
                }
                visited[node.index()] = true;
                members.push(self.graph[node].clone());
                for neighbor in self.graph.neighbors(node) {
                    if !visited[neighbor.index()] {
                        stack.push(neighbor);
                    }
                }
            }
            members.sort();
            components.push(members);
        }

        components.sort_by(|a, b| a[0].cmp(&b[0]));
        components
            .into_iter()
            .enumerate()
            .map(|(id, members)| Component { id, members })
            .collect()
    }

    /// Greedy modularity community detection (single-level Louvain sweep).
    ///
    /// Nodes are visited in sorted id order and modularity-gain ties break
    /// toward the community containing the lowest node id, so the result is
    /// invariant under input edge permutation.
    pub fn detect_communities(&self, resolution: f64) -> Vec<Vec<String>> {
        let n = self.graph.node_count();
        if n == 0 {
            return Vec::new();
        }

        let total_weight: f64 = self.graph.edge_references().map(|e| *e.weight()).sum();
        if total_weight == 0.0 {
            return self
                .sorted_nodes()
                .into_iter()
                .map(|idx| vec![self.graph[idx].clone()])
                .collect();
        }

        let degree: Vec<f64> = self
            .graph
            .node_indices()
            .map(|idx| self.graph.edges(idx).map(|e| *e.weight()).sum())
            .collect();

        let mut community: Vec<usize> = (0..n).collect();
        let mut community_degree: Vec<f64> = degree.clone();
        let order = self.sorted_nodes();

        const MAX_SWEEPS: usize = 10;
        for _ in 0..MAX_SWEEPS {
            let mut moved = false;
            for &node in &order {
                let i = node.index();
                let current = community[i];
                community_degree[current] -= degree[i];

                // Weight of edges from `node` into each neighboring community.
                let mut neighbor_weight: HashMap<usize, f64> = HashMap::new();
                neighbor_weight.insert(current, 0.0);
                for edge in self.graph.edges(node) {
                    let other = if edge.source() == node {
                        edge.target()
                    } else {
                        edge.source()
                    };
                    if other == node {
                        continue;
                    }
                    *neighbor_weight
                        .entry(community[other.index()])
                        .or_insert(0.0) += *edge.weight();
                }

                let mut best = current;
                let mut best_gain = gain(
                    neighbor_weight.get(&current).copied().unwrap_or(0.0),
                    community_degree[current],
                    degree[i],
                    total_weight,
                    resolution,
                );
                let mut best_min_id = self.community_min_id(&community, current, i);

                let mut candidates: Vec<usize> = neighbor_weight.keys().copied().collect();
                candidates.sort_unstable();
                for candidate in candidates {
                    if candidate == current {
                        continue;
                    }
                    let candidate_gain = gain(
                        neighbor_weight[&candidate],
                        community_degree[candidate],
                        degree[i],
                        total_weight,
                        resolution,
                    );
                    let candidate_min_id = self.community_min_id(&community, candidate, i);
                    let improves = candidate_gain > best_gain + 1e-12;
                    let ties = (candidate_gain - best_gain).abs() <= 1e-12
                        && candidate_min_id < best_min_id;
                    if improves || ties {
                        best = candidate;
                        best_gain = candidate_gain;
                        best_min_id = candidate_min_id;
                    }
                }

                if best != current {
                    moved = true;
                }
                community[i] = best;
                community_degree[best] += degree[i];
            }
            if !moved {
                break;
            }
        }

        let mut grouped: HashMap<usize, Vec<String>> = HashMap::new();
        for idx in self.graph.node_indices() {
            grouped
                .entry(community[idx.index()])
                .or_default()
                .push(self.graph[idx].clone());
        }
        let mut communities: Vec<Vec<String>> = grouped
            .into_values()
            .map(|mut members| {
                members.sort();
                members
            })
            .collect();
        communities.sort_by(|a, b| a[0].cmp(&b[0]));
        communities
    }

    fn community_min_id<'a>(&'a self, community: &[usize], target: usize, moving: usize) -> &'a str {
        let mut min_id: Option<&str> = None;
        for idx in self.graph.node_indices() {
            if idx.index() == moving || community[idx.index()] != target {
                continue;
            }
            let id = self.graph[idx].as_str();
            if min_id.map(|current| id < current).unwrap_or(true) {
                min_id = Some(id);
            }
        }
        min_id.unwrap_or("")
    }

    /// PageRank centrality with the given damping factor and iteration cap.
    pub fn pagerank(&self, damping: f64, max_iterations: usize) -> HashMap<String, f64> {
        let n = self.graph.node_count();
        if n == 0 {
            return HashMap::new();
        }

        let mut ranks = vec![1.0 / n as f64; n];
        let mut next = vec![0.0f64; n];

        for _ in 0..max_iterations {
            next.fill((1.0 - damping) / n as f64);
            for node in self.graph.node_indices() {
                let out_degree = self.graph.edges(node).count();
                if out_degree == 0 {
                    continue;
                }
                let share = ranks[node.index()] / out_degree as f64;
                for neighbor in self.graph.neighbors(node) {
                    next[neighbor.index()] += damping * share;
                }
            }
            std::mem::swap(&mut ranks, &mut next);
        }

        self.graph
            .node_indices()
            .map(|idx| (self.graph[idx].clone(), ranks[idx.index()]))
            .collect()
    }

    /// Graph-level summary statistics.
    pub fn stats(&self) -> GraphStats {
        let nodes = self.graph.node_count();
        let edges = self.graph.edge_count();
        let avg_degree = if nodes > 0 {
            (2 * edges) as f64 / nodes as f64
        } else {
            0.0
        };
        let density = if nodes > 1 {
            (2 * edges) as f64 / (nodes * (nodes - 1)) as f64
        } else {
            0.0
        };
        GraphStats {
            nodes,
            edges,
            avg_degree,
            density,
            components: self.connected_components().len(),
        }
    }

    fn sorted_nodes(&self) -> Vec<NodeIndex> {
        let mut order: Vec<NodeIndex> = self.graph.node_indices().collect();
        order.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));
        order
    }
}

impl Default for SimilarityGraph {
    fn default() -> Self {
        Self::new()
    }
}

fn gain(weight_in: f64, community_degree: f64, node_degree: f64, total: f64, resolution: f64) -> f64 {
    weight_in / (2.0 * total) - resolution * community_degree * node_degree / (4.0 * total * total)
}
