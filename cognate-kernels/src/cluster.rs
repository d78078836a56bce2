//! Clustering primitives: union-find components and density clustering.

use rayon::prelude::*;
use std::collections::VecDeque;

/// Union-find over `0..n` with path compression and union by rank.
pub struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    /// Creates a forest of `n` singletons.
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    /// Finds the representative of `x`.
    pub fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = x;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    /// Merges the sets containing `x` and `y`.
    pub fn union(&mut self, x: usize, y: usize) {
        let root_x = self.find(x);
        let root_y = self.find(y);
        if root_x == root_y {
            return;
        }
        match self.rank[root_x].cmp(&self.rank[root_y]) {
            std::cmp::Ordering::Less => self.parent[root_x] = root_y,
            std::cmp::Ordering::Greater => self.parent[root_y] = root_x,
            std::cmp::Ordering::Equal => {
                self.parent[root_y] = root_x;
                self.rank[root_x] += 1;
            }
        }
    }

    /// Returns all sets, each sorted, ordered by smallest member.
    pub fn components(&mut self) -> Vec<Vec<usize>> {
        let n = self.parent.len();
        let mut by_root: Vec<Vec<usize>> = vec![Vec::new(); n];
        for i in 0..n {
            let root = self.find(i);
            by_root[root].push(i);
        }
        let mut components: Vec<Vec<usize>> = by_root
            .into_iter()
            .filter(|members| !members.is_empty())
            .collect();
        components.sort_by_key(|members| members[0]);
        components
    }
}

/// Groups items whose pairwise similarity meets `threshold` into components.
pub fn threshold_components(
    similarities: &[(usize, usize, f64)],
    n_items: usize,
    threshold: f64,
) -> Vec<Vec<usize>> {
    let mut uf = UnionFind::new(n_items);
    for &(i, j, similarity) in similarities {
        if similarity >= threshold {
            uf.union(i, j);
        }
    }
    uf.components()
}

/// Parameters for density clustering.
#[derive(Debug, Clone, Copy)]
pub struct DensityParams {
    /// Neighborhood radius (euclidean).
    pub eps: f64,
    /// Minimum neighborhood size (including the point itself) to be a core
    /// point.
    pub min_samples: usize,
    /// Clusters smaller than this are dissolved into noise.
    pub min_cluster_size: usize,
}

impl Default for DensityParams {
    fn default() -> Self {
        Self {
            eps: 0.5,
            min_samples: 5,
            min_cluster_size: 5,
        }
    }
}

/// Output of [`density_cluster`].
#[derive(Debug, Clone)]
pub struct DensityClustering {
    /// Cluster label per point; `-1` marks noise. Labels are assigned in
    /// ascending order of each cluster's smallest member index.
    pub labels: Vec<i64>,
    /// Whether each point satisfied the core-density criterion.
    pub core: Vec<bool>,
}

/// Density-based clustering (DBSCAN) over points in euclidean space.
///
/// Deterministic: points are expanded in index order, so labels depend only
/// on the input values.
pub fn density_cluster(points: &[Vec<f64>], params: &DensityParams) -> DensityClustering {
    let n = points.len();
    if n == 0 {
        return DensityClustering {
            labels: Vec::new(),
            core: Vec::new(),
        };
    }

    let eps_sq = params.eps * params.eps;
    let neighbors: Vec<Vec<usize>> = (0..n)
        .into_par_iter()
        .map(|i| {
            let mut near = Vec::new();
            for j in 0..n {
                if i != j && squared_distance(&points[i], &points[j]) <= eps_sq {
                    near.push(j);
                }
            }
            near
        })
        .collect();

    let core: Vec<bool> = neighbors
        .iter()
        .map(|near| near.len() + 1 >= params.min_samples)
        .collect();

    let mut labels = vec![-1i64; n];
    let mut next_label = 0i64;

    for seed in 0..n {
        if labels[seed] != -1 || !core[seed] {
            continue;
        }
        let label = next_label;
        next_label += 1;

        let mut queue = VecDeque::new();
        labels[seed] = label;
        queue.push_back(seed);
        while let Some(point) = queue.pop_front() {
            for &neighbor in &neighbors[point] {
                if labels[neighbor] != -1 {
                    continue;
                }
                labels[neighbor] = label;
                if core[neighbor] {
                    queue.push_back(neighbor);
                }
            }
        }
    }

    dissolve_small_clusters(&mut labels, params.min_cluster_size);

    DensityClustering { labels, core }
}

fn dissolve_small_clusters(labels: &mut [i64], min_cluster_size: usize) {
    let max_label = labels.iter().copied().max().unwrap_or(-1);
    if max_label < 0 {
        return;
    }
    let mut sizes = vec![0usize; (max_label + 1) as usize];
    for &label in labels.iter() {
        if label >= 0 {
            sizes[label as usize] += 1;
        }
    }

    // Surviving clusters are renumbered densely, preserving order.
    let mut remap = vec![-1i64; sizes.len()];
    let mut next = 0i64;
    for (label, &size) in sizes.iter().enumerate() {
        if size >= min_cluster_size {
            remap[label] = next;
            next += 1;
        }
    }
    for label in labels.iter_mut() {
        if *label >= 0 {
            *label = remap[*label as usize];
        }
    }
}

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_find_merges_transitively() {
        let mut uf = UnionFind::new(5);
        uf.union(0, 1);
        uf.union(2, 3);
        uf.union(1, 2);
        assert_eq!(uf.find(0), uf.find(3));
        assert_ne!(uf.find(0), uf.find(4));
    }

    #[test]
    fn threshold_components_splits_below_threshold() {
        let similarities = vec![(0, 1, 0.9), (1, 2, 0.85), (3, 4, 0.95), (0, 3, 0.2)];
        let components = threshold_components(&similarities, 5, 0.8);
        assert_eq!(components, vec![vec![0, 1, 2], vec![3, 4]]);
    }

    #[test]
    fn density_cluster_finds_two_blobs() {
        let mut points = Vec::new();
        for i in 0..6 {
            points.push(vec![0.0 + 0.01 * i as f64, 0.0]);
        }
        for i in 0..6 {
            points.push(vec![5.0 + 0.01 * i as f64, 5.0]);
        }
        points.push(vec![2.5, 2.5]); // Isolated noise point.

        let params = DensityParams {
            eps: 0.1,
            min_samples: 3,
            min_cluster_size: 3,
        };
        let result = density_cluster(&points, &params);
        assert_eq!(result.labels[0], 0);
        assert!(result.labels[..6].iter().all(|&l| l == 0));
        assert!(result.labels[6..12].iter().all(|&l| l == 1));
        assert_eq!(result.labels[12], -1);
        assert!(!result.core[12]);
    }

    #[test]
    fn small_clusters_dissolve_to_noise() {
        let points = vec![
            vec![0.0, 0.0],
            vec![0.01, 0.0],
            vec![0.02, 0.0],
            vec![9.0, 9.0],
        ];
        let params = DensityParams {
            eps: 0.1,
            min_samples: 2,
            min_cluster_size: 4,
        };
        let result = density_cluster(&points, &params);
        assert!(result.labels.iter().all(|&l| l == -1));
    }

    #[test]
    fn labels_are_deterministic() {
        let points: Vec<Vec<f64>> = (0..20)
            .map(|i| vec![(i % 4) as f64 * 3.0, (i / 4) as f64 * 0.01])
            .collect();
        let params = DensityParams {
            eps: 0.5,
            min_samples: 2,
            min_cluster_size: 2,
        };
        let first = density_cluster(&points, &params);
        let second = density_cluster(&points, &params);
        assert_eq!(first.labels, second.labels);
    }
}
