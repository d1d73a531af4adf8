//! Nearest neighbor search implementations

use alignkit_core::{NearestNeighborSearch, Point3f};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

#[derive(Debug, Clone, Copy)]
struct KdNode {
    point_index: usize,
    axis: usize,
    left: Option<usize>,
    right: Option<usize>,
}

/// Immutable, median-balanced k-d tree over a copied position buffer.
///
/// Built once per cloud and queried many times; queries take `&self` and are
/// safe to issue concurrently. Rebuild the tree whenever the underlying cloud
/// changes; nodes are never patched in place.
#[derive(Debug)]
pub struct KdTree {
    points: Vec<Point3f>,
    nodes: Vec<KdNode>,
    root: Option<usize>,
}

impl KdTree {
    /// Build a tree over the given points.
    ///
    /// Building over an empty slice is allowed and yields an index that
    /// reports no matches for every query.
    pub fn build(points: &[Point3f]) -> Self {
        let points = points.to_vec();
        let mut indices: Vec<usize> = (0..points.len()).collect();
        let mut nodes = Vec::with_capacity(points.len());
        let root = Self::build_recursive(&points, &mut indices, 0, &mut nodes);
        Self {
            points,
            nodes,
            root,
        }
    }

    /// Number of indexed points
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the index contains no points
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    fn build_recursive(
        points: &[Point3f],
        indices: &mut [usize],
        depth: usize,
        nodes: &mut Vec<KdNode>,
    ) -> Option<usize> {
        if indices.is_empty() {
            return None;
        }

        let axis = depth % 3;
        let median = indices.len() / 2;
        indices.select_nth_unstable_by(median, |&a, &b| {
            points[a][axis]
                .partial_cmp(&points[b][axis])
                .unwrap_or(Ordering::Equal)
        });

        let node_id = nodes.len();
        nodes.push(KdNode {
            point_index: indices[median],
            axis,
            left: None,
            right: None,
        });

        let (lower, rest) = indices.split_at_mut(median);
        let upper = &mut rest[1..];

        let left = Self::build_recursive(points, lower, depth + 1, nodes);
        let right = Self::build_recursive(points, upper, depth + 1, nodes);
        nodes[node_id].left = left;
        nodes[node_id].right = right;

        Some(node_id)
    }

    fn nearest_recursive(&self, node_id: usize, query: &Point3f, best: &mut (usize, f32)) {
        let node = self.nodes[node_id];
        let point = self.points[node.point_index];

        let dist_sq = (point - query).norm_squared();
        if dist_sq < best.1 {
            *best = (node.point_index, dist_sq);
        }

        let diff = query[node.axis] - point[node.axis];
        let (near, far) = if diff < 0.0 {
            (node.left, node.right)
        } else {
            (node.right, node.left)
        };

        if let Some(child) = near {
            self.nearest_recursive(child, query, best);
        }
        // The far half-space can only contain a closer point if the splitting
        // plane is nearer than the current best.
        if diff * diff < best.1 {
            if let Some(child) = far {
                self.nearest_recursive(child, query, best);
            }
        }
    }

    fn radius_recursive(
        &self,
        node_id: usize,
        query: &Point3f,
        radius_sq: f32,
        out: &mut Vec<(usize, f32)>,
    ) {
        let node = self.nodes[node_id];
        let point = self.points[node.point_index];

        let dist_sq = (point - query).norm_squared();
        if dist_sq <= radius_sq {
            out.push((node.point_index, dist_sq));
        }

        let diff = query[node.axis] - point[node.axis];
        let (near, far) = if diff < 0.0 {
            (node.left, node.right)
        } else {
            (node.right, node.left)
        };

        if let Some(child) = near {
            self.radius_recursive(child, query, radius_sq, out);
        }
        if diff * diff <= radius_sq {
            if let Some(child) = far {
                self.radius_recursive(child, query, radius_sq, out);
            }
        }
    }

    fn knn_recursive(
        &self,
        node_id: usize,
        query: &Point3f,
        k: usize,
        heap: &mut BinaryHeap<HeapEntry>,
    ) {
        let node = self.nodes[node_id];
        let point = self.points[node.point_index];

        let dist_sq = (point - query).norm_squared();
        if heap.len() < k {
            heap.push(HeapEntry {
                dist_sq,
                index: node.point_index,
            });
        } else if dist_sq < heap.peek().map_or(f32::INFINITY, |e| e.dist_sq) {
            heap.pop();
            heap.push(HeapEntry {
                dist_sq,
                index: node.point_index,
            });
        }

        let diff = query[node.axis] - point[node.axis];
        let (near, far) = if diff < 0.0 {
            (node.left, node.right)
        } else {
            (node.right, node.left)
        };

        if let Some(child) = near {
            self.knn_recursive(child, query, k, heap);
        }
        let worst = if heap.len() < k {
            f32::INFINITY
        } else {
            heap.peek().map_or(f32::INFINITY, |e| e.dist_sq)
        };
        if diff * diff < worst {
            if let Some(child) = far {
                self.knn_recursive(child, query, k, heap);
            }
        }
    }
}

impl NearestNeighborSearch for KdTree {
    fn nearest_one(&self, query: &Point3f) -> Option<(usize, f32)> {
        let root = self.root?;
        let mut best = (usize::MAX, f32::INFINITY);
        self.nearest_recursive(root, query, &mut best);
        (best.0 != usize::MAX).then_some(best)
    }

    fn find_k_nearest(&self, query: &Point3f, k: usize) -> Vec<(usize, f32)> {
        let root = match self.root {
            Some(root) if k > 0 => root,
            _ => return Vec::new(),
        };

        let mut heap = BinaryHeap::with_capacity(k + 1);
        self.knn_recursive(root, query, k, &mut heap);

        let mut result: Vec<(usize, f32)> =
            heap.into_iter().map(|e| (e.index, e.dist_sq)).collect();
        result.sort_unstable_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        result
    }

    fn find_radius_neighbors(&self, query: &Point3f, radius: f32) -> Vec<(usize, f32)> {
        let mut out = Vec::new();
        if let Some(root) = self.root {
            if radius > 0.0 {
                self.radius_recursive(root, query, radius * radius, &mut out);
            }
        }
        out
    }
}

/// Max-heap entry ordered by squared distance, index as tie-break.
#[derive(Debug, Clone, Copy, PartialEq)]
struct HeapEntry {
    dist_sq: f32,
    index: usize,
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist_sq
            .total_cmp(&other.dist_sq)
            .then(self.index.cmp(&other.index))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Brute force nearest neighbor search, used as a reference oracle in tests
/// and for very small datasets.
pub struct BruteForceSearch {
    points: Vec<Point3f>,
}

impl BruteForceSearch {
    pub fn new(points: &[Point3f]) -> Self {
        Self {
            points: points.to_vec(),
        }
    }
}

impl NearestNeighborSearch for BruteForceSearch {
    fn nearest_one(&self, query: &Point3f) -> Option<(usize, f32)> {
        self.points
            .iter()
            .enumerate()
            .map(|(idx, p)| (idx, (p - query).norm_squared()))
            .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))
    }

    fn find_k_nearest(&self, query: &Point3f, k: usize) -> Vec<(usize, f32)> {
        let mut distances: Vec<(usize, f32)> = self
            .points
            .iter()
            .enumerate()
            .map(|(idx, p)| (idx, (p - query).norm_squared()))
            .collect();

        distances.sort_unstable_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        distances.truncate(k);
        distances
    }

    fn find_radius_neighbors(&self, query: &Point3f, radius: f32) -> Vec<(usize, f32)> {
        let radius_sq = radius * radius;
        self.points
            .iter()
            .enumerate()
            .filter_map(|(idx, p)| {
                let dist_sq = (p - query).norm_squared();
                (dist_sq <= radius_sq).then_some((idx, dist_sq))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_points(n: usize, seed: u64) -> Vec<Point3f> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                Point3f::new(
                    rng.gen_range(-1.0..1.0),
                    rng.gen_range(-1.0..1.0),
                    rng.gen_range(-1.0..1.0),
                )
            })
            .collect()
    }

    #[test]
    fn test_empty_tree_reports_no_matches() {
        let tree = KdTree::build(&[]);
        let query = Point3f::origin();

        assert!(tree.is_empty());
        assert_eq!(tree.nearest_one(&query), None);
        assert!(tree.find_k_nearest(&query, 5).is_empty());
        assert!(tree.find_radius_neighbors(&query, 1.0).is_empty());
    }

    #[test]
    fn test_single_point() {
        let tree = KdTree::build(&[Point3f::new(1.0, 2.0, 3.0)]);
        let (idx, dist_sq) = tree.nearest_one(&Point3f::new(1.0, 2.0, 4.0)).unwrap();
        assert_eq!(idx, 0);
        assert!((dist_sq - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_nearest_one_matches_brute_force() {
        let points = random_points(500, 7);
        let tree = KdTree::build(&points);
        let oracle = BruteForceSearch::new(&points);

        for query in random_points(100, 8) {
            let got = tree.nearest_one(&query).unwrap();
            let expected = oracle.nearest_one(&query).unwrap();
            assert!(
                (got.1 - expected.1).abs() < 1e-6,
                "tree {:?} vs brute {:?}",
                got,
                expected
            );
        }
    }

    #[test]
    fn test_radius_search_matches_brute_force() {
        let points = random_points(400, 21);
        let tree = KdTree::build(&points);
        let oracle = BruteForceSearch::new(&points);

        for query in random_points(50, 22) {
            let mut got = tree.find_radius_neighbors(&query, 0.4);
            let mut expected = oracle.find_radius_neighbors(&query, 0.4);
            got.sort_unstable_by_key(|&(idx, _)| idx);
            expected.sort_unstable_by_key(|&(idx, _)| idx);

            assert_eq!(got.len(), expected.len());
            for (g, e) in got.iter().zip(expected.iter()) {
                assert_eq!(g.0, e.0);
                assert!((g.1 - e.1).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_k_nearest_matches_brute_force() {
        let points = random_points(300, 42);
        let tree = KdTree::build(&points);
        let oracle = BruteForceSearch::new(&points);

        for query in random_points(50, 43) {
            let got = tree.find_k_nearest(&query, 10);
            let expected = oracle.find_k_nearest(&query, 10);

            assert_eq!(got.len(), 10);
            for (g, e) in got.iter().zip(expected.iter()) {
                assert!(
                    (g.1 - e.1).abs() < 1e-6,
                    "distance mismatch: {:?} vs {:?}",
                    g,
                    e
                );
            }
        }
    }

    #[test]
    fn test_k_larger_than_cloud() {
        let points = random_points(5, 3);
        let tree = KdTree::build(&points);
        let result = tree.find_k_nearest(&Point3f::origin(), 10);
        assert_eq!(result.len(), 5);
        for pair in result.windows(2) {
            assert!(pair[0].1 <= pair[1].1);
        }
    }
}
