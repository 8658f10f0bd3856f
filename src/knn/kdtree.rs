//! Two-dimensional k-d tree for exact k-nearest-neighbor queries.
//!
//! Results are ordered by (distance, insertion index), so equal-distance
//! neighbors always come back in the same order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

#[derive(Debug, Clone)]
struct Node {
    /// Index into `points`.
    point: usize,
    axis: usize,
    left: Option<usize>,
    right: Option<usize>,
}

/// One neighbor returned by a query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Insertion index of the fitted point.
    pub index: usize,
    /// Euclidean distance to the query.
    pub distance: f64,
}

#[derive(Debug, Clone)]
pub struct KdTree {
    points: Vec<[f64; 2]>,
    nodes: Vec<Node>,
    root: Option<usize>,
}

impl KdTree {
    pub fn build(points: Vec<[f64; 2]>) -> Self {
        let mut tree = Self {
            nodes: Vec::with_capacity(points.len()),
            points,
            root: None,
        };
        let mut indices: Vec<usize> = (0..tree.points.len()).collect();
        tree.root = tree.build_node(&mut indices, 0);
        tree
    }

    fn build_node(&mut self, indices: &mut [usize], depth: usize) -> Option<usize> {
        if indices.is_empty() {
            return None;
        }
        let axis = depth % 2;
        let points = &self.points;
        indices.sort_by(|&a, &b| points[a][axis].total_cmp(&points[b][axis]).then(a.cmp(&b)));

        let mid = indices.len() / 2;
        let point = indices[mid];
        let node_id = self.nodes.len();
        self.nodes.push(Node {
            point,
            axis,
            left: None,
            right: None,
        });

        let (lower, rest) = indices.split_at_mut(mid);
        let left = self.build_node(lower, depth + 1);
        let right = self.build_node(&mut rest[1..], depth + 1);
        self.nodes[node_id].left = left;
        self.nodes[node_id].right = right;
        Some(node_id)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// The `k` nearest fitted points to `query`, nearest first.
    ///
    /// Returns fewer than `k` neighbors when fewer points are fitted.
    pub fn nearest(&self, query: [f64; 2], k: usize) -> Vec<Neighbor> {
        if k == 0 {
            return vec![];
        }
        let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(k + 1);
        if let Some(root) = self.root {
            self.search(root, query, k, &mut heap);
        }

        let mut found: Vec<Candidate> = heap.into_vec();
        found.sort();
        found
            .into_iter()
            .map(|c| Neighbor {
                index: c.index,
                distance: c.dist_sq.sqrt(),
            })
            .collect()
    }

    fn search(&self, node_id: usize, query: [f64; 2], k: usize, heap: &mut BinaryHeap<Candidate>) {
        let node = &self.nodes[node_id];
        let p = self.points[node.point];
        let dx = p[0] - query[0];
        let dy = p[1] - query[1];
        let candidate = Candidate {
            dist_sq: dx * dx + dy * dy,
            index: node.point,
        };

        if heap.len() < k {
            heap.push(candidate);
        } else if let Some(worst) = heap.peek() {
            if candidate < *worst {
                heap.pop();
                heap.push(candidate);
            }
        }

        let diff = query[node.axis] - p[node.axis];
        let (near, far) = if diff < 0.0 {
            (node.left, node.right)
        } else {
            (node.right, node.left)
        };

        if let Some(near) = near {
            self.search(near, query, k, heap);
        }
        if let Some(far) = far {
            // Visit on equality so that lower-index ties across the split are seen.
            let within = heap
                .peek()
                .map_or(true, |worst| heap.len() < k || diff * diff <= worst.dist_sq);
            if within {
                self.search(far, query, k, heap);
            }
        }
    }
}

/// Max-heap entry: the worst current neighbor sits on top.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    dist_sq: f64,
    index: usize,
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist_sq
            .total_cmp(&other.dist_sq)
            .then(self.index.cmp(&other.index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn brute_force(points: &[[f64; 2]], query: [f64; 2], k: usize) -> Vec<usize> {
        let mut all: Vec<(f64, usize)> = points
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let dx = p[0] - query[0];
                let dy = p[1] - query[1];
                (dx * dx + dy * dy, i)
            })
            .collect();
        all.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        all.into_iter().take(k).map(|(_, i)| i).collect()
    }

    #[test]
    fn test_nearest_small() {
        let tree = KdTree::build(vec![[0.0, 0.0], [1.0, 0.0], [0.0, 2.0], [5.0, 5.0]]);
        let found = tree.nearest([0.1, 0.0], 2);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].index, 0);
        assert_eq!(found[1].index, 1);
        assert_relative_eq!(found[0].distance, 0.1, epsilon = 1e-12);
        assert_relative_eq!(found[1].distance, 0.9, epsilon = 1e-12);
    }

    #[test]
    fn test_ties_break_by_index() {
        // Four points at the same distance from the origin.
        let tree = KdTree::build(vec![[1.0, 0.0], [-1.0, 0.0], [0.0, 1.0], [0.0, -1.0]]);
        let found: Vec<usize> = tree.nearest([0.0, 0.0], 3).iter().map(|n| n.index).collect();
        assert_eq!(found, vec![0, 1, 2]);

        let dupes = KdTree::build(vec![[2.0, 2.0]; 5]);
        let found: Vec<usize> = dupes.nearest([0.0, 0.0], 2).iter().map(|n| n.index).collect();
        assert_eq!(found, vec![0, 1]);
    }

    #[test]
    fn test_k_larger_than_fitted() {
        let tree = KdTree::build(vec![[0.0, 0.0], [1.0, 1.0]]);
        assert_eq!(tree.nearest([0.0, 0.0], 10).len(), 2);
        assert!(tree.nearest([0.0, 0.0], 0).is_empty());
        assert!(KdTree::build(vec![]).nearest([0.0, 0.0], 3).is_empty());
    }

    proptest! {
        #[test]
        fn prop_matches_brute_force(
            points in prop::collection::vec((-5i32..5, -5i32..5), 1..60),
            qx in -6.0f64..6.0,
            qy in -6.0f64..6.0,
            k in 1usize..12,
        ) {
            // Integer grid coordinates force many exact distance ties.
            let points: Vec<[f64; 2]> = points.into_iter().map(|(x, y)| [x as f64, y as f64]).collect();
            let tree = KdTree::build(points.clone());
            let found: Vec<usize> = tree.nearest([qx, qy], k).iter().map(|n| n.index).collect();
            prop_assert_eq!(found, brute_force(&points, [qx, qy], k));
        }
    }
}
