//! Correspondence search between a transformed source and a target index

use crate::search::KdTree;
use alignkit_core::{NearestNeighborSearch, Point3f};
use rayon::prelude::*;

/// A matched point pair produced by one ICP iteration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    /// Index into the source cloud
    pub source_index: usize,
    /// Index into the target cloud
    pub target_index: usize,
    /// Squared Euclidean distance between the pair
    pub distance_sq: f32,
}

/// Find the closest target point for each (already transformed) source point.
///
/// A match is accepted only if its squared distance is within
/// `max_distance * max_distance`; source points without an accepted match are
/// simply excluded; that is how partial overlap between scans is handled.
/// Output ordering follows source point order.
pub fn find_correspondences(
    source_positions: &[Point3f],
    target_index: &KdTree,
    max_distance: f32,
) -> Vec<Correspondence> {
    let max_distance_sq = max_distance * max_distance;
    source_positions
        .par_iter()
        .enumerate()
        .filter_map(|(source_index, p)| {
            let (target_index, distance_sq) = target_index.nearest_one(p)?;
            (distance_sq <= max_distance_sq).then_some(Correspondence {
                source_index,
                target_index,
                distance_sq,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_follow_source_order() {
        let target = vec![
            Point3f::new(0.0, 0.0, 0.0),
            Point3f::new(1.0, 0.0, 0.0),
            Point3f::new(2.0, 0.0, 0.0),
        ];
        let tree = KdTree::build(&target);

        let source = vec![
            Point3f::new(2.1, 0.0, 0.0),
            Point3f::new(0.1, 0.0, 0.0),
            Point3f::new(1.1, 0.0, 0.0),
        ];

        let correspondences = find_correspondences(&source, &tree, 0.5);
        assert_eq!(correspondences.len(), 3);
        assert_eq!(
            correspondences.iter().map(|c| c.source_index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(
            correspondences.iter().map(|c| c.target_index).collect::<Vec<_>>(),
            vec![2, 0, 1]
        );
        for c in &correspondences {
            assert!((c.distance_sq - 0.01).abs() < 1e-6);
        }
    }

    #[test]
    fn test_distant_points_are_excluded() {
        let target = vec![Point3f::new(0.0, 0.0, 0.0)];
        let tree = KdTree::build(&target);

        let source = vec![
            Point3f::new(0.05, 0.0, 0.0),
            Point3f::new(5.0, 0.0, 0.0),
        ];

        let correspondences = find_correspondences(&source, &tree, 0.1);
        assert_eq!(correspondences.len(), 1);
        assert_eq!(correspondences[0].source_index, 0);
    }

    #[test]
    fn test_empty_target_yields_no_matches() {
        let tree = KdTree::build(&[]);
        let source = vec![Point3f::origin()];
        assert!(find_correspondences(&source, &tree, 1.0).is_empty());
    }
}
