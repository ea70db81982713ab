//! R*-tree over the truth source coordinates

use rstar::{PointDistance, RTree, RTreeObject, AABB};

/// A truth source position and its row in the truth table
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Node {
    pub index: usize,
    pub xy: [f64; 2],
}
impl RTreeObject for Node {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.xy)
    }
}
impl PointDistance for Node {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dx = self.xy[0] - point[0];
        let dy = self.xy[1] - point[1];
        dx * dx + dy * dy
    }
}

/// Nearest neighbor search over a set of points
pub struct SpatialIndex {
    tree: RTree<Node>,
}
impl SpatialIndex {
    pub fn new<I: IntoIterator<Item = [f64; 2]>>(points: I) -> Self {
        let nodes = points
            .into_iter()
            .enumerate()
            .map(|(index, xy)| Node { index, xy })
            .collect();
        Self {
            tree: RTree::bulk_load(nodes),
        }
    }
    pub fn len(&self) -> usize {
        self.tree.size()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Index of and distance to the point closest to `xy`
    ///
    /// Among points at the same distance, the one with the lowest index wins.
    pub fn nearest(&self, xy: [f64; 2]) -> Option<(usize, f64)> {
        let mut neighbors = self.tree.nearest_neighbor_iter_with_distance_2(&xy);
        let (first, d2) = neighbors.next()?;
        let index = neighbors
            .take_while(|(_, other_d2)| *other_d2 == d2)
            .map(|(node, _)| node.index)
            .fold(first.index, usize::min);
        Some((index, d2.sqrt()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_point() {
        let index = SpatialIndex::new([[0., 0.], [10., 10.], [10., 11.]]);
        assert_eq!(index.len(), 3);
        assert_eq!(index.nearest([9., 9.]), Some((1, 2f64.sqrt())));
        assert_eq!(index.nearest([10., 12.]), Some((2, 1.)));
    }

    #[test]
    fn equidistant_points() {
        let index = SpatialIndex::new([[2., 0.], [-2., 0.], [0., 2.], [0., -2.]]);
        assert_eq!(index.nearest([0., 0.]), Some((0, 2.)));
        let index = SpatialIndex::new([[5., 5.], [1., 1.], [1., 1.]]);
        assert_eq!(index.nearest([1., 1.]), Some((1, 0.)));
    }

    #[test]
    fn empty_index() {
        let index = SpatialIndex::new(Vec::<[f64; 2]>::new());
        assert!(index.is_empty());
        assert_eq!(index.nearest([0., 0.]), None);
    }
}
