//! Point-region quadtree over geofence entities.
//!
//! The tree owns all entities in a single arena; leaf nodes hold `u32`
//! indices into it. An entity is stored in every leaf whose bounds its
//! bounding box touches, so point queries descend exactly one branch.
//! The tree is built once at startup and never mutated afterwards.

use crate::geo::{Bounds, Entity, Point};

/// Maximum subdivision depth of the tree
pub const DEFAULT_MAX_DEPTH: u32 = 6;

/// Entities a leaf holds before it splits
pub const DEFAULT_LEAF_CAPACITY: usize = 4;

#[derive(Debug)]
pub struct Quadtree {
    root: QuadNode,
    entities: Vec<Entity>,
    max_depth: u32,
    leaf_capacity: usize,
}

#[derive(Debug)]
struct QuadNode {
    bounds: Bounds,
    depth: u32,
    entries: Vec<u32>,
    children: Option<Box<[QuadNode; 4]>>,
}

impl Quadtree {
    /// Create an empty tree covering `bounds` with the default limits
    pub fn new(bounds: Bounds) -> Self {
        Self::with_limits(bounds, DEFAULT_MAX_DEPTH, DEFAULT_LEAF_CAPACITY)
    }

    pub fn with_limits(bounds: Bounds, max_depth: u32, leaf_capacity: usize) -> Self {
        Self {
            root: QuadNode::leaf(bounds, 0),
            entities: Vec::new(),
            max_depth,
            leaf_capacity: leaf_capacity.max(1),
        }
    }

    /// Insert an entity. Entities whose bounding box falls entirely outside
    /// the root bounds are kept in the arena but are unreachable by queries.
    pub fn insert(&mut self, entity: Entity) {
        let idx = self.entities.len() as u32;
        let bbox = entity.bounding_box();
        self.entities.push(entity);
        self.root.insert(
            idx,
            &bbox,
            &self.entities,
            self.max_depth,
            self.leaf_capacity,
        );
    }

    /// Collect indices of entities containing `p` into `out`. The buffer is
    /// cleared first; queries allocate nothing beyond its capacity growth.
    pub fn query_point(&self, p: Point, out: &mut Vec<u32>) {
        out.clear();
        self.root.query(p, &self.entities, out);
    }

    /// Convenience wrapper around [`Self::query_point`]
    pub fn entities_at(&self, p: Point) -> Vec<&Entity> {
        let mut hits = Vec::new();
        self.query_point(p, &mut hits);
        hits.iter().map(|&i| &self.entities[i as usize]).collect()
    }

    pub fn get(&self, idx: u32) -> &Entity {
        &self.entities[idx as usize]
    }

    /// Number of entities inserted
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn bounds(&self) -> &Bounds {
        &self.root.bounds
    }
}

impl QuadNode {
    fn leaf(bounds: Bounds, depth: u32) -> Self {
        Self {
            bounds,
            depth,
            entries: Vec::new(),
            children: None,
        }
    }

    fn insert(&mut self, idx: u32, bbox: &Bounds, arena: &[Entity], max_depth: u32, leaf_capacity: usize) {
        if !self.bounds.intersects(bbox) {
            return;
        }

        if let Some(children) = &mut self.children {
            for child in children.iter_mut() {
                child.insert(idx, bbox, arena, max_depth, leaf_capacity);
            }
            return;
        }

        if self.entries.len() < leaf_capacity || self.depth == max_depth {
            self.entries.push(idx);
            return;
        }

        self.split(arena, max_depth, leaf_capacity);
        if let Some(children) = &mut self.children {
            for child in children.iter_mut() {
                child.insert(idx, bbox, arena, max_depth, leaf_capacity);
            }
        }
    }

    /// Turn this leaf into an internal node and push its entries down.
    /// An entry lands in every child its bounding box touches.
    fn split(&mut self, arena: &[Entity], max_depth: u32, leaf_capacity: usize) {
        let quadrants = self.bounds.quadrants();
        let depth = self.depth + 1;
        let mut children = Box::new(quadrants.map(|b| QuadNode::leaf(b, depth)));

        for &idx in &self.entries {
            let bbox = arena[idx as usize].bounding_box();
            for child in children.iter_mut() {
                child.insert(idx, &bbox, arena, max_depth, leaf_capacity);
            }
        }

        self.entries.clear();
        self.children = Some(children);
    }

    fn query(&self, p: Point, arena: &[Entity], out: &mut Vec<u32>) {
        if !self.bounds.contains(p) {
            return;
        }

        match &self.children {
            None => {
                for &idx in &self.entries {
                    if arena[idx as usize].contains(p) {
                        out.push(idx);
                    }
                }
            }
            Some(children) => {
                // Quadrants share their boundary lines; the first child in
                // NW, NE, SW, SE order that contains the point wins, which
                // keeps border queries deterministic.
                for child in children.iter() {
                    if child.bounds.contains(p) {
                        child.query(p, arena, out);
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn test_bounds() -> Bounds {
        Bounds::new(Point::new(35.0, -85.0), Point::new(37.0, -83.0))
    }

    fn circle(id: &str, lat: f64, lon: f64, r: f64) -> Entity {
        Entity::Circle {
            id: id.to_string(),
            center: Point::new(lat, lon),
            radius_m: r,
        }
    }

    #[test]
    fn test_empty_tree_query() {
        let tree = Quadtree::new(test_bounds());
        let mut hits = Vec::new();
        tree.query_point(Point::new(36.0, -84.0), &mut hits);
        assert!(hits.is_empty());
    }

    #[test]
    fn test_query_outside_root_is_empty() {
        let mut tree = Quadtree::new(test_bounds());
        tree.insert(circle("c", 36.0, -84.0, 5000.0));
        let mut hits = Vec::new();
        tree.query_point(Point::new(40.0, -84.0), &mut hits);
        assert!(hits.is_empty());
    }

    #[test]
    fn test_single_entity_hit_and_miss() {
        let mut tree = Quadtree::new(test_bounds());
        tree.insert(circle("c", 35.9606, -83.9207, 1000.0));
        assert_eq!(tree.entities_at(Point::new(35.9610, -83.9200)).len(), 1);
        assert!(tree.entities_at(Point::new(36.5, -84.5)).is_empty());
    }

    #[test]
    fn test_split_preserves_entities() {
        // Push enough overlapping circles into one quadrant to force splits
        let mut tree = Quadtree::new(test_bounds());
        for i in 0..20 {
            let offset = i as f64 * 0.001;
            tree.insert(circle(&format!("c{}", i), 35.5 + offset, -84.5, 2000.0));
        }
        assert_eq!(tree.len(), 20);

        // A point at the cluster center is inside many of the circles
        let hits = tree.entities_at(Point::new(35.51, -84.5));
        assert!(hits.len() > 5, "expected many hits, got {}", hits.len());
    }

    #[test]
    fn test_containment_law_and_soundness() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut tree = Quadtree::new(test_bounds());
        let mut shapes = Vec::new();

        for i in 0..30 {
            let lat = rng.gen_range(35.2..36.8);
            let lon = rng.gen_range(-84.8..-83.2);
            let e = match i % 3 {
                0 => circle(&format!("c{}", i), lat, lon, rng.gen_range(200.0..3000.0)),
                1 => Entity::Edge {
                    id: format!("e{}", i),
                    a: Point::new(lat, lon),
                    b: Point::new(lat + rng.gen_range(-0.02..0.02), lon + rng.gen_range(-0.02..0.02)),
                    width_m: rng.gen_range(10.0..200.0),
                },
                _ => Entity::Grid {
                    id: format!("g{}", i),
                    bounds: Bounds::new(
                        Point::new(lat, lon),
                        Point::new(lat + 0.05, lon + 0.05),
                    ),
                    row: i,
                    col: i,
                },
            };
            shapes.push(e.clone());
            tree.insert(e);
        }

        let mut hits = Vec::new();
        for _ in 0..500 {
            let p = Point::new(rng.gen_range(35.0..37.0), rng.gen_range(-85.0..-83.0));
            tree.query_point(p, &mut hits);

            // soundness: everything reported contains the point
            for &idx in &hits {
                assert!(tree.get(idx).contains(p), "false positive at {:?}", p);
            }

            // containment law: everything containing the point is reported
            let reported: Vec<&Entity> = hits.iter().map(|&i| tree.get(i)).collect();
            for e in &shapes {
                if e.contains(p) {
                    assert!(
                        reported.iter().any(|r| r.id() == e.id()),
                        "missed {} at {:?}",
                        e.id(),
                        p
                    );
                }
            }
        }
    }

    #[test]
    fn test_border_query_deterministic() {
        let mut tree = Quadtree::new(test_bounds());
        // force a split so the root has quadrants
        for i in 0..8 {
            tree.insert(circle(&format!("c{}", i), 36.0, -84.0, 50_000.0));
        }
        let border = tree.bounds().center();
        let mut a = Vec::new();
        let mut b = Vec::new();
        tree.query_point(border, &mut a);
        tree.query_point(border, &mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_depth_cap_keeps_accepting() {
        // Identical shapes cannot be separated by splitting; the depth cap
        // must stop recursion and let leaves grow past capacity.
        let mut tree = Quadtree::with_limits(test_bounds(), 3, 2);
        for i in 0..50 {
            tree.insert(circle(&format!("c{}", i), 36.0, -84.0, 500.0));
        }
        assert_eq!(tree.len(), 50);
        assert_eq!(tree.entities_at(Point::new(36.0, -84.0)).len(), 50);
    }
}
