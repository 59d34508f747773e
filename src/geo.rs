//! Geofence geometry primitives.
//!
//! All coordinates are WGS-84 decimal degrees. Circle containment uses
//! great-circle (haversine) distance; edge capsules project into a local
//! equirectangular plane anchored at the segment midpoint, which is accurate
//! to well under a meter at the scale of road segments.

use serde::{Deserialize, Serialize};

/// Mean Earth radius for the haversine distance, in meters.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// WGS-84 equatorial radius for the local-plane approximation, in meters.
pub const EQUATORIAL_RADIUS_M: f64 = 6_378_137.0;

/// A geographic point in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub lat: f64,
    pub lon: f64,
}

impl Point {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Check that the point lies within valid WGS-84 ranges
    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lon)
    }
}

/// An axis-aligned geographic rectangle. `sw.lat <= ne.lat` and
/// `sw.lon <= ne.lon`; the antimeridian is not wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub sw: Point,
    pub ne: Point,
}

impl Bounds {
    pub fn new(sw: Point, ne: Point) -> Self {
        Self { sw, ne }
    }

    /// Inclusive containment on both edges
    pub fn contains(&self, p: Point) -> bool {
        p.lat >= self.sw.lat && p.lat <= self.ne.lat && p.lon >= self.sw.lon && p.lon <= self.ne.lon
    }

    pub fn intersects(&self, other: &Bounds) -> bool {
        !(other.ne.lat < self.sw.lat
            || other.sw.lat > self.ne.lat
            || other.ne.lon < self.sw.lon
            || other.sw.lon > self.ne.lon)
    }

    pub fn center(&self) -> Point {
        Point::new(
            (self.sw.lat + self.ne.lat) / 2.0,
            (self.sw.lon + self.ne.lon) / 2.0,
        )
    }

    /// The four equal quadrants of this rectangle, ordered NW, NE, SW, SE.
    /// Neighboring quadrants share their boundary lines.
    pub fn quadrants(&self) -> [Bounds; 4] {
        let mid = self.center();
        [
            // NW
            Bounds::new(
                Point::new(mid.lat, self.sw.lon),
                Point::new(self.ne.lat, mid.lon),
            ),
            // NE
            Bounds::new(mid, self.ne),
            // SW
            Bounds::new(self.sw, mid),
            // SE
            Bounds::new(
                Point::new(self.sw.lat, mid.lon),
                Point::new(mid.lat, self.ne.lon),
            ),
        ]
    }

    /// Clamp a point onto this rectangle (the closest point of the rectangle)
    fn closest_point(&self, p: Point) -> Point {
        Point::new(
            p.lat.clamp(self.sw.lat, self.ne.lat),
            p.lon.clamp(self.sw.lon, self.ne.lon),
        )
    }
}

/// Calculate the distance between two points using the Haversine formula
/// Returns distance in meters
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Project `p` into a local equirectangular plane centered on `origin`.
/// Returns (x, y) offsets in meters, x east and y north.
fn local_xy(origin: Point, p: Point) -> (f64, f64) {
    let x = (p.lon - origin.lon).to_radians() * origin.lat.to_radians().cos() * EQUATORIAL_RADIUS_M;
    let y = (p.lat - origin.lat).to_radians() * EQUATORIAL_RADIUS_M;
    (x, y)
}

/// Meters of latitude expressed in degrees
fn meters_to_lat_degrees(m: f64) -> f64 {
    (m / EQUATORIAL_RADIUS_M).to_degrees()
}

/// Meters of longitude expressed in degrees at the given latitude
fn meters_to_lon_degrees(m: f64, at_lat: f64) -> f64 {
    // cos() shrinks toward the poles; floor it so the bounding box only
    // ever over-covers
    let cos_lat = at_lat.to_radians().cos().max(1e-6);
    (m / (EQUATORIAL_RADIUS_M * cos_lat)).to_degrees()
}

/// A geofence shape. Edges are capsules around a road segment, circles are
/// radius regions, grids are rectangular mask cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Entity {
    Circle {
        id: String,
        center: Point,
        radius_m: f64,
    },
    Edge {
        id: String,
        a: Point,
        b: Point,
        width_m: f64,
    },
    Grid {
        id: String,
        bounds: Bounds,
        row: u32,
        col: u32,
    },
}

impl Entity {
    pub fn id(&self) -> &str {
        match self {
            Entity::Circle { id, .. } | Entity::Edge { id, .. } | Entity::Grid { id, .. } => id,
        }
    }

    /// The smallest axis-aligned rectangle covering this shape
    pub fn bounding_box(&self) -> Bounds {
        match self {
            Entity::Circle {
                center, radius_m, ..
            } => {
                let dlat = meters_to_lat_degrees(*radius_m);
                let dlon = meters_to_lon_degrees(*radius_m, center.lat);
                Bounds::new(
                    Point::new(center.lat - dlat, center.lon - dlon),
                    Point::new(center.lat + dlat, center.lon + dlon),
                )
            }
            Entity::Edge { a, b, width_m, .. } => {
                let half = width_m / 2.0;
                let max_lat = a.lat.max(b.lat);
                let dlat = meters_to_lat_degrees(half);
                let dlon = meters_to_lon_degrees(half, max_lat);
                Bounds::new(
                    Point::new(a.lat.min(b.lat) - dlat, a.lon.min(b.lon) - dlon),
                    Point::new(max_lat + dlat, a.lon.max(b.lon) + dlon),
                )
            }
            Entity::Grid { bounds, .. } => *bounds,
        }
    }

    /// Point-in-shape test
    pub fn contains(&self, p: Point) -> bool {
        match self {
            Entity::Circle {
                center, radius_m, ..
            } => haversine_distance(center.lat, center.lon, p.lat, p.lon) <= *radius_m,
            Entity::Edge { a, b, width_m, .. } => {
                // Project onto the segment in the local plane, clamp the
                // parameter to [0, 1], and compare the offset against the
                // half width.
                let origin = Point::new((a.lat + b.lat) / 2.0, (a.lon + b.lon) / 2.0);
                let (ax, ay) = local_xy(origin, *a);
                let (bx, by) = local_xy(origin, *b);
                let (px, py) = local_xy(origin, p);

                let (dx, dy) = (bx - ax, by - ay);
                let len2 = dx * dx + dy * dy;
                let t = if len2 == 0.0 {
                    0.0
                } else {
                    (((px - ax) * dx + (py - ay) * dy) / len2).clamp(0.0, 1.0)
                };
                let (cx, cy) = (ax + t * dx, ay + t * dy);
                ((px - cx).powi(2) + (py - cy).powi(2)).sqrt() <= width_m / 2.0
            }
            Entity::Grid { bounds, .. } => bounds.contains(p),
        }
    }

    /// Shape-vs-rectangle overlap test, used to place entities into
    /// quadtree nodes
    pub fn intersects(&self, b: &Bounds) -> bool {
        match self {
            Entity::Circle {
                center, radius_m, ..
            } => {
                let closest = b.closest_point(*center);
                haversine_distance(center.lat, center.lon, closest.lat, closest.lon) <= *radius_m
            }
            Entity::Edge {
                a, b: eb, width_m, ..
            } => {
                // Inflate the rectangle by the half width in the local plane
                // and clip the segment against it.
                let origin = b.center();
                let (ax, ay) = local_xy(origin, *a);
                let (bx, by) = local_xy(origin, *eb);
                let (swx, swy) = local_xy(origin, b.sw);
                let (nex, ney) = local_xy(origin, b.ne);
                let half = width_m / 2.0;
                segment_intersects_rect(ax, ay, bx, by, swx - half, swy - half, nex + half, ney + half)
            }
            Entity::Grid { bounds, .. } => bounds.intersects(b),
        }
    }
}

/// Liang-Barsky clip: does the segment (ax,ay)-(bx,by) touch the rectangle?
fn segment_intersects_rect(
    ax: f64,
    ay: f64,
    bx: f64,
    by: f64,
    min_x: f64,
    min_y: f64,
    max_x: f64,
    max_y: f64,
) -> bool {
    let dx = bx - ax;
    let dy = by - ay;
    let mut t0 = 0.0_f64;
    let mut t1 = 1.0_f64;

    let edges = [
        (-dx, ax - min_x),
        (dx, max_x - ax),
        (-dy, ay - min_y),
        (dy, max_y - ay),
    ];

    for (p, q) in edges {
        if p == 0.0 {
            // parallel to this edge; outside means no intersection at all
            if q < 0.0 {
                return false;
            }
        } else {
            let r = q / p;
            if p < 0.0 {
                if r > t1 {
                    return false;
                }
                if r > t0 {
                    t0 = r;
                }
            } else {
                if r < t0 {
                    return false;
                }
                if r < t1 {
                    t1 = r;
                }
            }
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn circle(lat: f64, lon: f64, r: f64) -> Entity {
        Entity::Circle {
            id: "c1".to_string(),
            center: Point::new(lat, lon),
            radius_m: r,
        }
    }

    #[test]
    fn test_point_validity() {
        assert!(Point::new(35.96, -83.92).is_valid());
        assert!(!Point::new(90.01, 0.0).is_valid());
        assert!(!Point::new(0.0, -180.5).is_valid());
    }

    #[test]
    fn test_haversine_known_distance() {
        // Knoxville to Oak Ridge is roughly 30 km
        let d = haversine_distance(35.9606, -83.9207, 36.0104, -84.2696);
        assert!(d > 29_000.0 && d < 33_000.0, "unexpected distance {}", d);
    }

    #[test]
    fn test_circle_containment() {
        let c = circle(35.9606, -83.9207, 1000.0);
        assert!(c.contains(Point::new(35.9610, -83.9200)));
        assert!(!c.contains(Point::new(36.0, -84.0)));
    }

    #[test]
    fn test_edge_capsule_containment() {
        // A roughly east-west segment about 890 m long, 20 m wide
        let e = Entity::Edge {
            id: "e1".to_string(),
            a: Point::new(35.9600, -83.9300),
            b: Point::new(35.9600, -83.9200),
            width_m: 20.0,
        };
        // on the segment
        assert!(e.contains(Point::new(35.9600, -83.9250)));
        // ~5 m north of the centerline, inside the 10 m half width
        assert!(e.contains(Point::new(35.960045, -83.9250)));
        // ~50 m north, outside
        assert!(!e.contains(Point::new(35.96045, -83.9250)));
        // past the endpoint cap
        assert!(!e.contains(Point::new(35.9600, -83.9310)));
    }

    #[test]
    fn test_grid_containment() {
        let g = Entity::Grid {
            id: "g1".to_string(),
            bounds: Bounds::new(Point::new(35.0, -84.0), Point::new(36.0, -83.0)),
            row: 0,
            col: 0,
        };
        assert!(g.contains(Point::new(35.5, -83.5)));
        assert!(g.contains(Point::new(35.0, -84.0))); // corner is inclusive
        assert!(!g.contains(Point::new(36.1, -83.5)));
    }

    #[test]
    fn test_quadrants_cover_and_order() {
        let b = Bounds::new(Point::new(0.0, 0.0), Point::new(4.0, 4.0));
        let q = b.quadrants();
        // NW, NE, SW, SE
        assert!(q[0].contains(Point::new(3.0, 1.0)));
        assert!(q[1].contains(Point::new(3.0, 3.0)));
        assert!(q[2].contains(Point::new(1.0, 1.0)));
        assert!(q[3].contains(Point::new(1.0, 3.0)));
        // the shared center belongs to every quadrant
        for quad in &q {
            assert!(quad.contains(Point::new(2.0, 2.0)));
        }
    }

    #[test]
    fn test_circle_bounds_intersection() {
        let c = circle(35.9606, -83.9207, 1000.0);
        let near = Bounds::new(Point::new(35.95, -83.93), Point::new(35.97, -83.91));
        let far = Bounds::new(Point::new(40.0, -80.0), Point::new(41.0, -79.0));
        assert!(c.intersects(&near));
        assert!(!c.intersects(&far));
    }

    #[test]
    fn test_edge_bounds_intersection() {
        let e = Entity::Edge {
            id: "e1".to_string(),
            a: Point::new(35.9600, -83.9300),
            b: Point::new(35.9600, -83.9200),
            width_m: 20.0,
        };
        let crossing = Bounds::new(Point::new(35.9590, -83.9260), Point::new(35.9610, -83.9240));
        let disjoint = Bounds::new(Point::new(36.1, -83.93), Point::new(36.2, -83.92));
        assert!(e.intersects(&crossing));
        assert!(!e.intersects(&disjoint));
    }

    #[test]
    fn test_bounding_box_covers_shape() {
        let c = circle(35.9606, -83.9207, 500.0);
        let bbox = c.bounding_box();
        assert!(bbox.contains(Point::new(35.9606, -83.9207)));
        // a point just inside the radius must be inside the box
        assert!(bbox.contains(Point::new(35.9645, -83.9207)));
    }
}
