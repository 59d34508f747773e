//! Geofence map file loader.
//!
//! The map file is CSV with one shape per line. Field 0 is the shape type,
//! the remaining fields depend on it:
//!
//! ```text
//! edge,<id>,<lat_a>,<lon_a>,<lat_b>,<lon_b>,<width_m>
//! circle,<id>,<lat>,<lon>,<radius_m>
//! grid,<id>,<sw_lat>,<sw_lon>,<ne_lat>,<ne_lon>,<row>,<col>
//! ```
//!
//! Lines starting with `#` and blank lines are skipped; fields are trimmed.
//! Any malformed row fails the whole load and names its line number.

use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};

use crate::geo::{Bounds, Entity, Point};
use crate::quadtree::Quadtree;

#[derive(Debug, Error)]
pub enum MapError {
    #[error("cannot read map file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("map file parse error at line {line}: {reason}")]
    Parse { line: u64, reason: String },
}

impl MapError {
    fn parse(line: u64, reason: impl Into<String>) -> Self {
        MapError::Parse {
            line,
            reason: reason.into(),
        }
    }
}

/// Parse the map file into entities, in source order
pub fn load_shapes(path: &Path) -> Result<Vec<Entity>, MapError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| match e.into_kind() {
            csv::ErrorKind::Io(source) => MapError::Io {
                path: path.display().to_string(),
                source,
            },
            other => MapError::Parse {
                line: 0,
                reason: format!("{:?}", other),
            },
        })?;

    let mut entities = Vec::new();

    for result in reader.records() {
        let record = result.map_err(|e| {
            let line = e.position().map(|p| p.line()).unwrap_or(0);
            MapError::parse(line, e.to_string())
        })?;
        let line = record.position().map(|p| p.line()).unwrap_or(0);

        // csv already drops blank lines and comments
        let kind = record.get(0).unwrap_or("");
        let entity = match kind {
            "edge" => parse_edge(&record, line)?,
            "circle" => parse_circle(&record, line)?,
            "grid" => parse_grid(&record, line)?,
            other => {
                return Err(MapError::parse(
                    line,
                    format!("unknown shape type \"{}\"", other),
                ));
            }
        };

        debug!("loaded {} shape {}", kind, entity.id());
        entities.push(entity);
    }

    Ok(entities)
}

/// Load the map file and index every shape into a quadtree over `bounds`
pub fn build_geofence(
    path: &Path,
    bounds: Bounds,
    max_depth: u32,
    leaf_capacity: usize,
) -> Result<Quadtree, MapError> {
    let entities = load_shapes(path)?;
    let mut tree = Quadtree::with_limits(bounds, max_depth, leaf_capacity);
    let count = entities.len();
    for entity in entities {
        tree.insert(entity);
    }
    info!(
        "geofence built from {}: {} shapes indexed",
        path.display(),
        count
    );
    Ok(tree)
}

fn field<'r>(record: &'r csv::StringRecord, idx: usize, name: &str, line: u64) -> Result<&'r str, MapError> {
    record
        .get(idx)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| MapError::parse(line, format!("missing field {} ({})", idx, name)))
}

fn f64_field(record: &csv::StringRecord, idx: usize, name: &str, line: u64) -> Result<f64, MapError> {
    let raw = field(record, idx, name, line)?;
    raw.parse::<f64>()
        .map_err(|_| MapError::parse(line, format!("field {} is not a number: \"{}\"", name, raw)))
}

fn u32_field(record: &csv::StringRecord, idx: usize, name: &str, line: u64) -> Result<u32, MapError> {
    let raw = field(record, idx, name, line)?;
    raw.parse::<u32>()
        .map_err(|_| MapError::parse(line, format!("field {} is not an integer: \"{}\"", name, raw)))
}

fn checked_point(lat: f64, lon: f64, line: u64) -> Result<Point, MapError> {
    let p = Point::new(lat, lon);
    if !p.is_valid() {
        return Err(MapError::parse(
            line,
            format!("coordinate out of range: ({}, {})", lat, lon),
        ));
    }
    Ok(p)
}

fn parse_edge(record: &csv::StringRecord, line: u64) -> Result<Entity, MapError> {
    let id = field(record, 1, "id", line)?.to_string();
    let a = checked_point(
        f64_field(record, 2, "lat_a", line)?,
        f64_field(record, 3, "lon_a", line)?,
        line,
    )?;
    let b = checked_point(
        f64_field(record, 4, "lat_b", line)?,
        f64_field(record, 5, "lon_b", line)?,
        line,
    )?;
    let width_m = f64_field(record, 6, "width_m", line)?;
    if width_m <= 0.0 {
        return Err(MapError::parse(line, "edge width must be positive"));
    }
    Ok(Entity::Edge { id, a, b, width_m })
}

fn parse_circle(record: &csv::StringRecord, line: u64) -> Result<Entity, MapError> {
    let id = field(record, 1, "id", line)?.to_string();
    let center = checked_point(
        f64_field(record, 2, "lat", line)?,
        f64_field(record, 3, "lon", line)?,
        line,
    )?;
    let radius_m = f64_field(record, 4, "radius_m", line)?;
    if radius_m <= 0.0 {
        return Err(MapError::parse(line, "circle radius must be positive"));
    }
    Ok(Entity::Circle {
        id,
        center,
        radius_m,
    })
}

fn parse_grid(record: &csv::StringRecord, line: u64) -> Result<Entity, MapError> {
    let id = field(record, 1, "id", line)?.to_string();
    let sw = checked_point(
        f64_field(record, 2, "sw_lat", line)?,
        f64_field(record, 3, "sw_lon", line)?,
        line,
    )?;
    let ne = checked_point(
        f64_field(record, 4, "ne_lat", line)?,
        f64_field(record, 5, "ne_lon", line)?,
        line,
    )?;
    if sw.lat > ne.lat || sw.lon > ne.lon {
        return Err(MapError::parse(line, "grid sw corner must not exceed ne corner"));
    }
    let row = u32_field(record, 6, "row", line)?;
    let col = u32_field(record, 7, "col", line)?;
    Ok(Entity::Grid {
        id,
        bounds: Bounds::new(sw, ne),
        row,
        col,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_map(contents: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn test_load_all_shape_kinds() {
        let map = write_map(
            "# test map\n\
             edge,way-42,35.9500,-83.9300,35.9510,-83.9200,17.0\n\
             circle,cbd,35.9606,-83.9207,1000\n\
             \n\
             grid,cell-0-0,35.90,-84.00,35.95,-83.95,0,0\n",
        );
        let shapes = load_shapes(map.path()).unwrap();
        assert_eq!(shapes.len(), 3);
        assert_eq!(shapes[0].id(), "way-42");
        assert!(matches!(shapes[1], Entity::Circle { .. }));
        assert!(matches!(shapes[2], Entity::Grid { .. }));
    }

    #[test]
    fn test_fields_are_trimmed() {
        let map = write_map("circle, cbd , 35.9606 , -83.9207 , 1000 \n");
        let shapes = load_shapes(map.path()).unwrap();
        assert_eq!(shapes[0].id(), "cbd");
    }

    #[test]
    fn test_malformed_row_names_line() {
        let map = write_map(
            "# comment\n\
             circle,ok,35.9606,-83.9207,1000\n\
             circle,bad,not-a-number,-83.9207,1000\n",
        );
        let err = load_shapes(map.path()).unwrap_err();
        match err {
            MapError::Parse { line, .. } => assert_eq!(line, 3),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_unknown_shape_type_rejected() {
        let map = write_map("polygon,p1,35.0,-84.0\n");
        assert!(load_shapes(map.path()).is_err());
    }

    #[test]
    fn test_out_of_range_coordinate_rejected() {
        let map = write_map("circle,c1,95.0,-83.92,1000\n");
        assert!(load_shapes(map.path()).is_err());
    }

    #[test]
    fn test_nonpositive_radius_rejected() {
        let map = write_map("circle,c1,35.96,-83.92,0\n");
        assert!(load_shapes(map.path()).is_err());
    }

    #[test]
    fn test_geofence_round_trip_count() {
        let mut body = String::from("# shapes\n");
        for i in 0..12 {
            body.push_str(&format!(
                "circle,c{},35.9{},-83.9{},500\n",
                i,
                i % 10,
                i % 10
            ));
        }
        let map = write_map(&body);
        let bounds = Bounds::new(Point::new(35.0, -85.0), Point::new(37.0, -83.0));
        let tree = build_geofence(map.path(), bounds, 6, 4).unwrap();
        assert_eq!(tree.len(), 12);
    }

    #[test]
    fn test_missing_file() {
        let err = load_shapes(Path::new("/nonexistent/map.csv")).unwrap_err();
        assert!(matches!(err, MapError::Io { .. }));
    }
}
