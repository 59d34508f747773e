//! Shared helpers for the end-to-end filter tests.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ppm::broker::StartOffset;
use ppm::config::PpmConfig;
use ppm::geo::{Bounds, Entity, Point};
use ppm::policy::FilterMode;
use ppm::quadtree::Quadtree;

pub const RAW_TOPIC: &str = "j2735BsmRawJson";
pub const FILTERED_TOPIC: &str = "j2735BsmFilteredJson";

/// Region around the Knoxville test geofence
pub fn region_bounds() -> Bounds {
    Bounds::new(Point::new(35.0, -85.0), Point::new(37.0, -83.0))
}

/// One-circle geofence used by the literal scenarios:
/// (lat 35.9606, lon -83.9207, r 1000 m)
pub fn circle_geofence() -> Arc<Quadtree> {
    let mut tree = Quadtree::new(region_bounds());
    tree.insert(Entity::Circle {
        id: "scenario-circle".to_string(),
        center: Point::new(35.9606, -83.9207),
        radius_m: 1000.0,
    });
    Arc::new(tree)
}

pub fn scenario_config() -> PpmConfig {
    PpmConfig {
        consumed_topic: RAW_TOPIC.to_string(),
        published_topic: FILTERED_TOPIC.to_string(),
        partition: None,
        group: Some("ppm-test".to_string()),
        brokers: "localhost".to_string(),
        offset: StartOffset::Beginning,
        exit_on_eof: true,
        debug_facets: None,
        consumer_timeout: Duration::from_millis(500),
        mapfile: PathBuf::from("unused.csv"),
        geofence_bounds: region_bounds(),
        quadtree_max_depth: 6,
        quadtree_leaf_capacity: 4,
        mode: FilterMode::Inclusive,
        min_speed_mps: 2.235,
        max_speed_mps: 44.7,
        redact_fields: Vec::new(),
        client_overrides: BTreeMap::new(),
    }
}

/// A BSM document with the given identity and motion. Speed is given in
/// meters per second and encoded into raw J2735 units of 0.02 m/s.
pub fn bsm_payload(id: &str, lat: f64, lon: f64, speed_mps: f64) -> Vec<u8> {
    serde_json::json!({
        "metadata": { "recordType": "bsmTx" },
        "coreData": {
            "msgCnt": 1,
            "id": id,
            "secMark": 36000,
            "position": { "latitude": lat, "longitude": lon, "elevation": 280.0 },
            "speed": speed_mps / 0.02,
            "heading": 7200.0,
            "size": { "width": 180, "length": 480 }
        },
        "partII": [{ "id": 0, "value": { "events": 0 } }]
    })
    .to_string()
    .into_bytes()
}
