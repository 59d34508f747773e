//! Configuration resolver.
//!
//! Three sources feed the typed config, highest precedence first: CLI
//! flags, environment variables, then the configuration file. The file is
//! `key=value` lines with `#` comments. Keys under `privacy.` belong to
//! this module; every other key is forwarded verbatim to the broker
//! client, which is how operators reach librdkafka settings.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::broker::StartOffset;
use crate::geo::{Bounds, Point};
use crate::policy::{DEFAULT_MAX_SPEED_MPS, DEFAULT_MIN_SPEED_MPS, FilterMode, FilterPolicy};
use crate::quadtree::{DEFAULT_LEAF_CAPACITY, DEFAULT_MAX_DEPTH};

/// Default consumer poll timeout in milliseconds
pub const DEFAULT_CONSUMER_TIMEOUT_MS: u64 = 500;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("missing required configuration key {0}")]
    MissingKey(&'static str),
    #[error("invalid value for {key}: \"{value}\" ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
    #[error("environment variable {0} is required when KAFKA_TYPE=CONFLUENT")]
    MissingEnv(&'static str),
}

/// Values the CLI may override; `None` means the flag was not given
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub unfiltered_topic: Option<String>,
    pub filtered_topic: Option<String>,
    pub partition: Option<i32>,
    pub group: Option<String>,
    pub broker: Option<String>,
    pub offset: Option<String>,
    pub exit_on_eof: bool,
    pub debug: Option<String>,
    pub mapfile: Option<PathBuf>,
}

/// The fully resolved module configuration
#[derive(Debug, Clone)]
pub struct PpmConfig {
    pub consumed_topic: String,
    pub published_topic: String,
    pub partition: Option<i32>,
    pub group: Option<String>,
    pub brokers: String,
    pub offset: StartOffset,
    pub exit_on_eof: bool,
    pub debug_facets: Option<String>,
    pub consumer_timeout: Duration,
    pub mapfile: PathBuf,
    pub geofence_bounds: Bounds,
    pub quadtree_max_depth: u32,
    pub quadtree_leaf_capacity: usize,
    pub mode: FilterMode,
    pub min_speed_mps: f64,
    pub max_speed_mps: f64,
    pub redact_fields: Vec<String>,
    /// Keys forwarded verbatim to the broker client
    pub client_overrides: BTreeMap<String, String>,
}

impl PpmConfig {
    /// Resolve from the given file and CLI overrides, reading the process
    /// environment
    pub fn resolve(path: &Path, cli: &CliOverrides) -> Result<Self, ConfigError> {
        Self::resolve_with_env(path, cli, |name| std::env::var(name).ok())
    }

    /// Resolve with an injected environment lookup (tests use this to
    /// avoid mutating process state)
    pub fn resolve_with_env(
        path: &Path,
        cli: &CliOverrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let (privacy, mut client_overrides) = read_config_file(path)?;

        // environment: managed-broker mode injects the SASL settings the
        // way a confluent deployment expects them
        let mut confluent_bootstrap = None;
        if env("KAFKA_TYPE").as_deref() == Some("CONFLUENT") {
            let key = env("CONFLUENT_KEY").ok_or(ConfigError::MissingEnv("CONFLUENT_KEY"))?;
            let secret =
                env("CONFLUENT_SECRET").ok_or(ConfigError::MissingEnv("CONFLUENT_SECRET"))?;
            let host = env("DOCKER_HOST_IP").ok_or(ConfigError::MissingEnv("DOCKER_HOST_IP"))?;

            info!("confluent mode: injecting SASL_SSL broker settings");
            confluent_bootstrap = Some(host);
            client_overrides.insert("security.protocol".to_string(), "SASL_SSL".to_string());
            client_overrides.insert("sasl.mechanisms".to_string(), "PLAIN".to_string());
            client_overrides.insert("sasl.username".to_string(), key);
            client_overrides.insert("sasl.password".to_string(), secret);
            client_overrides.insert("api.version.request".to_string(), "true".to_string());
            client_overrides.insert("api.version.fallback.ms".to_string(), "0".to_string());
            client_overrides.insert("broker.version.fallback".to_string(), "0.10.0.0".to_string());
        }

        let consumed_topic = cli
            .unfiltered_topic
            .clone()
            .or_else(|| privacy.get("privacy.topic.consumer").cloned())
            .ok_or(ConfigError::MissingKey("privacy.topic.consumer"))?;

        let published_topic = cli
            .filtered_topic
            .clone()
            .or_else(|| privacy.get("privacy.topic.producer").cloned())
            .ok_or(ConfigError::MissingKey("privacy.topic.producer"))?;

        let partition = match cli.partition {
            Some(p) => Some(p),
            None => parse_opt(&privacy, "privacy.kafka.partition", |v| {
                v.parse::<i32>().map_err(|e| e.to_string())
            })?,
        };

        let group = cli.group.clone();

        // the broker list is owned by the resolver; leaving either key in
        // the pass-through map would overwrite the resolved value inside
        // the client
        let file_broker_list = client_overrides.remove("metadata.broker.list");
        let file_bootstrap = client_overrides.remove("bootstrap.servers");
        let brokers = cli
            .broker
            .clone()
            .or(confluent_bootstrap)
            .or(file_broker_list)
            .or(file_bootstrap)
            .unwrap_or_else(|| "localhost".to_string());

        let offset = match &cli.offset {
            Some(raw) => raw.parse::<StartOffset>().map_err(|reason| {
                ConfigError::Invalid {
                    key: "offset".to_string(),
                    value: raw.clone(),
                    reason,
                }
            })?,
            None => StartOffset::Beginning,
        };

        let consumer_timeout_ms = parse_opt(&privacy, "privacy.consumer.timeout.ms", |v| {
            v.parse::<u64>().map_err(|e| e.to_string())
        })?
        .unwrap_or(DEFAULT_CONSUMER_TIMEOUT_MS);

        let mapfile = cli
            .mapfile
            .clone()
            .or_else(|| privacy.get("privacy.filter.geofence.mapfile").map(PathBuf::from))
            .ok_or(ConfigError::MissingKey("privacy.filter.geofence.mapfile"))?;

        let geofence_bounds = Bounds::new(
            Point::new(
                parse_coord(&privacy, "privacy.filter.geofence.sw.lat")?.unwrap_or(-90.0),
                parse_coord(&privacy, "privacy.filter.geofence.sw.lon")?.unwrap_or(-180.0),
            ),
            Point::new(
                parse_coord(&privacy, "privacy.filter.geofence.ne.lat")?.unwrap_or(90.0),
                parse_coord(&privacy, "privacy.filter.geofence.ne.lon")?.unwrap_or(180.0),
            ),
        );
        if geofence_bounds.sw.lat > geofence_bounds.ne.lat
            || geofence_bounds.sw.lon > geofence_bounds.ne.lon
        {
            return Err(ConfigError::Invalid {
                key: "privacy.filter.geofence".to_string(),
                value: format!("{:?}", geofence_bounds),
                reason: "sw corner must not exceed ne corner".to_string(),
            });
        }

        let quadtree_max_depth = parse_opt(&privacy, "privacy.filter.geofence.depth.max", |v| {
            v.parse::<u32>().map_err(|e| e.to_string())
        })?
        .unwrap_or(DEFAULT_MAX_DEPTH);

        let quadtree_leaf_capacity =
            parse_opt(&privacy, "privacy.filter.geofence.leaf.capacity", |v| {
                v.parse::<usize>().map_err(|e| e.to_string())
            })?
            .unwrap_or(DEFAULT_LEAF_CAPACITY);

        let mode = parse_opt(&privacy, "privacy.filter.mode", |v| {
            v.parse::<FilterMode>()
        })?
        .unwrap_or(FilterMode::Inclusive);

        let min_speed_mps = parse_opt(&privacy, "privacy.filter.velocity.min", |v| {
            v.parse::<f64>().map_err(|e| e.to_string())
        })?
        .unwrap_or(DEFAULT_MIN_SPEED_MPS);

        let max_speed_mps = parse_opt(&privacy, "privacy.filter.velocity.max", |v| {
            v.parse::<f64>().map_err(|e| e.to_string())
        })?
        .unwrap_or(DEFAULT_MAX_SPEED_MPS);

        if min_speed_mps > max_speed_mps {
            return Err(ConfigError::Invalid {
                key: "privacy.filter.velocity".to_string(),
                value: format!("{}..{}", min_speed_mps, max_speed_mps),
                reason: "minimum exceeds maximum".to_string(),
            });
        }

        let redact_fields = privacy
            .get("privacy.filter.redact.fields")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            consumed_topic,
            published_topic,
            partition,
            group,
            brokers,
            offset,
            exit_on_eof: cli.exit_on_eof,
            debug_facets: cli.debug.clone(),
            consumer_timeout: Duration::from_millis(consumer_timeout_ms),
            mapfile,
            geofence_bounds,
            quadtree_max_depth,
            quadtree_leaf_capacity,
            mode,
            min_speed_mps,
            max_speed_mps,
            redact_fields,
            client_overrides,
        })
    }

    pub fn filter_policy(&self) -> FilterPolicy {
        FilterPolicy {
            mode: self.mode,
            min_speed_mps: self.min_speed_mps,
            max_speed_mps: self.max_speed_mps,
        }
    }

    /// Render the resolved settings for `--config-check`
    pub fn dump(&self) -> String {
        let mut out = String::from("# Resolved PPM configuration\n");
        out.push_str(&format!("consumed topic   = {}\n", self.consumed_topic));
        out.push_str(&format!("published topic  = {}\n", self.published_topic));
        out.push_str(&format!(
            "partition        = {}\n",
            self.partition
                .map(|p| p.to_string())
                .unwrap_or_else(|| "unassigned".to_string())
        ));
        out.push_str(&format!(
            "group            = {}\n",
            self.group.as_deref().unwrap_or("-")
        ));
        out.push_str(&format!("brokers          = {}\n", self.brokers));
        out.push_str(&format!("offset           = {:?}\n", self.offset));
        out.push_str(&format!("exit on eof      = {}\n", self.exit_on_eof));
        out.push_str(&format!(
            "consumer timeout = {} ms\n",
            self.consumer_timeout.as_millis()
        ));
        out.push_str(&format!("mapfile          = {}\n", self.mapfile.display()));
        out.push_str(&format!(
            "geofence         = ({}, {}) .. ({}, {})\n",
            self.geofence_bounds.sw.lat,
            self.geofence_bounds.sw.lon,
            self.geofence_bounds.ne.lat,
            self.geofence_bounds.ne.lon
        ));
        out.push_str(&format!(
            "quadtree         = depth {} leaf {}\n",
            self.quadtree_max_depth, self.quadtree_leaf_capacity
        ));
        out.push_str(&format!("mode             = {:?}\n", self.mode));
        out.push_str(&format!(
            "velocity         = {} .. {} m/s\n",
            self.min_speed_mps, self.max_speed_mps
        ));
        out.push_str(&format!(
            "redact fields    = {}\n",
            if self.redact_fields.is_empty() {
                "-".to_string()
            } else {
                self.redact_fields.join(",")
            }
        ));
        out.push_str("# Broker client config\n");
        for (key, value) in &self.client_overrides {
            let shown = if key.contains("password") || key.contains("secret") {
                "********"
            } else {
                value.as_str()
            };
            out.push_str(&format!("{} = {}\n", key, shown));
        }
        out
    }
}

type KeyMap = BTreeMap<String, String>;

/// Split the file into privacy keys and broker-client keys
fn read_config_file(path: &Path) -> Result<(KeyMap, KeyMap), ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let mut privacy = KeyMap::new();
    let mut client = KeyMap::new();

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            warn!("ignoring configuration line without '=': {}", line);
            continue;
        };
        let key = key.trim().to_string();
        let value = value.trim().to_string();
        if key.starts_with("privacy.") {
            privacy.insert(key, value);
        } else {
            client.insert(key, value);
        }
    }

    Ok((privacy, client))
}

fn parse_opt<T>(
    map: &KeyMap,
    key: &str,
    parse: impl Fn(&str) -> Result<T, String>,
) -> Result<Option<T>, ConfigError> {
    match map.get(key) {
        None => Ok(None),
        Some(raw) => parse(raw).map(Some).map_err(|reason| ConfigError::Invalid {
            key: key.to_string(),
            value: raw.clone(),
            reason,
        }),
    }
}

fn parse_coord(map: &KeyMap, key: &str) -> Result<Option<f64>, ConfigError> {
    parse_opt(map, key, |v| v.parse::<f64>().map_err(|e| e.to_string()))
}
