use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use ppm::broker::BrokerTransport;
use ppm::config::{CliOverrides, PpmConfig};
use ppm::kafka::KafkaTransport;
use ppm::logging::{self, LogSettings};
use ppm::runner::StreamRunner;
use ppm::shapes;
use ppm::shutdown::{self, ShutdownFlags};

#[derive(Parser)]
#[command(name = "ppm")]
#[command(about = "Privacy Protection Module - geofence and data filtering for BSM streams")]
struct Cli {
    /// Configuration for the broker client and the privacy filter
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    /// Check the configuration, print the resolved settings and exit
    #[arg(short = 'C', long = "config-check")]
    config_check: bool,

    /// The unfiltered consume topic
    #[arg(short = 'u', long = "unfiltered-topic")]
    unfiltered_topic: Option<String>,

    /// The filtered produce topic
    #[arg(short = 'f', long = "filtered-topic")]
    filtered_topic: Option<String>,

    /// Consumer topic partition from which to read
    #[arg(short = 'p', long = "partition")]
    partition: Option<i32>,

    /// Consumer group identifier
    #[arg(short = 'g', long = "group")]
    group: Option<String>,

    /// List of broker addresses (host:port,...)
    #[arg(short = 'b', long = "broker")]
    broker: Option<String>,

    /// Start offset in the consumed topic: beginning, end, stored or a byte offset
    #[arg(short = 'o', long = "offset")]
    offset: Option<String>,

    /// Exit when the last message of every partition has been received
    #[arg(short = 'x', long = "exit")]
    exit_on_eof: bool,

    /// Broker client debug facets, comma separated
    #[arg(short = 'd', long = "debug")]
    debug: Option<String>,

    /// Map data file specifying the geofence
    #[arg(short = 'm', long = "mapfile")]
    mapfile: Option<PathBuf>,

    /// Information log level [trace, debug, info, warning, error, critical, off]
    #[arg(short = 'v', long = "log-level", default_value = "info")]
    log_level: String,

    /// Directory for the log files
    #[arg(short = 'D', long = "log-dir")]
    log_dir: Option<PathBuf>,

    /// Remove existing log files at startup
    #[arg(short = 'R', long = "log-rm")]
    log_rm: bool,

    /// Information log file name
    #[arg(short = 'i', long = "ilog")]
    ilog: Option<String>,

    /// Error log file name
    #[arg(short = 'e', long = "elog")]
    elog: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_settings = LogSettings {
        info_level: logging::parse_level(&cli.log_level)?,
        remove_existing: cli.log_rm,
        ..LogSettings::default()
    };
    if let Some(dir) = &cli.log_dir {
        log_settings.dir = dir.clone();
    }
    if let Some(name) = &cli.ilog {
        log_settings.info_name = name.clone();
    }
    if let Some(name) = &cli.elog {
        log_settings.error_name = name.clone();
    }
    let _log_guards = logging::init(&log_settings).context("logger setup failed")?;

    let overrides = CliOverrides {
        unfiltered_topic: cli.unfiltered_topic.clone(),
        filtered_topic: cli.filtered_topic.clone(),
        partition: cli.partition,
        group: cli.group.clone(),
        broker: cli.broker.clone(),
        offset: cli.offset.clone(),
        exit_on_eof: cli.exit_on_eof,
        debug: cli.debug.clone(),
        mapfile: cli.mapfile.clone(),
    };

    let config = match PpmConfig::resolve(&cli.config, &overrides) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration failed: {}", e);
            eprintln!("configuration failed: {}", e);
            std::process::exit(1);
        }
    };

    if cli.config_check {
        print!("{}", config.dump());
        return Ok(());
    }

    let geofence = match shapes::build_geofence(
        &config.mapfile,
        config.geofence_bounds,
        config.quadtree_max_depth,
        config.quadtree_leaf_capacity,
    ) {
        Ok(tree) => Arc::new(tree),
        Err(e) => {
            error!("geofence build failed: {}", e);
            eprintln!("geofence build failed: {}", e);
            std::process::exit(1);
        }
    };
    info!(
        "geofence ready: {} shapes, mode {:?}",
        geofence.len(),
        config.mode
    );

    let flags = ShutdownFlags::new();
    shutdown::install_signal_handler(flags.clone());

    let transport: Arc<dyn BrokerTransport> = Arc::new(KafkaTransport::new(&config));
    let mut runner = StreamRunner::new(config, transport, geofence, flags);
    runner.run().await
}
