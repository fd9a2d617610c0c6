//! crossfeed binary: inspect routing, index metrics and client configuration
//!
//! Run with:
//! ```bash
//! cargo run -p crossfeed-client --bin crossfeed -- overlap --ranges pkranges.json --min 0x10 --max 0x90
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use crossfeed_core::{
    ClientConfig, CollectionId, IndexMetricsWriter, IndexUtilizationInfo, PartitionKeyRange,
    QueryRange, RoutingMap,
};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "crossfeed")]
#[command(about = "Cross-partition query tooling")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode an index utilization header and print it
    IndexMetrics {
        /// Header value
        payload: String,

        /// Payload is base64 encoded
        #[arg(long)]
        encoded: bool,
    },

    /// Print the partition key ranges overlapping a key range
    Overlap {
        /// JSON file with the collection's partition key ranges
        #[arg(long)]
        ranges: PathBuf,

        /// Inclusive lower bound
        #[arg(long, default_value = "")]
        min: String,

        /// Exclusive upper bound
        #[arg(long, default_value = "FF")]
        max: String,

        /// Collection id used in messages
        #[arg(long, default_value = "cli")]
        collection: String,
    },

    /// Print a client configuration file, or the defaults if it does not exist
    Config {
        path: PathBuf,
    },
}

/// Either a bare array or the service's `{"PartitionKeyRanges": [...]}` envelope
#[derive(Deserialize)]
#[serde(untagged)]
enum RangeFile {
    Envelope {
        #[serde(rename = "PartitionKeyRanges")]
        partition_key_ranges: Vec<PartitionKeyRange>,
    },
    List(Vec<PartitionKeyRange>),
}

impl RangeFile {
    fn into_ranges(self) -> Vec<PartitionKeyRange> {
        match self {
            RangeFile::Envelope { partition_key_ranges } => partition_key_ranges,
            RangeFile::List(ranges) => ranges,
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("crossfeed=info".parse()?))
        .init();

    let args = Args::parse();

    match args.command {
        Command::IndexMetrics { payload, encoded } => {
            let info = IndexUtilizationInfo::decode(Some(&payload), encoded);
            print!("{}", IndexMetricsWriter::write(&info));
        }
        Command::Overlap {
            ranges,
            min,
            max,
            collection,
        } => {
            let content = std::fs::read_to_string(&ranges)?;
            let file: RangeFile = serde_json::from_str(&content)?;
            let collection = CollectionId::parse(&collection)?;
            let map = RoutingMap::try_new(collection, file.into_ranges())?;

            let query = QueryRange::half_open(min, max);
            query.validate()?;
            let hits = map.overlapping(&query);
            tracing::info!(
                total = map.len(),
                overlapping = hits.len(),
                "Resolved overlapping ranges"
            );
            println!("{}", serde_json::to_string_pretty(&hits)?);
        }
        Command::Config { path } => {
            let config = if path.exists() {
                ClientConfig::load(&path)?
            } else {
                tracing::info!(path = %path.display(), "Config file not found, showing defaults");
                ClientConfig::default()
            };
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
