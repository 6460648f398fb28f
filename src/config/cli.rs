use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the template-engine binary.
#[derive(Debug, Parser)]
#[command(
    name = "template-engine",
    version,
    about = "Template engine cache-coherence node"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "TEMPLATE_ENGINE_CONFIG_FILE",
        value_name = "PATH"
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run one engine instance with its publish worker and event consumer.
    Serve(Box<ServeArgs>),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the instance identifier (UUID) stamped on change events.
    #[arg(long = "instance-id", value_name = "UUID")]
    pub instance_id: Option<String>,

    /// Override the local cache entry limit.
    #[arg(long = "cache-max-entries", value_name = "COUNT")]
    pub cache_max_entries: Option<u64>,

    /// Override the local cache time-to-live.
    #[arg(long = "cache-ttl-seconds", value_name = "SECONDS")]
    pub cache_ttl_seconds: Option<u64>,

    /// Override the number of local cache lock stripes.
    #[arg(long = "cache-shards", value_name = "COUNT")]
    pub cache_shards: Option<u64>,

    /// Override the expired-entry sweep cadence.
    #[arg(long = "cache-purge-interval-seconds", value_name = "SECONDS")]
    pub cache_purge_interval_seconds: Option<u64>,

    /// Override the default store call timeout.
    #[arg(long = "store-timeout-ms", value_name = "MILLIS")]
    pub store_timeout_ms: Option<u64>,

    /// Override the change-event topic name.
    #[arg(long = "bus-topic", value_name = "TOPIC")]
    pub bus_topic: Option<String>,

    /// Override the number of topic partitions.
    #[arg(long = "bus-partitions", value_name = "COUNT")]
    pub bus_partitions: Option<u64>,

    /// Override the subscriber group name.
    #[arg(long = "bus-group", value_name = "GROUP")]
    pub bus_group: Option<String>,

    /// Override the publish retry limit (0 retries forever).
    #[arg(long = "publisher-max-retries", value_name = "COUNT")]
    pub publisher_max_retries: Option<usize>,

    /// Override the consumer poll interval.
    #[arg(long = "consumer-poll-interval-ms", value_name = "MILLIS")]
    pub consumer_poll_interval_ms: Option<u64>,

    /// Override the expected bus delivery latency.
    #[arg(long = "consumer-delivery-budget-ms", value_name = "MILLIS")]
    pub consumer_delivery_budget_ms: Option<u64>,
}
