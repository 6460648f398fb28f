//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{num::NonZeroUsize, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::BackoffPolicy;
use crate::domain::entities::InstanceId;

mod cli;

pub use cli::{CliArgs, Command, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "template-engine";
const ENV_PREFIX: &str = "TEMPLATE_ENGINE";
const DEFAULT_CACHE_MAX_ENTRIES: u64 = 500;
const DEFAULT_CACHE_TTL_SECS: u64 = 600;
const DEFAULT_CACHE_SHARDS: u64 = 16;
const DEFAULT_CACHE_HIGH_WATER_LIMIT: u64 = 4096;
const DEFAULT_CACHE_PURGE_INTERVAL_SECS: u64 = 60;
const DEFAULT_STORE_TIMEOUT_MS: u64 = 2000;
const DEFAULT_BUS_TOPIC: &str = "template-cache-changes";
const DEFAULT_BUS_PARTITIONS: u64 = 8;
const DEFAULT_PUBLISHER_QUEUE_LEN: u64 = 1024;
const DEFAULT_CONSUMER_BATCH_LIMIT: u64 = 100;
const DEFAULT_CONSUMER_POLL_INTERVAL_MS: u64 = 200;
const DEFAULT_CONSUMER_DELIVERY_BUDGET_MS: u64 = 2000;
const DEFAULT_CONSUMER_APPLY_BUDGET_MS: u64 = 500;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub instance: InstanceSettings,
    pub cache: CacheSettings,
    pub store: StoreSettings,
    pub bus: BusSettings,
    pub publisher: PublisherSettings,
    pub consumer: ConsumerSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct InstanceSettings {
    pub id: InstanceId,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub max_entries: NonZeroUsize,
    pub ttl: Duration,
    pub shards: NonZeroUsize,
    pub high_water_limit: NonZeroUsize,
    pub purge_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct BusSettings {
    pub topic: String,
    pub partitions: NonZeroUsize,
    pub group: String,
}

#[derive(Debug, Clone)]
pub struct PublisherSettings {
    pub queue_len: NonZeroUsize,
    pub retry: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub batch_limit: NonZeroUsize,
    pub poll_interval: Duration,
    pub delivery_budget: Duration,
    pub apply_budget: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    instance: RawInstanceSettings,
    cache: RawCacheSettings,
    store: RawStoreSettings,
    bus: RawBusSettings,
    publisher: RawPublisherSettings,
    consumer: RawConsumerSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(id) = overrides.instance_id.as_ref() {
            self.instance.id = Some(id.clone());
        }
        if let Some(max) = overrides.cache_max_entries {
            self.cache.max_entries = Some(max);
        }
        if let Some(ttl) = overrides.cache_ttl_seconds {
            self.cache.ttl_seconds = Some(ttl);
        }
        if let Some(shards) = overrides.cache_shards {
            self.cache.shards = Some(shards);
        }
        if let Some(interval) = overrides.cache_purge_interval_seconds {
            self.cache.purge_interval_seconds = Some(interval);
        }
        if let Some(timeout) = overrides.store_timeout_ms {
            self.store.timeout_ms = Some(timeout);
        }
        if let Some(topic) = overrides.bus_topic.as_ref() {
            self.bus.topic = Some(topic.clone());
        }
        if let Some(partitions) = overrides.bus_partitions {
            self.bus.partitions = Some(partitions);
        }
        if let Some(group) = overrides.bus_group.as_ref() {
            self.bus.group = Some(group.clone());
        }
        if let Some(retries) = overrides.publisher_max_retries {
            self.publisher.max_retries = Some(retries);
        }
        if let Some(interval) = overrides.consumer_poll_interval_ms {
            self.consumer.poll_interval_ms = Some(interval);
        }
        if let Some(budget) = overrides.consumer_delivery_budget_ms {
            self.consumer.delivery_budget_ms = Some(budget);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            instance,
            cache,
            store,
            bus,
            publisher,
            consumer,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let instance = build_instance_settings(instance)?;
        let cache = build_cache_settings(cache)?;
        let store = build_store_settings(store)?;
        let bus = build_bus_settings(bus, &instance)?;
        let publisher = build_publisher_settings(publisher)?;
        let consumer = build_consumer_settings(consumer)?;

        Ok(Self {
            logging,
            instance,
            cache,
            store,
            bus,
            publisher,
            consumer,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_instance_settings(instance: RawInstanceSettings) -> Result<InstanceSettings, LoadError> {
    let id = match instance.id.as_deref().map(str::trim) {
        Some(value) if !value.is_empty() => InstanceId::from_str(value).map_err(|err| {
            LoadError::invalid("instance.id", format!("expected a UUID: {err}"))
        })?,
        _ => InstanceId::random(),
    };

    Ok(InstanceSettings { id })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let max_entries = non_zero_usize(
        cache.max_entries.unwrap_or(DEFAULT_CACHE_MAX_ENTRIES),
        "cache.max_entries",
    )?;
    let shards = non_zero_usize(cache.shards.unwrap_or(DEFAULT_CACHE_SHARDS), "cache.shards")?;
    let high_water_limit = non_zero_usize(
        cache
            .high_water_limit
            .unwrap_or(DEFAULT_CACHE_HIGH_WATER_LIMIT),
        "cache.high_water_limit",
    )?;
    if high_water_limit < max_entries {
        return Err(LoadError::invalid(
            "cache.high_water_limit",
            "must be at least cache.max_entries",
        ));
    }

    let ttl = positive_duration(
        cache.ttl_seconds.unwrap_or(DEFAULT_CACHE_TTL_SECS),
        "cache.ttl_seconds",
        Duration::from_secs,
    )?;
    let purge_interval = positive_duration(
        cache
            .purge_interval_seconds
            .unwrap_or(DEFAULT_CACHE_PURGE_INTERVAL_SECS),
        "cache.purge_interval_seconds",
        Duration::from_secs,
    )?;

    Ok(CacheSettings {
        max_entries,
        ttl,
        shards,
        high_water_limit,
        purge_interval,
    })
}

fn build_store_settings(store: RawStoreSettings) -> Result<StoreSettings, LoadError> {
    let timeout = positive_duration(
        store.timeout_ms.unwrap_or(DEFAULT_STORE_TIMEOUT_MS),
        "store.timeout_ms",
        Duration::from_millis,
    )?;

    Ok(StoreSettings { timeout })
}

fn build_bus_settings(
    bus: RawBusSettings,
    instance: &InstanceSettings,
) -> Result<BusSettings, LoadError> {
    let topic = bus
        .topic
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| DEFAULT_BUS_TOPIC.to_string());
    if topic.is_empty() {
        return Err(LoadError::invalid("bus.topic", "must not be empty"));
    }

    let partitions = non_zero_usize(
        bus.partitions.unwrap_or(DEFAULT_BUS_PARTITIONS),
        "bus.partitions",
    )?;

    // One group per instance so every instance sees every event.
    let group = bus
        .group
        .and_then(|value| {
            let trimmed = value.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        })
        .unwrap_or_else(|| format!("template-engine-{}", instance.id));

    Ok(BusSettings {
        topic,
        partitions,
        group,
    })
}

fn build_publisher_settings(
    publisher: RawPublisherSettings,
) -> Result<PublisherSettings, LoadError> {
    let queue_len = non_zero_usize(
        publisher.queue_len.unwrap_or(DEFAULT_PUBLISHER_QUEUE_LEN),
        "publisher.queue_len",
    )?;

    let defaults = BackoffPolicy::default();
    let retry = BackoffPolicy {
        max_retries: publisher.max_retries.unwrap_or(defaults.max_retries),
        timeout_ms: publisher.timeout_ms.unwrap_or(defaults.timeout_ms),
        base_delay_ms: publisher.base_delay_ms.unwrap_or(defaults.base_delay_ms),
        max_delay_ms: publisher.max_delay_ms.unwrap_or(defaults.max_delay_ms),
    };
    if retry.timeout_ms == 0 {
        return Err(LoadError::invalid(
            "publisher.timeout_ms",
            "must be greater than zero",
        ));
    }
    if retry.base_delay_ms > retry.max_delay_ms {
        return Err(LoadError::invalid(
            "publisher.base_delay_ms",
            "must not exceed publisher.max_delay_ms",
        ));
    }

    Ok(PublisherSettings { queue_len, retry })
}

fn build_consumer_settings(consumer: RawConsumerSettings) -> Result<ConsumerSettings, LoadError> {
    let batch_limit = non_zero_usize(
        consumer.batch_limit.unwrap_or(DEFAULT_CONSUMER_BATCH_LIMIT),
        "consumer.batch_limit",
    )?;
    let poll_interval = positive_duration(
        consumer
            .poll_interval_ms
            .unwrap_or(DEFAULT_CONSUMER_POLL_INTERVAL_MS),
        "consumer.poll_interval_ms",
        Duration::from_millis,
    )?;
    let delivery_budget = Duration::from_millis(
        consumer
            .delivery_budget_ms
            .unwrap_or(DEFAULT_CONSUMER_DELIVERY_BUDGET_MS),
    );
    let apply_budget = positive_duration(
        consumer
            .apply_budget_ms
            .unwrap_or(DEFAULT_CONSUMER_APPLY_BUDGET_MS),
        "consumer.apply_budget_ms",
        Duration::from_millis,
    )?;

    Ok(ConsumerSettings {
        batch_limit,
        poll_interval,
        delivery_budget,
        apply_budget,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawInstanceSettings {
    id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    max_entries: Option<u64>,
    ttl_seconds: Option<u64>,
    shards: Option<u64>,
    high_water_limit: Option<u64>,
    purge_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBusSettings {
    topic: Option<String>,
    partitions: Option<u64>,
    group: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPublisherSettings {
    queue_len: Option<u64>,
    max_retries: Option<usize>,
    timeout_ms: Option<u64>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawConsumerSettings {
    batch_limit: Option<u64>,
    poll_interval_ms: Option<u64>,
    delivery_budget_ms: Option<u64>,
    apply_budget_ms: Option<u64>,
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn positive_duration(
    value: u64,
    key: &'static str,
    unit: fn(u64) -> Duration,
) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(unit(value))
}
