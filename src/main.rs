use std::{process, sync::Arc};

use template_engine::{
    application::error::AppError,
    cache::CoherenceConfig,
    config,
    infra::{bus::MemoryBus, node::CoherenceNode, store::MemoryDocumentStore, telemetry},
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    let report = error.report();
    if dispatcher::has_been_set() {
        error!(error = %error, chain = ?report.messages, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, chain = ?report.messages, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let store = MemoryDocumentStore::new();
    let bus = MemoryBus::new(settings.bus.topic.clone(), settings.bus.partitions.get());
    let subscription = bus.subscribe(&settings.bus.group);

    let node = CoherenceNode::start(
        CoherenceConfig::from(&settings),
        settings.instance.id,
        Arc::new(store),
        Arc::new(bus.clone()),
        subscription,
        settings.cache.purge_interval,
    );

    info!(
        instance = %settings.instance.id,
        topic = bus.topic(),
        partitions = bus.partition_count(),
        group = %settings.bus.group,
        max_entries = settings.cache.max_entries.get(),
        ttl_secs = settings.cache.ttl.as_secs(),
        "template-engine ready"
    );

    let signal = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");

    let report = node.shutdown().await?;
    info!(
        applied = report.applied,
        stale = report.stale,
        malformed = report.malformed,
        "template-engine stopped"
    );

    signal.map_err(|err| {
        AppError::unexpected(format!("failed to listen for shutdown signal: {err}"))
    })
}
