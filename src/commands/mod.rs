//! Command handlers.
//!
//! Each handler builds its stores from [`AppConfig`], runs, and shuts the
//! coordinator down so buffered ledger writes are flushed before exit.

use anyhow::{Context, Result, bail};
use eventdedup::config::AppConfig;
use eventdedup::ingest::{
    EventSink, IngestService, JsonLinesQueue, JsonLinesSink, MemorySink, QueueConsumer,
};
use eventdedup::services::BackendFactory;
use eventdedup::{Canonicalizer, DeduplicationService, Event};
use serde_json::Value;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Builds the coordinator, starts the flusher and warms the fast tier if configured.
fn start_service(config: &AppConfig) -> Result<Arc<DeduplicationService>> {
    let service = Arc::new(
        BackendFactory::create_service(config).context("failed to initialize storage")?,
    );
    service.start()?;
    if config.dedup.warm_on_startup {
        match service.seed_cache(config.dedup.warm_window) {
            Ok(report) => tracing::info!(seeded = report.seeded, "Startup warming complete"),
            Err(e) => tracing::warn!(error = %e, "Startup warming failed, continuing cold"),
        }
    }
    Ok(service)
}

fn stop_service(service: &DeduplicationService) -> Result<()> {
    let report = service.shutdown().context("final flush failed")?;
    tracing::debug!(flushed = report.flushed, "Final flush complete");
    Ok(())
}

fn open_sink(output: &str) -> Result<Arc<dyn EventSink>> {
    if output == "-" {
        return Ok(Arc::new(JsonLinesSink::stdout()));
    }
    Ok(Arc::new(JsonLinesSink::append(Path::new(output))?))
}

fn open_input(input: &str) -> Result<Box<dyn BufRead + Send>> {
    if input == "-" {
        return Ok(Box::new(BufReader::new(io::stdin())));
    }
    let file = File::open(input).with_context(|| format!("cannot open {input}"))?;
    Ok(Box::new(BufReader::new(file)))
}

/// Runs the HTTP ingestion endpoint until Ctrl-C.
#[cfg(feature = "http")]
pub fn cmd_serve(config: AppConfig, port: Option<u16>, output: &str) -> Result<()> {
    let service = start_service(&config)?;
    let ingest = IngestService::new(service.clone(), open_sink(output)?);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port.unwrap_or(config.server.port)));

    let runtime = tokio::runtime::Runtime::new().context("failed to create runtime")?;
    let served = runtime.block_on(eventdedup::ingest::http::serve(addr, ingest, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Cannot listen for shutdown signal");
        }
        tracing::info!("Shutdown requested");
    }));

    let stopped = stop_service(&service);
    served?;
    stopped
}

/// Runs the HTTP ingestion endpoint (feature not enabled).
#[cfg(not(feature = "http"))]
pub fn cmd_serve(_config: AppConfig, _port: Option<u16>, _output: &str) -> Result<()> {
    Err(eventdedup::Error::FeatureNotEnabled("http".to_string()).into())
}

/// Consumes newline-delimited JSON until the input is exhausted.
pub fn cmd_consume(config: &AppConfig, input: &str, output: &str) -> Result<()> {
    let service = start_service(config)?;
    let ingest = IngestService::new(service.clone(), open_sink(output)?);
    let consumer = QueueConsumer::new(JsonLinesQueue::new(open_input(input)?), ingest);

    let consumed = consumer.run();
    let stopped = stop_service(&service);
    let report = consumed?;
    stopped?;

    eprintln!("{}", serde_json::to_string(&report)?);
    Ok(())
}

/// Deduplicates one batch and prints the report.
pub fn cmd_check(config: &AppConfig, input: &str) -> Result<()> {
    let mut text = String::new();
    open_input(input)?.read_to_string(&mut text)?;
    let events = parse_batch(&text)?;

    let service = start_service(config)?;
    let ingest = IngestService::new(service.clone(), Arc::new(MemorySink::new()));
    let processed = ingest.process(events);
    let stopped = stop_service(&service);
    let report = processed?;
    stopped?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Seeds the fast tier from the ledger.
pub fn cmd_warm(config: &AppConfig, window_secs: Option<u64>) -> Result<()> {
    let service = BackendFactory::create_service(config)?;
    let window = window_secs.map_or(config.dedup.warm_window, Duration::from_secs);
    let report = service.seed_cache(window)?;
    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}

/// Prints the fingerprint of one JSON event.
pub fn cmd_fingerprint(config: &AppConfig, event: &str) -> Result<()> {
    let value: Value = serde_json::from_str(event).context("event is not valid JSON")?;
    let event = Event::from_value(value)?;
    let fingerprint = Canonicalizer::new(config.dedup.scope).fingerprint(&event)?;
    println!("{fingerprint}");
    Ok(())
}

/// Accepts a JSON array, an `{"events": [...]}` object, or JSON lines.
fn parse_batch(text: &str) -> Result<Vec<Value>> {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return match value {
            Value::Array(events) => Ok(events),
            Value::Object(mut object) => match object.remove("events") {
                Some(Value::Array(events)) => Ok(events),
                Some(_) => bail!("'events' must be an array"),
                None => Ok(vec![Value::Object(object)]),
            },
            other => Ok(vec![other]),
        };
    }
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(n, line)| {
            serde_json::from_str(line).with_context(|| format!("line {}: invalid JSON", n + 1))
        })
        .collect()
}
