//! Acquisition Service binary
//!
//! Startup phases: logging, configuration, schema registry, data source,
//! batch sink, scheduler. Runs until Ctrl+C / SIGTERM, then stops the loops,
//! flushes what is buffered and releases the devices. A second signal during
//! shutdown exits immediately.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use acqsrv::config::{AcqConfig, ConfigOverrides, SourceMode, DEFAULT_CONFIG_PATH};
use acqsrv::connection::ConnectionManager;
use acqsrv::schema::{RateClass, SchemaRegistry};
use acqsrv::sink::influx::InfluxWriter;
use acqsrv::sink::{BatchSink, LogWriter, TimeSeriesWriter};
use acqsrv::source::{DataSource, LiveSource, SyntheticSource};
use acqsrv::transport::{S7Client, SerialClient};
use acqsrv::weighing::WeighingReader;
use acqsrv::{Scheduler, StatusCache, SERVICE_NAME, SERVICE_VERSION};
use common::logging::{init_with_config, parse_level, LogConfig};
use errors::{log_classified, ClassifiedError};

#[derive(Parser, Debug, Clone)]
#[command(name = "acqsrv", version, about = "Dual-rate PLC and weighing acquisition service")]
struct Args {
    /// Service configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "ACQSRV_CONFIG")]
    config: PathBuf,

    /// Schema document (overrides the configured path)
    #[arg(short, long)]
    schema: Option<PathBuf>,

    /// Data source: live or synthetic
    #[arg(short, long)]
    mode: Option<SourceMode>,

    /// Log level for the service target
    #[arg(short, long)]
    log_level: Option<String>,

    /// Start a smelting batch with this code
    #[arg(short, long)]
    batch: Option<String>,

    /// Load and validate configuration and schema, print a summary, then exit
    #[arg(long)]
    validate: bool,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            schema: self.schema.clone(),
            mode: self.mode,
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Phase 1: configuration (logging depends on it)
    let config = AcqConfig::load(&args.config, &args.overrides())
        .with_context(|| format!("Failed to load configuration from {:?}", args.config))?;

    // Phase 2: logging
    let level = parse_level(&config.logging.level).unwrap_or(tracing::Level::INFO);
    init_with_config(LogConfig {
        service_name: config.service.name.clone(),
        level,
        log_dir: config.logging.dir.clone(),
        enable_json: config.logging.json,
        ansi: true,
    })
    .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;
    info!(
        "Starting {} v{} ({} mode)",
        SERVICE_NAME,
        SERVICE_VERSION,
        match config.service.mode {
            SourceMode::Live => "live",
            SourceMode::Synthetic => "synthetic",
        }
    );

    // Phase 3: schema registry
    let registry = match SchemaRegistry::from_file(&config.schema) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            error!(code = e.error_code(), "Schema load failed: {}", e);
            return Err(e).context("Invalid schema document");
        }
    };
    info!("Schema: {} blocks from {:?}", registry.len(), config.schema);

    if args.validate {
        println!("{}", validation_summary(&config, &registry)?);
        info!("Validation completed successfully");
        return Ok(());
    }

    // Phase 4: data source
    let source = Arc::new(build_source(&config));
    match source.prepare().await {
        Ok(()) => {}
        Err(e) if e.is_fatal_at_startup() => {
            log_classified(&e, "Initial connection failed");
            return Err(e).context("Device session cannot be used");
        }
        Err(e) => warn!("Initial connection failed, loops will retry: {}", e),
    }

    // Phase 5: batch context and sink
    let batches = config.batch_tracker();
    if let Some(code) = &args.batch {
        if let Err(e) = batches.start(code) {
            log_classified(&e, "Batch not started");
            if e.is_fatal_at_startup() {
                return Err(e).context("Invalid --batch");
            }
        }
    }
    match batches.current() {
        Some(batch) => info!("Batch {} {}", batch.batch_code, batch.state),
        None if batches.is_gated() => warn!("No active batch: samples are not persisted until one starts"),
        None => {}
    }

    let writer = build_writer(&config).await;
    info!("Sink: {} writer", writer.name());
    let sink = Arc::new(
        BatchSink::new(
            writer,
            config.batch.fast.policy(),
            config.batch.normal.policy(),
            config.write_timeout(),
        )
        .with_batches(batches),
    );
    let cache = Arc::new(StatusCache::new());

    // Phase 6: scheduler
    let cancel = CancellationToken::new();
    let handle = Scheduler::new(
        registry,
        source.clone(),
        sink.clone(),
        cache.clone(),
        config.scheduler(),
    )
    .spawn(cancel);
    info!("Service started");

    let signal = shutdown_signal().await;
    info!("Received {}, stopping scheduler", signal);
    let stats = tokio::select! {
        stats = handle.shutdown() => stats,
        signal = shutdown_signal() => {
            warn!("Received {} during shutdown, exiting without final flush", signal);
            return Ok(());
        }
    };
    for (rate, s) in &stats {
        info!(
            "{} loop: {} ticks, {} samples, {} read failures",
            rate, s.ticks, s.samples, s.read_failures
        );
    }
    for rate in RateClass::ALL {
        info!("{} sink: {:?}", rate, sink.stats(rate));
    }
    source.shutdown().await;
    info!("{} stopped ({} cached snapshots)", SERVICE_NAME, cache.len());
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM; returns the signal name
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => tokio::select! {
                _ = tokio::signal::ctrl_c() => "Ctrl+C",
                _ = term.recv() => "SIGTERM",
            },
            Err(e) => {
                warn!("SIGTERM handler unavailable ({}), waiting for Ctrl+C only", e);
                ctrl_c().await
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c().await
    }
}

async fn ctrl_c() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for Ctrl+C ({}), stop the process externally", e);
        std::future::pending::<()>().await;
    }
    "Ctrl+C"
}

fn build_source(config: &AcqConfig) -> DataSource {
    match config.service.mode {
        SourceMode::Synthetic => {
            info!("Source: synthetic (seed {:?})", config.synthetic.seed);
            SyntheticSource::new(config.synthetic.seed).into()
        },
        SourceMode::Live => {
            let session = S7Client::new(config.plc.s7_settings());
            let manager = Arc::new(ConnectionManager::new(
                Box::new(session),
                config.reconnect.policy(),
                config.plc.timeouts(),
            ));
            let weigher = config.serial.enabled.then(|| {
                info!(
                    "Weighing: {} @ {} baud, station {}",
                    config.serial.port, config.serial.baud_rate, config.serial.station
                );
                WeighingReader::new(
                    SerialClient::new(config.serial.settings()),
                    config.serial.request(),
                    config.serial.timeout(),
                )
            });
            info!("Source: live ({})", manager.endpoint());
            LiveSource::new(manager, weigher).into()
        },
    }
}

async fn build_writer(config: &AcqConfig) -> Arc<dyn TimeSeriesWriter> {
    if !config.influxdb.enabled {
        return Arc::new(LogWriter);
    }
    let writer = InfluxWriter::new(
        &config.influxdb.url,
        &config.influxdb.org,
        &config.influxdb.bucket,
        &config.influxdb.token,
    );
    // Not fatal: batches are buffered and retried until the store comes up
    if let Err(e) = writer.ping().await {
        warn!("InfluxDB not reachable at startup: {}", e);
    }
    Arc::new(writer)
}

fn validation_summary(config: &AcqConfig, registry: &SchemaRegistry) -> Result<String> {
    let blocks: Vec<_> = registry
        .blocks()
        .iter()
        .map(|b| {
            serde_json::json!({
                "id": b.id,
                "area": b.area.to_string(),
                "size": b.size,
                "rate": b.rate.as_str(),
                "class": b.class,
                "fields": b.fields.len(),
                "composites": b.composites.len(),
                "quantities": b.conversions.len(),
            })
        })
        .collect();

    let summary = serde_json::json!({
        "service": config.service.name,
        "mode": config.service.mode,
        "polling": {
            "fast_ms": config.polling.fast_period_ms,
            "normal_ms": config.polling.normal_period_ms,
        },
        "weighing": config.weighing_enabled(),
        "batch_gate": config.smelting.gated,
        "influxdb": config.influxdb.enabled,
        "blocks": blocks,
    });
    serde_json::to_string_pretty(&summary).context("Failed to render summary")
}
