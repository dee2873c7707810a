//! Binary entrypoint: loads config, wires the monitors/dispatcher/sinks
//! topology together, and runs until shutdown is requested.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use logbeam::admin::{self, AdminState};
use logbeam::backpressure::{BackpressureController, BackpressureThresholds, DegradationManager, Feature, LoadInputs};
use logbeam::config::Config;
use logbeam::container_monitor::ContainerMonitor;
use logbeam::dedup::Deduplicator;
use logbeam::dispatcher::{Dispatcher, DispatcherConfig as RuntimeDispatcherConfig, Pipeline, SinkTarget};
use logbeam::processing::ProcessingRegistry;
use logbeam::sinks::local_file::LocalFileSink;
use logbeam::sinks::loki::LokiSink;
use logbeam::sinks::Sink;
use logbeam_buffers::dlq::{DeadLetterQueue, DlqConfig};
use logbeam_core::LogEntry;
use logbeam_file_source::position_store::FilePositionStore;
use logbeam_file_source::{Discovery, FileWatcher, RateLimiter};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "logbeam")]
struct Cli {
    #[arg(short, long, default_value = "/etc/logbeam/config.yaml")]
    config: PathBuf,
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.app.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(filter);
    if config.app.log_format == "json" {
        let _ = subscriber.json().try_init();
    } else {
        let _ = subscriber.try_init();
    }
}

fn build_sinks(config: &Config) -> (Vec<SinkTarget>, Option<Arc<LokiSink>>) {
    use logbeam::batcher::AdaptiveBatcherConfig;

    let mut sinks = Vec::new();
    let mut loki_handle = None;
    if config.sinks.loki.enabled {
        let adaptive = &config.sinks.loki.adaptive_batching;
        let loki = Arc::new(LokiSink::new(config.sinks.loki.clone()));
        loki_handle = Some(loki.clone());
        sinks.push(SinkTarget {
            name: "loki".to_string(),
            sink: loki as Arc<dyn Sink>,
            batcher_config: AdaptiveBatcherConfig {
                min_size: adaptive.min_batch_size,
                max_size: adaptive.max_batch_size,
                initial_size: adaptive.initial_batch_size,
                min_flush_delay: adaptive.min_flush_delay,
                max_flush_delay: adaptive.max_flush_delay,
                initial_flush_delay: config.sinks.loki.batch_timeout,
                latency_threshold: adaptive.latency_threshold,
                throughput_target: adaptive.throughput_target,
                adaptation_interval: adaptive.adaptation_interval,
                shrink_factor: 0.75,
                grow_factor: 1.25,
                window_capacity: 20,
            },
        });
    }
    if config.sinks.local_file.enabled {
        sinks.push(SinkTarget {
            name: "local_file".to_string(),
            sink: Arc::new(LocalFileSink::new(config.sinks.local_file.clone())) as Arc<dyn Sink>,
            batcher_config: AdaptiveBatcherConfig::default(),
        });
    }
    (sinks, loki_handle)
}

fn build_dlq(config: &Config) -> Option<DeadLetterQueue> {
    if !config.dlq.enabled {
        return None;
    }
    let dlq_config = DlqConfig {
        directory: PathBuf::from(&config.dlq.directory),
        max_file_size: config.dlq.max_file_size,
        max_total_size: config.dlq.max_file_size * 10,
        retention_period: config.dlq.retention_period,
        max_recovery_attempts: config.dlq.reprocessing.max_retries,
        backoff_base: Duration::from_secs(1),
        backoff_max: Duration::from_secs(300),
        max_pending_in_memory: 10_000,
    };
    match DeadLetterQueue::open(dlq_config, true) {
        Ok(dlq) => Some(dlq),
        Err(err) => {
            error!(error = %err, "failed to open dead letter queue, continuing without it");
            None
        }
    }
}

async fn run_file_monitor(config: Config, sender: mpsc::Sender<LogEntry>, mut shutdown: watch::Receiver<bool>) {
    let fm = &config.file_monitor_service;
    if !fm.enabled {
        return;
    }
    let discovery = Discovery::new(fm.paths.clone(), fm.exclude_paths.clone());
    let store = match FilePositionStore::new(config.positions.directory.clone(), true) {
        Ok(store) => store,
        Err(err) => {
            error!(error = %err, "failed to open position store, file monitor disabled");
            return;
        }
    };
    store.load();

    let mut watchers: HashMap<PathBuf, (FileWatcher, RateLimiter)> = HashMap::new();
    let mut ticker = tokio::time::interval(fm.poll_interval);
    let mut flush_ticker = tokio::time::interval(config.positions.flush_interval);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("file monitor stopping on shutdown signal");
                break;
            }
            _ = ticker.tick() => {
                for path in discovery.discover() {
                    if watchers.contains_key(&path) {
                        continue;
                    }
                    let key = path.to_string_lossy().to_string();
                    let position = store.get(&key).unwrap_or_else(|| logbeam_core::position::FilePosition::new(0, 0));
                    match FileWatcher::open(path.clone(), position, BTreeMap::new()) {
                        Ok(watcher) => {
                            let limiter = RateLimiter::new(fm.rate_limit.max_lines_per_second, fm.rate_limit.quiet_period);
                            watchers.insert(path, (watcher, limiter));
                        }
                        Err(err) => warn!(path = %path.display(), error = %err, "failed to open file for tailing"),
                    }
                }

                let mut gone = Vec::new();
                for (path, (watcher, limiter)) in watchers.iter_mut() {
                    if let Err(err) = watcher.reconcile_rotation() {
                        warn!(path = %path.display(), error = %err, "rotation check failed, dropping watcher");
                        gone.push(path.clone());
                        continue;
                    }
                    match watcher.read_available(limiter) {
                        Ok(entries) => {
                            for entry in entries {
                                if sender.send(entry).await.is_err() {
                                    return;
                                }
                            }
                            store.update(path.to_string_lossy().to_string(), watcher.position.clone());
                        }
                        Err(err) => {
                            warn!(path = %path.display(), error = %err, "read failed, dropping watcher");
                            gone.push(path.clone());
                        }
                    }
                }
                for path in gone {
                    watchers.remove(&path);
                }
            }
            _ = flush_ticker.tick() => {
                if let Err(err) = store.flush() {
                    warn!(error = %err, "failed to flush file positions");
                }
            }
        }
    }

    if config.positions.force_flush_on_exit {
        if let Err(err) = store.flush() {
            warn!(error = %err, "failed to flush file positions on shutdown");
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Config::load(&cli.config).unwrap_or_else(|err| {
        eprintln!("failed to load config {}: {err}, using defaults", cli.config.display());
        Config::default()
    });
    init_tracing(&config);
    info!(app = %config.app.name, version = %config.app.version, "starting logbeam");

    let processing = if config.processing.enabled {
        match &config.processing.pipelines_file {
            Some(path) => ProcessingRegistry::load(path).unwrap_or_else(|err| {
                error!(error = %err, "failed to load processing pipelines, running without processing");
                ProcessingRegistry::empty()
            }),
            None => ProcessingRegistry::empty(),
        }
    } else {
        ProcessingRegistry::empty()
    };

    let backpressure = BackpressureController::new(BackpressureThresholds {
        low: config.backpressure.low_threshold,
        medium: config.backpressure.medium_threshold,
        high: config.backpressure.high_threshold,
        critical: config.backpressure.critical_threshold,
        stabilize_time: config.backpressure.stabilize_time,
        cooldown_time: config.backpressure.cooldown_time,
    });

    let dedup = Deduplicator::new(
        config.deduplication.max_cache_size,
        config.deduplication.ttl,
        config.deduplication.include_timestamp,
        config.deduplication.include_source_id,
    );

    // Features a backpressure level can disable, thresholds chosen so the
    // cheapest degradations land first: drop deduplication at high load,
    // processing at sustained high load, and heavy compression earliest
    // since it costs CPU that's in short supply under any kind of pressure.
    let degradation = DegradationManager::new(
        vec![
            (logbeam::backpressure::BackpressureLevel::Medium, Feature::HeavyCompression),
            (logbeam::backpressure::BackpressureLevel::High, Feature::Deduplication),
            (logbeam::backpressure::BackpressureLevel::Critical, Feature::ComplexProcessing),
        ],
        config.backpressure.cooldown_time,
        config.backpressure.stabilize_time,
    );

    let pipeline = Pipeline::new(
        config.selfguard.clone(),
        config.file_monitor_service.rate_limit.clone(),
        config.timestamp_validation.clone(),
        backpressure,
        dedup,
        degradation,
        processing,
    );

    let (sinks, loki_handle) = build_sinks(&config);
    if sinks.is_empty() {
        warn!("no sinks enabled; ingested entries will be dropped after batching");
    }
    let dlq = build_dlq(&config);

    let dispatcher = Arc::new(Dispatcher::new(
        RuntimeDispatcherConfig {
            worker_count: config.dispatcher.worker_count,
            max_retries: config.dispatcher.max_retries,
            retry_base_delay_ms: config.dispatcher.retry_base_delay_ms,
            dlq_enabled: config.dlq.enabled,
        },
        pipeline,
        sinks,
        dlq,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (sender, receiver) = mpsc::channel(config.dispatcher.queue_size);
    let mut handles = Arc::clone(&dispatcher).spawn(receiver, shutdown_rx.clone());

    if config.file_monitor_service.enabled {
        let file_sender = sender.clone();
        let file_config = config.clone();
        let file_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            run_file_monitor(file_config, file_sender, file_shutdown).await;
        }));
    }

    if config.container_monitor.enabled {
        let container_sender = sender.clone();
        let container_config = config.container_monitor.clone();
        let mut container_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            match ContainerMonitor::new(container_config, container_sender).await {
                Ok(monitor) => {
                    tokio::select! {
                        result = monitor.run() => {
                            if let Err(err) = result {
                                error!(error = %err, "container monitor exited with error");
                            }
                        }
                        _ = container_shutdown.changed() => {
                            info!("container monitor stopping on shutdown signal");
                        }
                    }
                }
                Err(err) => error!(error = %err, "failed to start container monitor"),
            }
        }));
    }

    if config.server.enabled {
        let dispatcher_for_stats = dispatcher.clone();
        let config_for_snapshot = config.clone();
        let server_shutdown = shutdown_rx.clone();
        let addr = format!("{}:{}", config.server.host, config.server.port).parse().unwrap_or_else(|_| {
            ([0, 0, 0, 0], 8686).into()
        });
        handles.push(tokio::spawn(async move {
            let state = AdminState {
                config_snapshot: Box::new(move || serde_json::to_value(&config_for_snapshot).unwrap_or(json!({}))),
                stats_snapshot: Box::new({
                    let dispatcher = dispatcher_for_stats.clone();
                    move || json!({ "dropped_total": dispatcher.dropped_total() })
                }),
                positions_snapshot: Box::new(|| json!([])),
                dlq_stats_snapshot: Box::new(|| json!({})),
                reload_config: Box::new(|| Ok(())),
                dlq_reprocess: Box::new(|| Ok(json!({ "processed": 0 }))),
            };
            if let Err(err) = admin::serve(addr, state, server_shutdown).await {
                error!(error = %err, "admin server exited with error");
            }
        }));
    }

    if config.backpressure.enabled {
        let bp_dispatcher = dispatcher.clone();
        let bp_pipeline = dispatcher.pipeline();
        let bp_loki = loki_handle.clone();
        let bp_config = config.backpressure.clone();
        let bp_sender = sender.clone();
        let bp_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            run_backpressure_sampler(bp_dispatcher, bp_pipeline, bp_loki, bp_config, bp_sender, bp_shutdown).await;
        }));
    }

    drop(sender);

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(err) => error!(error = %err, "failed to listen for shutdown signal"),
    }
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, futures::future::join_all(handles)).await {
        Ok(_) => info!("all tasks stopped cleanly"),
        Err(_) => warn!("shutdown timed out after {:?}, remaining tasks will be dropped with the runtime", SHUTDOWN_TIMEOUT),
    }
}

/// Periodically samples the load the running system is under and feeds it
/// into the shared pipeline's backpressure controller and degradation
/// manager, and propagates the resulting reduction factor and feature
/// disables into the Loki sink (spec.md §4.G, §5's "one backpressure
/// sampling task").
async fn run_backpressure_sampler(
    dispatcher: Arc<Dispatcher>,
    pipeline: Arc<Pipeline>,
    loki: Option<Arc<LokiSink>>,
    config: logbeam::config::BackpressureConfig,
    inbound: mpsc::Sender<LogEntry>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.check_interval);
    let mut last_dropped = dispatcher.dropped_total();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("backpressure sampler stopping on shutdown signal");
                break;
            }
            _ = ticker.tick() => {
                let dropped_now = dispatcher.dropped_total();
                let dropped_delta = dropped_now.saturating_sub(last_dropped);
                last_dropped = dropped_now;

                let capacity = inbound.capacity() as f64;
                let max_capacity = inbound.max_capacity() as f64;
                let queue_utilization = if max_capacity > 0.0 {
                    (1.0 - capacity / max_capacity).clamp(0.0, 1.0)
                } else {
                    0.0
                };

                // No system-metrics crate is part of this stack; memory/cpu/io
                // pressure stay at zero until one is pulled in rather than
                // fabricating readings.
                let inputs = LoadInputs {
                    queue_utilization,
                    memory_pressure: 0.0,
                    cpu_pressure: 0.0,
                    io_pressure: 0.0,
                    error_rate: (dropped_delta as f64 / 100.0).min(1.0),
                };

                let now = Instant::now();
                let level = pipeline.backpressure.lock().observe(inputs, now);
                pipeline.degradation.lock().apply(level, now);

                if let Some(loki) = &loki {
                    loki.set_backpressure_reduction(pipeline.backpressure.lock().reduction());
                    loki.set_heavy_compression_disabled(pipeline.degradation.lock().is_disabled(Feature::HeavyCompression));
                }
            }
        }
    }
}
