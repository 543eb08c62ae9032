use anyhow::Result;
use ngs_correlator::{Correlator, CorrelatorSettings, LogSink, NotificationSink, WebhookSink};
use ngs_ingest::{
    FileProvider, GraphProvider, ImapProvider, Ingester, IngestSettings, MailProvider,
};
use ngs_llm::{ChatProvider, LlmExtractor};
use ngs_maintenance::{MaintenanceDetector, MaintenanceEngine};
use ngs_parser::{compile_parsers, EmailParser, ParserSettings};
use ngs_storage::MailStore;
use ngs_worker::config::WorkerConfig;
use ngs_worker::pipeline::{DlqPolicy, PipelineHandler, QueueHandler};
use ngs_worker::scheduler::Sweepers;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::EnvFilter;

#[allow(clippy::print_stderr)]
fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  ngs-worker [config.toml]              Start the worker");
    eprintln!("  ngs-worker rollback <config.toml> <version-id>");
    eprintln!("                                        Re-activate a stored config version");
}

#[tokio::main]
async fn main() -> Result<()> {
    ngs_common::id::init(1, 1);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("ngs=info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("rollback") => {
            let config_path = args.get(2).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("rollback requires <config.toml> and <version-id> arguments")
            })?;
            let version_id = args.get(3).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("rollback requires <version-id> argument")
            })?;
            run_rollback(config_path, version_id).await
        }
        Some("--help" | "-h") => {
            print_usage();
            Ok(())
        }
        other => {
            let config_path = other.unwrap_or("config/worker.toml");
            run_worker(config_path).await
        }
    }
}

/// Re-activate a previously stored configuration version.
async fn run_rollback(config_path: &str, version_id: &str) -> Result<()> {
    let config = WorkerConfig::load(config_path)?;
    let store = MailStore::new(Path::new(&config.database.data_dir)).await?;
    if store.activate_config_version("worker", version_id).await? {
        tracing::info!(version_id, "Config version re-activated");
        Ok(())
    } else {
        anyhow::bail!("config version '{version_id}' not found")
    }
}

async fn run_worker(config_path: &str) -> Result<()> {
    let config = WorkerConfig::load(config_path)?;

    tracing::info!(
        provider = %config.ingest.provider,
        folders = ?config.ingest.folders,
        data_dir = %config.database.data_dir,
        "ngs-worker starting"
    );

    let store = Arc::new(MailStore::new(Path::new(&config.database.data_dir)).await?);

    // The validated snapshot is versioned before anything runs on it.
    store
        .save_config_version("worker", &config.version_snapshot(), "startup", None, true)
        .await?;

    // LLM client.
    let llm: Arc<dyn LlmExtractor> = Arc::new(ChatProvider::new(
        config.llm.endpoint.clone(),
        config.llm.api_key.clone(),
        config.llm.model.clone(),
        Some(config.llm.timeout_secs),
        config.llm.requests_per_minute,
        config.llm.max_in_flight,
    )?);

    // Parser pipeline.
    let parsers = compile_parsers(config.effective_parsers())?;
    let parser = EmailParser::new(
        parsers,
        store.clone(),
        llm,
        ParserSettings {
            cache_min_success: 70.0,
            llm_min_confidence: config.llm.min_confidence,
            quarantine_confidence: config.quarantine.confidence_threshold,
            body_excerpt_bytes: config.llm.body_excerpt_bytes,
        },
    );

    // Maintenance engine.
    let maintenance = Arc::new(MaintenanceEngine::new(
        store.clone(),
        MaintenanceDetector::new(config.maintenance.subject_prefixes.clone()),
        config.maintenance.window_cache_ttl_secs,
    ));

    // Correlator with its notification sink.
    let sink: Arc<dyn NotificationSink> = match &config.notify.webhook_url {
        Some(url) => Arc::new(WebhookSink::new(url.clone(), config.notify.timeout_secs)?),
        None => Arc::new(LogSink),
    };
    let correlator = Arc::new(Correlator::new(
        store.clone(),
        CorrelatorSettings {
            dedup_window_minutes: config.correlation.dedup_window_minutes,
            flap_threshold: config.correlation.flap_threshold,
            flap_window_minutes: config.correlation.flap_window_minutes,
            resolve_quiet_period_seconds: config.correlation.resolve_quiet_period_seconds,
            auto_resolve_hours: config.correlation.auto_resolve_hours,
            resolved_reattach_minutes: 60,
        },
        sink,
    ));

    let pipeline = Arc::new(PipelineHandler::new(
        store.clone(),
        parser,
        maintenance.clone(),
        correlator.clone(),
        DlqPolicy {
            backoff_base_secs: config.dlq.backoff_base_secs,
            backoff_cap_secs: config.dlq.backoff_cap_secs,
            max_retries: config.dlq.max_retries,
        },
    ));

    // Mail provider.
    let provider: Arc<dyn MailProvider> = match config.ingest.provider.as_str() {
        "imap" => {
            let imap = config
                .imap
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("[imap] section missing"))?;
            Arc::new(ImapProvider::new(ngs_ingest::imap_provider::ImapConfig {
                host: imap.host.clone(),
                port: imap.port,
                user: imap.user.clone(),
                password: imap.password.clone(),
                poll_interval_secs: config.ingest.poll_interval_secs,
                backfill_days: imap.backfill_days,
            }))
        }
        "graph" => {
            let graph = config
                .graph
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("[graph] section missing"))?;
            Arc::new(GraphProvider::new(ngs_ingest::graph::GraphConfig {
                tenant_id: graph.tenant_id.clone(),
                client_id: graph.client_id.clone(),
                client_secret: graph.client_secret.clone(),
                user_email: graph.user_email.clone(),
                poll_interval_secs: config.ingest.poll_interval_secs,
                timeout_secs: graph.timeout_secs,
            })?)
        }
        "file" => {
            let watch = config
                .file
                .as_ref()
                .map(|f| f.watch_path.clone())
                .unwrap_or_else(|| "./watch".to_string());
            Arc::new(FileProvider::new(watch, config.ingest.poll_interval_secs)?)
        }
        other => anyhow::bail!("unknown ingest provider '{other}'"),
    };

    // Bounded parse queue drained by a worker pool; ingest tasks block
    // when it fills up.
    let (queue_handler, mut handles) = QueueHandler::spawn_pool(
        pipeline.clone(),
        config.ingest.parser_workers,
        config.ingest.parser_queue_capacity,
    );

    let ingester = Arc::new(Ingester::new(
        store.clone(),
        provider.clone(),
        Arc::new(queue_handler),
        IngestSettings {
            batch_size: config.ingest.batch_size,
            ..Default::default()
        },
    ));

    // One ingest task per folder.
    for folder in &config.ingest.folders {
        let folder = folder.clone();
        let ingester = ingester.clone();
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let delay = match ingester.poll(&folder).await {
                    Ok(_) => ingester.provider().poll_interval(),
                    Err(e) => {
                        let errors = store
                            .get_cursor(&folder)
                            .await
                            .ok()
                            .flatten()
                            .map(|c| c.error_count)
                            .unwrap_or(1);
                        let backoff = ingester.backoff_after_errors(errors);
                        tracing::error!(
                            folder = %folder,
                            error = %e,
                            backoff_secs = backoff.as_secs(),
                            "Poll failed, backing off"
                        );
                        backoff
                    }
                };
                tokio::time::sleep(delay).await;
            }
        }));
    }

    // Background sweepers.
    let sweepers = Arc::new(Sweepers::new(
        store.clone(),
        correlator.clone(),
        maintenance.clone(),
        pipeline.clone(),
        config.sweeper.clone(),
        config.dlq.sweep_interval_secs,
        config.maintenance.tick_secs,
    ));
    handles.push(tokio::spawn(sweepers.clone().run_auto_resolve()));
    handles.push(tokio::spawn(sweepers.clone().run_maintenance_tick()));
    handles.push(tokio::spawn(sweepers.clone().run_dlq()));
    handles.push(tokio::spawn(sweepers.clone().run_idempotency_cleanup()));
    handles.push(tokio::spawn(sweepers.clone().run_reprocess()));

    tracing::info!(tasks = handles.len(), "ngs-worker started");

    signal::ctrl_c().await.ok();
    tracing::info!("Shutting down gracefully");

    for handle in &handles {
        handle.abort();
    }
    tracing::info!("ngs-worker stopped");

    Ok(())
}
