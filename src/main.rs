use std::sync::Arc;

use actix_web::web::Data;
use actix_web::{get, middleware, App, HttpServer, HttpResponse, Responder};
use kube::api::ListParams;
use kube::{Api, Client};
use serde::Serialize;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter, Registry};

use zen_watcher::adapters::configmap::ConfigMapAdapter;
use zen_watcher::adapters::generic::GenericAdapter;
use zen_watcher::adapters::informer::InformerAdapter;
use zen_watcher::adapters::webhook::{ingest as webhook_ingest, WebhookState};
use zen_watcher::adapters::{Adapter, AdapterHealth, AdapterRuntime};
use zen_watcher::config::Settings;
use zen_watcher::dedup::{Deduper, DeduperConfig};
use zen_watcher::filter::loader::ConfigLoader;
use zen_watcher::filter::{FilterEngine, ProcessingOrder};
use zen_watcher::gc::GcCollector;
use zen_watcher::metrics::Metrics;
use zen_watcher::pipeline::Pipeline;
use zen_watcher::types::{EventMapping, Ingester, IngesterKind};

#[derive(Serialize)]
struct AdapterHealthView {
    name: String,
    kind: String,
    restart_count: u64,
    last_event_seconds_ago: Option<f64>,
}

impl From<AdapterHealth> for AdapterHealthView {
    fn from(h: AdapterHealth) -> Self {
        Self {
            name: h.name,
            kind: h.kind,
            restart_count: h.restart_count,
            last_event_seconds_ago: h.last_event_at.map(|t| t.elapsed().as_secs_f64()),
        }
    }
}

#[derive(Serialize)]
struct Diagnostics {
    adapters: Vec<AdapterHealthView>,
    dedup_cache_size: usize,
    filter_processing_order: &'static str,
}

struct AppState {
    metrics: Arc<Metrics>,
    runtime: Arc<AdapterRuntime>,
    dedup: Arc<Deduper>,
    filter: Arc<FilterEngine>,
}

#[get("/metrics")]
async fn metrics(state: Data<AppState>) -> impl Responder {
    HttpResponse::Ok().body(state.metrics.encode())
}

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(state: Data<AppState>) -> impl Responder {
    let adapters = state.runtime.health_snapshot().await.into_iter().map(AdapterHealthView::from).collect();
    let filter_processing_order = match state.filter.processing_order() {
        ProcessingOrder::FilterFirst => "filter_first",
        ProcessingOrder::DedupFirst => "dedup_first",
    };
    HttpResponse::Ok().json(Diagnostics {
        adapters,
        dedup_cache_size: state.dedup.cache_len(),
        filter_processing_order,
    })
}

/// Lists `Ingester` CRs once at startup and builds the corresponding
/// source adapters (§4.1, §6.2). Unlike `ObservationMapping`, `Ingester`
/// is not hot-reloaded: adding or changing one requires a restart.
async fn load_ingesters(
    client: &Client,
    settings: &Settings,
    metrics: Arc<Metrics>,
) -> (Vec<Arc<dyn Adapter>>, Option<EventMapping>, Option<String>) {
    let api: Api<Ingester> = match &settings.watch_namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let list = match api.list(&ListParams::default()).await {
        Ok(l) => l.items,
        Err(e) => {
            warn!(error = %e, "failed to list Ingester custom resources at startup; continuing with none configured");
            Vec::new()
        }
    };

    let mut adapters: Vec<Arc<dyn Adapter>> = Vec::new();
    let mut webhook_mapping = None;
    let mut webhook_path = None;

    for ingester in list {
        if !ingester.spec.enabled {
            continue;
        }
        let name = ingester.metadata.name.clone().unwrap_or_else(|| ingester.spec.source.clone());
        match ingester.spec.kind {
            IngesterKind::Informer => {
                let Some(gvr) = &ingester.spec.gvr else {
                    warn!(ingester = %name, "informer ingester missing gvr; skipping");
                    continue;
                };
                adapters.push(Arc::new(InformerAdapter::new(
                    name,
                    client.clone(),
                    gvr.group.clone(),
                    gvr.version.clone(),
                    gvr.resource.clone(),
                    gvr.namespaces.first().cloned(),
                    ingester.spec.mapping.clone(),
                    metrics.clone(),
                )));
            }
            IngesterKind::Logs => {
                adapters.push(Arc::new(ConfigMapAdapter::new(
                    name,
                    client.clone(),
                    settings.configmap_source_namespace.as_deref(),
                    settings.configmap_label_selector.clone(),
                    settings.configmap_payload_key.clone(),
                    ingester.spec.mapping.clone(),
                    settings.configmap_poll_interval,
                )));
            }
            IngesterKind::Webhook => {
                if webhook_mapping.is_some() {
                    warn!(ingester = %name, "multiple webhook ingesters configured; keeping the first, ignoring this one");
                    continue;
                }
                webhook_mapping = Some(ingester.spec.mapping.clone());
                webhook_path = ingester.spec.webhook_path.clone();
            }
        }
    }

    (adapters, webhook_mapping, webhook_path)
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    #[cfg(feature = "telemetry")]
    let telemetry_layer = tracing_opentelemetry::layer().with_tracer(zen_watcher::telemetry::init_tracer().await);
    let fmt_layer = tracing_subscriber::fmt::layer().json();
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info")).unwrap();

    #[cfg(feature = "telemetry")]
    let collector = Registry::default().with(telemetry_layer).with(fmt_layer).with(env_filter);
    #[cfg(not(feature = "telemetry"))]
    let collector = Registry::default().with(fmt_layer).with(env_filter);
    tracing::subscriber::set_global_default(collector).expect("setting global tracing subscriber failed");

    let settings = Arc::new(Settings::from_env());
    let client = Client::try_default()
        .await
        .expect("failed to build a kube client from the in-cluster or kubeconfig context");
    let metrics = Arc::new(Metrics::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let loader = ConfigLoader::new(client.clone(), &settings);
    let initial_filter = loader
        .load_initial()
        .await
        .expect("initial filter configuration is invalid; refusing to start");
    let filter = Arc::new(FilterEngine::new(initial_filter));
    let filter_loader_task = tokio::spawn({
        let filter = filter.clone();
        let metrics = metrics.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move { loader.watch(filter, metrics, shutdown_rx).await }
    });

    let dedup = Arc::new(Deduper::new(DeduperConfig::from(&*settings)));
    let (dedup_cleanup_task, dedup_reaper_task, mut agg_rx) = dedup.spawn_background_tasks();

    let pipeline = Arc::new(Pipeline::new(client.clone(), filter.clone(), dedup.clone(), metrics.clone(), settings.clone()));

    let aggregation_consumer = tokio::spawn({
        let pipeline = pipeline.clone();
        async move {
            while let Some(event) = agg_rx.recv().await {
                pipeline.process_aggregated_summary(event).await;
            }
        }
    });

    let (ingester_adapters, webhook_mapping, webhook_path) = load_ingesters(&client, &settings, metrics.clone()).await;

    let (mut runtime, event_rx) = AdapterRuntime::new(settings.event_channel_capacity, metrics.clone());
    for adapter in ingester_adapters {
        runtime.register(adapter);
    }
    runtime.register(Arc::new(GenericAdapter::new(
        "generic",
        client.clone(),
        settings.watch_namespace.clone(),
        metrics.clone(),
    )));
    let webhook_sender = runtime.sender();
    let runtime = Arc::new(runtime);
    let adapter_tasks = runtime.spawn();

    let event_rx = Arc::new(AsyncMutex::new(event_rx));
    let mut creator_tasks = Vec::new();
    for _ in 0..settings.creator_worker_count.max(1) {
        let event_rx = event_rx.clone();
        let pipeline = pipeline.clone();
        let mut shutdown = shutdown_rx.clone();
        creator_tasks.push(tokio::spawn(async move {
            loop {
                let event = {
                    let mut rx = event_rx.lock().await;
                    tokio::select! {
                        event = rx.recv() => event,
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() { break; } else { continue; }
                        }
                    }
                };
                match event {
                    Some(event) => pipeline.process(event).await,
                    None => break,
                }
            }
            // Pipeline drain (§5): once shutdown is signalled, adapters and
            // the webhook server have already stopped producing, so finish
            // whatever is already buffered instead of waiting on new sends.
            loop {
                let event = {
                    let mut rx = event_rx.lock().await;
                    rx.try_recv()
                };
                match event {
                    Ok(event) => pipeline.process(event).await,
                    Err(_) => break,
                }
            }
        }));
    }

    let gc = Arc::new(GcCollector::new(client.clone(), settings.clone(), metrics.clone()));
    let gc_task = tokio::spawn(gc.run(shutdown_rx.clone()));

    let webhook_ip_allowlist = settings.webhook_ip_allowlist.iter().filter_map(|s| s.parse().ok()).collect();
    let webhook_state = Data::new(WebhookState::new(
        webhook_mapping,
        webhook_path,
        settings.webhook_auth_token.clone(),
        webhook_ip_allowlist,
        settings.webhook_body_cap_bytes,
        settings.webhook_enqueue_timeout,
        webhook_sender,
        metrics.clone(),
        settings.webhook_rate_limit_enabled,
        settings.webhook_rate_limit_per_minute,
        settings.webhook_rate_limit_burst,
    ));

    let app_state = Data::new(AppState {
        metrics: metrics.clone(),
        runtime: runtime.clone(),
        dedup: dedup.clone(),
        filter: filter.clone(),
    });

    let http_listen_addr = settings.http_listen_addr.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .app_data(webhook_state.clone())
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
            .service(webhook_ingest)
    })
    .bind(&http_listen_addr)
    .unwrap_or_else(|e| panic!("cannot bind http server to {http_listen_addr}: {e}"))
    .shutdown_timeout(settings.adapter_shutdown_budget.as_secs())
    .run();
    let server_handle = server.handle();

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!(error = %e, "http server exited with error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            // Stop accepting new webhook/metrics traffic first, so no
            // further Events are enqueued once the drain below begins
            // (§5: "signal adapters, wait for pipeline drain, stop
            // Deduper cleanup, close channel").
            server_handle.stop(true).await;
        }
    }

    let drain_budget = settings.adapter_shutdown_budget;

    // 1. Signal every source adapter (and the creator workers' shutdown
    // watch) to stop producing.
    runtime.stop();
    let _ = shutdown_tx.send(true);
    for task in adapter_tasks {
        let _ = tokio::time::timeout(drain_budget, task).await;
    }

    // 2. With adapters and the webhook route stopped, let the pipeline
    // workers drain whatever is already queued, bounded by the same
    // budget; abort any worker that is still running past it so no task
    // outlives the shutdown window.
    for task in creator_tasks {
        let abort_handle = task.abort_handle();
        if tokio::time::timeout(drain_budget, task).await.is_err() {
            warn!("pipeline worker drain exceeded the shutdown budget; aborting");
            abort_handle.abort();
        }
    }

    // 3. Only now stop the Deduper's own background cleanup/aggregation
    // loops — the pipeline above may still have been consulting them.
    dedup.stop();
    let _ = tokio::time::timeout(drain_budget, dedup_cleanup_task).await;
    let _ = tokio::time::timeout(drain_budget, dedup_reaper_task).await;
    let _ = tokio::time::timeout(drain_budget, aggregation_consumer).await;

    // 4. Close the event channel and tear down the remaining ancillary tasks.
    event_rx.lock().await.close();
    let _ = tokio::time::timeout(drain_budget, filter_loader_task).await;
    gc_task.abort();

    info!("zen-watcher shut down cleanly");
    Ok(())
}
