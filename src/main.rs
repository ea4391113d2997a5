mod stage_runner;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use reeldub_auth::{AuthService, IdentityResolver, JwtProvider, SessionSigner};
use reeldub_core::config::QueueBackendKind;
use reeldub_core::RdConfig;
use reeldub_events::JobEventHub;
use reeldub_policy::{NoGpuProbe, PolicyEngine};
use reeldub_queue::backend::distributed::DistributedBackend;
use reeldub_queue::backend::memory::MemoryBackend;
use reeldub_queue::QueueBackend;
use reeldub_scheduler::Scheduler;
use reeldub_store::Store;
use reeldub_upload::{UploadCoordinator, UploadJanitor};
use reeldub_web::AppState;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use stage_runner::UnimplementedRunner;

const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(750);
const UPLOAD_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("reeldub=info,tower_http=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_queue_backend(config: &RdConfig) -> Result<Arc<dyn QueueBackend>> {
    match config.queue_backend {
        QueueBackendKind::Local => Ok(Arc::new(MemoryBackend::new())),
        QueueBackendKind::Distributed => {
            let url = config.redis_url.as_deref().context("REDIS_URL must be set for a distributed queue backend")?;
            let kv = reeldub_queue::backend::distributed::redis_kv::RedisKv::connect(url)?;
            Ok(Arc::new(DistributedBackend::new(kv)))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = Arc::new(RdConfig::from_env().context("loading configuration")?);

    for dir in [&config.output_dir, &config.input_dir, &config.log_dir, &config.state_dir, &config.voice_store_root] {
        tokio::fs::create_dir_all(dir).await.with_context(|| format!("creating {}", dir.display()))?;
    }

    let store = Store::open(&config.jobs_db_path, &config.auth_db_path).await.context("opening stores")?;

    let jwt = JwtProvider::new(&config.jwt_secret, &config.jwt_issuer, &config.jwt_audience, config.access_token_ttl.as_secs() as i64);
    let session = SessionSigner::new(&config.jwt_secret, config.session_cookie_ttl.as_secs() as i64);
    let identity = Arc::new(IdentityResolver::new(store.identity.clone(), jwt.clone(), session.clone(), config.allow_legacy_token_login));
    let refresh_token_ttl = ChronoDuration::from_std(config.refresh_token_ttl).context("refresh token ttl out of range")?;
    let auth = Arc::new(AuthService::new(store.identity.clone(), jwt, session, refresh_token_ttl));

    let policy = Arc::new(PolicyEngine::new(config.clone(), store.audit.clone(), Arc::new(NoGpuProbe)));

    let queue = build_queue_backend(&config)?;

    let scheduler = Arc::new(Scheduler::new(
        &config,
        queue.clone(),
        store.jobs.clone(),
        store.identity.clone(),
        store.quotas.clone(),
        policy.clone(),
        Arc::new(UnimplementedRunner),
    ));
    let readmitted = scheduler.readmit_on_startup().await.context("readmitting queued jobs on startup")?;
    tracing::info!(readmitted, "startup re-admission complete");

    let uploads = Arc::new(UploadCoordinator::new(store.uploads.clone(), store.quotas.clone(), store.jobs.clone(), config.clone()));
    let events = Arc::new(JobEventHub::new(store.jobs.clone(), EVENT_POLL_INTERVAL));

    let shutdown = CancellationToken::new();

    let scheduler_task = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run().await })
    };

    let janitor_task = {
        let janitor = UploadJanitor::new(store.uploads.clone(), config.input_dir.clone(), UPLOAD_SWEEP_INTERVAL);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { janitor.run(shutdown).await })
    };

    let events_task = {
        let events = events.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { events.run(shutdown).await })
    };

    let state = AppState { config: config.clone(), store, identity, auth, policy, queue, scheduler: scheduler.clone(), uploads, events };
    let router = reeldub_web::build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("serving http")?;

    scheduler.request_shutdown();
    shutdown.cancel();
    let _ = tokio::join!(scheduler_task, janitor_task, events_task);

    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("installing ctrl-c handler");
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = shutdown.cancelled() => {}
    }
    tracing::info!("shutdown signal received");
}
