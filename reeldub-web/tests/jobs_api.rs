use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use reeldub_auth::{apikey, AuthService, IdentityResolver, JwtProvider, SessionSigner};
use reeldub_core::config::{QueueBackendKind, RemoteAccessMode};
use reeldub_core::RdConfig;
use reeldub_events::JobEventHub;
use reeldub_policy::{NoGpuProbe, PolicyEngine};
use reeldub_queue::MemoryBackend;
use reeldub_scheduler::{JobRunContext, Scheduler, StageOutcome, StageRunner};
use reeldub_store::models::{ApiKey, Role, User};
use reeldub_store::Store;
use reeldub_web::AppState;
use serde_json::{json, Value};
use tower::ServiceExt;

struct NeverRunRunner;

#[async_trait::async_trait]
impl StageRunner for NeverRunRunner {
    async fn run(&self, _ctx: JobRunContext) -> StageOutcome {
        StageOutcome::Canceled
    }
}

async fn test_config(dir: &std::path::Path) -> Arc<RdConfig> {
    Arc::new(RdConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        output_dir: dir.join("output"),
        input_dir: dir.join("input"),
        log_dir: dir.join("logs"),
        state_dir: dir.join("state"),
        voice_store_root: dir.join("voices"),
        remote_access_mode: RemoteAccessMode::Off,
        allow_legacy_token_login: false,
        cookie_secure: false,
        jobs_db_path: dir.join("jobs.db"),
        auth_db_path: dir.join("auth.db"),
        jwt_secret: "test-secret-at-least-16-bytes".to_string(),
        jwt_issuer: "reeldub-test".to_string(),
        jwt_audience: "reeldub-test-api".to_string(),
        access_token_ttl: Duration::from_secs(900),
        refresh_token_ttl: Duration::from_secs(1_209_600),
        session_cookie_ttl: Duration::from_secs(86_400),
        max_upload_bytes: 1024 * 1024 * 1024,
        max_storage_bytes_per_user: 8 * 1024 * 1024 * 1024,
        jobs_per_day_per_user: 20,
        max_concurrent_jobs_per_user: 2,
        max_queued_jobs_per_user: 5,
        max_high_running_global: 1,
        high_mode_admin_only: true,
        max_concurrency_global: 4,
        max_concurrency_transcribe: 2,
        max_concurrency_tts: 2,
        max_concurrency_audio: 2,
        max_concurrency_mux: 2,
        backpressure_q_max: 8,
        upload_session_ttl: Duration::from_secs(86_400),
        queue_backend: QueueBackendKind::Local,
        redis_url: None,
    })
}

/// Builds a full `AppState` over a temp-dir-backed SQLite pair, and
/// returns it alongside a ready-to-present API key for the given role.
async fn build_test_state(role: Role) -> (AppState, String, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path()).await;
    for d in [&config.output_dir, &config.input_dir, &config.log_dir, &config.state_dir, &config.voice_store_root] {
        tokio::fs::create_dir_all(d).await.unwrap();
    }

    let store = Store::open(&config.jobs_db_path, &config.auth_db_path).await.unwrap();

    let user = User {
        id: reeldub_core::ids::short_id(16),
        username: format!("{}-user", role.as_str()),
        password_hash: reeldub_auth::password::hash("not-used-in-these-tests").unwrap(),
        role,
        totp_secret: None,
        totp_enabled: false,
        created_at: chrono::Utc::now(),
    };
    store.identity.create_user(&user).await.unwrap();

    let generated = apikey::generate();
    let key_row = ApiKey {
        id: reeldub_core::ids::short_id(16),
        prefix: generated.prefix.clone(),
        key_hash: generated.key_hash.clone(),
        scopes: reeldub_auth::identity::default_scopes_for_role(role),
        user_id: user.id.clone(),
        created_at: chrono::Utc::now(),
        revoked: false,
    };
    store.identity.create_api_key(&key_row).await.unwrap();

    let jwt = JwtProvider::new(&config.jwt_secret, &config.jwt_issuer, &config.jwt_audience, config.access_token_ttl.as_secs() as i64);
    let session = SessionSigner::new(&config.jwt_secret, config.session_cookie_ttl.as_secs() as i64);
    let identity = Arc::new(IdentityResolver::new(store.identity.clone(), jwt.clone(), session.clone(), config.allow_legacy_token_login));
    let auth = Arc::new(AuthService::new(store.identity.clone(), jwt, session, chrono::Duration::seconds(config.refresh_token_ttl.as_secs() as i64)));
    let policy = Arc::new(PolicyEngine::new(config.clone(), store.audit.clone(), Arc::new(NoGpuProbe)));
    let queue: Arc<dyn reeldub_queue::QueueBackend> = Arc::new(MemoryBackend::new());
    let scheduler = Arc::new(Scheduler::new(
        &config,
        queue.clone(),
        store.jobs.clone(),
        store.identity.clone(),
        store.quotas.clone(),
        policy.clone(),
        Arc::new(NeverRunRunner),
    ));
    let uploads = Arc::new(reeldub_upload::UploadCoordinator::new(store.uploads.clone(), store.quotas.clone(), store.jobs.clone(), config.clone()));
    let events = Arc::new(JobEventHub::new(store.jobs.clone(), Duration::from_millis(750)));

    let state = AppState { config, store, identity, auth, policy, queue, scheduler, uploads, events };
    (state, generated.full_key, dir)
}

async fn json_body(res: axum::response::Response) -> Value {
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn create_body() -> Value {
    json!({
        "video_path": "/input/ep01.mkv",
        "src_lang": "en",
        "tgt_lang": "es",
        "series_title": "Test Show",
        "season_number": 1,
        "episode_number": 1,
    })
}

#[tokio::test]
async fn unauthenticated_job_submission_is_rejected() {
    let (state, _key, _dir) = build_test_state(Role::Operator).await;
    let router = reeldub_web::build_router(state);

    let res = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/jobs")
                .header("content-type", "application/json")
                .body(Body::from(create_body().to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(res).await;
    assert_eq!(body["code"], 401);
}

#[tokio::test]
async fn operator_can_submit_and_fetch_their_own_job() {
    let (state, key, _dir) = build_test_state(Role::Operator).await;
    let router = reeldub_web::build_router(state);

    let res = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/jobs")
                .header("content-type", "application/json")
                .header("x-api-key", &key)
                .body(Body::from(create_body().to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let created = json_body(res).await;
    assert_eq!(created["state"], "queued");
    assert_eq!(created["series_slug"], "test-show");
    let job_id = created["id"].as_str().unwrap().to_string();

    let res = router
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(format!("/jobs/{job_id}"))
                .header("x-api-key", &key)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let fetched = json_body(res).await;
    assert_eq!(fetched["id"], job_id);
}

#[tokio::test]
async fn viewer_cannot_submit_a_job() {
    let (state, key, _dir) = build_test_state(Role::Viewer).await;
    let router = reeldub_web::build_router(state);

    let res = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/jobs")
                .header("content-type", "application/json")
                .header("x-api-key", &key)
                .body(Body::from(create_body().to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    let body = json_body(res).await;
    assert_eq!(body["code"], 403);
}

#[tokio::test]
async fn a_viewer_cannot_see_another_users_private_job() {
    let (owner_state, owner_key, _owner_dir) = build_test_state(Role::Operator).await;

    let res = reeldub_web::build_router(owner_state.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/jobs")
                .header("content-type", "application/json")
                .header("x-api-key", &owner_key)
                .body(Body::from(create_body().to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let created = json_body(res).await;
    let job_id = created["id"].as_str().unwrap().to_string();

    let outsider = User {
        id: reeldub_core::ids::short_id(16),
        username: "outsider".to_string(),
        password_hash: reeldub_auth::password::hash("unused").unwrap(),
        role: Role::Viewer,
        totp_secret: None,
        totp_enabled: false,
        created_at: chrono::Utc::now(),
    };
    owner_state.store.identity.create_user(&outsider).await.unwrap();
    let generated = apikey::generate();
    owner_state
        .store
        .identity
        .create_api_key(&ApiKey {
            id: reeldub_core::ids::short_id(16),
            prefix: generated.prefix.clone(),
            key_hash: generated.key_hash.clone(),
            scopes: reeldub_auth::identity::default_scopes_for_role(Role::Viewer),
            user_id: outsider.id.clone(),
            created_at: chrono::Utc::now(),
            revoked: false,
        })
        .await
        .unwrap();

    let res = reeldub_web::build_router(owner_state)
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(format!("/jobs/{job_id}"))
                .header("x-api-key", &generated.full_key)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn request_id_header_is_always_present() {
    let (state, _key, _dir) = build_test_state(Role::Operator).await;
    let router = reeldub_web::build_router(state);

    let res = router
        .oneshot(Request::builder().method("GET").uri("/jobs/does-not-exist").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert!(res.headers().get("x-request-id").is_some());
}
