//! Typed configuration assembled from environment variables.
//!
//! Every field here corresponds to one of the contract-visible environment
//! variables. `RdConfig::from_env` fails fast with a descriptive error
//! rather than letting a malformed deployment panic deep inside a handler.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

#[derive(Clone, Debug)]
pub struct RdConfig {
    pub host: String,
    pub port: u16,
    pub output_dir: PathBuf,
    pub input_dir: PathBuf,
    pub log_dir: PathBuf,
    pub state_dir: PathBuf,
    pub voice_store_root: PathBuf,

    pub remote_access_mode: RemoteAccessMode,
    pub allow_legacy_token_login: bool,
    pub cookie_secure: bool,

    pub jobs_db_path: PathBuf,
    pub auth_db_path: PathBuf,

    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    pub session_cookie_ttl: Duration,

    pub max_upload_bytes: u64,
    pub max_storage_bytes_per_user: u64,
    pub jobs_per_day_per_user: u32,
    pub max_concurrent_jobs_per_user: u32,
    pub max_queued_jobs_per_user: u32,
    pub max_high_running_global: u32,
    pub high_mode_admin_only: bool,

    pub max_concurrency_global: u32,
    pub max_concurrency_transcribe: u32,
    pub max_concurrency_tts: u32,
    pub max_concurrency_audio: u32,
    pub max_concurrency_mux: u32,
    pub backpressure_q_max: u32,

    pub upload_session_ttl: Duration,

    pub queue_backend: QueueBackendKind,
    pub redis_url: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteAccessMode {
    Off,
    Private,
    Proxied,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueBackendKind {
    Local,
    Distributed,
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match std::env::var(key) {
        Ok(v) => v.parse::<u64>().with_context(|| format!("{key} must be an integer, got {v:?}")),
        Err(_) => Ok(default),
    }
}

fn env_u32(key: &str, default: u32) -> Result<u32> {
    match std::env::var(key) {
        Ok(v) => v.parse::<u32>().with_context(|| format!("{key} must be an integer, got {v:?}")),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match std::env::var(key) {
        Ok(v) => match v.trim() {
            "1" | "true" | "TRUE" | "yes" => Ok(true),
            "0" | "false" | "FALSE" | "no" => Ok(false),
            other => anyhow::bail!("{key} must be a boolean (0/1/true/false), got {other:?}"),
        },
        Err(_) => Ok(default),
    }
}

impl RdConfig {
    pub fn from_env() -> Result<Self> {
        let output_dir = PathBuf::from(env_string("OUTPUT_DIR", "./data/output"));
        let input_dir = PathBuf::from(env_string("INPUT_DIR", "./data/input"));
        let log_dir = PathBuf::from(env_string("LOG_DIR", "./data/logs"));
        let state_dir = PathBuf::from(env_string("STATE_DIR", "./data/state"));
        let voice_store_root = PathBuf::from(env_string("VOICE_STORE_ROOT", "./data/voices"));

        let remote_access_mode = match env_string("REMOTE_ACCESS_MODE", "off").as_str() {
            "off" => RemoteAccessMode::Off,
            "private" => RemoteAccessMode::Private,
            "proxied" => RemoteAccessMode::Proxied,
            other => anyhow::bail!("REMOTE_ACCESS_MODE must be off|private|proxied, got {other:?}"),
        };

        let queue_backend = match env_string("QUEUE_BACKEND", "local").as_str() {
            "local" => QueueBackendKind::Local,
            "distributed" => QueueBackendKind::Distributed,
            other => anyhow::bail!("QUEUE_BACKEND must be local|distributed, got {other:?}"),
        };
        let redis_url = std::env::var("REDIS_URL").ok();
        if queue_backend == QueueBackendKind::Distributed && redis_url.is_none() {
            anyhow::bail!("REDIS_URL is required when QUEUE_BACKEND=distributed");
        }

        let jwt_secret = std::env::var("JWT_SECRET")
            .context("JWT_SECRET must be set (HMAC signing key for access/refresh tokens)")?;
        if jwt_secret.len() < 16 {
            anyhow::bail!("JWT_SECRET must be at least 16 bytes");
        }

        let cfg = Self {
            host: env_string("HOST", "127.0.0.1"),
            port: env_u32("PORT", 8080)? as u16,
            jobs_db_path: state_dir.join("jobs.db"),
            auth_db_path: state_dir.join("auth.db"),
            output_dir,
            input_dir,
            log_dir,
            state_dir,
            voice_store_root,
            remote_access_mode,
            allow_legacy_token_login: env_bool("ALLOW_LEGACY_TOKEN_LOGIN", false)?,
            cookie_secure: env_bool("COOKIE_SECURE", true)?,
            jwt_secret,
            jwt_issuer: env_string("JWT_ISSUER", "reeldub"),
            jwt_audience: env_string("JWT_AUDIENCE", "reeldub-api"),
            access_token_ttl: Duration::from_secs(env_u64("ACCESS_TOKEN_TTL_S", 900)?),
            refresh_token_ttl: Duration::from_secs(env_u64("REFRESH_TOKEN_TTL_S", 1_209_600)?),
            session_cookie_ttl: Duration::from_secs(env_u64("SESSION_COOKIE_TTL_S", 86_400)?),
            max_upload_bytes: env_u64("MAX_UPLOAD_BYTES", 8 * 1024 * 1024 * 1024)?,
            max_storage_bytes_per_user: env_u64("MAX_STORAGE_BYTES_PER_USER", 64 * 1024 * 1024 * 1024)?,
            jobs_per_day_per_user: env_u32("JOBS_PER_DAY_PER_USER", 20)?,
            max_concurrent_jobs_per_user: env_u32("MAX_CONCURRENT_JOBS_PER_USER", 1)?,
            max_queued_jobs_per_user: env_u32("MAX_QUEUED_JOBS_PER_USER", 5)?,
            max_high_running_global: env_u32("MAX_HIGH_RUNNING_GLOBAL", 1)?,
            high_mode_admin_only: env_bool("HIGH_MODE_ADMIN_ONLY", true)?,
            max_concurrency_global: env_u32("MAX_CONCURRENCY_GLOBAL", 4)?,
            max_concurrency_transcribe: env_u32("MAX_CONCURRENCY_TRANSCRIBE", 2)?,
            max_concurrency_tts: env_u32("MAX_CONCURRENCY_TTS", 2)?,
            max_concurrency_audio: env_u32("MAX_CONCURRENCY_AUDIO", 2)?,
            max_concurrency_mux: env_u32("MAX_CONCURRENCY_MUX", 2)?,
            backpressure_q_max: env_u32("BACKPRESSURE_Q_MAX", 8)?,
            upload_session_ttl: Duration::from_secs(env_u64("UPLOAD_SESSION_TTL_S", 86_400)?),
            queue_backend,
            redis_url,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("PORT must be nonzero");
        }
        if self.max_upload_bytes == 0 {
            anyhow::bail!("MAX_UPLOAD_BYTES must be nonzero");
        }
        if self.max_concurrency_global == 0 {
            anyhow::bail!("MAX_CONCURRENCY_GLOBAL must be nonzero");
        }
        Ok(())
    }
}
