//! Row types shared by every consumer of the store (queue, scheduler,
//! policy engine, HTTP surface).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A job's lifecycle state. Transitions are validated by
/// [`JobState::allowed_transition`], the single source of truth for the
/// state-machine-soundness invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Queued,
    Running,
    Done,
    Failed,
    Canceled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "QUEUED",
            JobState::Running => "RUNNING",
            JobState::Done => "DONE",
            JobState::Failed => "FAILED",
            JobState::Canceled => "CANCELED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(JobState::Queued),
            "RUNNING" => Some(JobState::Running),
            "DONE" => Some(JobState::Done),
            "FAILED" => Some(JobState::Failed),
            "CANCELED" => Some(JobState::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Canceled)
    }

    /// The allowed-transition table. `RUNNING -> QUEUED` is legal only for
    /// the admin requeue path, which callers signal with `is_admin_requeue`.
    pub fn allowed_transition(from: JobState, to: JobState, is_admin_requeue: bool) -> bool {
        use JobState::*;
        match (from, to) {
            (Queued, Running) => true,
            (Queued, Canceled) => true,
            (Running, Done) => true,
            (Running, Failed) => true,
            (Running, Canceled) => true,
            (Running, Queued) => is_admin_requeue,
            (Done, Queued) | (Failed, Queued) | (Canceled, Queued) => is_admin_requeue,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobMode {
    High,
    Medium,
    Low,
}

impl JobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobMode::High => "high",
            JobMode::Medium => "medium",
            JobMode::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "high" => Some(JobMode::High),
            "medium" => Some(JobMode::Medium),
            "low" => Some(JobMode::Low),
            _ => None,
        }
    }

    pub fn degrade(&self) -> Option<JobMode> {
        match self {
            JobMode::High => Some(JobMode::Medium),
            JobMode::Medium => Some(JobMode::Low),
            JobMode::Low => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobDevice {
    Auto,
    Cpu,
    Cuda,
}

impl JobDevice {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobDevice::Auto => "auto",
            JobDevice::Cpu => "cpu",
            JobDevice::Cuda => "cuda",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(JobDevice::Auto),
            "cpu" => Some(JobDevice::Cpu),
            "cuda" => Some(JobDevice::Cuda),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Private,
    Public,
    Shared,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Private => "private",
            Visibility::Public => "public",
            Visibility::Shared => "shared",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "private" => Some(Visibility::Private),
            "public" => Some(Visibility::Public),
            "shared" => Some(Visibility::Shared),
            _ => None,
        }
    }
}

/// One end-to-end dubbing run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub owner_id: String,
    pub video_path: String,
    pub duration_s: Option<f64>,
    pub mode: JobMode,
    pub device: JobDevice,
    pub src_lang: String,
    pub tgt_lang: String,
    pub series_title: String,
    pub series_slug: String,
    pub season_number: i64,
    pub episode_number: i64,
    pub visibility: Visibility,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: JobState,
    pub progress: f64,
    pub message: String,
    pub error: Option<String>,
    pub output_mkv: Option<String>,
    pub output_srt: Option<String>,
    pub work_dir: String,
    pub log_path: String,
    pub storage_bytes: i64,
    pub runtime: serde_json::Value,
}

/// Partial update applied atomically by [`crate::jobs::JobStore::update`].
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub state: Option<JobState>,
    pub progress: Option<f64>,
    pub message: Option<String>,
    pub error: Option<Option<String>>,
    pub mode: Option<JobMode>,
    pub device: Option<JobDevice>,
    pub output_mkv: Option<Option<String>>,
    pub output_srt: Option<Option<String>>,
    pub runtime: Option<serde_json::Value>,
    pub is_admin_requeue: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Operator,
    Editor,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Operator => "operator",
            Role::Editor => "editor",
            Role::Viewer => "viewer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Role::Admin),
            "operator" => Some(Role::Operator),
            "editor" => Some(Role::Editor),
            "viewer" => Some(Role::Viewer),
            _ => None,
        }
    }

    /// Coarse ordering: `viewer < operator <= editor < admin`.
    pub fn rank(&self) -> u8 {
        match self {
            Role::Viewer => 0,
            Role::Operator => 1,
            Role::Editor => 1,
            Role::Admin => 2,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }

    pub fn at_least_operator(&self) -> bool {
        self.rank() >= Role::Operator.rank()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub password_hash: String,
    pub role: Role,
    pub totp_secret: Option<String>,
    pub totp_enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub prefix: String,
    pub key_hash: String,
    pub scopes: Vec<String>,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub revoked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshToken {
    pub id: String,
    pub user_id: String,
    pub token_hash: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub replaced_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub upload_id: String,
    pub owner_id: String,
    pub filename: String,
    pub total_bytes: i64,
    pub chunk_bytes: i64,
    pub received_bytes: i64,
    pub sha256_partial: Option<String>,
    pub chunks_received: Vec<i64>,
    pub finalized: bool,
    pub video_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub user_id: String,
    pub max_upload_bytes: Option<i64>,
    pub max_storage_bytes: Option<i64>,
    pub jobs_per_day: Option<i64>,
    pub max_concurrent_jobs: Option<i64>,
    pub max_queued_jobs: Option<i64>,
    pub max_processing_minutes_per_day: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryRow {
    pub job_id: String,
    pub owner_id: String,
    pub series_slug: String,
    pub series_title: String,
    pub season_number: i64,
    pub episode_number: i64,
    pub visibility: Visibility,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Allow,
    Deny,
    Degrade,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Allow => "allow",
            AuditOutcome::Deny => "deny",
            AuditOutcome::Degrade => "degrade",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub ts: DateTime<Utc>,
    pub actor_user_id: Option<String>,
    pub action: String,
    pub outcome: AuditOutcome,
    pub reason: Option<String>,
    pub job_id: Option<String>,
    pub detail: serde_json::Value,
}

/// Filters accepted by [`crate::jobs::JobStore::list`].
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub owner_id: Option<String>,
    pub states: Option<Vec<JobState>>,
    pub series_slug: Option<String>,
    pub visibility: Option<Visibility>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOrder {
    UpdatedDesc,
    CreatedAsc,
}
