//! Resumable chunked upload protocol (init/chunk/complete), per-user
//! upload and storage quota enforcement, and the janitor that reclaims
//! abandoned upload sessions.

pub mod coordinator;
pub mod janitor;
pub mod quota;

pub use coordinator::UploadCoordinator;
pub use janitor::UploadJanitor;
pub use quota::{require_upload_bytes, require_upload_progress, resolve_upload_limits, UploadLimits};
