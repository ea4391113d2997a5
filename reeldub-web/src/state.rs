use std::sync::Arc;

use reeldub_auth::{AuthService, IdentityResolver};
use reeldub_core::RdConfig;
use reeldub_events::JobEventHub;
use reeldub_policy::PolicyEngine;
use reeldub_queue::QueueBackend;
use reeldub_scheduler::Scheduler;
use reeldub_store::Store;
use reeldub_upload::UploadCoordinator;

/// Everything a handler needs, wired once at bootstrap and shared behind
/// `Arc` the way `reeldub-store`'s own `Store` bundles its trait objects.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RdConfig>,
    pub store: Store,
    pub identity: Arc<IdentityResolver>,
    pub auth: Arc<AuthService>,
    pub policy: Arc<PolicyEngine>,
    pub queue: Arc<dyn QueueBackend>,
    pub scheduler: Arc<Scheduler>,
    pub uploads: Arc<UploadCoordinator>,
    pub events: Arc<JobEventHub>,
}
