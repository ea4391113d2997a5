//! HTTP/WebSocket surface for the dubbing orchestrator: auth, resumable
//! uploads, job lifecycle, live event fan-out, library browse, and admin
//! endpoints, all mounted onto one [`AppState`].

pub mod app;
pub mod error;
pub mod extract;
pub mod routes;
pub mod state;

pub use app::build_router;
pub use error::{RdWebError, RdWebResult};
pub use state::AppState;
