//! Identity resolution, token issuance, and RBAC for the dubbing
//! orchestrator's HTTP surface.

pub mod apikey;
pub mod csrf;
pub mod identity;
pub mod jwt;
pub mod password;
pub mod rbac;
pub mod service;
pub mod session;
pub mod totp;

pub use identity::{IdentityResolver, RequestSignals};
pub use jwt::{AccessClaims, JwtProvider};
pub use rbac::{is_visible, Identity, IdentityKind};
pub use service::{AuthService, LoginOutcome, RefreshOutcome};
pub use session::SessionSigner;
