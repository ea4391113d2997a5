//! # Errors
//!
//! A closed taxonomy of error kinds shared by every component. Mirrors the
//! shape of Feathers-style framework errors: a status code, a stable name,
//! optional structured data, and an optional wrapped source that is never
//! shown to callers.

use std::fmt;

use anyhow::Error as AnyError;

/// Convenience result type used throughout the workspace.
pub type RdResult<T> = std::result::Result<T, AnyError>;

/// The closed set of error kinds a caller can match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Unauthenticated,   // 401
    Forbidden,         // 403
    NotFound,          // 404
    Conflict,          // 409 - illegal state transition
    Validation,        // 400
    Quota,             // 429, sub-reason carried in `reason`
    Backpressure,      // 429, deferred with retry_after_s
    IllegalTransition, // 409
    PersistFailed,     // 500
    ToolchainFailed,   // 502 - external media/ML collaborator error
    Unavailable,       // 503 - optional capability not configured
    Canceled,          // used internally; never surfaced as FAILED
    Internal,          // 500
}

impl ErrorKind {
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::Unauthenticated => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Validation => 400,
            ErrorKind::Quota => 429,
            ErrorKind::Backpressure => 429,
            ErrorKind::IllegalTransition => 409,
            ErrorKind::PersistFailed => 500,
            ErrorKind::ToolchainFailed => 502,
            ErrorKind::Unavailable => 503,
            ErrorKind::Canceled => 200,
            ErrorKind::Internal => 500,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::Unauthenticated => "UNAUTHENTICATED",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::Quota => "QUOTA",
            ErrorKind::Backpressure => "BACKPRESSURE",
            ErrorKind::IllegalTransition => "ILLEGAL_TRANSITION",
            ErrorKind::PersistFailed => "PERSIST_FAILED",
            ErrorKind::ToolchainFailed => "TOOLCHAIN_FAILED",
            ErrorKind::Unavailable => "UNAVAILABLE",
            ErrorKind::Canceled => "CANCELED",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

/// A structured error carried through `anyhow::Error`.
///
/// `reason`, `mode`, and `retry_after_s` map straight onto the JSON error
/// body shape used by the HTTP layer: `{detail, reason?, mode?, retry_after_s?}`.
#[derive(Debug)]
pub struct RdError {
    pub kind: ErrorKind,
    pub message: String,
    pub reason: Option<String>,
    pub mode: Option<String>,
    pub retry_after_s: Option<f64>,
    pub source: Option<AnyError>,
}

impl RdError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            reason: None,
            mode: None,
            retry_after_s: None,
            source: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    pub fn with_retry_after(mut self, secs: f64) -> Self {
        self.retry_after_s = Some(secs);
        self
    }

    pub fn with_source(mut self, source: AnyError) -> Self {
        self.source = Some(source);
        self
    }

    pub fn code(&self) -> u16 {
        self.kind.status_code()
    }

    pub fn into_anyhow(self) -> AnyError {
        AnyError::new(self)
    }

    pub fn from_anyhow(err: &AnyError) -> Option<&RdError> {
        err.downcast_ref::<RdError>()
    }

    /// Normalize any error into an `RdError`, defaulting to `Internal`.
    pub fn normalize(err: AnyError) -> RdError {
        match err.downcast::<RdError>() {
            Ok(rd) => rd,
            Err(other) => RdError::new(ErrorKind::Internal, other.to_string()).with_source(other),
        }
    }

    /// The client-safe projection: drops `source` (may carry raw exception
    /// text or secrets) but keeps every field the JSON error body needs.
    pub fn sanitize_for_client(&self) -> RdError {
        RdError {
            kind: self.kind,
            message: self.message.clone(),
            reason: self.reason.clone(),
            mode: self.mode.clone(),
            retry_after_s: self.retry_after_s,
            source: None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "detail": self.message,
            "reason": self.reason,
            "mode": self.mode,
            "retry_after_s": self.retry_after_s,
        })
    }

    // ---- Constructors ----

    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthenticated, msg)
    }
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, msg)
    }
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, msg)
    }
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, msg)
    }
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, msg)
    }
    pub fn quota(msg: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Quota, msg).with_reason(reason)
    }
    pub fn backpressure(msg: impl Into<String>, retry_after_s: f64) -> Self {
        Self::new(ErrorKind::Backpressure, msg).with_retry_after(retry_after_s)
    }
    pub fn illegal_transition(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::IllegalTransition, msg)
    }
    pub fn persist_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::PersistFailed, msg)
    }
    pub fn toolchain_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ToolchainFailed, msg)
    }
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, msg)
    }
    pub fn canceled(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Canceled, msg)
    }
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, msg)
    }
}

impl fmt::Display for RdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.kind.name(), self.code(), self.message)
    }
}

impl std::error::Error for RdError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Convenience helper for "bail with RdError", mirroring the DogRS `bail_dog!` macro.
#[macro_export]
macro_rules! bail_rd {
    ($ctor:ident, $msg:expr) => {
        return Err($crate::errors::RdError::$ctor($msg).into_anyhow());
    };
    ($ctor:ident, $fmt:expr, $($arg:tt)*) => {
        return Err($crate::errors::RdError::$ctor(format!($fmt, $($arg)*)).into_anyhow());
    };
}
