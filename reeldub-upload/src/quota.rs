//! Upload-side quota checks: the per-user upload/storage caps from
//! §4.8, sharing the same override-then-default resolution shape
//! `reeldub-policy::resolve_limits_for_user` uses for job counts.

use reeldub_core::{RdConfig, RdError, RdResult};
use reeldub_store::QuotaStore;

pub struct UploadLimits {
    pub max_upload_bytes: u64,
    pub max_storage_bytes: u64,
}

pub async fn resolve_upload_limits(config: &RdConfig, quotas: &dyn QuotaStore, user_id: &str) -> RdResult<UploadLimits> {
    let quota = quotas.get(user_id).await?;
    let max_upload_bytes =
        quota.as_ref().and_then(|q| q.max_upload_bytes).map(|v| v.max(0) as u64).unwrap_or(config.max_upload_bytes);
    let max_storage_bytes = quota
        .as_ref()
        .and_then(|q| q.max_storage_bytes)
        .map(|v| v.max(0) as u64)
        .unwrap_or(config.max_storage_bytes_per_user);
    Ok(UploadLimits { max_upload_bytes, max_storage_bytes })
}

/// Checked once at `init`, against the declared `total_bytes`.
pub fn require_upload_bytes(total_bytes: u64, current_storage_bytes: u64, limits: &UploadLimits) -> RdResult<()> {
    if total_bytes > limits.max_upload_bytes {
        return Err(RdError::validation("upload exceeds the per-user size limit").with_reason("file_too_large").into());
    }
    if current_storage_bytes.saturating_add(total_bytes) > limits.max_storage_bytes {
        return Err(RdError::quota("upload would exceed storage quota", "storage_quota").into());
    }
    Ok(())
}

/// Re-checked on every chunk, since `current_storage_bytes` is a point-in-time
/// read and concurrent uploads from the same user could otherwise slip past it.
pub fn require_upload_progress(received_bytes: u64, current_storage_bytes: u64, limits: &UploadLimits) -> RdResult<()> {
    if current_storage_bytes.saturating_add(received_bytes) > limits.max_storage_bytes {
        return Err(RdError::quota("storage quota exceeded mid-upload", "storage_quota").into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> UploadLimits {
        UploadLimits { max_upload_bytes: 1000, max_storage_bytes: 5000 }
    }

    #[test]
    fn oversize_upload_is_rejected_at_the_boundary() {
        assert!(require_upload_bytes(1000, 0, &limits()).is_ok());
        assert!(require_upload_bytes(1001, 0, &limits()).is_err());
    }

    #[test]
    fn storage_cap_accounts_for_existing_usage() {
        assert!(require_upload_bytes(500, 4500, &limits()).is_ok());
        assert!(require_upload_bytes(500, 4501, &limits()).is_err());
    }
}
