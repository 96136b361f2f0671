use tracing::{error, info, warn};

/// Security-relevant callback outcomes, emitted on the `audit` target.
#[derive(Debug, Clone, Default)]
pub struct AuditLogger;

impl AuditLogger {
    pub fn new() -> Self {
        Self
    }

    pub fn signature_invalid(&self, nonce: &str, timestamp: &str) {
        warn!(target: "audit", event = "signature_invalid", nonce, timestamp);
    }

    pub fn decrypt_failed(&self, origin_id: Option<&str>, reason: &str) {
        warn!(target: "audit", event = "decrypt_failed", origin_id = origin_id.unwrap_or(""), reason);
    }

    pub fn origin_mismatch(&self, expected: &str, found: &str) {
        warn!(target: "audit", event = "origin_mismatch", expected, found);
    }

    pub fn stale_event(&self, info_type: &str, create_time: i64, skew_secs: i64) {
        warn!(target: "audit", event = "stale_event", info_type, create_time, skew_secs);
    }

    pub fn unsealed_key_rotation(&self, origin_id: &str) {
        warn!(target: "audit", event = "unsealed_key_rotation", origin_id);
    }

    pub fn malformed(&self, reason: &str) {
        warn!(target: "audit", event = "malformed_callback", reason);
    }

    pub fn verify_ticket_stored(&self, create_time: i64) {
        info!(target: "audit", event = "verify_ticket_stored", create_time);
    }

    pub fn tenant_authorized(&self, tenant_id: &str, info_type: &str) {
        info!(target: "audit", event = "tenant_authorized", tenant_id, info_type);
    }

    pub fn tenant_revoked(&self, tenant_id: &str) {
        info!(target: "audit", event = "tenant_revoked", tenant_id);
    }

    pub fn key_rotated(&self, origin_id: &str) {
        info!(target: "audit", event = "key_rotated", origin_id);
    }

    pub fn handler_failed(&self, info_type: &str, error_msg: &str) {
        error!(target: "audit", event = "handler_failed", info_type, error = error_msg);
    }
}
