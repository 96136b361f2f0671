pub mod audit_log;
pub mod key_ring;
pub mod msg_crypto;
pub mod signature;
