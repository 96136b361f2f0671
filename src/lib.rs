pub mod broker;
pub mod comms;
pub mod config;
pub mod error;
pub mod security;
pub mod store;
pub mod transport;
pub mod utils;

pub use broker::TokenBroker;
pub use comms::EventRouter;
pub use config::BrokerConfig;
pub use error::{BrokerError, CryptoError, Result};
pub use store::CredentialStore;

// Crate version exposed for runtime queries
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
