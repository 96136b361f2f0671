//! Credential lifecycle: cache, mint and refresh with one remote call per
//! credential at a time.

pub mod single_flight;
pub mod token_broker;

pub use single_flight::{FlightKey, FlightLocks};
pub use token_broker::{ClientSignature, ListingPolicy, TokenBroker};
