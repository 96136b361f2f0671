//! Inbound callback surface: XML notifications pushed by the remote server.

pub mod callback_api;
pub mod event_router;
pub mod events;
pub mod handlers;

pub use event_router::{CallbackQuery, EventRouter, ACKNOWLEDGEMENT};
pub use events::{CallbackEvent, EventKind, Notification};
pub use handlers::EventHandler;
