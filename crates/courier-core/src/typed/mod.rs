//! Typed - message and handler API.
//!
//! Two layers:
//! - **Typed**: `Message`, `Handler`, `HandlerConfig<H>` - bindings checked at compile time
//! - **Dyn**: `DynHandler` - object-safe, used by the manager and bus adapters

pub mod config;
pub mod handler;
pub mod message;
pub mod registry;
pub mod resolver;

#[cfg(test)]
pub(crate) mod fixtures;

pub use self::config::{DEFAULT_SELECTOR, HandlerConfig, HandlerConfigBuilder, Registration};
pub use self::handler::{AnyMessage, DecodedMessage, DynHandler, Handler, MessageDescriptor};
pub use self::message::Message;
pub use self::registry::HandlerRegistry;
