//! Ports - seams to the broker.
//!
//! Each trait hides one side of the transport so the registry, resolver and
//! delivery engine never depend on a concrete client.

pub mod acknowledger;
pub mod bus;

pub use self::acknowledger::Acknowledger;
pub use self::bus::{Bus, Subscription, SubscriptionMode};
