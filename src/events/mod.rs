//! Event system module
//!
//! Provides the push-channel hub that fans build events and live log
//! entries out to subscribers (dashboards, log followers).

mod hub;

pub use hub::{Hub, HubEvent, Subscription};
