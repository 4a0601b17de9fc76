//! # gamefleet-events
//!
//! Change events for the observation stream that feeds the controller.
//!
//! ## Design Principles
//!
//! - An event describes one observed state of one object; it is never a command
//! - Delivery is eventually consistent: no ordering is implied between an
//!   action the controller issues and the event that reflects it
//! - Every event names its object through an [`ObjectKey`] and carries the
//!   resource version that was observed
//!
//! ## Event Envelope
//!
//! All events share a common envelope with:
//! - Global ordering (`event_id`)
//! - Change classification (`change`: added, modified, deleted)
//! - Object addressing (`resource`, `key`, `resource_version`)
//! - The observed object itself (`payload`)

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
