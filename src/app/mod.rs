//! Application boundary: port traits and outbound events.
//!
//! The protocol stack in [`crate::proto`] talks to the device only through
//! the traits in [`ports`], keeping it fully testable without hardware.

pub mod events;
pub mod ports;
