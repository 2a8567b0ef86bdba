//! Shared protocol types for pagesync
//!
//! Defines the JSON wire structures exchanged between the relay host and
//! browser clients: opaque edit steps, diff envelopes, and the tagged
//! client/server message variants.

pub mod envelope;
pub mod messages;
pub mod step;

pub use envelope::*;
pub use messages::*;
pub use step::*;
