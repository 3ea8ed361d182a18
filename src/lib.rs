//! pollwire core library
//!
//! Converts a live social-media text stream into per-option vote counts for
//! active polls. A stream ingester matches incoming text against the tracked
//! poll options and publishes one vote event per match to a broker topic; a
//! tally worker consumes the topic, buffers pending increments in memory,
//! and periodically merges them into durable poll results.

pub mod bus;
pub mod config;
pub mod logging;
pub mod store;
pub mod stream;
pub mod tally;
