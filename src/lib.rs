//! warmupd: email account warmup daemon.
//!
//! Managed mailboxes send each other low-volume conversational mail on a
//! schedule. Each cycle grows the daily volume, locates the messages in the
//! recipients' mailboxes, rescues spam placements and simulates opens and
//! replies, recording deliverability metrics as it goes.

pub mod config;
pub mod error;
pub mod model;
pub mod scheduler;
pub mod store;
pub mod transport;
pub mod warmup;

pub use error::{Error, Result};
