//! Core domain for the heterogeneous-device task scheduler.
//!
//! This crate holds everything both processes agree on: the device and
//! ability catalog, the strategy engine (static argmax and dynamic
//! exhaustive search), the active-task accounting with its event hub, and
//! the IPC wire types. No sockets or executors live here — the server and
//! client crates wire these types to the outside world.

pub mod config;
pub mod device;
pub mod error;
pub mod proto;
pub mod scheduler;
pub mod strategy;

pub use error::SchedError;

pub type Result<T> = std::result::Result<T, SchedError>;
