//! hetsched-server — the central scheduler daemon.
//!
//! Holds the authoritative strategy table behind a Unix-socket IPC
//! endpoint, streams per-device throughput to WebSocket dashboards, and
//! takes mode switches from an operator console on stdin.

pub mod console;
pub mod ipc;
pub mod plot;
pub mod telemetry;
