//! hetsched-client — the developer-facing side of the scheduler.
//!
//! `TaskService` is the API: register a task type with the devices that can
//! run it, then dispatch single requests or whole batches. Each request
//! consults the scheduler's current strategy over `SchedChannel` (a Unix
//! socket in production, in-process for tests), claims a free device under
//! the shared dispatch lock, and runs the precompiled artifact through the
//! external `ExecutorBackend`.

pub mod channel;
pub mod executor;
pub mod service;

pub use channel::{InProcessChannel, SchedChannel, UnixChannel};
pub use executor::{artifact_path, code_path, BuildArtifact, ExecutorBackend, ExecutorHandle};
pub use service::{TaskService, TaskServiceConfig};
