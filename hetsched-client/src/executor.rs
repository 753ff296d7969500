//! `ExecutorBackend` — the seam to the external compilation/loader backend
//! that produces, loads, and runs device-specific artifacts.
//!
//! The scheduler never looks inside an artifact; it only routes requests.
//! Backends return `anyhow::Result` and the service wraps failures into
//! the `BuildFailed`/`LoadFailed`/`ComputeFailed` taxonomy.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use hetsched_core::device::DeviceType;

/// Output of `build`: which runtime family executes the artifact and where
/// it lives on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildArtifact {
    pub executor_kind: String,
    pub artifact_path: String,
}

/// Opaque handle to a loaded artifact, issued and owned by the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ExecutorHandle(pub u64);

#[async_trait]
pub trait ExecutorBackend: Send + Sync {
    /// Compile `model_source` for `device`. Idempotent: an artifact already
    /// on disk is reused rather than rebuilt.
    async fn build(
        &self,
        device: DeviceType,
        task: &str,
        model_source: &str,
    ) -> anyhow::Result<BuildArtifact>;

    /// Load a built artifact onto `device` and return its handle.
    async fn load(&self, device: DeviceType, artifact: &BuildArtifact)
        -> anyhow::Result<ExecutorHandle>;

    /// Run one request through a loaded artifact.
    async fn compute(
        &self,
        device: DeviceType,
        executor_kind: &str,
        handle: ExecutorHandle,
        input: Vec<u8>,
    ) -> anyhow::Result<Vec<u8>>;
}

/// `<root>/device/<TYPE>/<TYPE>_<task>.artifact`
pub fn artifact_path(root: &Path, device: DeviceType, task: &str) -> PathBuf {
    root.join("device")
        .join(device.as_str())
        .join(format!("{}_{task}.artifact", device.as_str()))
}

/// Sibling `.code` file for executor kinds that keep bytecode separate
/// from the library.
pub fn code_path(root: &Path, device: DeviceType, task: &str) -> PathBuf {
    root.join("device")
        .join(device.as_str())
        .join(format!("{}_{task}.code", device.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_layout_matches_the_on_disk_convention() {
        let root = Path::new("/srv/models");
        assert_eq!(
            artifact_path(root, DeviceType::Gpu, "yolo"),
            PathBuf::from("/srv/models/device/GPU/GPU_yolo.artifact")
        );
        assert_eq!(
            code_path(root, DeviceType::Cpu, "BFS"),
            PathBuf::from("/srv/models/device/CPU/CPU_BFS.code")
        );
    }
}
