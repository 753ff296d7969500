use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedError {
    #[error("unknown device type: {0}")]
    UnknownDevice(String),

    #[error("affinity {0} outside (0, 1]")]
    InvalidAffinity(f64),

    #[error("build failed for {task} on {device}: {source}")]
    BuildFailed {
        task: String,
        device: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("load failed for {task} on {device}: {source}")]
    LoadFailed {
        task: String,
        device: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("compute failed for {task} on {device}: {source}")]
    ComputeFailed {
        task: String,
        device: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("scheduler ipc: {0}")]
    Ipc(String),

    #[error("ipc authentication rejected")]
    AuthRejected,

    #[error("no device can run task {0}: strategy is empty")]
    EmptyStrategy(String),

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}
