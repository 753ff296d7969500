//! hetsched-server — the central scheduler daemon.
//!
//! Reads config from env vars:
//!   HETSCHED_SOCKET  — IPC socket path (default /tmp/scheduler.sock)
//!   HETSCHED_KEY     — pre-shared IPC key (default "lemon"; deployments
//!                      should override)
//!   HETSCHED_DEVICES — roster spec, e.g. "GPU:0,CPU:0,CPU:1"

use std::path::Path;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use hetsched_core::config;
use hetsched_core::device::{DeviceRegistry, DeviceType};
use hetsched_core::scheduler::{shared, Scheduler};
use hetsched_server::console;
use hetsched_server::ipc::IpcServer;
use hetsched_server::telemetry::TelemetryOrchestrator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,hetsched_server=debug".into()),
        )
        .init();

    let socket_path =
        std::env::var(config::ENV_SOCKET).unwrap_or_else(|_| config::DEFAULT_SOCKET_PATH.into());
    let auth_key =
        std::env::var(config::ENV_KEY).unwrap_or_else(|_| config::DEFAULT_AUTH_KEY.into());
    let roster_spec =
        std::env::var(config::ENV_DEVICES).unwrap_or_else(|_| config::DEFAULT_ROSTER.into());

    let registry = parse_roster(&roster_spec)?;
    tracing::info!(roster = %roster_spec, "device roster loaded");
    let scheduler = shared(Scheduler::new(registry));

    let telemetry = TelemetryOrchestrator::start(scheduler.clone()).await?;
    tokio::spawn(telemetry.run());
    tokio::spawn(console::run(scheduler.clone()));

    IpcServer::new(scheduler, auth_key)
        .serve(Path::new(&socket_path))
        .await
}

/// Parse a roster spec like `GPU:0,CPU:0`. A bare device type gets id 0.
fn parse_roster(spec: &str) -> anyhow::Result<DeviceRegistry> {
    let mut registry = DeviceRegistry::new();
    for entry in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (device, id) = entry.split_once(':').unwrap_or((entry, "0"));
        let device_type: DeviceType = device
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{e} in roster entry {entry:?}"))?;
        let id: u32 = id
            .trim()
            .parse()
            .with_context(|| format!("bad device id in roster entry {entry:?}"))?;
        registry.add_device(device_type, id);
    }
    anyhow::ensure!(!registry.is_empty(), "device roster is empty");
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_default_roster() {
        let registry = parse_roster(config::DEFAULT_ROSTER).unwrap();
        let types: Vec<DeviceType> = registry.device_types();
        assert_eq!(types, vec![DeviceType::Gpu, DeviceType::Cpu]);
    }

    #[test]
    fn bare_type_defaults_to_id_zero_and_duplicates_collapse() {
        let registry = parse_roster("NPU, NPU:0, CPU:2").unwrap();
        assert_eq!(registry.devices().len(), 2);
    }

    #[test]
    fn rejects_unknown_devices_and_empty_rosters() {
        assert!(parse_roster("TPU:0").is_err());
        assert!(parse_roster("  , ").is_err());
    }
}
