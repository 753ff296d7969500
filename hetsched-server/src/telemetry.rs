//! Telemetry orchestrator: one publisher per roster device type and the
//! 100 ms sweep that feeds them.
//!
//! Each tick harvests summed per-(device type, task) throughput under the
//! scheduler lock, then diffs and publishes with the lock released — the
//! sweep never holds `schedLock` while fanning out to subscribers.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use tracing::info;

use hetsched_core::config::TELEMETRY_TICK;
use hetsched_core::device::{DeviceType, TaskType};
use hetsched_core::scheduler::{now_secs, SharedScheduler};

use crate::plot::PlotServer;

pub struct TelemetryOrchestrator {
    scheduler: SharedScheduler,
    publishers: HashMap<DeviceType, PlotServer>,
}

impl TelemetryOrchestrator {
    /// Bind one dashboard per distinct roster device type on its
    /// deterministic port.
    pub async fn start(scheduler: SharedScheduler) -> anyhow::Result<Self> {
        let device_types = { scheduler.lock().await.registry().device_types() };
        let mut publishers = HashMap::new();
        for device_type in device_types {
            let addr = SocketAddr::from(([127, 0, 0, 1], device_type.telemetry_port()));
            let publisher = PlotServer::start(device_type, addr).await?;
            publishers.insert(device_type, publisher);
        }
        info!("telemetry orchestrator serving {} device type(s)", publishers.len());
        Ok(Self {
            scheduler,
            publishers,
        })
    }

    /// Run the sweep loop. Never returns; spawn via `tokio::spawn`.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(TELEMETRY_TICK);
        let mut live: HashMap<DeviceType, HashSet<TaskType>> = self
            .publishers
            .keys()
            .map(|&device_type| (device_type, HashSet::new()))
            .collect();

        loop {
            ticker.tick().await;

            let harvest = { self.scheduler.lock().await.throughput_by_type() };
            let ts = now_secs();

            let mut current: HashMap<DeviceType, Vec<(TaskType, f64)>> = HashMap::new();
            for (device_type, task, fps) in harvest {
                current.entry(device_type).or_default().push((task, fps));
            }

            for (device_type, publisher) in &self.publishers {
                let assigned = current.remove(device_type).unwrap_or_default();
                let assigned_set: HashSet<TaskType> =
                    assigned.iter().map(|(task, _)| task.clone()).collect();
                let Some(seen) = live.get_mut(device_type) else {
                    continue;
                };

                for task in assigned_set.difference(seen) {
                    publisher.add_series(task).await;
                }
                for task in seen.difference(&assigned_set) {
                    publisher.remove_series(task).await;
                }
                *seen = assigned_set;

                for (task, fps) in &assigned {
                    publisher.push_sample(task, ts, *fps).await;
                }
            }
        }
    }
}
