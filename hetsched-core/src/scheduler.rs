//! The central scheduler: the device roster, the active-task population,
//! the event hub, and the authoritative strategy table.
//!
//! All mutation funnels through one lock (`SharedScheduler`). Events are
//! applied inline under it, which serializes them in submission order and
//! makes every strategy replacement atomic from an observer's viewpoint.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config;
use crate::device::{DeviceRegistry, DeviceType, TaskType};
use crate::strategy::{SchedMode, Strategy, StrategyEngine};
use crate::Result;

/// Strategy-affecting signals. Every event triggers exactly one
/// recomputation over the current active-task keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedEvent {
    NewTaskType,
    AlgorithmDone,
    ModeSwitch,
}

pub struct Scheduler {
    registry: DeviceRegistry,
    engine: StrategyEngine,
    mode: SchedMode,
    /// Reference counts of active task types. A key exists iff count ≥ 1.
    active: HashMap<TaskType, u32>,
    strategy: Strategy,
}

impl Scheduler {
    pub fn new(registry: DeviceRegistry) -> Self {
        Self {
            registry,
            engine: StrategyEngine::new(config::DEFAULT_SEARCH_BUDGET),
            mode: SchedMode::Static,
            active: HashMap::new(),
            strategy: Strategy::new(),
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut DeviceRegistry {
        &mut self.registry
    }

    pub fn mode(&self) -> SchedMode {
        self.mode
    }

    pub fn active_count(&self, task: &str) -> u32 {
        self.active.get(task).copied().unwrap_or(0)
    }

    pub fn register_ability(
        &mut self,
        device_type: DeviceType,
        task: &str,
        affinity: f64,
        executor_kind: &str,
        artifact_path: &str,
    ) -> Result<()> {
        self.registry
            .register_ability(device_type, task, affinity, executor_kind, artifact_path)
    }

    /// Bump the reference count for `task`; a 0→1 transition activates the
    /// task and recomputes the strategy table.
    pub fn increase_task(&mut self, task: &str) {
        let count = self.active.entry(task.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            info!(task, "task type activated");
            self.on_event(SchedEvent::NewTaskType);
        }
    }

    /// Drop the reference count for `task`; a 1→0 transition removes the
    /// key and recomputes. Decreasing an absent key is a no-op.
    pub fn decrease_task(&mut self, task: &str) {
        let Some(count) = self.active.get_mut(task) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            self.active.remove(task);
            info!(task, "task type deactivated");
            self.on_event(SchedEvent::AlgorithmDone);
        }
    }

    /// Deep copy of the current preference list for `task`; empty for
    /// unknown or inactive tasks.
    pub fn strategy_for(&self, task: &str) -> Vec<DeviceType> {
        self.strategy.get(task).cloned().unwrap_or_default()
    }

    pub fn strategy_table(&self) -> &Strategy {
        &self.strategy
    }

    /// Toggle static/dynamic and recompute. Returns the mode now in effect.
    pub fn switch_mode(&mut self) -> SchedMode {
        self.mode = self.mode.toggled();
        info!(mode = %self.mode, "scheduling mode switched");
        self.on_event(SchedEvent::ModeSwitch);
        self.mode
    }

    fn on_event(&mut self, event: SchedEvent) {
        debug!(?event, "recomputing strategy table");
        let mut active: Vec<TaskType> = self.active.keys().cloned().collect();
        active.sort();
        self.strategy = self
            .engine
            .recompute(&mut self.registry, &active, self.mode, now_secs());
    }

    /// Telemetry harvest: summed fps per `(device type, task)` pair across
    /// all roster devices, in roster/assignment order.
    pub fn throughput_by_type(&self) -> Vec<(DeviceType, TaskType, f64)> {
        let mut totals: Vec<(DeviceType, TaskType, f64)> = Vec::new();
        for device in self.registry.devices() {
            for (task, sample) in device.assigned().iter().zip(device.samples()) {
                match totals
                    .iter_mut()
                    .find(|(dt, t, _)| *dt == device.device_type && t == task)
                {
                    Some(slot) => slot.2 += sample.fps,
                    None => totals.push((device.device_type, task.clone(), sample.fps)),
                }
            }
        }
        totals
    }
}

/// Epoch seconds as a float, the timestamp unit of the telemetry stream.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// The process-wide scheduler lock. IPC handlers, the event hub, and the
/// telemetry sweep all serialize on it.
pub type SharedScheduler = Arc<Mutex<Scheduler>>;

pub fn shared(scheduler: Scheduler) -> SharedScheduler {
    Arc::new(Mutex::new(scheduler))
}
