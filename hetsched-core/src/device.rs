use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::SchedError;
use crate::Result;

// ─── Device types ─────────────────────────────────────────────

pub type TaskType = String;

/// The closed set of compute device classes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceType {
    Cpu,
    Gpu,
    Npu,
    Fpga,
}

impl DeviceType {
    pub const ALL: [DeviceType; 4] = [
        DeviceType::Cpu,
        DeviceType::Gpu,
        DeviceType::Npu,
        DeviceType::Fpga,
    ];

    /// Nominal compute-power rating of the device class.
    pub fn nominal_power(self) -> u32 {
        match self {
            DeviceType::Cpu => 40,
            DeviceType::Gpu => 500,
            DeviceType::Npu => 200,
            DeviceType::Fpga => 100,
        }
    }

    /// Deterministic telemetry dashboard port for the device class.
    pub fn telemetry_port(self) -> u16 {
        match self {
            DeviceType::Cpu => 1900,
            DeviceType::Gpu => 2000,
            DeviceType::Npu => 3000,
            DeviceType::Fpga => 4000,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::Cpu => "CPU",
            DeviceType::Gpu => "GPU",
            DeviceType::Npu => "NPU",
            DeviceType::Fpga => "FPGA",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = SchedError;

    fn from_str(s: &str) -> Result<Self> {
        DeviceType::ALL
            .into_iter()
            .find(|d| d.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| SchedError::UnknownDevice(s.to_string()))
    }
}

// ─── Abilities ────────────────────────────────────────────────

/// What a device class can do for one task type: how well it runs it and
/// which prebuilt artifact to execute. Immutable after registration apart
/// from whole-value overwrite by a re-registration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ability {
    /// Dimensionless coefficient in (0, 1] scaling the nominal power.
    pub affinity: f64,
    /// Runtime family needed to execute the artifact.
    pub executor_kind: String,
    /// Filesystem path of the prebuilt artifact.
    pub artifact_path: String,
}

/// One slot of a device's throughput window, parallel to its assigned
/// task list.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ThroughputSample {
    /// Epoch seconds of the most recent completion.
    pub last_tick: f64,
    /// Instantaneous completions per second.
    pub fps: f64,
}

// ─── Device ───────────────────────────────────────────────────

/// One physical device in the roster, with its ability map and the
/// bookkeeping the strategy engine and telemetry sweep read.
#[derive(Clone, Debug)]
pub struct Device {
    pub device_type: DeviceType,
    pub id: u32,
    pub compute_power: u32,
    abilities: HashMap<TaskType, Ability>,
    /// Task types currently assigned by the active strategy.
    assigned: Vec<TaskType>,
    /// Mean of `compute_power × affinity` over assigned tasks; 0 when idle.
    pub equivalent_power: f64,
    /// Parallel to `assigned` — one throughput slot per assigned task.
    samples: Vec<ThroughputSample>,
}

impl Device {
    pub fn new(device_type: DeviceType, id: u32) -> Self {
        Self {
            device_type,
            id,
            compute_power: device_type.nominal_power(),
            abilities: HashMap::new(),
            assigned: Vec::new(),
            equivalent_power: 0.0,
            samples: Vec::new(),
        }
    }

    pub fn ability(&self, task: &str) -> Option<&Ability> {
        self.abilities.get(task)
    }

    /// `compute_power × affinity` for `task`, if this device can run it.
    pub fn weighted_power(&self, task: &str) -> Option<f64> {
        self.abilities
            .get(task)
            .map(|a| self.compute_power as f64 * a.affinity)
    }

    pub(crate) fn set_ability(&mut self, task: &str, ability: Ability) {
        self.abilities.insert(task.to_string(), ability);
    }

    pub fn assigned(&self) -> &[TaskType] {
        &self.assigned
    }

    pub fn samples(&self) -> &[ThroughputSample] {
        &self.samples
    }

    /// Replace the assignment and reset the throughput window. Keeps
    /// `assigned` and `samples` the same length and recomputes
    /// `equivalent_power`.
    pub fn assign(&mut self, tasks: Vec<TaskType>, now: f64) {
        self.samples = vec![
            ThroughputSample {
                last_tick: now,
                fps: 0.0,
            };
            tasks.len()
        ];
        self.assigned = tasks;
        self.equivalent_power = if self.assigned.is_empty() {
            0.0
        } else {
            let total: f64 = self
                .assigned
                .iter()
                .filter_map(|t| self.weighted_power(t))
                .sum();
            total / self.assigned.len() as f64
        };
    }

    /// Record one finished request for `task`, updating its instantaneous
    /// throughput from the inter-completion gap.
    pub fn record_completion(&mut self, task: &str, now: f64) {
        if let Some(index) = self.assigned.iter().position(|t| t == task) {
            let slot = &mut self.samples[index];
            let gap = now - slot.last_tick;
            if gap > 0.0 {
                slot.fps = 1.0 / gap;
            }
            slot.last_tick = now;
        }
    }
}

// ─── Registry ─────────────────────────────────────────────────

/// The device roster, in insertion order. Insertion order is significant:
/// it is the strategy engine's tie-break.
#[derive(Clone, Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a device to the roster. Idempotent by `(type, id)`.
    pub fn add_device(&mut self, device_type: DeviceType, id: u32) {
        let exists = self
            .devices
            .iter()
            .any(|d| d.device_type == device_type && d.id == id);
        if !exists {
            self.devices.push(Device::new(device_type, id));
        }
    }

    /// Attach an ability to every roster device of `device_type`. Upserts:
    /// re-registration with the same affinity leaves state unchanged, a
    /// different affinity overwrites the prior one. A device type with no
    /// roster entries is a no-op.
    pub fn register_ability(
        &mut self,
        device_type: DeviceType,
        task: &str,
        affinity: f64,
        executor_kind: &str,
        artifact_path: &str,
    ) -> Result<()> {
        if !(affinity > 0.0 && affinity <= 1.0) {
            return Err(SchedError::InvalidAffinity(affinity));
        }
        let ability = Ability {
            affinity,
            executor_kind: executor_kind.to_string(),
            artifact_path: artifact_path.to_string(),
        };
        for device in self
            .devices
            .iter_mut()
            .filter(|d| d.device_type == device_type)
        {
            device.set_ability(task, ability.clone());
        }
        Ok(())
    }

    pub fn lookup_ability(&self, device_type: DeviceType, id: u32, task: &str) -> Option<&Ability> {
        self.devices
            .iter()
            .find(|d| d.device_type == device_type && d.id == id)
            .and_then(|d| d.ability(task))
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn devices_mut(&mut self) -> &mut [Device] {
        &mut self.devices
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Distinct device types present in the roster, in roster order.
    pub fn device_types(&self) -> Vec<DeviceType> {
        let mut types = Vec::new();
        for device in &self.devices {
            if !types.contains(&device.device_type) {
                types.push(device.device_type);
            }
        }
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_type_parses_wire_names() {
        assert_eq!("GPU".parse::<DeviceType>().unwrap(), DeviceType::Gpu);
        assert_eq!("cpu".parse::<DeviceType>().unwrap(), DeviceType::Cpu);
        assert!(matches!(
            "TPU".parse::<DeviceType>(),
            Err(SchedError::UnknownDevice(s)) if s == "TPU"
        ));
    }

    #[test]
    fn add_device_is_idempotent() {
        let mut registry = DeviceRegistry::new();
        registry.add_device(DeviceType::Gpu, 0);
        registry.add_device(DeviceType::Gpu, 0);
        registry.add_device(DeviceType::Gpu, 1);
        assert_eq!(registry.devices().len(), 2);
    }

    #[test]
    fn register_ability_attaches_to_every_device_of_type() {
        let mut registry = DeviceRegistry::new();
        registry.add_device(DeviceType::Cpu, 0);
        registry.add_device(DeviceType::Cpu, 1);
        registry.add_device(DeviceType::Gpu, 0);
        registry
            .register_ability(DeviceType::Cpu, "yolo", 0.9, "relay_vm", "/tmp/a.artifact")
            .unwrap();

        assert!(registry.lookup_ability(DeviceType::Cpu, 0, "yolo").is_some());
        assert!(registry.lookup_ability(DeviceType::Cpu, 1, "yolo").is_some());
        assert!(registry.lookup_ability(DeviceType::Gpu, 0, "yolo").is_none());
    }

    #[test]
    fn re_registration_overwrites_affinity() {
        let mut registry = DeviceRegistry::new();
        registry.add_device(DeviceType::Gpu, 0);
        registry
            .register_ability(DeviceType::Gpu, "yolo", 0.7, "relay_vm", "/tmp/a")
            .unwrap();
        registry
            .register_ability(DeviceType::Gpu, "yolo", 0.7, "relay_vm", "/tmp/a")
            .unwrap();
        assert_eq!(
            registry
                .lookup_ability(DeviceType::Gpu, 0, "yolo")
                .unwrap()
                .affinity,
            0.7
        );

        registry
            .register_ability(DeviceType::Gpu, "yolo", 0.5, "relay_vm", "/tmp/a")
            .unwrap();
        assert_eq!(
            registry
                .lookup_ability(DeviceType::Gpu, 0, "yolo")
                .unwrap()
                .affinity,
            0.5
        );
    }

    #[test]
    fn out_of_range_affinity_is_rejected() {
        let mut registry = DeviceRegistry::new();
        registry.add_device(DeviceType::Gpu, 0);
        for bad in [0.0, -0.1, 1.5] {
            assert!(matches!(
                registry.register_ability(DeviceType::Gpu, "yolo", bad, "k", "/p"),
                Err(SchedError::InvalidAffinity(_))
            ));
        }
    }

    #[test]
    fn assign_keeps_samples_parallel_and_updates_power() {
        let mut device = Device::new(DeviceType::Gpu, 0);
        device.set_ability(
            "yolo",
            Ability {
                affinity: 0.7,
                executor_kind: "relay_vm".into(),
                artifact_path: "/p".into(),
            },
        );
        device.set_ability(
            "bfs",
            Ability {
                affinity: 0.2,
                executor_kind: "relay_vm".into(),
                artifact_path: "/p".into(),
            },
        );

        device.assign(vec!["yolo".into(), "bfs".into()], 100.0);
        assert_eq!(device.assigned().len(), device.samples().len());
        // mean of 500*0.7 and 500*0.2
        assert!((device.equivalent_power - 225.0).abs() < 1e-9);

        device.assign(vec![], 101.0);
        assert_eq!(device.equivalent_power, 0.0);
        assert!(device.samples().is_empty());
    }

    #[test]
    fn record_completion_tracks_instantaneous_fps() {
        let mut device = Device::new(DeviceType::Cpu, 0);
        device.set_ability(
            "yolo",
            Ability {
                affinity: 1.0,
                executor_kind: "relay_vm".into(),
                artifact_path: "/p".into(),
            },
        );
        device.assign(vec!["yolo".into()], 10.0);

        device.record_completion("yolo", 10.5);
        assert!((device.samples()[0].fps - 2.0).abs() < 1e-9);
        assert_eq!(device.samples()[0].last_tick, 10.5);

        // unknown task is ignored
        device.record_completion("bfs", 11.0);
        assert_eq!(device.samples()[0].last_tick, 10.5);
    }
}
