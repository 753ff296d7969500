//! Strategy computation: the static argmax policy and the dynamic
//! exhaustive assignment search.
//!
//! Both policies end in the same write-back: device task lists, equivalent
//! power, and throughput windows are replaced together with the strategy
//! map, so observers under the scheduler lock never see a half-applied
//! strategy.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::device::{DeviceRegistry, DeviceType, TaskType};

/// Task type → ordered device-type preference list.
pub type Strategy = HashMap<TaskType, Vec<DeviceType>>;

/// The single global scheduling mode bit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedMode {
    Static,
    Dynamic,
}

impl SchedMode {
    pub fn toggled(self) -> Self {
        match self {
            SchedMode::Static => SchedMode::Dynamic,
            SchedMode::Dynamic => SchedMode::Static,
        }
    }
}

impl fmt::Display for SchedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedMode::Static => f.write_str("static"),
            SchedMode::Dynamic => f.write_str("dynamic"),
        }
    }
}

/// Per task: the chosen roster indices, in preference order.
type Assignment = Vec<(TaskType, Vec<usize>)>;

pub struct StrategyEngine {
    /// Wall-clock budget for the dynamic search.
    pub search_budget: Duration,
}

impl StrategyEngine {
    pub fn new(search_budget: Duration) -> Self {
        Self { search_budget }
    }

    /// Recompute the strategy for `active` and write the result back into
    /// the registry (task lists, equivalent power, fresh throughput
    /// windows). An empty active set clears every assignment and yields an
    /// empty map.
    pub fn recompute(
        &self,
        registry: &mut DeviceRegistry,
        active: &[TaskType],
        mode: SchedMode,
        now: f64,
    ) -> Strategy {
        if active.is_empty() {
            for device in registry.devices_mut() {
                device.assign(Vec::new(), now);
            }
            return Strategy::new();
        }

        let assignment = match mode {
            SchedMode::Static => static_assignment(registry, active),
            SchedMode::Dynamic => match self.dynamic_assignment(registry, active) {
                Some(found) => found,
                None => {
                    warn!(
                        budget_ms = self.search_budget.as_millis() as u64,
                        "dynamic strategy search exceeded its budget, falling back to static"
                    );
                    static_assignment(registry, active)
                }
            },
        };

        write_back(registry, &assignment, now)
    }

    /// Exhaustive search over every `task → subset of roster devices`
    /// assignment, maximizing summed equivalent power. Returns `None` when
    /// the wall-clock budget runs out before the enumeration finishes.
    fn dynamic_assignment(
        &self,
        registry: &DeviceRegistry,
        active: &[TaskType],
    ) -> Option<Assignment> {
        let deadline = Instant::now() + self.search_budget;
        let subsets = device_subsets(registry.devices().len());

        // Odometer over the candidate space: one subset choice per task.
        // The all-empty candidate comes first and is always rational, so
        // `best` is seeded on the first iteration.
        let mut choice = vec![0usize; active.len()];
        let mut best: Option<(f64, Vec<usize>)> = None;
        loop {
            if Instant::now() > deadline {
                return None;
            }

            let candidate: Vec<&[usize]> = choice.iter().map(|&i| subsets[i].as_slice()).collect();
            if is_rational(registry, active, &candidate) {
                let score = score_candidate(registry, active, &candidate);
                if best.as_ref().map_or(true, |(top, _)| score > *top) {
                    best = Some((score, choice.clone()));
                }
            }

            // advance the odometer
            let mut digit = 0;
            loop {
                if digit == choice.len() {
                    let (_, winner) = best?;
                    return Some(
                        active
                            .iter()
                            .zip(winner)
                            .map(|(task, i)| (task.clone(), subsets[i].clone()))
                            .collect(),
                    );
                }
                choice[digit] += 1;
                if choice[digit] < subsets.len() {
                    break;
                }
                choice[digit] = 0;
                digit += 1;
            }
        }
    }
}

/// Per active task independently, the single device maximizing
/// `compute_power × affinity`. Ties keep the earliest roster device.
fn static_assignment(registry: &DeviceRegistry, active: &[TaskType]) -> Assignment {
    active
        .iter()
        .map(|task| {
            let mut best: Option<(f64, usize)> = None;
            for (index, device) in registry.devices().iter().enumerate() {
                if let Some(power) = device.weighted_power(task) {
                    if best.map_or(true, |(top, _)| power > top) {
                        best = Some((power, index));
                    }
                }
            }
            let chosen = best.map(|(_, index)| vec![index]).unwrap_or_default();
            (task.clone(), chosen)
        })
        .collect()
}

/// All subsets of `0..n`, the empty set first, then by ascending size in
/// roster order. The enumeration order defines the first-seen tie-break.
fn device_subsets(n: usize) -> Vec<Vec<usize>> {
    let mut subsets = vec![Vec::new()];
    for size in 1..=n {
        combinations(n, size, &mut subsets);
    }
    subsets
}

fn combinations(n: usize, size: usize, out: &mut Vec<Vec<usize>>) {
    let mut current = Vec::with_capacity(size);
    fn recurse(start: usize, n: usize, size: usize, current: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
        if current.len() == size {
            out.push(current.clone());
            return;
        }
        for index in start..n {
            current.push(index);
            recurse(index + 1, n, size, current, out);
            current.pop();
        }
    }
    recurse(0, n, size, &mut current, out);
}

/// Every (task, device) pair in the candidate must be backed by an ability.
fn is_rational(registry: &DeviceRegistry, active: &[TaskType], candidate: &[&[usize]]) -> bool {
    active.iter().zip(candidate).all(|(task, devices)| {
        devices
            .iter()
            .all(|&i| registry.devices()[i].ability(task).is_some())
    })
}

/// Sum over devices of the mean `compute_power × affinity` across the tasks
/// the candidate assigns to them; unassigned devices contribute 0.
fn score_candidate(registry: &DeviceRegistry, active: &[TaskType], candidate: &[&[usize]]) -> f64 {
    let mut per_device: HashMap<usize, Vec<&TaskType>> = HashMap::new();
    for (task, devices) in active.iter().zip(candidate) {
        for &index in devices.iter() {
            per_device.entry(index).or_default().push(task);
        }
    }
    per_device
        .into_iter()
        .map(|(index, tasks)| {
            let device = &registry.devices()[index];
            let total: f64 = tasks
                .iter()
                .filter_map(|t| device.weighted_power(t.as_str()))
                .sum();
            total / tasks.len() as f64
        })
        .sum()
}

/// Apply the winning assignment: every device gets its new task list and a
/// zeroed throughput window; the returned map lists device types per task
/// in subset order, deduplicated.
fn write_back(registry: &mut DeviceRegistry, assignment: &Assignment, now: f64) -> Strategy {
    let mut per_device: HashMap<usize, Vec<TaskType>> = HashMap::new();
    let mut strategy = Strategy::new();

    for (task, devices) in assignment {
        let mut types = Vec::new();
        for &index in devices {
            per_device.entry(index).or_default().push(task.clone());
            let device_type = registry.devices()[index].device_type;
            if !types.contains(&device_type) {
                types.push(device_type);
            }
        }
        strategy.insert(task.clone(), types);
    }

    for (index, device) in registry.devices_mut().iter_mut().enumerate() {
        let tasks = per_device.remove(&index).unwrap_or_default();
        device.assign(tasks, now);
    }

    strategy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceRegistry;

    fn roster() -> DeviceRegistry {
        let mut registry = DeviceRegistry::new();
        registry.add_device(DeviceType::Cpu, 0);
        registry.add_device(DeviceType::Gpu, 0);
        registry
    }

    fn register_yolo(registry: &mut DeviceRegistry) {
        registry
            .register_ability(DeviceType::Cpu, "yolo", 0.9, "relay_vm", "/a/cpu")
            .unwrap();
        registry
            .register_ability(DeviceType::Gpu, "yolo", 0.7, "relay_vm", "/a/gpu")
            .unwrap();
    }

    fn engine() -> StrategyEngine {
        StrategyEngine::new(Duration::from_secs(5))
    }

    #[test]
    fn static_two_device_prefers_weighted_argmax() {
        // 500·0.7 = 350 beats 40·0.9 = 36
        let mut registry = roster();
        register_yolo(&mut registry);

        let strategy = engine().recompute(
            &mut registry,
            &["yolo".to_string()],
            SchedMode::Static,
            0.0,
        );
        assert_eq!(strategy["yolo"], vec![DeviceType::Gpu]);
    }

    #[test]
    fn static_unique_device_splits_tasks() {
        let mut registry = roster();
        register_yolo(&mut registry);
        registry
            .register_ability(DeviceType::Cpu, "BFS", 1.0, "relay_vm", "/a/bfs")
            .unwrap();

        let active = ["BFS".to_string(), "yolo".to_string()];
        let strategy = engine().recompute(&mut registry, &active, SchedMode::Static, 0.0);
        assert_eq!(strategy["yolo"], vec![DeviceType::Gpu]);
        assert_eq!(strategy["BFS"], vec![DeviceType::Cpu]);
    }

    #[test]
    fn static_no_ability_yields_empty_list() {
        let mut registry = roster();
        register_yolo(&mut registry);

        let active = ["yolo".to_string(), "unknown".to_string()];
        let strategy = engine().recompute(&mut registry, &active, SchedMode::Static, 0.0);
        assert_eq!(strategy["unknown"], Vec::<DeviceType>::new());
        assert_eq!(strategy.len(), 2);
    }

    #[test]
    fn dynamic_reshare_keeps_gpu_dedicated() {
        // Dedicating GPU to yolo scores 500·0.7 + 40·1.0 = 390, beating the
        // GPU-splitting candidate at (350 + 100)/2 + 40 = 265.
        let mut registry = roster();
        register_yolo(&mut registry);
        registry
            .register_ability(DeviceType::Cpu, "BFS", 1.0, "relay_vm", "/a/bfs")
            .unwrap();
        registry
            .register_ability(DeviceType::Gpu, "BFS", 0.2, "relay_vm", "/a/bfs-gpu")
            .unwrap();

        let active = ["BFS".to_string(), "yolo".to_string()];
        let strategy = engine().recompute(&mut registry, &active, SchedMode::Dynamic, 0.0);
        assert_eq!(strategy["yolo"], vec![DeviceType::Gpu]);
        assert_eq!(strategy["BFS"], vec![DeviceType::Cpu]);
    }

    #[test]
    fn dynamic_no_ability_yields_empty_list() {
        let mut registry = roster();
        register_yolo(&mut registry);

        let active = ["orphan".to_string(), "yolo".to_string()];
        let strategy = engine().recompute(&mut registry, &active, SchedMode::Dynamic, 0.0);
        assert_eq!(strategy["orphan"], Vec::<DeviceType>::new());
        assert_eq!(strategy["yolo"], vec![DeviceType::Gpu]);
    }

    #[test]
    fn exhausted_budget_falls_back_to_static() {
        let mut registry = roster();
        register_yolo(&mut registry);

        let tight = StrategyEngine::new(Duration::ZERO);
        let active = ["yolo".to_string()];
        let strategy = tight.recompute(&mut registry, &active, SchedMode::Dynamic, 0.0);
        assert_eq!(strategy["yolo"], vec![DeviceType::Gpu]);
    }

    #[test]
    fn mode_switch_is_a_steady_state_no_op() {
        // One active task, exactly one able device: both policies must agree.
        let mut registry = roster();
        registry
            .register_ability(DeviceType::Cpu, "BFS", 1.0, "relay_vm", "/a/bfs")
            .unwrap();

        let active = ["BFS".to_string()];
        let via_static = engine().recompute(&mut registry, &active, SchedMode::Static, 0.0);
        let via_dynamic = engine().recompute(&mut registry, &active, SchedMode::Dynamic, 0.0);
        let again_static = engine().recompute(&mut registry, &active, SchedMode::Static, 0.0);
        assert_eq!(via_static, via_dynamic);
        assert_eq!(via_static, again_static);
    }

    #[test]
    fn write_back_resets_windows_and_equivalent_power() {
        let mut registry = roster();
        register_yolo(&mut registry);

        let strategy = engine().recompute(
            &mut registry,
            &["yolo".to_string()],
            SchedMode::Static,
            42.0,
        );
        assert_eq!(strategy.len(), 1);

        for device in registry.devices() {
            assert_eq!(device.assigned().len(), device.samples().len());
            match device.device_type {
                DeviceType::Gpu => {
                    assert_eq!(device.assigned(), ["yolo".to_string()]);
                    assert!((device.equivalent_power - 350.0).abs() < 1e-9);
                    assert_eq!(device.samples()[0].last_tick, 42.0);
                    assert_eq!(device.samples()[0].fps, 0.0);
                }
                _ => {
                    assert!(device.assigned().is_empty());
                    assert_eq!(device.equivalent_power, 0.0);
                }
            }
        }
    }

    #[test]
    fn empty_active_set_clears_assignments() {
        let mut registry = roster();
        register_yolo(&mut registry);
        engine().recompute(&mut registry, &["yolo".to_string()], SchedMode::Static, 0.0);

        let strategy = engine().recompute(&mut registry, &[], SchedMode::Dynamic, 1.0);
        assert!(strategy.is_empty());
        assert!(registry.devices().iter().all(|d| d.assigned().is_empty()));
    }

    #[test]
    fn strategies_are_rational() {
        let mut registry = roster();
        register_yolo(&mut registry);
        registry
            .register_ability(DeviceType::Gpu, "BFS", 0.2, "relay_vm", "/a/bfs-gpu")
            .unwrap();

        let active = ["BFS".to_string(), "yolo".to_string()];
        for mode in [SchedMode::Static, SchedMode::Dynamic] {
            let strategy = engine().recompute(&mut registry, &active, mode, 0.0);
            for (task, devices) in &strategy {
                for device_type in devices {
                    let able = registry
                        .devices()
                        .iter()
                        .any(|d| d.device_type == *device_type && d.ability(task).is_some());
                    assert!(able, "{mode} strategy lists {device_type} without ability for {task}");
                }
            }
        }
    }
}
