//! `TaskService` — the developer-facing API: register a task type with the
//! devices that can run it, then dispatch single requests or whole batches
//! against the scheduler's current strategy.
//!
//! One lock (`state`) protects the device-busy table, the per-task counters,
//! and the strategy snapshots; `device_freed` is the backpressure signal a
//! release broadcasts to waiting dispatchers. External compute always runs
//! outside the lock.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, Semaphore};
use tracing::{debug, error, warn};

use hetsched_core::config::{DEFAULT_BATCH_REFRESH, DEFAULT_POOL_WORKERS};
use hetsched_core::device::{DeviceType, TaskType};
use hetsched_core::{Result, SchedError};

use crate::channel::SchedChannel;
use crate::executor::{ExecutorBackend, ExecutorHandle};

#[derive(Clone, Debug)]
pub struct TaskServiceConfig {
    /// Re-fetch the strategy snapshot every this many submissions.
    pub batch_refresh: u64,
    /// Bounded concurrency for `run_task_batch` jobs.
    pub pool_workers: usize,
}

impl Default for TaskServiceConfig {
    fn default() -> Self {
        Self {
            batch_refresh: DEFAULT_BATCH_REFRESH,
            pool_workers: DEFAULT_POOL_WORKERS,
        }
    }
}

#[derive(Clone, Debug)]
struct LoadedExecutor {
    executor_kind: String,
    handle: ExecutorHandle,
}

#[derive(Debug, Default)]
struct TaskCounters {
    in_count: u64,
    out_count: u64,
    planned_total: u64,
    /// Snapshot of the scheduler's preference list, refreshed on first
    /// entry and at batch-size boundaries.
    strategy: Vec<DeviceType>,
}

#[derive(Debug, Default)]
struct DispatchState {
    /// Device type → free bit. A type missing from the table is treated as
    /// busy, so a foreign strategy entry can never be selected.
    device_free: HashMap<DeviceType, bool>,
    tasks: HashMap<TaskType, TaskCounters>,
}

pub struct TaskService {
    channel: Arc<dyn SchedChannel>,
    backend: Arc<dyn ExecutorBackend>,
    executors: Mutex<HashMap<TaskType, HashMap<DeviceType, LoadedExecutor>>>,
    state: Mutex<DispatchState>,
    device_freed: Notify,
    pool: Arc<Semaphore>,
    batch_refresh: u64,
}

impl TaskService {
    pub fn new(channel: Arc<dyn SchedChannel>, backend: Arc<dyn ExecutorBackend>) -> Arc<Self> {
        Self::with_config(channel, backend, TaskServiceConfig::default())
    }

    pub fn with_config(
        channel: Arc<dyn SchedChannel>,
        backend: Arc<dyn ExecutorBackend>,
        config: TaskServiceConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel,
            backend,
            executors: Mutex::new(HashMap::new()),
            state: Mutex::new(DispatchState::default()),
            device_freed: Notify::new(),
            pool: Arc::new(Semaphore::new(config.pool_workers.max(1))),
            batch_refresh: config.batch_refresh.max(1),
        })
    }

    /// Register `task` on every listed device: build the artifact, forward
    /// the ability to the scheduler, load the executor. Nothing is
    /// committed locally until every device succeeds.
    pub async fn register_task(
        &self,
        task: &str,
        devices: &HashMap<DeviceType, f64>,
        model_source: &str,
    ) -> Result<()> {
        for (&device, &affinity) in devices {
            if !(affinity > 0.0 && affinity <= 1.0) {
                return Err(SchedError::InvalidAffinity(affinity));
            }
        }

        let mut staged: HashMap<DeviceType, LoadedExecutor> = HashMap::new();
        for (&device, &affinity) in devices {
            let artifact = self
                .backend
                .build(device, task, model_source)
                .await
                .map_err(|source| SchedError::BuildFailed {
                    task: task.to_string(),
                    device: device.to_string(),
                    source,
                })?;
            self.channel
                .register_ability(
                    device,
                    task,
                    affinity,
                    &artifact.executor_kind,
                    &artifact.artifact_path,
                )
                .await?;
            let handle = self.backend.load(device, &artifact).await.map_err(|source| {
                SchedError::LoadFailed {
                    task: task.to_string(),
                    device: device.to_string(),
                    source,
                }
            })?;
            staged.insert(
                device,
                LoadedExecutor {
                    executor_kind: artifact.executor_kind,
                    handle,
                },
            );
            debug!(task, device = %device, affinity, "device registered");
        }

        self.executors.lock().await.insert(task.to_string(), staged);
        let mut state = self.state.lock().await;
        for &device in devices.keys() {
            state.device_free.entry(device).or_insert(true);
        }
        state.tasks.entry(task.to_string()).or_default();
        Ok(())
    }

    /// Declare how many outputs the current run of `task` will produce.
    /// `run_task_batch` does this automatically; manual callers driving
    /// `run_task` directly use this to get the deactivation bookkeeping.
    pub async fn set_planned_total(&self, task: &str, total: u64) {
        let mut state = self.state.lock().await;
        state.tasks.entry(task.to_string()).or_default().planned_total = total;
    }

    /// Current busy table, for diagnostics.
    pub async fn device_states(&self) -> HashMap<DeviceType, bool> {
        self.state.lock().await.device_free.clone()
    }

    /// Dispatch one request: refresh the strategy snapshot if due, claim
    /// the first free device in preference order (waiting for a release
    /// when none is free), run the executor outside the lock, release, and
    /// account the completion.
    pub async fn run_task(&self, task: &str, input: Vec<u8>) -> Result<Vec<u8>> {
        let strategy = {
            let mut state = self.state.lock().await;
            let counters = state.tasks.entry(task.to_string()).or_default();

            let activated = counters.in_count == 0;
            if activated {
                self.channel.increase_task(task).await?;
                counters.strategy = self.channel.get_strategy(task).await?;
            } else if counters.in_count % self.batch_refresh == 0 {
                counters.strategy = self.channel.get_strategy(task).await?;
            }
            if counters.strategy.is_empty() {
                // a wait below could never be woken; undo the activation
                if activated {
                    let _ = self.channel.decrease_task(task).await;
                }
                return Err(SchedError::EmptyStrategy(task.to_string()));
            }
            counters.in_count += 1;
            counters.strategy.clone()
        };

        let device = self.acquire_device(&strategy).await;
        debug!(task, device = %device, "dispatching");

        let executor = {
            let executors = self.executors.lock().await;
            executors.get(task).and_then(|by_dev| by_dev.get(&device)).cloned()
        };
        let result = match executor {
            Some(executor) => self
                .backend
                .compute(device, &executor.executor_kind, executor.handle, input)
                .await
                .map_err(|source| SchedError::ComputeFailed {
                    task: task.to_string(),
                    device: device.to_string(),
                    source,
                }),
            None => Err(SchedError::ComputeFailed {
                task: task.to_string(),
                device: device.to_string(),
                source: anyhow::anyhow!("no executor loaded"),
            }),
        };

        // Release precedes the wake, and happens whether compute succeeded
        // or not, so waiters and batch siblings stay live.
        {
            let mut state = self.state.lock().await;
            state.device_free.insert(device, true);
        }
        self.device_freed.notify_waiters();

        let output = result?;

        {
            let mut state = self.state.lock().await;
            let counters = state.tasks.entry(task.to_string()).or_default();
            counters.out_count += 1;
            if counters.planned_total > 0 && counters.out_count == counters.planned_total {
                self.channel.decrease_task(task).await?;
                counters.in_count = 0;
                counters.out_count = 0;
            }
        }
        Ok(output)
    }

    /// Scan the preference list for a free device and claim it; park on the
    /// release signal when every listed device is busy.
    async fn acquire_device(&self, strategy: &[DeviceType]) -> DeviceType {
        loop {
            let waiter = self.device_freed.notified();
            tokio::pin!(waiter);
            // register before the scan so a release that lands between the
            // scan and the await still wakes us
            waiter.as_mut().enable();
            {
                let mut state = self.state.lock().await;
                for &device in strategy {
                    if state.device_free.get(&device).copied().unwrap_or(false) {
                        state.device_free.insert(device, false);
                        return device;
                    }
                }
            }
            waiter.await;
        }
    }

    /// Run `user_fn` over every input with bounded concurrency, returning
    /// one slot per input in input order. Failing or timed-out jobs are
    /// logged and leave their slot `None`; siblings are unaffected. A
    /// timed-out job's compute is not cancelled — it runs to completion on
    /// its device.
    pub async fn run_task_batch<I, O, F, Fut>(
        self: &Arc<Self>,
        task: &str,
        user_fn: F,
        inputs: Vec<I>,
        job_timeout: Option<Duration>,
    ) -> Vec<Option<O>>
    where
        F: Fn(Arc<TaskService>, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
        I: Send + 'static,
        O: Send + 'static,
    {
        let total = inputs.len();
        self.set_planned_total(task, total as u64).await;

        let user_fn = Arc::new(user_fn);
        let mut handles = Vec::with_capacity(total);
        for input in inputs {
            let pool = Arc::clone(&self.pool);
            let service = Arc::clone(self);
            let user_fn = Arc::clone(&user_fn);
            handles.push(tokio::spawn(async move {
                let _permit = match pool.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return Err(SchedError::Internal(anyhow::anyhow!("worker pool closed")))
                    }
                };
                user_fn(service, input).await
            }));
        }

        let mut results: Vec<Option<O>> = Vec::with_capacity(total);
        for (index, handle) in handles.into_iter().enumerate() {
            let joined = match job_timeout {
                Some(limit) => match tokio::time::timeout(limit, handle).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!(task, index, "batch job timed out; slot left empty");
                        results.push(None);
                        continue;
                    }
                },
                None => handle.await,
            };
            match joined {
                Ok(Ok(output)) => results.push(Some(output)),
                Ok(Err(e)) => {
                    error!(task, index, error = %e, "batch job failed");
                    results.push(None);
                }
                Err(join_error) => {
                    error!(task, index, error = %join_error, "batch job panicked");
                    results.push(None);
                }
            }
        }
        results
    }
}
