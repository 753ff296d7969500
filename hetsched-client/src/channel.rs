//! `SchedChannel` — the client side of the scheduler IPC surface.
//!
//! `UnixChannel` speaks the newline-delimited JSON protocol over the
//! daemon's socket; `InProcessChannel` wraps a `SharedScheduler` directly
//! for tests and single-process embeddings.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::Mutex;

use hetsched_core::device::DeviceType;
use hetsched_core::proto::{Request, Response};
use hetsched_core::scheduler::SharedScheduler;
use hetsched_core::{Result, SchedError};

/// The four scheduler operations, as seen from a client.
#[async_trait]
pub trait SchedChannel: Send + Sync {
    async fn register_ability(
        &self,
        device: DeviceType,
        task: &str,
        affinity: f64,
        executor_kind: &str,
        artifact_path: &str,
    ) -> Result<()>;

    async fn increase_task(&self, task: &str) -> Result<()>;

    async fn decrease_task(&self, task: &str) -> Result<()>;

    /// Snapshot of the current preference list; empty when the task is not
    /// (yet) active.
    async fn get_strategy(&self, task: &str) -> Result<Vec<DeviceType>>;
}

// ─── Unix socket client ───────────────────────────────────────

struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

/// Lazy-connecting, authenticating IPC client. The connection is dropped
/// after any transport error and re-established on the next call.
pub struct UnixChannel {
    socket_path: PathBuf,
    auth_key: String,
    conn: Mutex<Option<Connection>>,
}

impl UnixChannel {
    pub fn new(socket_path: impl Into<PathBuf>, auth_key: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
            auth_key: auth_key.into(),
            conn: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<Connection> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            SchedError::Ipc(format!("connect {}: {e}", self.socket_path.display()))
        })?;
        let (read_half, write_half) = stream.into_split();
        let mut conn = Connection {
            lines: BufReader::new(read_half).lines(),
            writer: write_half,
        };
        match roundtrip(
            &mut conn,
            &Request::Hello {
                key: self.auth_key.clone(),
            },
        )
        .await?
        {
            Response::Ok => Ok(conn),
            Response::Error { .. } => Err(SchedError::AuthRejected),
            Response::Strategy { .. } => {
                Err(SchedError::Ipc("unexpected handshake reply".into()))
            }
        }
    }

    async fn call(&self, request: &Request) -> Result<Response> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(SchedError::Ipc("connection unavailable".into()));
        };
        match roundtrip(conn, request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                // stale connection; the next call reconnects
                *guard = None;
                Err(e)
            }
        }
    }
}

async fn roundtrip(conn: &mut Connection, request: &Request) -> Result<Response> {
    let mut frame =
        serde_json::to_string(request).map_err(|e| SchedError::Ipc(e.to_string()))?;
    frame.push('\n');
    conn.writer
        .write_all(frame.as_bytes())
        .await
        .map_err(|e| SchedError::Ipc(format!("write: {e}")))?;
    match conn.lines.next_line().await {
        Ok(Some(line)) => serde_json::from_str(&line)
            .map_err(|e| SchedError::Ipc(format!("bad response frame: {e}"))),
        Ok(None) => Err(SchedError::Ipc("connection closed by scheduler".into())),
        Err(e) => Err(SchedError::Ipc(format!("read: {e}"))),
    }
}

fn expect_ok(response: Response) -> Result<()> {
    match response {
        Response::Ok => Ok(()),
        Response::Error { message } => Err(SchedError::Ipc(message)),
        Response::Strategy { .. } => Err(SchedError::Ipc("unexpected strategy reply".into())),
    }
}

fn expect_strategy(response: Response) -> Result<Vec<DeviceType>> {
    match response {
        Response::Strategy { devices } => Ok(devices),
        Response::Error { message } => Err(SchedError::Ipc(message)),
        Response::Ok => Err(SchedError::Ipc("missing strategy in reply".into())),
    }
}

#[async_trait]
impl SchedChannel for UnixChannel {
    async fn register_ability(
        &self,
        device: DeviceType,
        task: &str,
        affinity: f64,
        executor_kind: &str,
        artifact_path: &str,
    ) -> Result<()> {
        expect_ok(
            self.call(&Request::RegisterAbility {
                device: device.to_string(),
                task: task.to_string(),
                affinity,
                executor_kind: executor_kind.to_string(),
                artifact_path: artifact_path.to_string(),
            })
            .await?,
        )
    }

    async fn increase_task(&self, task: &str) -> Result<()> {
        expect_ok(
            self.call(&Request::IncreaseTask {
                task: task.to_string(),
            })
            .await?,
        )
    }

    async fn decrease_task(&self, task: &str) -> Result<()> {
        expect_ok(
            self.call(&Request::DecreaseTask {
                task: task.to_string(),
            })
            .await?,
        )
    }

    async fn get_strategy(&self, task: &str) -> Result<Vec<DeviceType>> {
        expect_strategy(
            self.call(&Request::GetStrategy {
                task: task.to_string(),
            })
            .await?,
        )
    }
}

// ─── In-process client ────────────────────────────────────────

/// Wraps a `SharedScheduler` directly, bypassing the socket. Used by tests
/// and by deployments that embed the scheduler in the client process.
pub struct InProcessChannel {
    scheduler: SharedScheduler,
}

impl InProcessChannel {
    pub fn new(scheduler: SharedScheduler) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl SchedChannel for InProcessChannel {
    async fn register_ability(
        &self,
        device: DeviceType,
        task: &str,
        affinity: f64,
        executor_kind: &str,
        artifact_path: &str,
    ) -> Result<()> {
        self.scheduler
            .lock()
            .await
            .register_ability(device, task, affinity, executor_kind, artifact_path)
    }

    async fn increase_task(&self, task: &str) -> Result<()> {
        self.scheduler.lock().await.increase_task(task);
        Ok(())
    }

    async fn decrease_task(&self, task: &str) -> Result<()> {
        self.scheduler.lock().await.decrease_task(task);
        Ok(())
    }

    async fn get_strategy(&self, task: &str) -> Result<Vec<DeviceType>> {
        Ok(self.scheduler.lock().await.strategy_for(task))
    }
}
