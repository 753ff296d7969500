//! The scheduler's IPC endpoint: a Unix stream socket speaking
//! newline-delimited JSON.
//!
//! Every connection starts with a `hello` frame carrying the pre-shared
//! key; unauthenticated peers are answered once and dropped. Each request
//! takes the scheduler lock, so the four operations are serialized
//! process-wide. Malformed frames are logged and answered with an error
//! frame — the server never tears down on bad input.

use std::path::Path;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use hetsched_core::device::DeviceType;
use hetsched_core::proto::{Request, Response};
use hetsched_core::scheduler::SharedScheduler;
use hetsched_core::SchedError;

pub struct IpcServer {
    scheduler: SharedScheduler,
    auth_key: String,
}

impl IpcServer {
    pub fn new(scheduler: SharedScheduler, auth_key: impl Into<String>) -> Self {
        Self {
            scheduler,
            auth_key: auth_key.into(),
        }
    }

    /// Bind the socket (unlinking any stale file first) and serve forever.
    pub async fn serve(self, socket_path: &Path) -> Result<()> {
        if socket_path.exists() {
            std::fs::remove_file(socket_path)
                .with_context(|| format!("unlink stale socket {}", socket_path.display()))?;
        }
        let listener = UnixListener::bind(socket_path)
            .with_context(|| format!("bind {}", socket_path.display()))?;
        info!("scheduler IPC listening on {}", socket_path.display());

        loop {
            let (stream, _addr) = listener.accept().await.context("accept")?;
            let scheduler = self.scheduler.clone();
            let auth_key = self.auth_key.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, scheduler, auth_key).await {
                    debug!("ipc connection ended: {e:#}");
                }
            });
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    scheduler: SharedScheduler,
    auth_key: String,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let Some(first) = lines.next_line().await? else {
        return Ok(());
    };
    match serde_json::from_str::<Request>(&first) {
        Ok(Request::Hello { key }) if key == auth_key => {
            send(&mut write_half, &Response::Ok).await?;
        }
        Ok(Request::Hello { .. }) => {
            warn!("ipc client presented a bad key");
            send(
                &mut write_half,
                &Response::Error {
                    message: SchedError::AuthRejected.to_string(),
                },
            )
            .await?;
            return Ok(());
        }
        _ => {
            warn!("ipc client skipped the hello handshake");
            send(
                &mut write_half,
                &Response::Error {
                    message: "expected hello".into(),
                },
            )
            .await?;
            return Ok(());
        }
    }

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => dispatch(&scheduler, request).await,
            Err(e) => {
                warn!("malformed ipc frame: {e}");
                Response::Error {
                    message: format!("malformed request: {e}"),
                }
            }
        };
        send(&mut write_half, &response).await?;
    }
    Ok(())
}

async fn dispatch(scheduler: &SharedScheduler, request: Request) -> Response {
    match request {
        // tolerated after authentication
        Request::Hello { .. } => Response::Ok,
        Request::RegisterAbility {
            device,
            task,
            affinity,
            executor_kind,
            artifact_path,
        } => {
            let device_type = match device.parse::<DeviceType>() {
                Ok(parsed) => parsed,
                Err(e) => {
                    return Response::Error {
                        message: e.to_string(),
                    }
                }
            };
            let mut sched = scheduler.lock().await;
            match sched.register_ability(device_type, &task, affinity, &executor_kind, &artifact_path)
            {
                Ok(()) => Response::Ok,
                Err(e) => Response::Error {
                    message: e.to_string(),
                },
            }
        }
        Request::IncreaseTask { task } => {
            scheduler.lock().await.increase_task(&task);
            Response::Ok
        }
        Request::DecreaseTask { task } => {
            scheduler.lock().await.decrease_task(&task);
            Response::Ok
        }
        Request::GetStrategy { task } => Response::Strategy {
            devices: scheduler.lock().await.strategy_for(&task),
        },
    }
}

async fn send(writer: &mut OwnedWriteHalf, response: &Response) -> Result<()> {
    let mut frame = serde_json::to_string(response).context("encode response")?;
    frame.push('\n');
    writer.write_all(frame.as_bytes()).await.context("write response")?;
    Ok(())
}
