//! Per-device-type telemetry publisher: an axum app serving a static
//! dashboard at `/`, control events on `/ws/manager`, and per-sample
//! frames on `/ws/task/{task}`.
//!
//! Fan-out rides `tokio::sync::broadcast` — one channel for the manager
//! stream, one per task series. A slow subscriber lags and drops frames;
//! it never blocks the sweep thread.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::{Html, Response};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info};

use hetsched_core::device::DeviceType;

const MANAGER_BUFFER: usize = 64;
const SAMPLE_BUFFER: usize = 256;

struct PlotState {
    device_type: DeviceType,
    manager_tx: broadcast::Sender<String>,
    series: RwLock<HashMap<String, broadcast::Sender<String>>>,
}

#[derive(Clone)]
pub struct PlotServer {
    state: Arc<PlotState>,
}

impl PlotServer {
    fn new_state(device_type: DeviceType) -> Arc<PlotState> {
        Arc::new(PlotState {
            device_type,
            manager_tx: broadcast::channel(MANAGER_BUFFER).0,
            series: RwLock::new(HashMap::new()),
        })
    }

    /// Bind `addr` and serve in a background task.
    pub async fn start(device_type: DeviceType, addr: SocketAddr) -> anyhow::Result<Self> {
        let state = Self::new_state(device_type);
        let app = Router::new()
            .route("/", get(index))
            .route("/ws/manager", get(ws_manager))
            .route("/ws/task/:task", get(ws_task))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("{device_type} telemetry dashboard on http://{addr}");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("{device_type} telemetry server exited: {e}");
            }
        });
        Ok(Self { state })
    }

    /// Announce a new series; no-op when it already exists.
    pub async fn add_series(&self, task: &str) {
        let mut series = self.state.series.write().await;
        if series.contains_key(task) {
            return;
        }
        series.insert(task.to_string(), broadcast::channel(SAMPLE_BUFFER).0);
        drop(series);
        debug!(device = %self.state.device_type, task, "series online");
        let _ = self.state.manager_tx.send(
            json!({
                "event": "task_online",
                "task": task,
                "ws_path": format!("/ws/task/{task}"),
            })
            .to_string(),
        );
    }

    /// Retire a series: subscribers get an offline frame, then the channel
    /// closes and their sockets end.
    pub async fn remove_series(&self, task: &str) {
        let removed = self.state.series.write().await.remove(task);
        if let Some(tx) = removed {
            debug!(device = %self.state.device_type, task, "series offline");
            let _ = tx.send(json!({"status": "offline", "task": task}).to_string());
            let _ = self
                .state
                .manager_tx
                .send(json!({"event": "task_offline", "task": task}).to_string());
        }
    }

    /// Push one sample to every subscriber of the series. Unknown series
    /// are ignored.
    pub async fn push_sample(&self, task: &str, ts: f64, value: f64) {
        if let Some(tx) = self.state.series.read().await.get(task) {
            let _ = tx.send(json!({"task": task, "ts": ts, "value": value}).to_string());
        }
    }

    pub async fn tasks(&self) -> Vec<String> {
        self.state.series.read().await.keys().cloned().collect()
    }
}

// ─── Handlers ─────────────────────────────────────────────────

async fn index(State(state): State<Arc<PlotState>>) -> Html<String> {
    Html(DASHBOARD_HTML.replace("__DEVICE__", state.device_type.as_str()))
}

async fn ws_manager(ws: WebSocketUpgrade, State(state): State<Arc<PlotState>>) -> Response {
    ws.on_upgrade(move |socket| manager_loop(socket, state))
}

async fn manager_loop(mut socket: WebSocket, state: Arc<PlotState>) {
    // subscribe before the snapshot so no event between the two is missed
    let mut rx = state.manager_tx.subscribe();
    let tasks: Vec<String> = state.series.read().await.keys().cloned().collect();
    let hello = json!({"event": "task_list", "tasks": tasks}).to_string();
    if socket.send(Message::Text(hello)).await.is_err() {
        return;
    }
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(frame) => {
                    if socket.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "manager subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                // page heartbeats, ignored
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }
}

async fn ws_task(
    ws: WebSocketUpgrade,
    Path(task): Path<String>,
    State(state): State<Arc<PlotState>>,
) -> Response {
    ws.on_upgrade(move |socket| task_loop(socket, task, state))
}

async fn task_loop(mut socket: WebSocket, task: String, state: Arc<PlotState>) {
    let rx = state
        .series
        .read()
        .await
        .get(&task)
        .map(|tx| tx.subscribe());
    let Some(mut rx) = rx else {
        let refusal = json!({"error": "task not found", "task": task}).to_string();
        let _ = socket.send(Message::Text(refusal)).await;
        let _ = socket.send(Message::Close(None)).await;
        return;
    };
    loop {
        tokio::select! {
            sample = rx.recv() => match sample {
                Ok(frame) => {
                    if socket.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(task, skipped, "task subscriber lagged");
                }
                // series retired
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }
}

const DASHBOARD_HTML: &str = r#"<!doctype html>
<html>
<head>
  <meta charset="utf-8"/>
  <title>__DEVICE__ task throughput</title>
  <script src="https://cdn.jsdelivr.net/npm/chart.js"></script>
  <style>
    body{font-family:sans-serif;padding:12px;background:#f5f5f5;}
    #tasks span{margin-right:8px;padding:3px 8px;background:#4caf50;color:#fff;border-radius:4px;}
    #status{padding:6px;margin:8px 0;border-radius:4px;}
    .up{background:#e8f5e9;color:#2e7d32;}
    .down{background:#ffebee;color:#c62828;}
    canvas{background:#fff;border-radius:8px;}
  </style>
</head>
<body>
  <h3>__DEVICE__ task throughput</h3>
  <div id="status" class="down">disconnected</div>
  <div id="tasks">no active tasks</div>
  <canvas id="chart" width="960" height="400"></canvas>
<script>
const HORIZON = 20; // seconds of history to keep
const palette = ['#e5534b','#3b76d1','#d8a206','#3aa89b','#8957c9','#d8742a'];
const byTask = {};
const sockets = {};
let manager = null;

const chart = new Chart(document.getElementById('chart').getContext('2d'), {
  type: 'line',
  data: {datasets: []},
  options: {
    animation: false,
    parsing: false,
    scales: {
      x: {type: 'linear', title: {display: true, text: 'time / s'}},
      y: {beginAtZero: true, title: {display: true, text: 'fps'}}
    }
  }
});

function setStatus(up) {
  const el = document.getElementById('status');
  el.className = up ? 'up' : 'down';
  el.textContent = up ? 'connected' : 'disconnected';
}

function refreshTaskList() {
  const names = Object.keys(byTask);
  document.getElementById('tasks').innerHTML = names.length
    ? names.map(n => `<span>${n}</span>`).join('')
    : 'no active tasks';
}

function ensureDataset(task) {
  if (task in byTask) return byTask[task];
  const color = palette[chart.data.datasets.length % palette.length];
  chart.data.datasets.push({label: task, data: [], borderColor: color, pointRadius: 0});
  byTask[task] = chart.data.datasets.length - 1;
  refreshTaskList();
  return byTask[task];
}

function dropDataset(task) {
  const idx = byTask[task];
  if (idx === undefined) return;
  chart.data.datasets.splice(idx, 1);
  delete byTask[task];
  Object.values(chart.data.datasets).forEach((ds, i) => { byTask[ds.label] = i; });
  refreshTaskList();
  chart.update('none');
}

function connectTask(task) {
  if (sockets[task]) return;
  const ws = new WebSocket(`ws://${location.host}/ws/task/${encodeURIComponent(task)}`);
  sockets[task] = ws;
  ws.onopen = () => ensureDataset(task);
  ws.onmessage = ev => {
    const msg = JSON.parse(ev.data);
    if (msg.error || msg.status === 'offline') { ws.close(); return; }
    if (typeof msg.ts === 'number') {
      const ds = chart.data.datasets[ensureDataset(task)];
      ds.data.push({x: msg.ts, y: msg.value});
      ds.data = ds.data.filter(p => msg.ts - p.x <= HORIZON);
      chart.update('none');
    }
  };
  ws.onclose = () => { delete sockets[task]; dropDataset(task); };
}

function connectManager() {
  manager = new WebSocket(`ws://${location.host}/ws/manager`);
  manager.onopen = () => setStatus(true);
  manager.onmessage = ev => {
    const msg = JSON.parse(ev.data);
    if (msg.event === 'task_list') (msg.tasks || []).forEach(connectTask);
    else if (msg.event === 'task_online') connectTask(msg.task);
    else if (msg.event === 'task_offline') { const ws = sockets[msg.task]; if (ws) ws.close(); }
  };
  manager.onclose = () => {
    setStatus(false);
    Object.values(sockets).forEach(ws => ws.close());
    setTimeout(connectManager, 3000);
  };
}

connectManager();
setInterval(() => { if (manager && manager.readyState === WebSocket.OPEN) manager.send('ping'); }, 30000);
</script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn publisher() -> PlotServer {
        PlotServer {
            state: PlotServer::new_state(DeviceType::Gpu),
        }
    }

    #[tokio::test]
    async fn add_series_announces_on_the_manager_stream() {
        let plot = publisher();
        let mut manager_rx = plot.state.manager_tx.subscribe();

        plot.add_series("yolo").await;
        let frame: serde_json::Value =
            serde_json::from_str(&manager_rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["event"], "task_online");
        assert_eq!(frame["task"], "yolo");
        assert_eq!(plot.tasks().await, vec!["yolo".to_string()]);

        // duplicate add is silent
        plot.add_series("yolo").await;
        assert!(manager_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn samples_fan_out_to_series_subscribers() {
        let plot = publisher();
        plot.add_series("yolo").await;
        let mut rx = plot
            .state
            .series
            .read()
            .await
            .get("yolo")
            .map(|tx| tx.subscribe())
            .unwrap();

        plot.push_sample("yolo", 12.5, 30.0).await;
        let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["task"], "yolo");
        assert_eq!(frame["ts"], 12.5);
        assert_eq!(frame["value"], 30.0);

        // unknown series is ignored
        plot.push_sample("ghost", 0.0, 0.0).await;
    }

    #[tokio::test]
    async fn remove_series_notifies_and_closes_the_channel() {
        let plot = publisher();
        plot.add_series("yolo").await;
        let mut manager_rx = plot.state.manager_tx.subscribe();
        let mut series_rx = plot
            .state
            .series
            .read()
            .await
            .get("yolo")
            .map(|tx| tx.subscribe())
            .unwrap();

        plot.remove_series("yolo").await;

        let offline: serde_json::Value =
            serde_json::from_str(&series_rx.recv().await.unwrap()).unwrap();
        assert_eq!(offline["status"], "offline");
        assert!(matches!(
            series_rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));

        let event: serde_json::Value =
            serde_json::from_str(&manager_rx.recv().await.unwrap()).unwrap();
        assert_eq!(event["event"], "task_offline");
        assert!(plot.tasks().await.is_empty());
    }
}
