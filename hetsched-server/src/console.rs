//! Operator console: a line-oriented REPL on stdin.
//!
//! `switch` toggles static/dynamic scheduling, `exit` terminates only the
//! console loop. Anything else prints an error and loops.

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use hetsched_core::scheduler::SharedScheduler;

pub async fn run(scheduler: SharedScheduler) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match line.trim() {
                "switch" => {
                    let mode = scheduler.lock().await.switch_mode();
                    println!("now using {mode} scheduling");
                }
                "exit" => {
                    info!("operator console closed");
                    break;
                }
                "" => {}
                other => println!("invalid command: {other}"),
            },
            // stdin closed (daemonized run)
            Ok(None) => break,
            Err(e) => {
                info!("console read failed: {e}");
                break;
            }
        }
    }
}
