//! Wire protocol for the scheduler IPC endpoint.
//!
//! Frames are newline-delimited JSON over a local Unix stream socket. The
//! first frame on every connection must be `hello` carrying the pre-shared
//! key; after an `ok` reply the connection settles into a request/response
//! loop over the four scheduler operations.
//!
//! `register_ability` carries the device type as a string so the server
//! can answer `UnknownDevice` for names outside the enumerated set instead
//! of dropping the frame as malformed.

use serde::{Deserialize, Serialize};

use crate::device::DeviceType;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Hello {
        key: String,
    },
    RegisterAbility {
        device: String,
        task: String,
        affinity: f64,
        executor_kind: String,
        artifact_path: String,
    },
    IncreaseTask {
        task: String,
    },
    DecreaseTask {
        task: String,
    },
    GetStrategy {
        task: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok,
    Strategy { devices: Vec<DeviceType> },
    Error { message: String },
}
