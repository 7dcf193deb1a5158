use std::{collections::BTreeMap, path::PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{error::Error, resources::UsbId};

pub const HYDRA_REQUEST: u16 = 0x0A00;
pub const HYDRA_REPLY: u16 = 0x0A01;
pub const HYDRA_STATUS: u16 = 0x0A02;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Message {
    pub kind: u16,
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub broadcast: bool,
}

fn object(payload: Value) -> Map<String, Value> {
    match payload {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        },
    }
}

impl Message {
    pub fn request(payload: Value) -> Self {
        Message { kind: HYDRA_REQUEST, payload: object(payload), broadcast: false }
    }

    pub fn reply(payload: Value) -> Self {
        Message { kind: HYDRA_REPLY, payload: object(payload), broadcast: false }
    }

    pub fn status(payload: Value) -> Self {
        Message { kind: HYDRA_STATUS, payload: object(payload), broadcast: true }
    }

    pub fn error(error: &Error) -> Self {
        Message::reply(serde_json::json!({ "error": error.to_string() }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    Status,
    Start {
        /// Caller uid; the emulator runs as this user.
        #[serde(default, alias = "uid")]
        user: Option<u32>,
    },
    Stop {
        #[serde(default)]
        force: bool,
        /// Seconds before a graceful stop is forced.
        #[serde(default)]
        timeout: Option<u64>,
        #[serde(default)]
        tap: bool,
    },
    Restart,
    Reset,
    Sleep,
    Wake,
    Hibernate,
    UsbAdd {
        device: UsbId,
    },
    UsbRemove {
        #[serde(default)]
        id: Option<u32>,
        #[serde(default)]
        device: Option<UsbId>,
    },
    UsbList,
    Ping,
    Ip,
}

impl Command {
    pub fn allows_all(&self) -> bool {
        matches!(
            self,
            Command::Status
                | Command::Stop { .. }
                | Command::Restart
                | Command::Reset
                | Command::Sleep
                | Command::Wake
                | Command::Hibernate
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Vmid(u32),
    All,
    Path(String),
}

impl Target {
    pub fn parse(payload: &Map<String, Value>) -> Result<Option<Target>, Error> {
        match payload.get("vmid") {
            Some(Value::Number(number)) => {
                let vmid = number
                    .as_u64()
                    .and_then(|vmid| u32::try_from(vmid).ok())
                    .ok_or_else(|| Error::Invalid(format!("bad vmid {}", number)))?;
                return Ok(Some(Target::Vmid(vmid)));
            },
            Some(Value::String(text)) if text == "all" => return Ok(Some(Target::All)),
            Some(Value::String(text)) => {
                let vmid = text.parse().map_err(|_| Error::Invalid(format!("bad vmid {:?}", text)))?;
                return Ok(Some(Target::Vmid(vmid)));
            },
            Some(Value::Null) | None => {},
            Some(other) => return Err(Error::Invalid(format!("bad vmid {}", other))),
        }
        match payload.get("path") {
            Some(Value::String(path)) => Ok(Some(Target::Path(path.clone()))),
            Some(Value::Null) | None => Ok(None),
            Some(other) => Err(Error::Invalid(format!("bad path {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub target: Option<Target>,
}

impl Request {
    pub fn parse(message: &Message) -> Result<Self, Error> {
        if message.kind != HYDRA_REQUEST {
            return Err(Error::Invalid(format!("unexpected message kind {:#06x}", message.kind)));
        }
        let command = serde_json::from_value(Value::Object(message.payload.clone()))
            .map_err(|e| Error::Invalid(format!("bad request: {}", e)))?;
        let target = Target::parse(&message.payload)?;
        Ok(Request { command, target })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Stopped,
    Waiting,
    Running,
    Sleeping,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Snapshot {
    /// `None` only for a stopped descriptor that was never given one.
    pub vmid: Option<u32>,
    pub pid: Option<u32>,
    pub state: VmState,
    pub path: PathBuf,
    pub name: Option<String>,
    pub usb: BTreeMap<u32, UsbId>,
}

/// Desktop notifications and status broadcasts.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, body: &str, icon: &str);

    fn broadcast(&self, message: Message);
}

#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, body: &str, _icon: &str) {
        log::info!("{}: {}", title, body);
    }

    fn broadcast(&self, message: Message) {
        log::debug!("Status: {}", Value::Object(message.payload));
    }
}
