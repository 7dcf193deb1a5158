use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Deserialize)]
pub struct QMP {
    #[serde(default)]
    pub version: Option<Value>,
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct Greeting {
    #[serde(rename = "QMP")]
    pub qmp: QMP,
}

#[derive(Debug, Deserialize)]
pub struct CommandError {
    #[serde(default)]
    pub class: String,
    pub desc: String,
}

#[derive(Debug, Deserialize)]
pub struct CommandResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(rename = "return")]
    pub result: Option<Value>,
    pub error: Option<CommandError>,
}

#[derive(Debug, Deserialize)]
pub struct Event {
    pub event: String,
    #[serde(default)]
    pub data: Option<Value>,
}

// Order matters: every object parses as a CommandResponse.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Greeting(Greeting),
    Event(Event),
    CommandResponse(CommandResponse),
}

#[derive(Debug, Serialize)]
pub struct EmptyCommand {
    pub execute: String,
}

#[derive(Debug, Serialize)]
pub struct CommandWithArgs {
    pub execute: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum InvokeCommand {
    Empty(EmptyCommand),
    WithArgs(CommandWithArgs),
}

impl InvokeCommand {
    pub fn empty(command: &str) -> Self {
        InvokeCommand::Empty(EmptyCommand {
            execute: command.to_string(),
        })
    }

    pub fn with_args(command: &str, arguments: Value) -> Self {
        InvokeCommand::WithArgs(CommandWithArgs {
            execute: command.to_string(),
            arguments: Some(arguments),
        })
    }

    pub fn name(&self) -> &str {
        match self {
            InvokeCommand::Empty(command) => &command.execute,
            InvokeCommand::WithArgs(command) => &command.execute,
        }
    }

    pub fn capabilities() -> Self {
        InvokeCommand::empty("qmp_capabilities")
    }

    pub fn powerdown() -> Self {
        InvokeCommand::empty("system_powerdown")
    }

    pub fn reset() -> Self {
        InvokeCommand::empty("system_reset")
    }

    pub fn quit() -> Self {
        InvokeCommand::empty("quit")
    }

    pub fn usb_host_add(id: &str, vendor: u16, product: u16) -> Self {
        InvokeCommand::with_args("device_add", json!({
            "driver": "usb-host",
            "bus": "xhci.0",
            "id": id,
            "vendorid": vendor,
            "productid": product,
        }))
    }

    pub fn device_del(id: &str) -> Self {
        InvokeCommand::with_args("device_del", json!({ "id": id }))
    }

    pub fn guest_ping() -> Self {
        InvokeCommand::empty("guest-ping")
    }

    pub fn guest_shutdown(reboot: bool) -> Self {
        let mode = if reboot { "reboot" } else { "powerdown" };
        InvokeCommand::with_args("guest-shutdown", json!({ "mode": mode }))
    }

    pub fn guest_suspend_disk() -> Self {
        InvokeCommand::empty("guest-suspend-disk")
    }

    pub fn guest_interfaces() -> Self {
        InvokeCommand::empty("guest-network-get-interfaces")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_do_not_parse_as_replies() {
        let event: Response = serde_json::from_str(r#"{"event":"POWERDOWN","timestamp":{"seconds":1}}"#).unwrap();
        assert!(matches!(event, Response::Event(ref e) if e.event == "POWERDOWN"));
        let greeting: Response = serde_json::from_str(r#"{"QMP":{"version":{},"capabilities":[]}}"#).unwrap();
        assert!(matches!(greeting, Response::Greeting(_)));
        let reply: Response = serde_json::from_str(r#"{"return":{}}"#).unwrap();
        assert!(matches!(reply, Response::CommandResponse(CommandResponse { result: Some(_), .. })));
    }

    #[test]
    fn usb_add_arguments() {
        let command = serde_json::to_value(InvokeCommand::usb_host_add("usb1", 0x1234, 0x5678)).unwrap();
        assert_eq!(command["execute"], "device_add");
        assert_eq!(command["arguments"]["vendorid"], 0x1234);
        assert_eq!(command["arguments"]["id"], "usb1");
    }
}
