//! Line protocol spoken between the broker and the privileged helper.
//!
//! Every frame is one JSON object followed by `\n`:
//!
//! * helper → broker, once at startup: `{"type":"ready"}`
//! * broker → helper: `{"id":1,"command":"read","args":{"name":"wg0"},"content":""}`
//! * helper → broker: `{"id":1,"ok":true,"data":...}` or
//!   `{"id":1,"ok":false,"error":"...","code":"NotFound"}`

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;
use crate::tunnel_name::TunnelName;

pub const READY_FRAME_TYPE: &str = "ready";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HelperCommand {
    List,
    Read,
    Write,
    Delete,
    WgShowDump,
    WgShowAllowedIps,
    WgShowInterfaces,
    WgShowAll,
    WgUp,
    WgDown,
    WgRestart,
}

impl HelperCommand {
    pub const ALL: [HelperCommand; 11] = [
        Self::List,
        Self::Read,
        Self::Write,
        Self::Delete,
        Self::WgShowDump,
        Self::WgShowAllowedIps,
        Self::WgShowInterfaces,
        Self::WgShowAll,
        Self::WgUp,
        Self::WgDown,
        Self::WgRestart,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
            Self::WgShowDump => "wg_show_dump",
            Self::WgShowAllowedIps => "wg_show_allowed_ips",
            Self::WgShowInterfaces => "wg_show_interfaces",
            Self::WgShowAll => "wg_show_all",
            Self::WgUp => "wg_up",
            Self::WgDown => "wg_down",
            Self::WgRestart => "wg_restart",
        }
    }

    /// Whether the command operates on a single tunnel and needs `args.name`.
    #[must_use]
    pub fn takes_name(self) -> bool {
        !matches!(
            self,
            Self::List | Self::WgShowInterfaces | Self::WgShowAll
        )
    }
}

impl fmt::Display for HelperCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HelperCommand {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| AppError::UnsupportedCommand("Unsupported command.".into()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<TunnelName>,
}

/// Broker → helper.
#[derive(Debug, Clone, Serialize)]
pub struct HelperRequest {
    pub id: u64,
    pub command: &'static str,
    pub args: CommandArgs,
    pub content: String,
}

impl HelperRequest {
    #[must_use]
    pub fn new(id: u64, command: HelperCommand, name: Option<&TunnelName>, content: &str) -> Self {
        Self {
            id,
            command: command.as_str(),
            args: CommandArgs {
                name: name.cloned(),
            },
            content: content.to_string(),
        }
    }
}

/// Helper → broker reply to one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelperReply {
    pub id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl HelperReply {
    #[must_use]
    pub fn success(id: u64, data: Value) -> Self {
        Self {
            id,
            ok: true,
            data: Some(data),
            error: None,
            code: None,
        }
    }

    #[must_use]
    pub fn failure(id: u64, error: &AppError) -> Self {
        let mut message = error.to_string();
        if message.trim().is_empty() {
            message = "Operation failed.".into();
        }
        Self {
            id,
            ok: false,
            data: None,
            error: Some(message),
            code: Some(error.code().to_string()),
        }
    }

    /// Convert back into the caller-facing result.
    pub fn into_result(self) -> crate::error::Result<Value> {
        if self.ok {
            return Ok(self.data.unwrap_or(Value::Null));
        }
        let message = self
            .error
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| "Operation failed.".into());
        Err(AppError::from_wire(self.code.as_deref(), message))
    }
}

/// Readiness frame emitted by the helper before it reads any input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyFrame {
    #[serde(rename = "type")]
    pub kind: String,
}

impl ReadyFrame {
    #[must_use]
    pub fn new() -> Self {
        Self {
            kind: READY_FRAME_TYPE.into(),
        }
    }
}

impl Default for ReadyFrame {
    fn default() -> Self {
        Self::new()
    }
}

/// One decoded helper → broker line.
#[derive(Debug, Clone, PartialEq)]
pub enum HelperFrame {
    Ready,
    Reply(HelperReply),
}

impl HelperFrame {
    /// Decode a line. Anything that is neither a ready frame nor a reply
    /// with a positive integer id yields `None`.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(line.trim()).ok()?;
        if value.get("type").and_then(Value::as_str) == Some(READY_FRAME_TYPE) {
            return Some(Self::Ready);
        }
        let id = value.get("id").and_then(Value::as_u64).filter(|id| *id > 0)?;
        let ok = value.get("ok").and_then(Value::as_bool).unwrap_or(false);
        Some(Self::Reply(HelperReply {
            id,
            ok,
            data: value.get("data").cloned(),
            error: value.get("error").and_then(Value::as_str).map(str::to_string),
            code: value.get("code").and_then(Value::as_str).map(str::to_string),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_names_roundtrip() {
        for command in HelperCommand::ALL {
            assert_eq!(command.as_str().parse::<HelperCommand>().ok(), Some(command));
        }
        assert!(matches!(
            "rm_rf".parse::<HelperCommand>(),
            Err(AppError::UnsupportedCommand(_))
        ));
    }

    #[test]
    fn request_serializes_to_wire_shape() {
        let name = TunnelName::normalize("wg0").expect("valid");
        let request = HelperRequest::new(7, HelperCommand::Write, Some(&name), "[Interface]\n");
        let value = serde_json::to_value(&request).expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({
                "id": 7,
                "command": "write",
                "args": {"name": "wg0"},
                "content": "[Interface]\n",
            })
        );

        let list = serde_json::to_value(HelperRequest::new(8, HelperCommand::List, None, ""))
            .expect("serialize");
        assert_eq!(list["args"], serde_json::json!({}));
    }

    #[test]
    fn frames_decode_ready_replies_and_garbage() {
        assert_eq!(HelperFrame::parse(r#"{"type":"ready"}"#), Some(HelperFrame::Ready));
        let Some(HelperFrame::Reply(reply)) =
            HelperFrame::parse(r#"{"id":3,"ok":false,"error":"gone","code":"NotFound"}"#)
        else {
            panic!("expected reply");
        };
        assert!(matches!(reply.into_result(), Err(AppError::NotFound(m)) if m == "gone"));

        assert_eq!(HelperFrame::parse("not json"), None);
        assert_eq!(HelperFrame::parse(r#"{"ok":true}"#), None);
        assert_eq!(HelperFrame::parse(r#"{"id":0,"ok":true}"#), None);
        assert_eq!(HelperFrame::parse(r#"{"id":"4","ok":true}"#), None);
    }

    #[test]
    fn failure_reply_without_code_maps_to_helper_error() {
        let reply = HelperReply {
            id: 1,
            ok: false,
            data: None,
            error: Some("wg-quick failed.".into()),
            code: None,
        };
        assert!(matches!(reply.into_result(), Err(AppError::Helper(m)) if m == "wg-quick failed."));
    }

    #[test]
    fn success_reply_defaults_missing_data_to_null() {
        let reply = HelperFrame::parse(r#"{"id":2,"ok":true}"#);
        let Some(HelperFrame::Reply(reply)) = reply else {
            panic!("expected reply");
        };
        assert_eq!(reply.into_result().expect("ok"), Value::Null);
    }
}
