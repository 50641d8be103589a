//! Terminal wire events. Every frame is a JSON text message tagged by `type`.

use serde::{Deserialize, Serialize};

/// Events a terminal client sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
}

/// Events the server sends to a terminal client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected { message: String },
    Output { data: String },
    Error { message: String },
    Terminated { message: String },
}

impl ServerEvent {
    pub fn connected() -> Self {
        ServerEvent::Connected {
            message: "Terminal session connected successfully".to_string(),
        }
    }

    pub fn output(data: impl Into<String>) -> Self {
        ServerEvent::Output { data: data.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }

    pub fn terminated(message: impl Into<String>) -> Self {
        ServerEvent::Terminated {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        // Plain enum of strings and integers; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }

    /// Whether the connection closes right after this event.
    pub fn is_final(&self) -> bool {
        matches!(self, ServerEvent::Terminated { .. })
    }
}

impl ClientEvent {
    pub fn parse(text: &str) -> Result<ClientEvent, String> {
        serde_json::from_str(text).map_err(|e| format!("malformed event: {e}"))
    }
}
