use serde::{Deserialize, Serialize};

/// Frames a client may send over the console socket.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundMessage {
    Command { data: String },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Server,
    Game,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastKind {
    Log,
    Lifecycle,
}

/// Fanned out to every subscribed session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BroadcastMessage {
    pub source: Source,
    #[serde(rename = "type")]
    pub kind: BroadcastKind,
    pub data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyKind {
    Error,
    History,
}

/// Sent to a single session only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplyMessage {
    #[serde(rename = "type")]
    pub kind: ReplyKind,
    pub data: String,
}

impl ReplyMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: ReplyKind::Error,
            data: message.into(),
        }
    }

    pub fn history(lines: &[String]) -> Self {
        Self {
            kind: ReplyKind::History,
            data: lines.join("\n"),
        }
    }
}
