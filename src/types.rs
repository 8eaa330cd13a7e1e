use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

/// Opaque command identifier.
///
/// Locally issued ids are random v4 UUIDs. Ids arriving from the remote side
/// are taken verbatim, so an orphaned submission can carry any string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(String);

impl CommandId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[cfg(test)]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CommandId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for CommandId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A unit of work published for the remote runtime.
#[derive(Debug, Clone)]
pub struct Command {
    pub id: CommandId,
    pub name: String,
    pub args: Value,
    pub created_at: Instant,
    pub timestamp_ms: u64,
}

impl Command {
    pub fn new(name: &str, args: Value) -> Self {
        Self {
            id: CommandId::generate(),
            name: name.to_owned(),
            args,
            created_at: Instant::now(),
            timestamp_ms: now_ms(),
        }
    }

    pub fn to_wire(&self) -> WireCommand {
        WireCommand {
            id: self.id.clone(),
            name: self.name.clone(),
            args: self.args.clone(),
            timestamp: self.timestamp_ms,
        }
    }
}

/// A command as it travels to the remote poller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireCommand {
    pub id: CommandId,
    pub name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub timestamp: u64,
}

/// A result entry as submitted by the remote poller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireResult {
    pub id: CommandId,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub id: CommandId,
    pub result: Value,
    pub error: Option<String>,
    pub produced_at: Instant,
}

impl CommandResult {
    pub fn from_wire(entry: WireResult) -> Self {
        Self {
            id: entry.id,
            result: entry.result,
            error: entry.error,
            produced_at: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Connecting,
    Disconnected,
}

impl ConnectionState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Connected => "Connected",
            Self::Connecting => "Connecting...",
            Self::Disconnected => "Disconnected",
        }
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
