use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

mod codec;

pub use codec::{
    decode_client_message, decode_server_message, encode_client_message, encode_server_message,
    CodecError,
};

/// `type` tag the controller uses for direct command replies.
pub const REPLY_TYPE: &str = "plugin_response";
/// `type` tag of a full plugin status snapshot.
pub const STATUS_TYPE: &str = "status";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Starting,
    Active,
    Running,
    Started,
    Stopped,
    Error,
    #[default]
    #[serde(other)]
    Unknown,
}

impl PluginState {
    /// Whether the controller will accept commands for a plugin in this state.
    pub fn is_available(self) -> bool {
        matches!(self, PluginState::Active | PluginState::Running | PluginState::Started)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PluginState::Starting => "starting",
            PluginState::Active => "active",
            PluginState::Running => "running",
            PluginState::Started => "started",
            PluginState::Stopped => "stopped",
            PluginState::Error => "error",
            PluginState::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for PluginState {
    type Err = std::convert::Infallible;

    /// Never fails: unrecognised states read as `Unknown`, like on the wire.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "starting" => PluginState::Starting,
            "active" => PluginState::Active,
            "running" => PluginState::Running,
            "started" => PluginState::Started,
            "stopped" => PluginState::Stopped,
            "error" => PluginState::Error,
            _ => PluginState::Unknown,
        })
    }
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PluginStatus {
    pub id: String,
    pub status: PluginState,
}

/// Plugin id -> last reported state, as of the most recent snapshot.
pub type PluginStatusMap = BTreeMap<String, PluginState>;

/// Full plugin status. A controller may also send one as the answer to a command,
/// in which case it carries that command's `correlationId`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub plugins: Vec<PluginStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusSnapshot {
    pub fn new(plugins: Vec<PluginStatus>) -> Self {
        Self {
            plugins,
            ..Self::default()
        }
    }

    /// Result handed to the command this snapshot answers: `{"plugins": [...]}`.
    pub fn outcome(&self) -> Result<Value, String> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        let plugins = self
            .plugins
            .iter()
            .map(|p| {
                let mut obj = Map::new();
                obj.insert("id".into(), Value::String(p.id.clone()));
                obj.insert("status".into(), Value::String(p.status.as_str().into()));
                Value::Object(obj)
            })
            .collect();
        let mut obj = Map::new();
        obj.insert("plugins".into(), Value::Array(plugins));
        Ok(Value::Object(obj))
    }

    pub fn to_map(&self) -> PluginStatusMap {
        self.plugins
            .iter()
            .map(|p| (p.id.clone(), p.status))
            .collect()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ClientMessage {
    Command(CommandEnvelope),
}

impl ClientMessage {
    pub fn correlation_id(&self) -> &str {
        match self {
            ClientMessage::Command(cmd) => &cmd.correlation_id,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    pub plugin_id: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    pub correlation_id: String,
}

/// Inbound message, classified at the boundary by [`decode_server_message`].
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Status(StatusSnapshot),
    Reply(CommandReply),
    Event(PluginEvent),
}

impl ServerMessage {
    pub fn kind(&self) -> &str {
        match self {
            ServerMessage::Status(_) => STATUS_TYPE,
            ServerMessage::Reply(reply) => &reply.kind,
            ServerMessage::Event(event) => &event.kind,
        }
    }

    pub fn plugin_id(&self) -> Option<&str> {
        match self {
            ServerMessage::Status(_) => None,
            ServerMessage::Reply(reply) => reply.plugin_id.as_deref(),
            ServerMessage::Event(event) => event.plugin_id.as_deref(),
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            ServerMessage::Status(snapshot) => snapshot.correlation_id.as_deref(),
            ServerMessage::Reply(reply) => reply.correlation_id.as_deref(),
            ServerMessage::Event(_) => None,
        }
    }
}

/// Direct answer to a command. `action` is read from `command`, falling back to `action`.
/// `plugin_id` may be absent only when the reply is correlated.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReply {
    pub kind: String,
    pub plugin_id: Option<String>,
    pub action: Option<String>,
    pub correlation_id: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl CommandReply {
    pub fn ok(
        plugin_id: impl Into<String>,
        action: impl Into<String>,
        correlation_id: Option<String>,
        result: Value,
    ) -> Self {
        Self {
            kind: REPLY_TYPE.to_string(),
            plugin_id: Some(plugin_id.into()),
            action: Some(action.into()),
            correlation_id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(
        plugin_id: impl Into<String>,
        action: impl Into<String>,
        correlation_id: Option<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            kind: REPLY_TYPE.to_string(),
            plugin_id: Some(plugin_id.into()),
            action: Some(action.into()),
            correlation_id,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Wire form of the reply, as the controller would have sent it.
    pub fn to_object(&self) -> Map<String, Value> {
        let mut obj = Map::new();
        obj.insert("type".into(), Value::String(self.kind.clone()));
        if let Some(plugin_id) = &self.plugin_id {
            obj.insert("pluginId".into(), Value::String(plugin_id.clone()));
        }
        if let Some(action) = &self.action {
            obj.insert("command".into(), Value::String(action.clone()));
        }
        if let Some(id) = &self.correlation_id {
            obj.insert("correlationId".into(), Value::String(id.clone()));
        }
        if let Some(result) = &self.result {
            obj.insert("result".into(), result.clone());
        }
        if let Some(error) = &self.error {
            obj.insert("error".into(), Value::String(error.clone()));
        }
        obj
    }

    /// `Err` carries the controller's error text verbatim.
    pub fn outcome(&self) -> Result<Value, String> {
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(self.result.clone().unwrap_or(Value::Null)),
        }
    }
}

/// Unsolicited broadcast. `body` keeps the whole original object.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginEvent {
    pub kind: String,
    pub plugin_id: Option<String>,
    pub action: Option<String>,
    pub body: Map<String, Value>,
}

/// A reply nobody is waiting for is still worth broadcasting.
impl From<CommandReply> for PluginEvent {
    fn from(reply: CommandReply) -> Self {
        let body = reply.to_object();
        Self {
            kind: reply.kind,
            plugin_id: reply.plugin_id,
            action: reply.action,
            body,
        }
    }
}

impl PluginEvent {
    pub fn new(kind: impl Into<String>, plugin_id: Option<String>) -> Self {
        Self {
            kind: kind.into(),
            plugin_id,
            action: None,
            body: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.body.insert(key.into(), value);
        self
    }
}
