use crate::{
    ClientMessage, CommandReply, PluginEvent, PluginStatus, ServerMessage, StatusSnapshot,
    REPLY_TYPE, STATUS_TYPE,
};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected a json object")]
    NotAnObject,
    #[error("message has no string `type` field")]
    MissingType,
    #[error("`{kind}` message is missing `{field}`")]
    MissingField { kind: String, field: &'static str },
    #[error("malformed status snapshot: {0}")]
    BadStatus(serde_json::Error),
}

pub fn encode_client_message(msg: &ClientMessage) -> Result<String, CodecError> {
    Ok(serde_json::to_string(msg)?)
}

pub fn decode_client_message(text: &str) -> Result<ClientMessage, CodecError> {
    Ok(serde_json::from_str(text)?)
}

/// Parses one inbound frame into the closed [`ServerMessage`] union.
///
/// Precedence: `status` snapshots first, then anything that looks like a reply
/// (a `correlationId`, the reply tag, or a command name next to a result/error),
/// and everything else is an unsolicited event. A `correlationId` is kept on
/// snapshots too, so the router can settle a command answered with one.
pub fn decode_server_message(text: &str) -> Result<ServerMessage, CodecError> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Object(obj) = value else {
        return Err(CodecError::NotAnObject);
    };
    classify(obj)
}

fn classify(obj: Map<String, Value>) -> Result<ServerMessage, CodecError> {
    let Some(kind) = string_field(&obj, "type") else {
        return Err(CodecError::MissingType);
    };

    if kind == STATUS_TYPE {
        let plugins = obj.get("plugins").cloned().ok_or(CodecError::MissingField {
            kind,
            field: "plugins",
        })?;
        let plugins: Vec<PluginStatus> =
            serde_json::from_value(plugins).map_err(CodecError::BadStatus)?;
        return Ok(ServerMessage::Status(StatusSnapshot {
            plugins,
            correlation_id: string_field(&obj, "correlationId"),
            error: error_field(&obj),
        }));
    }

    let correlation_id = string_field(&obj, "correlationId");
    let action = string_field(&obj, "command").or_else(|| string_field(&obj, "action"));
    let has_outcome = obj.contains_key("result") || obj.contains_key("error");

    if correlation_id.is_some() || kind == REPLY_TYPE || (action.is_some() && has_outcome) {
        let plugin_id = string_field(&obj, "pluginId");
        if plugin_id.is_none() && correlation_id.is_none() {
            return Err(CodecError::MissingField {
                kind,
                field: "pluginId",
            });
        }
        return Ok(ServerMessage::Reply(CommandReply {
            kind,
            plugin_id,
            action,
            correlation_id,
            result: obj.get("result").cloned(),
            error: error_field(&obj),
        }));
    }

    let plugin_id = string_field(&obj, "pluginId");
    Ok(ServerMessage::Event(PluginEvent {
        kind,
        plugin_id,
        action,
        body: obj,
    }))
}

fn string_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Non-string errors keep their compact json text.
fn error_field(obj: &Map<String, Value>) -> Option<String> {
    match obj.get("error") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    }
}

pub fn encode_server_message(msg: &ServerMessage) -> Result<String, CodecError> {
    let value = match msg {
        ServerMessage::Status(snapshot) => {
            let mut obj = Map::new();
            obj.insert("type".into(), Value::String(STATUS_TYPE.into()));
            obj.insert("plugins".into(), serde_json::to_value(&snapshot.plugins)?);
            if let Some(id) = &snapshot.correlation_id {
                obj.insert("correlationId".into(), Value::String(id.clone()));
            }
            if let Some(error) = &snapshot.error {
                obj.insert("error".into(), Value::String(error.clone()));
            }
            obj
        }
        ServerMessage::Reply(reply) => reply.to_object(),
        ServerMessage::Event(event) => {
            let mut obj = event.body.clone();
            obj.insert("type".into(), Value::String(event.kind.clone()));
            if let Some(plugin_id) = &event.plugin_id {
                obj.insert("pluginId".into(), Value::String(plugin_id.clone()));
            }
            if let Some(action) = &event.action {
                obj.entry("action")
                    .or_insert_with(|| Value::String(action.clone()));
            }
            obj
        }
    };
    Ok(serde_json::to_string(&Value::Object(value))?)
}
