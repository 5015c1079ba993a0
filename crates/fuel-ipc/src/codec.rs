//! Line codec. `decode` never fails: anything it cannot make sense of turns
//! into an `error` event describing the problem.

use crate::message::{IpcMessage, MessageType, Payload};
use crate::ProtocolError;
use serde_json::Value;
use uuid::Uuid;

/// Serialize a message as one newline-terminated JSON line.
pub fn encode(message: &IpcMessage) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Parse one line. An empty `instance_id` is filled with `local_instance_id`.
pub fn decode(line: &str, local_instance_id: &str) -> IpcMessage {
    let value: Value = match serde_json::from_str(line.trim()) {
        Ok(value) => value,
        Err(e) => return decode_error(format!("malformed JSON: {e}"), None, local_instance_id),
    };

    let Some(object) = value.as_object() else {
        return decode_error("message is not a JSON object", None, local_instance_id);
    };

    let request_id = object
        .get("request_id")
        .and_then(Value::as_str)
        .map(str::to_owned);

    let type_name = match object.get("type") {
        Some(Value::String(name)) => name.clone(),
        Some(_) => {
            return decode_error("field `type` must be a string", request_id, local_instance_id)
        }
        None => return decode_error("missing field `type`", request_id, local_instance_id),
    };

    let Some(message_type) = MessageType::from_name(&type_name) else {
        return decode_error(
            format!("unknown message type `{type_name}`"),
            request_id,
            local_instance_id,
        );
    };

    match serde_json::from_value::<IpcMessage>(value) {
        Ok(mut message) => {
            if message.instance_id.is_empty() {
                message.instance_id = local_instance_id.to_owned();
            }
            message
        }
        Err(e) => decode_error(
            format!("invalid `{message_type}` message: {e}"),
            request_id,
            local_instance_id,
        ),
    }
}

fn decode_error(
    message: impl Into<String>,
    request_id: Option<String>,
    instance_id: &str,
) -> IpcMessage {
    IpcMessage::new(Payload::error(message), instance_id).with_request_id(request_id)
}

/// Fresh correlation id for a command.
pub fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Fresh identity for a daemon instance.
pub fn generate_instance_id() -> String {
    Uuid::new_v4().to_string()
}
