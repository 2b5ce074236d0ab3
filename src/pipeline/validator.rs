//! Inbound payload validation and phone canonicalization.
//!
//! Pure functions, no I/O. Every problem in a payload is reported at once.

use serde_json::{Map, Value};

use super::types::{EventData, InboundEvent, MESSAGE_RECEIVED, TextBody};
use crate::error::{FieldProblem, ValidationError};

/// Canonical form of a phone number: its ASCII digits, in order.
///
/// This is the only form ever used as a lookup key.
pub fn normalize_phone(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}

/// Validate a raw webhook body. A body that is not JSON is one problem at `$`.
pub fn validate_body(body: &[u8]) -> Result<InboundEvent, ValidationError> {
    let raw: Value = serde_json::from_slice(body).map_err(|e| ValidationError {
        problems: vec![FieldProblem::new("$", format!("invalid JSON: {e}"))],
    })?;
    validate(&raw)
}

/// Validate a raw webhook payload into an [`InboundEvent`].
///
/// Data fields are mandatory only for `message-received` events; other event
/// types (delivery receipts, presence) are accepted with whatever data they
/// carry so the router can acknowledge and discard them.
pub fn validate(raw: &Value) -> Result<InboundEvent, ValidationError> {
    let mut problems = Vec::new();

    let Some(root) = raw.as_object() else {
        return Err(ValidationError {
            problems: vec![FieldProblem::new("$", "expected a JSON object")],
        });
    };

    let event = required_str(root, "event", "event", &mut problems);
    let instance_id = required_str(root, "instanceId", "instanceId", &mut problems);
    let strict = event.as_deref() == Some(MESSAGE_RECEIVED);

    let empty = Map::new();
    let data = match root.get("data") {
        Some(Value::Object(data)) => data,
        Some(_) => {
            problems.push(FieldProblem::new("data", "expected an object"));
            &empty
        }
        None => {
            if strict {
                problems.push(FieldProblem::new("data", "is required"));
            }
            &empty
        }
    };

    let mut fields = DataFields::default();
    if strict {
        fields.message_id = required_str(data, "messageId", "data.messageId", &mut problems);
        fields.from = required_phone(data, "from", "data.from", &mut problems);
        fields.to = required_phone(data, "to", "data.to", &mut problems);
        fields.text = required_text(data, &mut problems);
        fields.timestamp = required_timestamp(data, &mut problems);
        fields.from_me = required_bool(data, "fromMe", "data.fromMe", &mut problems);
    } else {
        fields.message_id = data.get("messageId").and_then(Value::as_str).map(String::from);
        fields.from = data.get("from").and_then(Value::as_str).map(normalize_phone);
        fields.to = data.get("to").and_then(Value::as_str).map(normalize_phone);
        fields.text = data
            .get("text")
            .and_then(|t| t.get("message"))
            .and_then(Value::as_str)
            .map(String::from);
        fields.timestamp = data.get("timestamp").and_then(as_timestamp);
        fields.from_me = data.get("fromMe").and_then(Value::as_bool);
    }
    let sender_name = optional_str(data, "senderName", "data.senderName", &mut problems);
    let push_name = optional_str(data, "pushName", "data.pushName", &mut problems);

    if !problems.is_empty() {
        return Err(ValidationError { problems });
    }

    Ok(InboundEvent {
        event: event.unwrap_or_default(),
        instance_id: instance_id.unwrap_or_default(),
        data: EventData {
            message_id: fields.message_id.unwrap_or_default(),
            from: fields.from.unwrap_or_default(),
            to: fields.to.unwrap_or_default(),
            text: TextBody {
                message: fields.text.unwrap_or_default(),
            },
            timestamp: fields.timestamp.unwrap_or_default(),
            from_me: fields.from_me.unwrap_or_default(),
            sender_name,
            push_name,
        },
    })
}

#[derive(Default)]
struct DataFields {
    message_id: Option<String>,
    from: Option<String>,
    to: Option<String>,
    text: Option<String>,
    timestamp: Option<i64>,
    from_me: Option<bool>,
}

fn required_str(
    obj: &Map<String, Value>,
    key: &str,
    path: &str,
    problems: &mut Vec<FieldProblem>,
) -> Option<String> {
    match obj.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
        Some(Value::String(_)) => {
            problems.push(FieldProblem::new(path, "must not be empty"));
            None
        }
        Some(_) => {
            problems.push(FieldProblem::new(path, "expected a string"));
            None
        }
        None => {
            problems.push(FieldProblem::new(path, "is required"));
            None
        }
    }
}

fn optional_str(
    obj: &Map<String, Value>,
    key: &str,
    path: &str,
    problems: &mut Vec<FieldProblem>,
) -> String {
    match obj.get(key) {
        Some(Value::String(s)) => s.clone(),
        None | Some(Value::Null) => String::new(),
        Some(_) => {
            problems.push(FieldProblem::new(path, "expected a string"));
            String::new()
        }
    }
}

fn required_phone(
    obj: &Map<String, Value>,
    key: &str,
    path: &str,
    problems: &mut Vec<FieldProblem>,
) -> Option<String> {
    let raw = required_str(obj, key, path, problems)?;
    let phone = normalize_phone(&raw);
    if phone.is_empty() {
        problems.push(FieldProblem::new(path, "contains no digits"));
        return None;
    }
    Some(phone)
}

fn required_text(obj: &Map<String, Value>, problems: &mut Vec<FieldProblem>) -> Option<String> {
    match obj.get("text") {
        Some(Value::Object(text)) => match text.get("message") {
            Some(Value::String(message)) => Some(message.clone()),
            Some(_) => {
                problems.push(FieldProblem::new("data.text.message", "expected a string"));
                None
            }
            None => {
                problems.push(FieldProblem::new("data.text.message", "is required"));
                None
            }
        },
        Some(_) => {
            problems.push(FieldProblem::new("data.text", "expected an object"));
            None
        }
        None => {
            problems.push(FieldProblem::new("data.text", "is required"));
            None
        }
    }
}

fn as_timestamp(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
}

fn required_timestamp(obj: &Map<String, Value>, problems: &mut Vec<FieldProblem>) -> Option<i64> {
    match obj.get("timestamp") {
        Some(value) => {
            let ts = as_timestamp(value);
            if ts.is_none() {
                problems.push(FieldProblem::new("data.timestamp", "expected a number"));
            }
            ts
        }
        None => {
            problems.push(FieldProblem::new("data.timestamp", "is required"));
            None
        }
    }
}

fn required_bool(
    obj: &Map<String, Value>,
    key: &str,
    path: &str,
    problems: &mut Vec<FieldProblem>,
) -> Option<bool> {
    match obj.get(key) {
        Some(Value::Bool(b)) => Some(*b),
        Some(_) => {
            problems.push(FieldProblem::new(path, "expected a boolean"));
            None
        }
        None => {
            problems.push(FieldProblem::new(path, "is required"));
            None
        }
    }
}
