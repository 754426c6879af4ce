//! Protocol messages.
//!
//! Three shapes travel on the wire, mirroring the informal grammar:
//!
//! ```text
//! CallMsg      = { key, name, args }
//! ResponseMsg  = { key, value } | { key, error }
//! ControlMsg   = { streamCtl: [command, id] | [command, id, value] }
//! ```
//!
//! A message that matches none of these shapes is a [`WireError::UnknownShape`];
//! the engine's policy is to drop such messages rather than fail the session.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::value::Value;

/// Stream-control commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Subscribe,
    Unsubscribe,
    Next,
    Error,
    Completed,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Subscribe => "subscribe",
            Command::Unsubscribe => "unsubscribe",
            Command::Next => "next",
            Command::Error => "error",
            Command::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "subscribe" => Some(Command::Subscribe),
            "unsubscribe" => Some(Command::Unsubscribe),
            "next" => Some(Command::Next),
            "error" => Some(Command::Error),
            "completed" => Some(Command::Completed),
            _ => None,
        }
    }

    /// `next` and `error` carry a payload; the other commands must not.
    pub fn carries_payload(self) -> bool {
        matches!(self, Command::Next | Command::Error)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stream-lifecycle control message for one shared stream id.
#[derive(Debug, Clone, PartialEq)]
pub struct Control {
    pub command: Command,
    pub id: String,
    pub value: Option<Value>,
}

/// The body of a response: a converted return value, or the converted
/// error a provider invocation produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyPayload {
    Value(Value),
    Error(Value),
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Invoke method `name` on the peer's provider with converted `args`.
    /// `key` correlates the eventual response.
    Call {
        key: String,
        name: String,
        args: Vec<Value>,
    },
    /// The converted outcome of a call, keyed to the matching request.
    Response { key: String, result: ReplyPayload },
    /// Stream lifecycle traffic.
    Control(Control),
}

impl Message {
    pub fn control(command: Command, id: impl Into<String>, value: Option<Value>) -> Self {
        Message::Control(Control {
            command,
            id: id.into(),
            value,
        })
    }

    /// Lower this message into its structural wire form.
    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        match self {
            Message::Call { key, name, args } => {
                map.insert("key".to_string(), Value::String(key.clone()));
                map.insert("name".to_string(), Value::String(name.clone()));
                map.insert("args".to_string(), Value::Array(args.clone()));
            }
            Message::Response { key, result } => {
                map.insert("key".to_string(), Value::String(key.clone()));
                match result {
                    ReplyPayload::Value(v) => {
                        map.insert("value".to_string(), v.clone());
                    }
                    ReplyPayload::Error(e) => {
                        map.insert("error".to_string(), e.clone());
                    }
                }
            }
            Message::Control(ctl) => {
                let mut tuple = vec![
                    Value::String(ctl.command.as_str().to_string()),
                    Value::String(ctl.id.clone()),
                ];
                if let Some(v) = &ctl.value {
                    tuple.push(v.clone());
                }
                map.insert("streamCtl".to_string(), Value::Array(tuple));
            }
        }
        Value::Object(map)
    }

    /// Classify a structural value as one of the three message shapes.
    pub fn from_value(value: Value) -> Result<Self, WireError> {
        let Value::Object(mut map) = value else {
            return Err(WireError::UnknownShape);
        };

        if let Some(ctl) = map.remove("streamCtl") {
            return parse_control(ctl).map(Message::Control);
        }

        if map.contains_key("name") {
            let key = take_string(&mut map, "key")?;
            let name = take_string(&mut map, "name")?;
            let args = match map.remove("args") {
                Some(Value::Array(items)) => items,
                Some(_) => return Err(WireError::UnknownShape),
                None => Vec::new(),
            };
            return Ok(Message::Call { key, name, args });
        }

        if map.contains_key("key") {
            let key = take_string(&mut map, "key")?;
            if let Some(e) = map.remove("error") {
                return Ok(Message::Response {
                    key,
                    result: ReplyPayload::Error(e),
                });
            }
            if let Some(v) = map.remove("value") {
                return Ok(Message::Response {
                    key,
                    result: ReplyPayload::Value(v),
                });
            }
        }

        Err(WireError::UnknownShape)
    }
}

fn take_string(map: &mut BTreeMap<String, Value>, key: &str) -> Result<String, WireError> {
    match map.remove(key) {
        Some(Value::String(s)) => Ok(s),
        _ => Err(WireError::UnknownShape),
    }
}

fn parse_control(value: Value) -> Result<Control, WireError> {
    let Value::Array(mut items) = value else {
        return Err(WireError::BadControl("streamCtl is not a tuple".into()));
    };
    if items.len() < 2 || items.len() > 3 {
        return Err(WireError::BadControl(format!(
            "streamCtl tuple has {} elements",
            items.len()
        )));
    }
    let payload = if items.len() == 3 { items.pop() } else { None };
    let id = match items.pop() {
        Some(Value::String(id)) => id,
        _ => return Err(WireError::BadControl("stream id is not a string".into())),
    };
    let command = match items.pop() {
        Some(Value::String(cmd)) => Command::parse(&cmd)
            .ok_or_else(|| WireError::BadControl(format!("unknown command {cmd:?}")))?,
        _ => return Err(WireError::BadControl("command is not a string".into())),
    };
    if command.carries_payload() != payload.is_some() {
        return Err(WireError::BadControl(format!(
            "{command} payload arity mismatch"
        )));
    }
    Ok(Control {
        command,
        id,
        value: payload,
    })
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Message::from_value(value).map_err(serde::de::Error::custom)
    }
}

/// Encode a message as JSON text.
pub fn encode(message: &Message) -> Result<String, WireError> {
    serde_json::to_string(message).map_err(WireError::Json)
}

/// Decode JSON text into a message.
pub fn decode(text: &str) -> Result<Message, WireError> {
    let value: Value = serde_json::from_str(text).map_err(WireError::Json)?;
    Message::from_value(value)
}

/// Error at the wire layer.
#[derive(Debug)]
pub enum WireError {
    /// Structurally valid JSON that matches no message shape.
    UnknownShape,
    /// A `streamCtl` tuple that violates the control grammar.
    BadControl(String),
    /// JSON syntax or serialization failure (including a live stream
    /// reaching the serializer).
    Json(serde_json::Error),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::UnknownShape => write!(f, "message matches no known shape"),
            WireError::BadControl(msg) => write!(f, "malformed stream control: {msg}"),
            WireError::Json(e) => write!(f, "json: {e}"),
        }
    }
}

impl std::error::Error for WireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WireError::Json(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: &Message) -> Message {
        decode(&encode(msg).expect("encode")).expect("decode")
    }

    #[test]
    fn call_roundtrips() {
        let msg = Message::Call {
            key: "k1".to_string(),
            name: "echo".to_string(),
            args: vec![Value::from(1), Value::StreamRef("s1".to_string())],
        };
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn response_value_and_error_roundtrip() {
        let ok = Message::Response {
            key: "k1".to_string(),
            result: ReplyPayload::Value(Value::from(0)),
        };
        let err = Message::Response {
            key: "k2".to_string(),
            result: ReplyPayload::Error(Value::from("boom")),
        };
        assert_eq!(roundtrip(&ok), ok);
        assert_eq!(roundtrip(&err), err);
    }

    #[test]
    fn control_tuples_roundtrip() {
        let sub = Message::control(Command::Subscribe, "id1", None);
        let next = Message::control(Command::Next, "id1", Some(Value::from("x")));
        let done = Message::control(Command::Completed, "id1", None);
        assert_eq!(roundtrip(&sub), sub);
        assert_eq!(roundtrip(&next), next);
        assert_eq!(roundtrip(&done), done);
    }

    #[test]
    fn control_wire_form_matches_grammar() {
        let next = Message::control(Command::Next, "s", Some(Value::from(5)));
        assert_eq!(encode(&next).unwrap(), r#"{"streamCtl":["next","s",5]}"#);
        let unsub = Message::control(Command::Unsubscribe, "s", None);
        assert_eq!(encode(&unsub).unwrap(), r#"{"streamCtl":["unsubscribe","s"]}"#);
    }

    #[test]
    fn payload_arity_is_enforced() {
        assert!(matches!(
            decode(r#"{"streamCtl":["next","s"]}"#),
            Err(WireError::BadControl(_))
        ));
        assert!(matches!(
            decode(r#"{"streamCtl":["subscribe","s",1]}"#),
            Err(WireError::BadControl(_))
        ));
        assert!(matches!(
            decode(r#"{"streamCtl":["nonsense","s"]}"#),
            Err(WireError::BadControl(_))
        ));
    }

    #[test]
    fn unknown_shapes_are_rejected() {
        assert!(matches!(decode("42"), Err(WireError::UnknownShape)));
        assert!(matches!(
            decode(r#"{"unrelated":true}"#),
            Err(WireError::UnknownShape)
        ));
        // A response needs either a value or an error.
        assert!(matches!(
            decode(r#"{"key":"k"}"#),
            Err(WireError::UnknownShape)
        ));
    }

    #[test]
    fn call_without_args_defaults_to_empty() {
        let msg = decode(r#"{"key":"k","name":"ping"}"#).unwrap();
        assert_eq!(
            msg,
            Message::Call {
                key: "k".to_string(),
                name: "ping".to_string(),
                args: vec![],
            }
        );
    }
}
