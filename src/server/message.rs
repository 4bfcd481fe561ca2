//! Relay protocol messages carried in text frames.

use serde_json::{Map, Value};

use crate::error::Error;
use crate::Result;

pub const ACTION_LISTEN: &str = "listen";
pub const ACTION_SHUTDOWN: &str = "shutdown";

/// A decoded relay message.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// Subscribe the sending connection to notifications.
    Listen,
    /// Stop the server.
    Shutdown,
    /// Anything else: relayed to every listener.
    Notify { action: String, data: Option<Value> },
}

impl RelayMessage {
    /// Decode a text message. It must be a JSON object with a string `action`.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| Error::Message(format!("invalid JSON: {e}")))?;
        let Value::Object(mut object) = value else {
            return Err(Error::Message("message is not a JSON object".into()));
        };
        let action = match object.remove("action") {
            Some(Value::String(action)) => action,
            Some(_) => return Err(Error::Message("action is not a string".into())),
            None => return Err(Error::Message("missing action".into())),
        };
        Ok(match action.as_str() {
            ACTION_LISTEN => RelayMessage::Listen,
            ACTION_SHUTDOWN => RelayMessage::Shutdown,
            _ => RelayMessage::Notify {
                action,
                data: object.remove("data"),
            },
        })
    }

    /// Serialize back to the wire form. `data` is omitted when null or empty.
    pub fn to_json(&self) -> String {
        let mut object = Map::new();
        match self {
            RelayMessage::Listen => {
                object.insert("action".into(), ACTION_LISTEN.into());
            }
            RelayMessage::Shutdown => {
                object.insert("action".into(), ACTION_SHUTDOWN.into());
            }
            RelayMessage::Notify { action, data } => {
                object.insert("action".into(), action.as_str().into());
                if let Some(data) = data.as_ref().filter(|d| !is_empty(d)) {
                    object.insert("data".into(), data.clone());
                }
            }
        }
        Value::Object(object).to_string()
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(o) => o.is_empty(),
        Value::Array(a) => a.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::assert_err;

    #[test]
    fn parses_each_kind() {
        assert_eq!(
            RelayMessage::parse(r#"{"action":"listen"}"#).unwrap(),
            RelayMessage::Listen
        );
        assert_eq!(
            RelayMessage::parse(r#"{"action":"shutdown","data":{"x":1}}"#).unwrap(),
            RelayMessage::Shutdown
        );
        assert_eq!(
            RelayMessage::parse(r#"{"action":"ping","data":{"value":1}}"#).unwrap(),
            RelayMessage::Notify {
                action: "ping".into(),
                data: Some(json!({"value": 1})),
            }
        );
        assert_eq!(
            RelayMessage::parse(r#"{"action":"ping"}"#).unwrap(),
            RelayMessage::Notify {
                action: "ping".into(),
                data: None,
            }
        );
    }

    #[test]
    fn rejects_malformed() {
        for text in ["not json", "[1,2]", r#"{"data":{}}"#, r#"{"action":7}"#] {
            let err = assert_err!(RelayMessage::parse(text));
            assert!(matches!(err, Error::Message(_)), "{text}");
        }
    }

    #[test]
    fn serializes_without_empty_data() {
        let bare = RelayMessage::Notify {
            action: "refresh".into(),
            data: Some(json!({})),
        };
        assert_eq!(bare.to_json(), r#"{"action":"refresh"}"#);

        let full = RelayMessage::Notify {
            action: "ping".into(),
            data: Some(json!({"value": 1})),
        };
        assert_eq!(full.to_json(), r#"{"action":"ping","data":{"value":1}}"#);
        assert_eq!(RelayMessage::Listen.to_json(), r#"{"action":"listen"}"#);
    }
}
