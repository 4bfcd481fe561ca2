//! Event types emitted by the listener.

use serde_json::Value;

/// Events delivered to [Listener](crate::Listener) handlers.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// Handshake completed and the listen request was sent.
    Connected,

    /// A notification relayed by the server.
    Notification(Notification),

    /// The session ended.
    Disconnected { reason: String },
}

/// One relayed message.
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub action: String,
    /// `None` when the sender attached no data.
    pub data: Option<Value>,
    /// The message exactly as relayed.
    pub raw: String,
}

impl Notification {
    /// Decode relayed text. Anything without a string `action` is not a notification.
    pub fn parse(raw: String) -> Option<Self> {
        let mut value: Value = serde_json::from_str(&raw).ok()?;
        let object = value.as_object_mut()?;
        let action = match object.remove("action")? {
            Value::String(action) => action,
            _ => return None,
        };
        let data = object.remove("data");
        Some(Self { action, data, raw })
    }
}
