//! Messaging data types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Display payload of a message
///
/// All fields are optional; a data-only message carries no notification at
/// all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Title line
    pub title: Option<String>,

    /// Body text
    pub body: Option<String>,

    /// Icon resource name
    pub icon: Option<String>,

    /// Sound to play on arrival
    pub sound: Option<String>,

    /// Badge count, as a string
    pub badge: Option<String>,

    /// Tag for coalescing notifications in the tray
    pub tag: Option<String>,
}

/// One push message
///
/// Outgoing messages need at least [`to`](Message::to): either a
/// registration token or a `/topics/NAME` path. The hub fills
/// [`message_id`](Message::message_id) when the sender leaves it empty and
/// stamps [`from`](Message::from) on topic deliveries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier
    pub message_id: String,

    /// Recipient: a registration token or a `/topics/NAME` path
    pub to: String,

    /// Sender, filled in on delivery
    pub from: String,

    /// Key/value payload
    pub data: HashMap<String, String>,

    /// Binary payload
    #[serde(with = "serde_bytes")]
    pub raw_data: Vec<u8>,

    /// Display payload, if any
    pub notification: Option<Notification>,

    /// Seconds the message may be queued before being dropped
    pub time_to_live: Option<i32>,

    /// Messages sharing a collapse key replace one another while queued
    pub collapse_key: Option<String>,

    /// Delivery priority, `"normal"` or `"high"`
    pub priority: Option<String>,

    /// Message type, e.g. `"deleted_messages"` for control messages
    pub message_type: Option<String>,

    /// Error indicator set by the hub
    pub error: Option<String>,

    /// Human-readable description of [`error`](Message::error)
    pub error_description: Option<String>,
}

/// Observer of incoming messages and registration tokens
///
/// Callbacks run on a worker task, never on the caller of
/// [`send`](crate::messaging::Messaging::send); implementors must
/// synchronize any state they touch.
pub trait MessagingListener: Send + Sync {
    /// Called for every message delivered to this instance
    fn on_message(&self, message: &Message);

    /// Called when a registration token becomes available
    fn on_token_received(&self, token: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serde_keeps_raw_data() {
        let message = Message {
            to: "/topics/news".to_string(),
            raw_data: vec![0, 159, 146, 150],
            ..Default::default()
        };

        let encoded = serde_json::to_string(&message).expect("message serializes");
        let decoded: Message = serde_json::from_str(&encoded).expect("message deserializes");
        assert_eq!(decoded.raw_data, vec![0, 159, 146, 150]);
        assert_eq!(decoded.to, "/topics/news");
    }

    #[test]
    fn test_notification_defaults_empty() {
        let notification = Notification::default();
        assert!(notification.title.is_none());
        assert!(notification.body.is_none());
    }
}
