//! Wire frames for the broker protocol
//!
//! Every message on the connection is one JSON object per line:
//! `{"method": ..., "requestId": ..., "requestData": ..., "response": ...}`.
//! Requests carry a unique `requestId`; responses echo it back with
//! `response` populated. `notify` frames are broadcast and never
//! answered.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Event name announced by a worker when an operation's apply finished
pub const EVENT_TASK_COMPLETED: &str = "taskCompleted";

/// Frame method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    /// Pop the head of the pending list
    #[serde(rename = "getTask")]
    GetTask,
    /// Append a task id to the tail of the pending list
    #[serde(rename = "submitTask")]
    SubmitTask,
    /// Fan a payload out to every connected subscriber
    #[serde(rename = "notify")]
    Notify,
}

/// Protocol frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Frame method
    pub method: Method,

    /// Correlation id (echoed on the response)
    #[serde(rename = "requestId")]
    pub request_id: String,

    /// Request payload, method-dependent
    #[serde(rename = "requestData", skip_serializing_if = "Option::is_none")]
    pub request_data: Option<Value>,

    /// Response payload (set by the broker)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
}

impl Frame {
    /// New request frame with a fresh correlation id
    pub fn request(method: Method, request_data: Option<Value>) -> Self {
        Self {
            method,
            request_id: Uuid::new_v4().to_string(),
            request_data,
            response: None,
        }
    }

    /// Notification payload: `{event, data}`
    pub fn notification(event: &str, data: Value) -> Self {
        Self::request(
            Method::Notify,
            Some(serde_json::json!({ "event": event, "data": data })),
        )
    }

    /// Serialize to one newline-terminated JSON line
    pub fn to_line(&self) -> crate::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Deserialize from a JSON line
    ///
    /// A line the peer sent that does not parse as a frame is a
    /// protocol violation, distinct from failing to serialize our own.
    pub fn from_line(line: &str) -> crate::Result<Self> {
        serde_json::from_str(line.trim_end())
            .map_err(|e| crate::Error::Protocol(format!("malformed frame: {}", e)))
    }

    /// Event name when this is a notification frame
    pub fn notify_event(&self) -> Option<&str> {
        if self.method != Method::Notify {
            return None;
        }
        self.request_data.as_ref()?.get("event")?.as_str()
    }

    /// Notification data payload
    pub fn notify_data(&self) -> Option<&Value> {
        self.request_data.as_ref()?.get("data")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_round_trip() {
        let frame = Frame::request(Method::SubmitTask, Some(json!("42")));
        let line = frame.to_line().unwrap();
        assert!(line.ends_with('\n'));

        let parsed = Frame::from_line(&line).unwrap();
        assert_eq!(parsed.method, Method::SubmitTask);
        assert_eq!(parsed.request_id, frame.request_id);
        assert_eq!(parsed.request_data, Some(json!("42")));
        assert!(parsed.response.is_none());
    }

    #[test]
    fn test_method_wire_names() {
        let frame = Frame::request(Method::GetTask, None);
        let line = frame.to_line().unwrap();
        assert!(line.contains("\"getTask\""));
        assert!(line.contains("\"requestId\""));
        // absent fields are omitted, not null
        assert!(!line.contains("requestData"));
    }

    #[test]
    fn test_malformed_line_is_a_protocol_error() {
        let err = Frame::from_line("{not a frame").unwrap_err();
        assert!(matches!(err, crate::Error::Protocol(_)));
        assert!(err.to_string().contains("malformed frame"));
    }

    #[test]
    fn test_notification_accessors() {
        let frame = Frame::notification(EVENT_TASK_COMPLETED, json!("7"));
        assert_eq!(frame.notify_event(), Some(EVENT_TASK_COMPLETED));
        assert_eq!(frame.notify_data(), Some(&json!("7")));

        let plain = Frame::request(Method::GetTask, None);
        assert_eq!(plain.notify_event(), None);
    }
}
