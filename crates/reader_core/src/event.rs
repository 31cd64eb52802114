//! Stream events produced by batch jobs.
//!
//! Only the payload shape is contractual; transports decide how events are
//! framed. [`StreamEvent::to_sse`] renders the `event:`/`data:` framing used
//! by text transports.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One streamed batch: the cursor after the window and the window's new
/// results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPayload<T> {
    pub last_index: i64,
    pub data: Vec<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_count: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub is_success: bool,
    pub error_msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorPayload {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            is_success: false,
            error_msg: message.into(),
            error_code: None,
            data: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSummary {
    pub cached_count: usize,
    pub success_count: usize,
    pub failed_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EndPayload {
    Cursor {
        #[serde(rename = "lastIndex")]
        last_index: i64,
    },
    Cache(CacheSummary),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent<T> {
    Message(BatchPayload<T>),
    Error(ErrorPayload),
    End(EndPayload),
}

impl<T> StreamEvent<T> {
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Message(_) => "message",
            StreamEvent::Error(_) => "error",
            StreamEvent::End(_) => "end",
        }
    }

    /// True for the events that close a stream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Message(_))
    }
}

impl<T: Serialize> StreamEvent<T> {
    pub fn payload_json(&self) -> Value {
        let encoded = match self {
            StreamEvent::Message(payload) => serde_json::to_value(payload),
            StreamEvent::Error(payload) => serde_json::to_value(payload),
            StreamEvent::End(payload) => serde_json::to_value(payload),
        };
        // Payloads are plain structs of strings and numbers.
        encoded.unwrap_or(Value::Null)
    }

    pub fn to_sse(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.name(), self.payload_json())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_payload_uses_wire_names() {
        let event: StreamEvent<String> = StreamEvent::Message(BatchPayload {
            last_index: 3,
            data: vec!["a".to_string()],
            cached_count: None,
        });
        assert_eq!(event.payload_json(), json!({"lastIndex": 3, "data": ["a"]}));
    }

    #[test]
    fn end_payloads_render_flat() {
        let search: StreamEvent<String> = StreamEvent::End(EndPayload::Cursor { last_index: 7 });
        assert_eq!(search.payload_json(), json!({"lastIndex": 7}));

        let cache: StreamEvent<String> = StreamEvent::End(EndPayload::Cache(CacheSummary {
            cached_count: 5,
            success_count: 2,
            failed_count: 0,
        }));
        assert_eq!(
            cache.payload_json(),
            json!({"cachedCount": 5, "successCount": 2, "failedCount": 0})
        );
    }

    #[test]
    fn error_payload_omits_missing_optionals() {
        let event: StreamEvent<String> =
            StreamEvent::Error(ErrorPayload::new("boom").with_code("NO_SOURCES"));
        assert_eq!(
            event.to_sse(),
            "event: error\ndata: {\"isSuccess\":false,\"errorMsg\":\"boom\",\"errorCode\":\"NO_SOURCES\"}\n\n"
        );
    }
}
