use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Ordering metadata every client message carries.
///
/// `previous_message_id` is the tail id the client last observed; the log
/// only accepts the message if that is still the tail.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_message_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_key_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A message as submitted by a client, before the log assigns `id` and
/// `timeSent`. Any other fields are preserved verbatim.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<MessageContext>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessageDraft {
    pub fn expected_previous_id(&self) -> Option<i64> {
        self.context.as_ref().and_then(|c| c.previous_message_id)
    }

    pub fn conversation_key_id(&self) -> Option<&str> {
        self.context
            .as_ref()
            .and_then(|c| c.conversation_key_id.as_deref())
    }

    /// Stamp the draft with its server-assigned identity. Client-supplied
    /// `id` / `timeSent` are discarded.
    pub fn into_message(mut self, id: i64, time_sent: String) -> Message {
        self.extra.remove("id");
        self.extra.remove("timeSent");
        Message {
            id,
            time_sent,
            context: self.context.unwrap_or_default(),
            extra: self.extra,
        }
    }
}

/// A stored message. `id` is the 1-based position in its conversation log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub time_sent: String,
    #[serde(default)]
    pub context: MessageContext,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Current UTC time as RFC 3339 with millisecond precision and a `Z` suffix.
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
