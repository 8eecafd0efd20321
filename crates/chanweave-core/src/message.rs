//! Channel record types and the history content filter
//!
//! Records travel as JSON objects tagged by a `type` field. Chat content
//! (text, reactions, images, media announcements) goes to the persistent
//! topic; presence, typing and media chunks go to the ephemeral topic.
//!
//! [`is_history_record`] decides what replay may hand back. Ephemeral-class
//! records are rejected even when they turn up on the persistent topic.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::random_hex;

/// Length of generated record ids.
const RECORD_ID_LEN: usize = 16;

/// A typed channel record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ChatRecord {
    Text {
        id: String,
        text: String,
        sender: String,
        timestamp: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
    },
    Reaction {
        id: String,
        message_id: String,
        emoji: String,
        sender: String,
        timestamp: i64,
        /// Withdraws an earlier reaction
        #[serde(default)]
        remove: bool,
    },
    Image {
        id: String,
        image_id: String,
        sender: String,
        timestamp: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    /// Announces a media file that peers fetch over the media partition
    Media {
        id: String,
        metadata: Value,
        sender: String,
        timestamp: i64,
    },
    Presence {
        sender: String,
        status: String,
        timestamp: i64,
    },
    Typing {
        sender: String,
        typing: bool,
        timestamp: i64,
    },
    MediaChunk {
        transfer_id: String,
        index: u32,
        total: u32,
        /// Base64 chunk data
        data: String,
        sender: String,
        timestamp: i64,
    },
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl ChatRecord {
    pub fn text(sender: impl Into<String>, text: impl Into<String>) -> Self {
        ChatRecord::Text {
            id: random_hex(RECORD_ID_LEN),
            text: text.into(),
            sender: sender.into(),
            timestamp: now_ms(),
            reply_to: None,
        }
    }

    pub fn reaction(
        sender: impl Into<String>,
        message_id: impl Into<String>,
        emoji: impl Into<String>,
    ) -> Self {
        ChatRecord::Reaction {
            id: random_hex(RECORD_ID_LEN),
            message_id: message_id.into(),
            emoji: emoji.into(),
            sender: sender.into(),
            timestamp: now_ms(),
            remove: false,
        }
    }

    pub fn image(sender: impl Into<String>, image_id: impl Into<String>, caption: Option<String>) -> Self {
        ChatRecord::Image {
            id: random_hex(RECORD_ID_LEN),
            image_id: image_id.into(),
            sender: sender.into(),
            timestamp: now_ms(),
            caption,
        }
    }

    pub fn media(sender: impl Into<String>, metadata: Value) -> Self {
        ChatRecord::Media {
            id: random_hex(RECORD_ID_LEN),
            metadata,
            sender: sender.into(),
            timestamp: now_ms(),
        }
    }

    pub fn presence(sender: impl Into<String>, status: impl Into<String>) -> Self {
        ChatRecord::Presence {
            sender: sender.into(),
            status: status.into(),
            timestamp: now_ms(),
        }
    }

    pub fn typing(sender: impl Into<String>, typing: bool) -> Self {
        ChatRecord::Typing {
            sender: sender.into(),
            typing,
            timestamp: now_ms(),
        }
    }

    /// Presence, typing and media chunks never belong in history.
    pub fn is_ephemeral(&self) -> bool {
        matches!(
            self,
            ChatRecord::Presence { .. } | ChatRecord::Typing { .. } | ChatRecord::MediaChunk { .. }
        )
    }

    pub fn to_value(&self) -> Value {
        // Serializing this enum cannot fail: every field is a plain JSON type.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn has_field(value: &Value, key: &str) -> bool {
    value.get(key).is_some_and(|v| !v.is_null())
}

/// Whether a decoded payload may be returned from history replay.
///
/// Accepted: `text`; `reaction`; `image` with an `imageId`; `media` with
/// `metadata`; and untyped objects with the full legacy text shape (`id`,
/// `text`, `sender`, `timestamp`). Everything else is rejected, including
/// presence and typing records.
pub fn is_history_record(value: &Value) -> bool {
    if !value.is_object() {
        return false;
    }

    match value.get("type") {
        Some(Value::String(kind)) => match kind.as_str() {
            "text" | "reaction" => true,
            "image" => has_field(value, "imageId"),
            "media" => has_field(value, "metadata"),
            _ => false,
        },
        // Legacy records written before typing was introduced.
        None | Some(Value::Null) => ["id", "text", "sender", "timestamp"]
            .iter()
            .all(|k| has_field(value, k)),
        Some(_) => false,
    }
}
