/// Record types mirrored from the chat log
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Seconds between 1970-01-01 and 2001-01-01 (the store's epoch)
const APPLE_EPOCH: i64 = 978_307_200;

/// Dates above this are nanosecond-resolution (newer stores)
const NANOSECOND_THRESHOLD: i64 = 1_000_000_000_000;

/// One conversation thread.
///
/// `messages` is newest-first and `last_message_date` always equals the date
/// of its first element (0 when empty); the cache re-derives it on upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Stable, source-assigned identifier (phone number, email, or `chat…`)
    pub id: String,
    /// Internal numeric row reference
    pub row_id: i64,
    pub guid: String,
    pub display_name: String,
    pub service_name: String,
    pub messages: Vec<Message>,
    pub last_message_date: i64,
    pub recipients: Vec<String>,
}

impl Conversation {
    /// True for multi-party threads (identifiers the store assigns as `chat…`)
    pub fn is_group(&self) -> bool {
        self.id.starts_with("chat")
    }

    /// Replace the message list and its derived timestamp together
    pub fn set_messages(&mut self, messages: Vec<Message>) {
        self.last_message_date = messages.first().map_or(0, |m| m.date);
        self.messages = messages;
    }
}

/// A participant; a missing sender resolves to [`Handle::SELF_ID`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handle {
    pub id: String,
}

impl Handle {
    pub const SELF_ID: &'static str = "me";

    pub fn resolve(id: Option<String>) -> Self {
        Self {
            id: id.unwrap_or_else(|| Self::SELF_ID.to_string()),
        }
    }

    pub fn is_self(&self) -> bool {
        self.id == Self::SELF_ID
    }
}

/// A single message. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub row_id: i64,
    pub guid: String,
    pub text: Option<String>,
    pub is_from_me: bool,
    pub has_attachment: bool,
    pub is_delivered: bool,
    pub is_read: bool,
    /// Raw store date (Apple epoch, seconds or nanoseconds)
    pub date: i64,
    pub date_delivered: i64,
    pub date_read: i64,
    pub handle: Handle,
    pub attachments: Vec<Attachment>,
    /// `date` converted to wall-clock time, when representable
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// Owning message row reference
    pub message_id: i64,
    pub row_id: i64,
    pub filename: String,
    pub mime_type: String,
    pub transfer_state: i64,
    pub total_bytes: i64,
}

/// Convert a store date into UTC. Zero means "never" and yields `None`.
pub fn apple_time_to_utc(raw: i64) -> Option<DateTime<Utc>> {
    if raw == 0 {
        return None;
    }
    let (secs, nanos) = if raw.abs() >= NANOSECOND_THRESHOLD {
        (raw.div_euclid(1_000_000_000), raw.rem_euclid(1_000_000_000) as u32)
    } else {
        (raw, 0)
    };
    Utc.timestamp_opt(secs.checked_add(APPLE_EPOCH)?, nanos).single()
}
