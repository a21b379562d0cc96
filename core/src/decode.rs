/// Row decoders: raw store rows into typed records
///
/// Decoders are pure; the statement and its cursor are owned by the caller's
/// scope and released on every exit path. A row that fails to decode is
/// logged and skipped, it never aborts the scan.
use crate::models::{apple_time_to_utc, Attachment, Conversation, Handle, Message};
use rusqlite::{Params, Row, Statement};
use tracing::warn;

/// `chat.ROWID, chat.chat_identifier, chat.guid, chat.display_name, chat.service_name`
pub fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        row_id: row.get(0)?,
        id: row.get(1)?,
        guid: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        display_name: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        service_name: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        messages: Vec::new(),
        last_message_date: 0,
        recipients: Vec::new(),
    })
}

/// `message.ROWID, message.guid, handle.id, message.text, message.is_from_me,
/// message.cache_has_attachments, message.is_delivered, message.is_read,
/// message.date, message.date_delivered, message.date_read`
///
/// Attachments are left empty; filling them is the query layer's job.
pub fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let date: i64 = row.get::<_, Option<i64>>(8)?.unwrap_or(0);
    Ok(Message {
        row_id: row.get(0)?,
        guid: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        handle: Handle::resolve(row.get::<_, Option<String>>(2)?),
        text: row.get(3)?,
        is_from_me: row.get::<_, Option<bool>>(4)?.unwrap_or(false),
        has_attachment: row.get::<_, Option<bool>>(5)?.unwrap_or(false),
        is_delivered: row.get::<_, Option<bool>>(6)?.unwrap_or(false),
        is_read: row.get::<_, Option<bool>>(7)?.unwrap_or(false),
        date,
        date_delivered: row.get::<_, Option<i64>>(9)?.unwrap_or(0),
        date_read: row.get::<_, Option<i64>>(10)?.unwrap_or(0),
        attachments: Vec::new(),
        sent_at: apple_time_to_utc(date),
    })
}

/// `message_attachment_join.message_id, attachment.ROWID, attachment.filename,
/// attachment.mime_type, attachment.transfer_state, attachment.total_bytes`
pub fn attachment_from_row(row: &Row<'_>) -> rusqlite::Result<Attachment> {
    Ok(Attachment {
        message_id: row.get(0)?,
        row_id: row.get(1)?,
        filename: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        mime_type: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        transfer_state: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
        total_bytes: row.get::<_, Option<i64>>(5)?.unwrap_or(0),
    })
}

/// Run `stmt` and decode every row with `decode`.
///
/// Engine failures (I/O, interrupt, locking) abort with an error; per-row
/// decode failures are skipped.
pub fn collect_rows<T, P, F>(
    stmt: &mut Statement<'_>,
    params: P,
    what: &str,
    decode: F,
) -> rusqlite::Result<Vec<T>>
where
    P: Params,
    F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
{
    let rows = stmt.query_map(params, decode)?;
    let mut out = Vec::new();
    for (index, row) in rows.enumerate() {
        match row {
            Ok(item) => out.push(item),
            Err(e @ rusqlite::Error::SqliteFailure(..)) => return Err(e),
            Err(e) => warn!("Skipping undecodable {} row #{}: {}", what, index, e),
        }
    }
    Ok(out)
}
