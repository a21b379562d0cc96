/// SQL against the chat log schema and the composite fetches built on it
use crate::decode::{attachment_from_row, collect_rows, conversation_from_row, message_from_row};
use crate::models::{Attachment, Conversation, Message};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use tracing::{debug, error};

const CONVERSATIONS_SQL: &str = "
    SELECT chat.ROWID, chat.chat_identifier, chat.guid, chat.display_name, chat.service_name
    FROM chat
    LEFT JOIN chat_message_join cmj ON cmj.chat_id = chat.ROWID
    LEFT JOIN message ON message.ROWID = cmj.message_id
    WHERE chat.service_name = ?1
    GROUP BY chat.ROWID
    ORDER BY MAX(message.date) DESC, chat.ROWID DESC";

const RECIPIENTS_SQL: &str = "
    SELECT chj.chat_id, handle.id
    FROM chat_handle_join chj
    JOIN handle ON handle.ROWID = chj.handle_id
    JOIN chat ON chat.ROWID = chj.chat_id
    WHERE chat.service_name = ?1
    ORDER BY chj.chat_id, handle.ROWID";

const LATEST_DATE_SQL: &str = "
    SELECT COALESCE(MAX(message.date), 0)
    FROM chat_message_join cmj
    JOIN message ON message.ROWID = cmj.message_id
    WHERE cmj.chat_id = ?1";

const MESSAGE_COLUMNS: &str = "
    SELECT message.ROWID, message.guid, handle.id, message.text, message.is_from_me,
           message.cache_has_attachments, message.is_delivered, message.is_read,
           message.date, message.date_delivered, message.date_read
    FROM chat_message_join cmj
    JOIN chat ON chat.ROWID = cmj.chat_id
    JOIN message ON message.ROWID = cmj.message_id
    LEFT JOIN handle ON handle.ROWID = message.handle_id";

const ATTACHMENTS_SQL: &str = "
    SELECT maj.message_id, attachment.ROWID, attachment.filename, attachment.mime_type,
           attachment.transfer_state, attachment.total_bytes
    FROM message_attachment_join maj
    JOIN attachment ON attachment.ROWID = maj.attachment_id
    WHERE maj.message_id = ?1
    ORDER BY attachment.created_date DESC, attachment.ROWID DESC";

/// How a message window is addressed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatSelector {
    /// Internal row reference (refresh path)
    RowId(i64),
    /// Source identifier (on-demand path for cache misses)
    Identifier(String),
}

/// Full conversation list for `service`, most recent activity first, with
/// recipients attached. Messages are not loaded.
pub fn list_conversations(conn: &Connection, service: &str) -> rusqlite::Result<Vec<Conversation>> {
    debug!("{}", CONVERSATIONS_SQL.trim());
    let mut stmt = conn.prepare_cached(CONVERSATIONS_SQL)?;
    let mut conversations =
        collect_rows(&mut stmt, params![service], "conversation", conversation_from_row)?;

    let mut stmt = conn.prepare_cached(RECIPIENTS_SQL)?;
    let pairs = collect_rows(&mut stmt, params![service], "recipient", |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut recipients: HashMap<i64, Vec<String>> = HashMap::new();
    for (chat_id, handle) in pairs {
        recipients.entry(chat_id).or_default().push(handle);
    }

    for conv in &mut conversations {
        if let Some(list) = recipients.remove(&conv.row_id) {
            conv.recipients = list;
        }
    }
    Ok(conversations)
}

/// Store-side date of the newest message in a conversation (0 when empty)
pub fn latest_message_date(conn: &Connection, chat_row_id: i64) -> rusqlite::Result<i64> {
    let mut stmt = conn.prepare_cached(LATEST_DATE_SQL)?;
    stmt.query_row(params![chat_row_id], |row| row.get(0))
}

/// Newest-first message window, attachments included.
///
/// Every message flagged as carrying attachments costs one extra query.
pub fn messages_for(
    conn: &Connection,
    selector: &ChatSelector,
    limit: usize,
) -> rusqlite::Result<Vec<Message>> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut messages = match selector {
        ChatSelector::RowId(row_id) => {
            let sql = format!("{} WHERE chat.ROWID = ?1 ORDER BY message.date DESC LIMIT ?2", MESSAGE_COLUMNS);
            debug!("{} [{}]", sql.trim(), row_id);
            let mut stmt = conn.prepare_cached(&sql)?;
            collect_rows(&mut stmt, params![row_id, limit], "message", message_from_row)?
        }
        ChatSelector::Identifier(id) => {
            let sql = format!(
                "{} WHERE chat.chat_identifier = ?1 ORDER BY message.date DESC LIMIT ?2",
                MESSAGE_COLUMNS
            );
            debug!("{} [{}]", sql.trim(), id);
            let mut stmt = conn.prepare_cached(&sql)?;
            collect_rows(&mut stmt, params![id, limit], "message", message_from_row)?
        }
    };

    for message in messages.iter_mut().filter(|m| m.has_attachment) {
        match attachments_for(conn, message.row_id) {
            Ok(list) => message.attachments = list,
            Err(e) => error!("Attachment fetch failed for message {}: {}", message.row_id, e),
        }
    }
    Ok(messages)
}

/// Attachments owned by one message, newest first
pub fn attachments_for(conn: &Connection, message_row_id: i64) -> rusqlite::Result<Vec<Attachment>> {
    let mut stmt = conn.prepare_cached(ATTACHMENTS_SQL)?;
    collect_rows(&mut stmt, params![message_row_id], "attachment", attachment_from_row)
}
