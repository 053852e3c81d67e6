use super::users::query_users_by_ids;
use super::{OptionalExt, as_params, placeholders};
use crate::Database;
use crate::models::{AttachmentRow, MessageRow, NewAttachment, ReceiptRow};
use anyhow::Result;
use chatty_types::models::ChatMessage;
use chrono::Utc;
use rusqlite::{Connection, Row, params};
use std::collections::HashMap;

const MESSAGE_COLUMNS: &str =
    "id, chat_id, sender_id, content, status, reply_to, created_at, updated_at";

impl Database {
    // -- Messages --

    /// Store a message with its attachments and make it the chat's last message.
    pub fn insert_message(
        &self,
        id: &str,
        chat_id: &str,
        sender_id: &str,
        content: &str,
        reply_to: Option<&str>,
        attachments: &[NewAttachment],
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            let now = Utc::now();
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO chat_messages (id, chat_id, sender_id, content, reply_to, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![id, chat_id, sender_id, content, reply_to, now],
            )?;
            for (position, a) in attachments.iter().enumerate() {
                tx.execute(
                    "INSERT INTO message_attachments
                         (message_id, position, kind, url, storage_key, original_name, mime_type, size)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        id,
                        position as i64,
                        a.kind.as_str(),
                        a.url,
                        a.storage_key,
                        a.original_name,
                        a.mime_type,
                        a.size as i64
                    ],
                )?;
            }
            tx.execute(
                "UPDATE chats SET last_message_id = ?2, updated_at = ?3 WHERE id = ?1",
                params![chat_id, id, now],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_message_row(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {MESSAGE_COLUMNS} FROM chat_messages WHERE id = ?1");
            let row = conn.query_row(&sql, [id], map_message).optional()?;
            Ok(row)
        })
    }

    /// A single message with sender, attachments and receipts.
    pub fn load_message(&self, id: &str) -> Result<Option<ChatMessage>> {
        self.with_conn(|conn| load_message(conn, id))
    }

    /// Newest first. With `before`, only messages older than that message.
    pub fn messages_for_chat(
        &self,
        chat_id: &str,
        limit: u32,
        before: Option<&str>,
    ) -> Result<Vec<ChatMessage>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM chat_messages m
                 WHERE m.chat_id = ?1
                   AND (?2 IS NULL OR (m.created_at, m.rowid) <
                        (SELECT created_at, rowid FROM chat_messages WHERE id = ?2))
                 ORDER BY m.created_at DESC, m.rowid DESC
                 LIMIT ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![chat_id, before, limit], map_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            hydrate_messages(conn, &rows)
        })
    }

    /// Delete a message and repoint the chat's last message at the newest
    /// remaining one. Returns the storage keys of its attachments.
    pub fn delete_message(&self, chat_id: &str, message_id: &str) -> Result<Vec<String>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let keys = {
                let mut stmt = tx.prepare(
                    "SELECT storage_key FROM message_attachments WHERE message_id = ?1 ORDER BY position",
                )?;
                stmt.query_map([message_id], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<String>, _>>()?
            };
            tx.execute("DELETE FROM chat_messages WHERE id = ?1", [message_id])?;
            tx.execute(
                "UPDATE chats SET last_message_id = (
                     SELECT id FROM chat_messages WHERE chat_id = ?1
                     ORDER BY created_at DESC, rowid DESC LIMIT 1)
                 WHERE id = ?1 AND (last_message_id = ?2 OR last_message_id IS NULL)",
                params![chat_id, message_id],
            )?;
            tx.commit()?;
            Ok(keys)
        })
    }

    /// Record delivery of the given messages to `user_id`, skipping the
    /// user's own messages. Returns how many receipts were new.
    pub fn mark_delivered(&self, user_id: &str, message_ids: &[String]) -> Result<usize> {
        if message_ids.is_empty() {
            return Ok(0);
        }
        self.with_conn_mut(|conn| {
            let now = Utc::now();
            let tx = conn.transaction()?;
            let mut added = 0;
            for id in message_ids {
                added += tx.execute(
                    "INSERT OR IGNORE INTO message_receipts (message_id, user_id, kind, at)
                     SELECT id, ?2, 'delivered', ?3 FROM chat_messages WHERE id = ?1 AND sender_id != ?2",
                    params![id, user_id, now],
                )?;
            }
            if added > 0 {
                refresh_status(&tx, message_ids)?;
            }
            tx.commit()?;
            Ok(added)
        })
    }

    /// Mark every message from others in the chat as read (and delivered)
    /// for `user_id`. Returns how many messages were newly read.
    pub fn mark_chat_read(&self, chat_id: &str, user_id: &str) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let now = Utc::now();
            let tx = conn.transaction()?;
            let pending: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT m.id FROM chat_messages m
                     WHERE m.chat_id = ?1 AND m.sender_id != ?2
                       AND NOT EXISTS (SELECT 1 FROM message_receipts r
                                       WHERE r.message_id = m.id AND r.user_id = ?2 AND r.kind = 'read')",
                )?;
                stmt.query_map(params![chat_id, user_id], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };
            for id in &pending {
                for kind in ["delivered", "read"] {
                    tx.execute(
                        "INSERT OR IGNORE INTO message_receipts (message_id, user_id, kind, at)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![id, user_id, kind, now],
                    )?;
                }
            }
            refresh_status(&tx, &pending)?;
            tx.commit()?;
            Ok(pending.len())
        })
    }
}

fn map_message(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        sender_id: row.get(2)?,
        content: row.get(3)?,
        status: row.get(4)?,
        reply_to: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

pub(crate) fn load_message(conn: &Connection, id: &str) -> Result<Option<ChatMessage>> {
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM chat_messages WHERE id = ?1");
    let Some(row) = conn.query_row(&sql, [id], map_message).optional()? else {
        return Ok(None);
    };
    Ok(hydrate_messages(conn, std::slice::from_ref(&row))?.pop())
}

/// Batch-fetch senders, attachments and receipts for a set of rows and
/// assemble API messages in the same order.
pub(crate) fn hydrate_messages(conn: &Connection, rows: &[MessageRow]) -> Result<Vec<ChatMessage>> {
    if rows.is_empty() {
        return Ok(vec![]);
    }

    let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
    let mut sender_ids: Vec<String> = rows.iter().map(|r| r.sender_id.clone()).collect();
    sender_ids.sort();
    sender_ids.dedup();

    let senders: HashMap<String, _> = query_users_by_ids(conn, &sender_ids)?
        .into_iter()
        .map(|u| (u.id.clone(), u.to_public()))
        .collect();
    let attachments = query_attachments(conn, &ids)?;
    let receipts = query_receipts(conn, &ids)?;

    Ok(rows
        .iter()
        .map(|r| r.to_message(senders.get(&r.sender_id).cloned(), &attachments, &receipts))
        .collect())
}

fn query_attachments(conn: &Connection, message_ids: &[String]) -> Result<Vec<AttachmentRow>> {
    let sql = format!(
        "SELECT message_id, position, kind, url, storage_key, original_name, mime_type, size
         FROM message_attachments WHERE message_id IN ({})",
        placeholders(message_ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(as_params(message_ids).as_slice(), |row| {
            Ok(AttachmentRow {
                message_id: row.get(0)?,
                position: row.get::<_, i64>(1)? as u32,
                kind: row.get(2)?,
                url: row.get(3)?,
                storage_key: row.get(4)?,
                original_name: row.get(5)?,
                mime_type: row.get(6)?,
                size: row.get::<_, i64>(7)? as u64,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn query_receipts(conn: &Connection, message_ids: &[String]) -> Result<Vec<ReceiptRow>> {
    let sql = format!(
        "SELECT message_id, user_id, kind FROM message_receipts
         WHERE message_id IN ({}) ORDER BY at, rowid",
        placeholders(message_ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(as_params(message_ids).as_slice(), |row| {
            Ok(ReceiptRow {
                message_id: row.get(0)?,
                user_id: row.get(1)?,
                kind: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Recompute `status` from receipts: `read` once every other participant
/// has read it, `delivered` once every other participant has received it.
fn refresh_status(conn: &Connection, message_ids: &[String]) -> Result<()> {
    let mut stmt = conn.prepare(
        "UPDATE chat_messages SET status = CASE
             WHEN NOT EXISTS (
                 SELECT 1 FROM chat_participants p
                 WHERE p.chat_id = chat_messages.chat_id AND p.user_id != chat_messages.sender_id
                   AND NOT EXISTS (SELECT 1 FROM message_receipts r
                                   WHERE r.message_id = chat_messages.id
                                     AND r.user_id = p.user_id AND r.kind = 'read'))
                 THEN 'read'
             WHEN NOT EXISTS (
                 SELECT 1 FROM chat_participants p
                 WHERE p.chat_id = chat_messages.chat_id AND p.user_id != chat_messages.sender_id
                   AND NOT EXISTS (SELECT 1 FROM message_receipts r
                                   WHERE r.message_id = chat_messages.id
                                     AND r.user_id = p.user_id AND r.kind = 'delivered'))
                 THEN 'delivered'
             ELSE 'sent'
         END
         WHERE id = ?1",
    )?;
    for id in message_ids {
        stmt.execute([id])?;
    }
    Ok(())
}
