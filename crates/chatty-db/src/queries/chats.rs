use super::messages::load_message;
use super::users::query_users_by_ids;
use super::OptionalExt;
use crate::Database;
use crate::models::ChatRow;
use anyhow::Result;
use chatty_types::models::Chat;
use chrono::Utc;
use rusqlite::{Connection, Row, params};

const CHAT_COLUMNS: &str = "id, name, is_group, admin_id, last_message_id, created_at, updated_at";

impl Database {
    // -- Chats --

    pub fn create_chat(
        &self,
        id: &str,
        name: &str,
        is_group: bool,
        admin_id: Option<&str>,
        participants: &[String],
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            let now = Utc::now();
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO chats (id, name, is_group, admin_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![id, name, is_group, admin_id, now],
            )?;
            for user_id in participants {
                tx.execute(
                    "INSERT OR IGNORE INTO chat_participants (chat_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
                    params![id, user_id, now],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_chat(&self, id: &str) -> Result<Option<ChatRow>> {
        self.with_conn(|conn| query_chat(conn, id))
    }

    /// The one-on-one chat between exactly these two users, if any.
    pub fn find_one_on_one(&self, a: &str, b: &str) -> Result<Option<ChatRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {CHAT_COLUMNS} FROM chats c
                 WHERE c.is_group = 0
                   AND EXISTS (SELECT 1 FROM chat_participants WHERE chat_id = c.id AND user_id = ?1)
                   AND EXISTS (SELECT 1 FROM chat_participants WHERE chat_id = c.id AND user_id = ?2)
                   AND (SELECT COUNT(*) FROM chat_participants WHERE chat_id = c.id) = 2
                 LIMIT 1"
            );
            let row = conn.query_row(&sql, params![a, b], map_chat).optional()?;
            Ok(row)
        })
    }

    /// Participant ids in join order.
    pub fn participant_ids(&self, chat_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| query_participant_ids(conn, chat_id))
    }

    pub fn is_participant(&self, chat_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM chat_participants WHERE chat_id = ?1 AND user_id = ?2",
                    params![chat_id, user_id],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    pub fn rename_chat(&self, chat_id: &str, name: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE chats SET name = ?2, updated_at = ?3 WHERE id = ?1",
                params![chat_id, name, Utc::now()],
            )?;
            Ok(())
        })
    }

    pub fn add_participant(&self, chat_id: &str, user_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            let now = Utc::now();
            conn.execute(
                "INSERT OR IGNORE INTO chat_participants (chat_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
                params![chat_id, user_id, now],
            )?;
            conn.execute(
                "UPDATE chats SET updated_at = ?2 WHERE id = ?1",
                params![chat_id, now],
            )?;
            Ok(())
        })
    }

    /// Returns false when the user was not a participant.
    pub fn remove_participant(&self, chat_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM chat_participants WHERE chat_id = ?1 AND user_id = ?2",
                params![chat_id, user_id],
            )?;
            if removed > 0 {
                conn.execute(
                    "UPDATE chats SET updated_at = ?2 WHERE id = ?1",
                    params![chat_id, Utc::now()],
                )?;
            }
            Ok(removed > 0)
        })
    }

    pub fn set_admin(&self, chat_id: &str, admin_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE chats SET admin_id = ?2, updated_at = ?3 WHERE id = ?1",
                params![chat_id, admin_id, Utc::now()],
            )?;
            Ok(())
        })
    }

    /// Delete a chat with its messages, attachments, receipts and favorite
    /// entries. Returns the attachment storage keys so blobs can be removed.
    pub fn delete_chat(&self, chat_id: &str) -> Result<Vec<String>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let keys = {
                let mut stmt = tx.prepare(
                    "SELECT a.storage_key FROM message_attachments a
                     JOIN chat_messages m ON m.id = a.message_id
                     WHERE m.chat_id = ?1",
                )?;
                stmt.query_map([chat_id], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<String>, _>>()?
            };
            tx.execute("DELETE FROM user_favorites WHERE chat_id = ?1", [chat_id])?;
            // Messages, attachments, receipts and participants cascade.
            tx.execute("DELETE FROM chats WHERE id = ?1", [chat_id])?;
            tx.commit()?;
            Ok(keys)
        })
    }

    /// Messages from others in the chat that `user_id` has not read.
    pub fn unread_count(&self, chat_id: &str, user_id: &str) -> Result<u64> {
        self.with_conn(|conn| query_unread_count(conn, chat_id, user_id))
    }

    /// Fully assembled chat as seen by `viewer_id`.
    pub fn load_chat(&self, chat_id: &str, viewer_id: &str) -> Result<Option<Chat>> {
        self.with_conn(|conn| {
            let Some(row) = query_chat(conn, chat_id)? else {
                return Ok(None);
            };
            Ok(Some(assemble_chat(conn, row, viewer_id)?))
        })
    }

    /// Every chat the user takes part in, most recent activity first.
    pub fn chats_for_user(&self, user_id: &str) -> Result<Vec<Chat>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {CHAT_COLUMNS} FROM chats c
                 WHERE EXISTS (SELECT 1 FROM chat_participants p WHERE p.chat_id = c.id AND p.user_id = ?1)
                 ORDER BY c.updated_at DESC, c.rowid DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([user_id], map_chat)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|row| assemble_chat(conn, row, user_id))
                .collect()
        })
    }
}

fn map_chat(row: &Row<'_>) -> rusqlite::Result<ChatRow> {
    Ok(ChatRow {
        id: row.get(0)?,
        name: row.get(1)?,
        is_group: row.get(2)?,
        admin_id: row.get(3)?,
        last_message_id: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn query_chat(conn: &Connection, id: &str) -> Result<Option<ChatRow>> {
    let sql = format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?1");
    let row = conn.query_row(&sql, [id], map_chat).optional()?;
    Ok(row)
}

fn query_participant_ids(conn: &Connection, chat_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM chat_participants WHERE chat_id = ?1 ORDER BY joined_at, rowid",
    )?;
    let ids = stmt
        .query_map([chat_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(ids)
}

fn query_unread_count(conn: &Connection, chat_id: &str, user_id: &str) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM chat_messages m
         WHERE m.chat_id = ?1 AND m.sender_id != ?2
           AND NOT EXISTS (SELECT 1 FROM message_receipts r
                           WHERE r.message_id = m.id AND r.user_id = ?2 AND r.kind = 'read')",
        params![chat_id, user_id],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

fn assemble_chat(conn: &Connection, row: ChatRow, viewer_id: &str) -> Result<Chat> {
    let ids = query_participant_ids(conn, &row.id)?;
    let users = query_users_by_ids(conn, &ids)?;
    // Keep join order; the IN query does not preserve it.
    let participants = ids
        .iter()
        .filter_map(|id| users.iter().find(|u| &u.id == id))
        .map(|u| u.to_public())
        .collect();

    let last_message = match row.last_message_id.as_deref() {
        Some(id) => load_message(conn, id)?,
        None => None,
    };

    Ok(Chat {
        unread_message_count: query_unread_count(conn, &row.id, viewer_id)?,
        id: row.id,
        name: row.name,
        is_group_chat: row.is_group,
        participants,
        admin: row.admin_id,
        last_message,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}
