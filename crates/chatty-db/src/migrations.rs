use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id                          TEXT PRIMARY KEY,
            username                    TEXT NOT NULL UNIQUE,
            email                       TEXT NOT NULL UNIQUE,
            contact                     TEXT NOT NULL UNIQUE,
            name                        TEXT NOT NULL,
            password                    TEXT NOT NULL,
            date_of_birth               TEXT,
            login_type                  TEXT NOT NULL DEFAULT 'EMAIL_PASSWORD',
            is_email_verified           INTEGER NOT NULL DEFAULT 0,
            is_contact_verified         INTEGER NOT NULL DEFAULT 0,
            avatar_url                  TEXT,
            avatar_key                  TEXT,
            refresh_token               TEXT,
            email_otp                   TEXT,
            email_otp_expiry            TEXT,
            phone_otp                   TEXT,
            phone_otp_expiry            TEXT,
            password_reset_otp          TEXT,
            password_reset_otp_expiry   TEXT,
            login_attempts              INTEGER NOT NULL DEFAULT 0,
            lock_until                  TEXT,
            last_login                  TEXT,
            created_at                  TEXT NOT NULL,
            updated_at                  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS otp_requests (
            user_id         TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            requested_at    TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_otp_requests_user
            ON otp_requests(user_id, requested_at);

        CREATE TABLE IF NOT EXISTS chats (
            id              TEXT PRIMARY KEY,
            name            TEXT NOT NULL,
            is_group        INTEGER NOT NULL DEFAULT 0,
            admin_id        TEXT,
            last_message_id TEXT,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS chat_participants (
            chat_id     TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
            user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            joined_at   TEXT NOT NULL,
            PRIMARY KEY (chat_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_chat_participants_user
            ON chat_participants(user_id);

        CREATE TABLE IF NOT EXISTS chat_messages (
            id          TEXT PRIMARY KEY,
            chat_id     TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
            sender_id   TEXT NOT NULL,
            content     TEXT NOT NULL DEFAULT '',
            status      TEXT NOT NULL DEFAULT 'sent',
            reply_to    TEXT,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_chat_messages_chat
            ON chat_messages(chat_id, created_at);

        CREATE TABLE IF NOT EXISTS message_attachments (
            message_id      TEXT NOT NULL REFERENCES chat_messages(id) ON DELETE CASCADE,
            position        INTEGER NOT NULL,
            kind            TEXT NOT NULL,
            url             TEXT NOT NULL,
            storage_key     TEXT NOT NULL,
            original_name   TEXT,
            mime_type       TEXT NOT NULL,
            size            INTEGER NOT NULL,
            PRIMARY KEY (message_id, position)
        );

        CREATE TABLE IF NOT EXISTS message_receipts (
            message_id  TEXT NOT NULL REFERENCES chat_messages(id) ON DELETE CASCADE,
            user_id     TEXT NOT NULL,
            kind        TEXT NOT NULL CHECK (kind IN ('delivered', 'read')),
            at          TEXT NOT NULL,
            PRIMARY KEY (message_id, user_id, kind)
        );

        CREATE TABLE IF NOT EXISTS user_favorites (
            user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            chat_id     TEXT NOT NULL,
            PRIMARY KEY (user_id, chat_id)
        );

        CREATE TABLE IF NOT EXISTS user_blocked (
            user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            blocked_id  TEXT NOT NULL,
            PRIMARY KEY (user_id, blocked_id)
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
