use super::{OptionalExt, as_params, placeholders};
use crate::Database;
use crate::models::UserRow;
use anyhow::{Result, anyhow};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, Row, TransactionBehavior, params};

const USER_COLUMNS: &str = "id, username, email, contact, name, password, date_of_birth, \
    login_type, is_email_verified, is_contact_verified, avatar_url, avatar_key, refresh_token, \
    email_otp, email_otp_expiry, phone_otp, phone_otp_expiry, password_reset_otp, \
    password_reset_otp_expiry, login_attempts, lock_until, last_login, created_at, updated_at";

pub struct NewUser {
    pub id: String,
    pub username: String,
    pub email: String,
    pub contact: String,
    pub name: String,
    pub password_hash: String,
    pub date_of_birth: Option<NaiveDate>,
}

/// Fields a user may change on their own profile. `None` leaves the column
/// alone. A new email or contact clears the matching verified flag.
#[derive(Debug, Default)]
pub struct ProfileChanges {
    pub name: Option<String>,
    pub username: Option<String>,
    pub email: Option<String>,
    pub contact: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtpPurpose {
    Email,
    Phone,
    PasswordReset,
}

impl OtpPurpose {
    fn columns(self) -> (&'static str, &'static str) {
        match self {
            Self::Email => ("email_otp", "email_otp_expiry"),
            Self::Phone => ("phone_otp", "phone_otp_expiry"),
            Self::PasswordReset => ("password_reset_otp", "password_reset_otp_expiry"),
        }
    }

    fn verified_flag(self) -> Option<&'static str> {
        match self {
            Self::Email => Some("is_email_verified"),
            Self::Phone => Some("is_contact_verified"),
            Self::PasswordReset => None,
        }
    }

    /// The stored (hash, expiry) pair for this purpose.
    pub fn stored(self, user: &UserRow) -> (Option<&str>, Option<DateTime<Utc>>) {
        match self {
            Self::Email => (user.email_otp.as_deref(), user.email_otp_expiry),
            Self::Phone => (user.phone_otp.as_deref(), user.phone_otp_expiry),
            Self::PasswordReset => (
                user.password_reset_otp.as_deref(),
                user.password_reset_otp_expiry,
            ),
        }
    }
}

impl Database {
    // -- Users --

    pub fn create_user(&self, user: &NewUser) -> Result<UserRow> {
        self.with_conn(|conn| {
            let now = Utc::now();
            conn.execute(
                "INSERT INTO users (id, username, email, contact, name, password, date_of_birth, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    user.id,
                    user.username,
                    user.email,
                    user.contact,
                    user.name,
                    user.password_hash,
                    user.date_of_birth,
                    now
                ],
            )?;
            query_user(conn, "id", &user.id)?
                .ok_or_else(|| anyhow!("User vanished after insert: {}", user.id))
        })
    }

    /// Name of the first unique field (`username`, `email`, `contact`) already
    /// held by a different user.
    pub fn find_user_conflict(
        &self,
        username: Option<&str>,
        email: Option<&str>,
        contact: Option<&str>,
        exclude_id: Option<&str>,
    ) -> Result<Option<&'static str>> {
        self.with_conn(|conn| {
            let checks = [("username", username), ("email", email), ("contact", contact)];
            for (column, value) in checks {
                let Some(value) = value else { continue };
                let sql = format!(
                    "SELECT 1 FROM users WHERE {column} = ?1 AND id != COALESCE(?2, '')"
                );
                let taken = conn
                    .query_row(&sql, params![value, exclude_id], |_| Ok(()))
                    .optional()?
                    .is_some();
                if taken {
                    return Ok(Some(column));
                }
            }
            Ok(None)
        })
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "email", email))
    }

    pub fn get_user_by_contact(&self, contact: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "contact", contact))
    }

    pub fn get_users_by_ids(&self, ids: &[String]) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| query_users_by_ids(conn, ids))
    }

    /// Everyone except `user_id`, optionally filtered by a case-insensitive
    /// match on username, name or email.
    pub fn list_users_except(&self, user_id: &str, search: Option<&str>) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            let pattern = search
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| format!("%{}%", s.to_lowercase()));
            let sql = format!(
                "SELECT {USER_COLUMNS} FROM users
                 WHERE id != ?1
                   AND (?2 IS NULL OR lower(username) LIKE ?2 OR lower(name) LIKE ?2 OR lower(email) LIKE ?2)
                 ORDER BY username"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![user_id, pattern], map_user)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- OTP --

    pub fn set_otp(
        &self,
        user_id: &str,
        purpose: OtpPurpose,
        hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let (otp_col, expiry_col) = purpose.columns();
        self.with_conn(|conn| {
            let sql = format!(
                "UPDATE users SET {otp_col} = ?2, {expiry_col} = ?3, updated_at = ?4 WHERE id = ?1"
            );
            conn.execute(&sql, params![user_id, hash, expires_at, Utc::now()])?;
            Ok(())
        })
    }

    /// Clear the stored OTP and, for email/phone, set the verified flag.
    pub fn complete_otp(&self, user_id: &str, purpose: OtpPurpose) -> Result<()> {
        let (otp_col, expiry_col) = purpose.columns();
        let verified = purpose
            .verified_flag()
            .map(|flag| format!(", {flag} = 1"))
            .unwrap_or_default();
        self.with_conn(|conn| {
            let sql = format!(
                "UPDATE users SET {otp_col} = NULL, {expiry_col} = NULL{verified}, updated_at = ?2 WHERE id = ?1"
            );
            conn.execute(&sql, params![user_id, Utc::now()])?;
            Ok(())
        })
    }

    pub fn record_otp_request(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO otp_requests (user_id, requested_at) VALUES (?1, ?2)",
                params![user_id, at],
            )?;
            Ok(())
        })
    }

    pub fn count_otp_requests_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<u32> {
        self.with_conn(|conn| count_otp_requests(conn, user_id, since))
    }

    /// Log `n` OTP sends at `now` unless that would take the user past `max`
    /// sends after `since`. Count and insert share one transaction.
    pub fn try_record_otp_requests(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        since: DateTime<Utc>,
        max: u32,
        n: u32,
    ) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if count_otp_requests(&tx, user_id, since)? + n > max {
                return Ok(false);
            }
            for _ in 0..n {
                tx.execute(
                    "INSERT INTO otp_requests (user_id, requested_at) VALUES (?1, ?2)",
                    params![user_id, now],
                )?;
            }
            tx.commit()?;
            Ok(true)
        })
    }

    pub fn prune_otp_requests(&self, before: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM otp_requests WHERE requested_at <= ?1",
                params![before],
            )?;
            Ok(n)
        })
    }

    /// Drop OTP hashes whose expiry has passed. Returns affected users.
    pub fn clear_expired_otps(&self, now: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            let mut total = 0;
            for purpose in [OtpPurpose::Email, OtpPurpose::Phone, OtpPurpose::PasswordReset] {
                let (otp_col, expiry_col) = purpose.columns();
                let sql = format!(
                    "UPDATE users SET {otp_col} = NULL, {expiry_col} = NULL
                     WHERE {expiry_col} IS NOT NULL AND {expiry_col} <= ?1"
                );
                total += conn.execute(&sql, params![now])?;
            }
            Ok(total)
        })
    }

    // -- Credentials --

    pub fn set_refresh_token(&self, user_id: &str, token: Option<&str>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET refresh_token = ?2 WHERE id = ?1",
                params![user_id, token],
            )?;
            Ok(())
        })
    }

    /// Replace the password hash. Revokes the refresh token and any pending
    /// reset OTP.
    pub fn update_password(&self, user_id: &str, password_hash: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET password = ?2, refresh_token = NULL,
                     password_reset_otp = NULL, password_reset_otp_expiry = NULL, updated_at = ?3
                 WHERE id = ?1",
                params![user_id, password_hash, Utc::now()],
            )?;
            Ok(())
        })
    }

    /// Count a failed login. Once `max_attempts` is reached the account is
    /// locked until `lock_until` and the counter starts over.
    /// Returns true when this failure triggered the lock.
    pub fn record_failed_login(
        &self,
        user_id: &str,
        max_attempts: u32,
        lock_until: DateTime<Utc>,
    ) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let attempts: i64 = tx.query_row(
                "UPDATE users SET login_attempts = login_attempts + 1 WHERE id = ?1
                 RETURNING login_attempts",
                [user_id],
                |row| row.get(0),
            )?;
            let locked = attempts as u32 >= max_attempts;
            if locked {
                tx.execute(
                    "UPDATE users SET login_attempts = 0, lock_until = ?2 WHERE id = ?1",
                    params![user_id, lock_until],
                )?;
            }
            tx.commit()?;
            Ok(locked)
        })
    }

    /// Successful login: reset the failure counter and stamp `last_login`.
    pub fn record_login(&self, user_id: &str, refresh_token: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET login_attempts = 0, lock_until = NULL, last_login = ?2, refresh_token = ?3
                 WHERE id = ?1",
                params![user_id, Utc::now(), refresh_token],
            )?;
            Ok(())
        })
    }

    // -- Profile --

    pub fn update_avatar(&self, user_id: &str, url: &str, key: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET avatar_url = ?2, avatar_key = ?3, updated_at = ?4 WHERE id = ?1",
                params![user_id, url, key, Utc::now()],
            )?;
            Ok(())
        })
    }

    pub fn update_profile(&self, user_id: &str, changes: &ProfileChanges) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET
                     name = COALESCE(?2, name),
                     username = COALESCE(?3, username),
                     email = COALESCE(?4, email),
                     is_email_verified = CASE WHEN ?4 IS NULL THEN is_email_verified ELSE 0 END,
                     contact = COALESCE(?5, contact),
                     is_contact_verified = CASE WHEN ?5 IS NULL THEN is_contact_verified ELSE 0 END,
                     updated_at = ?6
                 WHERE id = ?1",
                params![
                    user_id,
                    changes.name,
                    changes.username,
                    changes.email,
                    changes.contact,
                    Utc::now()
                ],
            )?;
            Ok(())
        })
    }

    /// Add the chat to favorites, or remove it if already there.
    /// Returns true when added.
    pub fn toggle_favorite(&self, user_id: &str, chat_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM user_favorites WHERE user_id = ?1 AND chat_id = ?2",
                params![user_id, chat_id],
            )?;
            if removed == 0 {
                conn.execute(
                    "INSERT INTO user_favorites (user_id, chat_id) VALUES (?1, ?2)",
                    params![user_id, chat_id],
                )?;
            }
            Ok(removed == 0)
        })
    }

    pub fn list_favorites(&self, user_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            query_strings(
                conn,
                "SELECT chat_id FROM user_favorites WHERE user_id = ?1 ORDER BY rowid",
                user_id,
            )
        })
    }

    pub fn toggle_block(&self, user_id: &str, blocked_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM user_blocked WHERE user_id = ?1 AND blocked_id = ?2",
                params![user_id, blocked_id],
            )?;
            if removed == 0 {
                conn.execute(
                    "INSERT INTO user_blocked (user_id, blocked_id) VALUES (?1, ?2)",
                    params![user_id, blocked_id],
                )?;
            }
            Ok(removed == 0)
        })
    }

    pub fn list_blocked(&self, user_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            query_strings(
                conn,
                "SELECT blocked_id FROM user_blocked WHERE user_id = ?1 ORDER BY rowid",
                user_id,
            )
        })
    }
}

pub(crate) fn map_user(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        contact: row.get(3)?,
        name: row.get(4)?,
        password: row.get(5)?,
        date_of_birth: row.get(6)?,
        login_type: row.get(7)?,
        is_email_verified: row.get(8)?,
        is_contact_verified: row.get(9)?,
        avatar_url: row.get(10)?,
        avatar_key: row.get(11)?,
        refresh_token: row.get(12)?,
        email_otp: row.get(13)?,
        email_otp_expiry: row.get(14)?,
        phone_otp: row.get(15)?,
        phone_otp_expiry: row.get(16)?,
        password_reset_otp: row.get(17)?,
        password_reset_otp_expiry: row.get(18)?,
        login_attempts: row.get::<_, i64>(19)? as u32,
        lock_until: row.get(20)?,
        last_login: row.get(21)?,
        created_at: row.get(22)?,
        updated_at: row.get(23)?,
    })
}

fn count_otp_requests(conn: &Connection, user_id: &str, since: DateTime<Utc>) -> Result<u32> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM otp_requests WHERE user_id = ?1 AND requested_at > ?2",
        params![user_id, since],
        |row| row.get(0),
    )?;
    Ok(count as u32)
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE {column} = ?1");
    let mut stmt = conn.prepare(&sql)?;
    let row = stmt.query_row([value], map_user).optional()?;
    Ok(row)
}

pub(crate) fn query_users_by_ids(conn: &Connection, ids: &[String]) -> Result<Vec<UserRow>> {
    if ids.is_empty() {
        return Ok(vec![]);
    }
    let sql = format!(
        "SELECT {USER_COLUMNS} FROM users WHERE id IN ({})",
        placeholders(ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(as_params(ids).as_slice(), map_user)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn query_strings(conn: &Connection, sql: &str, key: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([key], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(rows)
}
