//! Database row types. These map directly to SQLite rows and stay
//! independent of the chatty-types API models; the `to_*` helpers do the
//! conversion once related rows have been fetched.

use chatty_types::models::{
    Attachment, AttachmentKind, Avatar, ChatMessage, MessageStatus, PublicUser, UserProfile,
};
use chrono::{DateTime, NaiveDate, Utc};

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: String,
    pub username: String,
    pub email: String,
    pub contact: String,
    pub name: String,
    pub password: String,
    pub date_of_birth: Option<NaiveDate>,
    pub login_type: String,
    pub is_email_verified: bool,
    pub is_contact_verified: bool,
    pub avatar_url: Option<String>,
    pub avatar_key: Option<String>,
    pub refresh_token: Option<String>,
    pub email_otp: Option<String>,
    pub email_otp_expiry: Option<DateTime<Utc>>,
    pub phone_otp: Option<String>,
    pub phone_otp_expiry: Option<DateTime<Utc>>,
    pub password_reset_otp: Option<String>,
    pub password_reset_otp_expiry: Option<DateTime<Utc>>,
    pub login_attempts: u32,
    pub lock_until: Option<DateTime<Utc>>,
    pub last_login: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserRow {
    pub fn avatar(&self) -> Option<Avatar> {
        match (&self.avatar_url, &self.avatar_key) {
            (Some(url), Some(key)) => Some(Avatar {
                url: url.clone(),
                key: key.clone(),
            }),
            _ => None,
        }
    }

    pub fn to_public(&self) -> PublicUser {
        PublicUser {
            id: self.id.clone(),
            username: self.username.clone(),
            name: self.name.clone(),
            email: self.email.clone(),
            contact: self.contact.clone(),
            avatar: self.avatar(),
        }
    }

    /// Sanitized self view: no password, refresh token or OTP state.
    pub fn to_profile(&self, favorites: Vec<String>, blocked_users: Vec<String>) -> UserProfile {
        UserProfile {
            id: self.id.clone(),
            username: self.username.clone(),
            name: self.name.clone(),
            email: self.email.clone(),
            contact: self.contact.clone(),
            avatar: self.avatar(),
            date_of_birth: self.date_of_birth,
            login_type: self.login_type.clone(),
            is_email_verified: self.is_email_verified,
            is_contact_verified: self.is_contact_verified,
            last_login: self.last_login,
            favorites,
            blocked_users,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.lock_until.is_some_and(|until| until > now)
    }
}

#[derive(Debug, Clone)]
pub struct ChatRow {
    pub id: String,
    pub name: String,
    pub is_group: bool,
    pub admin_id: Option<String>,
    pub last_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    pub status: String,
    pub reply_to: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AttachmentRow {
    pub message_id: String,
    pub position: u32,
    pub kind: String,
    pub url: String,
    pub storage_key: String,
    pub original_name: Option<String>,
    pub mime_type: String,
    pub size: u64,
}

impl AttachmentRow {
    pub fn to_attachment(&self) -> Attachment {
        Attachment {
            kind: AttachmentKind::parse(&self.kind),
            url: self.url.clone(),
            key: self.storage_key.clone(),
            original_name: self.original_name.clone(),
            mime_type: self.mime_type.clone(),
            size: self.size,
        }
    }
}

/// Attachment metadata handed to `insert_message`.
#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub kind: AttachmentKind,
    pub url: String,
    pub storage_key: String,
    pub original_name: Option<String>,
    pub mime_type: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct ReceiptRow {
    pub message_id: String,
    pub user_id: String,
    pub kind: String,
}

impl MessageRow {
    /// Assemble the API model from the row and the already-fetched relations.
    pub fn to_message(
        &self,
        sender: Option<PublicUser>,
        attachments: &[AttachmentRow],
        receipts: &[ReceiptRow],
    ) -> ChatMessage {
        let mut attachments: Vec<&AttachmentRow> = attachments
            .iter()
            .filter(|a| a.message_id == self.id)
            .collect();
        attachments.sort_by_key(|a| a.position);

        let by_kind = |kind: &str| -> Vec<String> {
            receipts
                .iter()
                .filter(|r| r.message_id == self.id && r.kind == kind)
                .map(|r| r.user_id.clone())
                .collect()
        };

        ChatMessage {
            id: self.id.clone(),
            chat: self.chat_id.clone(),
            sender,
            content: self.content.clone(),
            attachments: attachments.into_iter().map(AttachmentRow::to_attachment).collect(),
            status: MessageStatus::parse(&self.status),
            delivered_to: by_kind("delivered"),
            read_by: by_kind("read"),
            reply_to: self.reply_to.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}
