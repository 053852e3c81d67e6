use axum::{
    Extension,
    extract::{Multipart, Path, Query, State},
    response::IntoResponse,
};
use axum_extra::extract::WithRejection;
use bytes::Bytes;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use chatty_db::models::NewAttachment;
use chatty_types::events::ChatEvent;
use chatty_types::models::{AttachmentKind, ChatMessage};

use crate::error::ApiError;
use crate::middleware::AuthUser;
use crate::response::{created, ok};
use crate::state::{AppState, AppStateInner};
use crate::storage::Storage;

pub const MAX_ATTACHMENTS: usize = 5;
/// 16 MB per attachment
pub const MAX_ATTACHMENT_SIZE: usize = 16 * 1024 * 1024;

const DEFAULT_PAGE: u32 = 50;
const MAX_PAGE: u32 = 200;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    pub limit: Option<u32>,
    /// Id of the oldest message from the previous page.
    pub before: Option<String>,
}

struct Upload {
    file_name: Option<String>,
    mime_type: String,
    data: Bytes,
}

/// Participants of `chat_id`, or None when the chat does not exist.
async fn chat_members(state: &AppStateInner, chat_id: &str) -> Result<Option<Vec<String>>, ApiError> {
    let id = chat_id.to_string();
    state
        .run_db(move |db| {
            if db.get_chat(&id)?.is_none() {
                return Ok(None);
            }
            Ok(Some(db.participant_ids(&id)?))
        })
        .await
}

async fn notify_others(state: &AppStateInner, members: &[String], sender_id: &str, event: ChatEvent) {
    for user_id in members.iter().filter(|m| *m != sender_id) {
        state.dispatcher.emit_to_user(user_id, event.clone()).await;
    }
}

pub async fn get_all_messages(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Path(chat_id): Path<String>,
    Query(query): Query<MessageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let members = chat_members(&state, &chat_id)
        .await?
        .ok_or_else(|| ApiError::not_found("chat not found"))?;
    if !members.contains(&caller.id) {
        return Err(ApiError::bad_request("User is not a part of this chat."));
    }

    let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let before = query.before.filter(|b| !b.is_empty());
    if let Some(cursor) = before.clone() {
        let cursor_row = state.run_db(move |db| db.get_message_row(&cursor)).await?;
        if cursor_row.is_none_or(|row| row.chat_id != chat_id) {
            return Err(ApiError::bad_request("Invalid cursor"));
        }
    }

    let (id, uid) = (chat_id.clone(), caller.id.clone());
    let messages = state
        .run_db(move |db| {
            let page = db.messages_for_chat(&id, limit, before.as_deref())?;
            let ids: Vec<String> = page.iter().map(|m| m.id.clone()).collect();
            if db.mark_delivered(&uid, &ids)? == 0 {
                return Ok(page);
            }
            // Statuses may have moved to delivered; reload the page.
            db.messages_for_chat(&id, limit, before.as_deref())
        })
        .await?;

    Ok(ok(messages, "Message fetched successfully"))
}

/// POST multipart: `content`, up to five `attachments`, optional `replyTo`.
pub async fn send_message(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Path(chat_id): Path<String>,
    WithRejection(mut multipart, _): WithRejection<Multipart, ApiError>,
) -> Result<impl IntoResponse, ApiError> {
    let mut content = String::new();
    let mut reply_to: Option<String> = None;
    let mut uploads: Vec<Upload> = Vec::new();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "content" => {
                content = field.text().await?;
            }
            "replyTo" => {
                let value = field.text().await?;
                reply_to = Some(value.trim().to_string()).filter(|v| !v.is_empty());
            }
            "attachments" => {
                if uploads.len() == MAX_ATTACHMENTS {
                    return Err(ApiError::bad_request(format!(
                        "At most {MAX_ATTACHMENTS} attachments per message"
                    )));
                }
                let mime_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let file_name = field.file_name().map(str::to_string);
                let data = field.bytes().await?;
                if data.len() > MAX_ATTACHMENT_SIZE {
                    return Err(ApiError::PayloadTooLarge(
                        "Each attachment must be at most 16 MB".into(),
                    ));
                }
                if !data.is_empty() {
                    uploads.push(Upload {
                        file_name,
                        mime_type,
                        data,
                    });
                }
            }
            other => warn!("Ignoring unexpected multipart field {:?}", other),
        }
    }

    let content = content.trim().to_string();
    if content.is_empty() && uploads.is_empty() {
        return Err(ApiError::bad_request("Message or Attachments is required."));
    }

    let members = chat_members(&state, &chat_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Chat doesn't exist."))?;
    if !members.contains(&caller.id) {
        return Err(ApiError::bad_request("User is not a part of this chat."));
    }

    if let Some(target) = reply_to.clone() {
        let target_row = state.run_db(move |db| db.get_message_row(&target)).await?;
        if target_row.is_none_or(|row| row.chat_id != chat_id) {
            return Err(ApiError::bad_request("Replied message does not belong to this chat"));
        }
    }

    let prefix = format!("chat-attachments/{}", chat_id);
    let mut attachments = Vec::with_capacity(uploads.len());
    for upload in uploads {
        let key = Storage::new_key(&prefix, upload.file_name.as_deref());
        let url = match state.storage.save(&key, &upload.data).await {
            Ok(url) => url,
            Err(e) => {
                let saved: Vec<String> = attachments.iter().map(|a: &NewAttachment| a.storage_key.clone()).collect();
                state.storage.delete_all(&saved).await;
                return Err(e.into());
            }
        };
        attachments.push(NewAttachment {
            kind: AttachmentKind::from_mime(&upload.mime_type),
            url,
            storage_key: key,
            original_name: upload.file_name,
            size: upload.data.len() as u64,
            mime_type: upload.mime_type,
        });
    }

    let message_id = Uuid::new_v4().to_string();
    let keys: Vec<String> = attachments.iter().map(|a| a.storage_key.clone()).collect();
    let (mid, cid, uid) = (message_id.clone(), chat_id.clone(), caller.id.clone());
    let inserted = state
        .run_db(move |db| {
            db.insert_message(&mid, &cid, &uid, &content, reply_to.as_deref(), &attachments)?;
            db.load_message(&mid)
        })
        .await;
    let message: ChatMessage = match inserted {
        Ok(Some(message)) => message,
        Ok(None) => {
            state.storage.delete_all(&keys).await;
            return Err(ApiError::Internal(anyhow::anyhow!("message {} vanished", message_id)));
        }
        Err(e) => {
            state.storage.delete_all(&keys).await;
            return Err(e);
        }
    };
    info!(
        "{} sent message {} to chat {} ({} attachments)",
        caller.id,
        message.id,
        chat_id,
        message.attachments.len()
    );

    notify_others(&state, &members, &caller.id, ChatEvent::MessageReceived(message.clone())).await;
    Ok(created(message, "Message saved successfully"))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Path((chat_id, message_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let members = chat_members(&state, &chat_id)
        .await?
        .filter(|m| m.contains(&caller.id))
        .ok_or_else(|| ApiError::not_found("chat doesn't exist"))?;

    let mid = message_id.clone();
    let message = state
        .run_db(move |db| db.load_message(&mid))
        .await?
        .filter(|m| m.chat == chat_id)
        .ok_or_else(|| ApiError::not_found("Message not found"))?;
    if message.sender.as_ref().map(|s| s.id.as_str()) != Some(caller.id.as_str()) {
        return Err(ApiError::forbidden(
            "You are not authorised to delete the message, you are not the sender.",
        ));
    }

    let (cid, mid) = (chat_id.clone(), message_id.clone());
    let keys = state.run_db(move |db| db.delete_message(&cid, &mid)).await?;
    state.storage.delete_all(&keys).await;
    info!("{} deleted message {} in chat {}", caller.id, message_id, chat_id);

    notify_others(&state, &members, &caller.id, ChatEvent::MessageDeleted(message.clone())).await;
    Ok(ok(message, "Message deleted successfully."))
}
