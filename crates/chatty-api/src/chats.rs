use axum::{
    Extension, Json,
    body::Bytes,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use axum_extra::extract::WithRejection;
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use chatty_db::models::ChatRow;
use chatty_gateway::dispatcher::chat_room;
use chatty_types::api::{
    CreateGroupChatRequest, LeaveGroupChatRequest, MarkReadResponse, RenameGroupChatRequest,
};
use chatty_types::events::ChatEvent;
use chatty_types::models::{Chat, PublicUser};

use crate::error::ApiError;
use crate::middleware::AuthUser;
use crate::response::{ApiJson, created, ok, optional_json};
use crate::state::{AppState, AppStateInner};

const ONE_ON_ONE_NAME: &str = "One on one chat";

#[derive(Debug, Deserialize)]
pub struct UserSearchQuery {
    pub search: Option<String>,
}

// -- Helpers --

async fn find_chat(state: &AppStateInner, chat_id: &str) -> Result<Option<ChatRow>, ApiError> {
    let id = chat_id.to_string();
    state.run_db(move |db| db.get_chat(&id)).await
}

/// Group chat or 404 with `missing` as the message.
async fn find_group(state: &AppStateInner, chat_id: &str, missing: &str) -> Result<ChatRow, ApiError> {
    find_chat(state, chat_id)
        .await?
        .filter(|c| c.is_group)
        .ok_or_else(|| ApiError::not_found(missing))
}

async fn participants_of(state: &AppStateInner, chat_id: &str) -> Result<Vec<String>, ApiError> {
    let id = chat_id.to_string();
    state.run_db(move |db| db.participant_ids(&id)).await
}

async fn chat_for(state: &AppStateInner, chat_id: &str, viewer_id: &str) -> Result<Chat, ApiError> {
    let (id, viewer) = (chat_id.to_string(), viewer_id.to_string());
    state
        .run_db(move |db| db.load_chat(&id, &viewer))
        .await?
        .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("chat {} vanished", chat_id)))
}

/// Send each recipient the chat as they see it (their own unread count).
async fn notify_each(
    state: &AppStateInner,
    chat_id: &str,
    recipients: Vec<String>,
    event: fn(Chat) -> ChatEvent,
) -> Result<(), ApiError> {
    let id = chat_id.to_string();
    let views = state
        .run_db(move |db| {
            let mut views = Vec::with_capacity(recipients.len());
            for user_id in recipients {
                if let Some(chat) = db.load_chat(&id, &user_id)? {
                    views.push((user_id, chat));
                }
            }
            Ok(views)
        })
        .await?;
    for (user_id, chat) in views {
        state.dispatcher.emit_to_user(&user_id, event(chat)).await;
    }
    Ok(())
}

/// Same payload to every recipient; used once the chat no longer exists.
async fn notify_all(state: &AppStateInner, recipients: &[String], event: ChatEvent) {
    for user_id in recipients {
        state.dispatcher.emit_to_user(user_id, event.clone()).await;
    }
}

fn require_admin(chat: &ChatRow, user_id: &str, message: &str) -> Result<(), ApiError> {
    if chat.admin_id.as_deref() != Some(user_id) {
        return Err(ApiError::forbidden(message));
    }
    Ok(())
}

// -- Handlers --

pub async fn get_all_chats(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
) -> Result<impl IntoResponse, ApiError> {
    let uid = caller.id.clone();
    let chats = state.run_db(move |db| db.chats_for_user(&uid)).await?;
    Ok(ok(chats, "User chats fetched successfully!"))
}

pub async fn search_available_users(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Query(query): Query<UserSearchQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let uid = caller.id.clone();
    let users: Vec<PublicUser> = state
        .run_db(move |db| db.list_users_except(&uid, query.search.as_deref()))
        .await?
        .iter()
        .map(|u| u.to_public())
        .collect();
    Ok(ok(users, "Users fetched successfully"))
}

pub async fn create_or_get_one_on_one_chat(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Path(receiver_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let rid = receiver_id.clone();
    let receiver = state.run_db(move |db| db.get_user_by_id(&rid)).await?;
    if receiver.is_none() {
        return Err(ApiError::not_found("Receiver doesn't exist"));
    }
    if receiver_id == caller.id {
        return Err(ApiError::bad_request("You cannot chat with yourself"));
    }

    let (a, b) = (caller.id.clone(), receiver_id.clone());
    if let Some(existing) = state.run_db(move |db| db.find_one_on_one(&a, &b)).await? {
        let chat = chat_for(&state, &existing.id, &caller.id).await?;
        return Ok(ok(chat, "Chat retrieved successfully"));
    }

    let chat_id = Uuid::new_v4().to_string();
    let members = vec![caller.id.clone(), receiver_id.clone()];
    let id = chat_id.clone();
    state
        .run_db(move |db| db.create_chat(&id, ONE_ON_ONE_NAME, false, None, &members))
        .await?;
    info!("{} started chat {} with {}", caller.id, chat_id, receiver_id);

    notify_each(&state, &chat_id, vec![receiver_id], ChatEvent::NewChat).await?;
    let chat = chat_for(&state, &chat_id, &caller.id).await?;
    Ok(created(chat, "Chat created successfully"))
}

pub async fn create_group_chat(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    WithRejection(Json(req), _): ApiJson<CreateGroupChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = req.name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::bad_request("Group name is required"));
    }
    if req.participants.contains(&caller.id) {
        return Err(ApiError::bad_request(
            "Participants array should not contain the group creator",
        ));
    }

    let mut members: Vec<String> = Vec::with_capacity(req.participants.len() + 1);
    for id in req.participants.into_iter().chain(std::iter::once(caller.id.clone())) {
        if !members.contains(&id) {
            members.push(id);
        }
    }
    if members.len() < 3 {
        return Err(ApiError::bad_request(
            "Seems like you have passed duplicate participants.",
        ));
    }

    let ids = members.clone();
    let found = state.run_db(move |db| db.get_users_by_ids(&ids)).await?;
    if found.len() != members.len() {
        return Err(ApiError::not_found("Participant does not exist"));
    }

    // Creator first, then the invited users in the order given.
    members.rotate_right(1);
    let chat_id = Uuid::new_v4().to_string();
    let (id, admin, group_members) = (chat_id.clone(), caller.id.clone(), members.clone());
    state
        .run_db(move |db| db.create_chat(&id, &name, true, Some(&admin), &group_members))
        .await?;
    info!("{} created group chat {}", caller.id, chat_id);

    let others: Vec<String> = members.into_iter().filter(|m| *m != caller.id).collect();
    notify_each(&state, &chat_id, others, ChatEvent::NewChat).await?;
    let chat = chat_for(&state, &chat_id, &caller.id).await?;
    Ok(created(chat, "Group chat created successfully"))
}

pub async fn get_group_chat_details(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Path(chat_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    find_group(&state, &chat_id, "Group chat doesn't exist").await?;
    let members = participants_of(&state, &chat_id).await?;
    if !members.contains(&caller.id) {
        return Err(ApiError::forbidden("You are not a participant of this group chat"));
    }
    let chat = chat_for(&state, &chat_id, &caller.id).await?;
    Ok(ok(chat, "Group chat fetched successfully"))
}

pub async fn rename_group_chat(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Path(chat_id): Path<String>,
    WithRejection(Json(req), _): ApiJson<RenameGroupChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = req.name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::bad_request("Group name is required"));
    }
    let group = find_group(&state, &chat_id, "Requested group doesn't exist").await?;
    require_admin(&group, &caller.id, "You are not an admin")?;

    let id = chat_id.clone();
    state.run_db(move |db| db.rename_chat(&id, &name)).await?;

    let members = participants_of(&state, &chat_id).await?;
    notify_each(&state, &chat_id, members, ChatEvent::UpdateGroupName).await?;
    let chat = chat_for(&state, &chat_id, &caller.id).await?;
    Ok(ok(chat, "Group name updated successfully"))
}

pub async fn delete_group_chat(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Path(chat_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let group = find_group(&state, &chat_id, "Group chat does not exist").await?;
    require_admin(&group, &caller.id, "Only admin can delete the group")?;

    let snapshot = chat_for(&state, &chat_id, &caller.id).await?;
    let members = participants_of(&state, &chat_id).await?;
    let id = chat_id.clone();
    let keys = state.run_db(move |db| db.delete_chat(&id)).await?;
    state.storage.delete_all(&keys).await;
    state.dispatcher.close_room(&chat_room(&chat_id)).await;
    info!("{} deleted group chat {}", caller.id, chat_id);

    notify_all(&state, &members, ChatEvent::LeaveChat(snapshot)).await;
    Ok(ok(json!({}), "Group chat deleted successfully"))
}

pub async fn delete_one_on_one_chat(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Path(chat_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    // Groups go through leave or delete-group, never this route.
    let chat = find_chat(&state, &chat_id).await?.filter(|c| !c.is_group);
    let members = participants_of(&state, &chat_id).await?;
    if chat.is_none() || !members.contains(&caller.id) {
        return Err(ApiError::not_found("Chat doesn't exist"));
    }

    let snapshot = chat_for(&state, &chat_id, &caller.id).await?;
    let id = chat_id.clone();
    let keys = state.run_db(move |db| db.delete_chat(&id)).await?;
    state.storage.delete_all(&keys).await;
    state.dispatcher.close_room(&chat_room(&chat_id)).await;
    info!("{} deleted chat {}", caller.id, chat_id);

    let others: Vec<String> = members.into_iter().filter(|m| *m != caller.id).collect();
    notify_all(&state, &others, ChatEvent::LeaveChat(snapshot)).await;
    Ok(ok(json!({}), "Chat deleted successfully"))
}

pub async fn leave_group_chat(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Path(chat_id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let req: LeaveGroupChatRequest = optional_json(&body)?;
    let group = find_group(&state, &chat_id, "Group chat does not exist.").await?;
    let members = participants_of(&state, &chat_id).await?;
    if !members.contains(&caller.id) {
        return Err(ApiError::bad_request("You are not a member of this group chat."));
    }

    let new_admin = if group.admin_id.as_deref() == Some(caller.id.as_str()) {
        let Some(new_admin) = req.new_admin_id.filter(|id| !id.is_empty()) else {
            return Err(ApiError::bad_request("New admin ID is required if admin leaves."));
        };
        if !members.contains(&new_admin) {
            return Err(ApiError::bad_request(
                "New admin must be an existing group participant.",
            ));
        }
        if new_admin == caller.id {
            return Err(ApiError::bad_request(
                "You cannot assign yourself as admin after leaving.",
            ));
        }
        Some(new_admin)
    } else {
        None
    };

    let (id, uid) = (chat_id.clone(), caller.id.clone());
    state
        .run_db(move |db| {
            if let Some(admin) = &new_admin {
                db.set_admin(&id, admin)?;
            }
            db.remove_participant(&id, &uid)?;
            Ok(())
        })
        .await?;
    state
        .dispatcher
        .leave_user(&caller.id, &chat_room(&chat_id))
        .await;
    info!("{} left group chat {}", caller.id, chat_id);

    let remaining = participants_of(&state, &chat_id).await?;
    notify_each(&state, &chat_id, remaining, ChatEvent::LeaveChat).await?;
    let chat = chat_for(&state, &chat_id, &caller.id).await?;
    Ok(ok(chat, "Left the group chat successfully"))
}

pub async fn add_participant(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Path((chat_id, participant_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let group = find_group(&state, &chat_id, "Group chat does not exist.").await?;
    require_admin(&group, &caller.id, "You are not an admin.")?;

    let pid = participant_id.clone();
    if state.run_db(move |db| db.get_user_by_id(&pid)).await?.is_none() {
        return Err(ApiError::not_found("User does not exist"));
    }
    let members = participants_of(&state, &chat_id).await?;
    if members.contains(&participant_id) {
        return Err(ApiError::conflict("Participant already in the group chat"));
    }

    let (id, pid) = (chat_id.clone(), participant_id.clone());
    state.run_db(move |db| db.add_participant(&id, &pid)).await?;
    info!("{} added {} to group chat {}", caller.id, participant_id, chat_id);

    notify_each(&state, &chat_id, vec![participant_id], ChatEvent::NewChat).await?;
    let others: Vec<String> = members.into_iter().filter(|m| *m != caller.id).collect();
    notify_each(&state, &chat_id, others, ChatEvent::NewChat).await?;

    let chat = chat_for(&state, &chat_id, &caller.id).await?;
    Ok(ok(chat, "Participant added successfully"))
}

pub async fn remove_participant(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Path((chat_id, participant_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let group = find_group(&state, &chat_id, "Group chat does not exist").await?;
    require_admin(&group, &caller.id, "You are not an admin")?;

    let members = participants_of(&state, &chat_id).await?;
    if !members.contains(&participant_id) {
        return Err(ApiError::bad_request(
            "Participant does not exist in the group chat.",
        ));
    }
    if group.admin_id.as_deref() == Some(participant_id.as_str()) {
        return Err(ApiError::bad_request(
            "The admin cannot be removed. Leave the group and hand over admin instead.",
        ));
    }

    let (id, pid) = (chat_id.clone(), participant_id.clone());
    state.run_db(move |db| db.remove_participant(&id, &pid)).await?;
    state
        .dispatcher
        .leave_user(&participant_id, &chat_room(&chat_id))
        .await;
    info!("{} removed {} from group chat {}", caller.id, participant_id, chat_id);

    let mut recipients = vec![participant_id.clone()];
    recipients.extend(
        members
            .into_iter()
            .filter(|m| *m != caller.id && *m != participant_id),
    );
    notify_each(&state, &chat_id, recipients, ChatEvent::LeaveChat).await?;

    let chat = chat_for(&state, &chat_id, &caller.id).await?;
    Ok(ok(chat, "User removed successfully"))
}

pub async fn mark_chat_read(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Path(chat_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if find_chat(&state, &chat_id).await?.is_none() {
        return Err(ApiError::not_found("Chat does not exist"));
    }
    let members = participants_of(&state, &chat_id).await?;
    if !members.contains(&caller.id) {
        return Err(ApiError::bad_request("User is not a part of this chat."));
    }

    let (id, uid) = (chat_id.clone(), caller.id.clone());
    let updated = state.run_db(move |db| db.mark_chat_read(&id, &uid)).await?;
    Ok(ok(MarkReadResponse { updated }, "Messages marked as read"))
}
