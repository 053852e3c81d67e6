use axum::{
    Extension, Json,
    extract::{Multipart, State},
    response::IntoResponse,
};
use axum_extra::extract::WithRejection;
use tracing::{info, warn};

use chatty_db::queries::{OtpPurpose, ProfileChanges};
use chatty_types::api::{
    BlockedUsersResponse, FavoritesResponse, FieldError, ToggleBlockRequest,
    ToggleFavoriteRequest, UpdateProfileRequest,
};

use crate::auth::{load_profile, load_user, verify_password};
use crate::error::ApiError;
use crate::middleware::AuthUser;
use crate::otp;
use crate::response::{ApiJson, ok};
use crate::state::AppState;
use crate::storage::Storage;
use crate::validation::{
    check_email, check_name, check_username, normalize_contact, normalize_email,
    normalize_username,
};

/// 1 MB avatar limit
const MAX_AVATAR_SIZE: usize = 1024 * 1024;

/// PATCH /avatar: multipart field `avatar`, image/* only.
pub async fn update_avatar(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    WithRejection(mut multipart, _): WithRejection<Multipart, ApiError>,
) -> Result<impl IntoResponse, ApiError> {
    let mut upload = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("avatar") {
            continue;
        }
        let mime = field.content_type().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let data = field.bytes().await?;
        upload = Some((mime, file_name, data));
        break;
    }

    let Some((mime, file_name, data)) = upload else {
        return Err(ApiError::bad_request("Avatar image is required"));
    };
    if !mime.starts_with("image/") {
        return Err(ApiError::bad_request("Avatar must be an image"));
    }
    if data.is_empty() {
        return Err(ApiError::bad_request("Avatar image is required"));
    }
    if data.len() > MAX_AVATAR_SIZE {
        return Err(ApiError::PayloadTooLarge("Avatar must be at most 1 MB".into()));
    }

    let user = load_user(&state, &caller.id).await?;
    let key = Storage::new_key(&format!("avatars/{}", user.id), file_name.as_deref());
    let url = state.storage.save(&key, &data).await?;

    let uid = user.id.clone();
    let (new_url, new_key) = (url.clone(), key.clone());
    state
        .run_db(move |db| db.update_avatar(&uid, &new_url, &new_key))
        .await?;

    if let Some(old_key) = user.avatar_key.as_deref() {
        if let Err(e) = state.storage.delete(old_key).await {
            warn!("Failed to delete old avatar {}: {}", old_key, e);
        }
    }
    info!("{} ({}) updated avatar", user.username, user.id);

    let profile = load_profile(&state, &user.id).await?;
    Ok(ok(profile, "Avatar uploaded successfully"))
}

/// PATCH /profile. Changing username, email or contact needs the current
/// password; a new email or contact must be verified again.
pub async fn update_profile(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    WithRejection(Json(req), _): ApiJson<UpdateProfileRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = load_user(&state, &caller.id).await?;
    let mut errors = Vec::new();
    let mut push = |field: &str, result: Result<(), String>| {
        if let Err(message) = result {
            errors.push(FieldError {
                field: field.to_string(),
                message,
            });
        }
    };

    let name = req.name.map(|n| n.trim().to_string());
    if let Some(name) = &name {
        push("name", check_name(name));
    }
    let username = req
        .username
        .map(|u| normalize_username(&u))
        .filter(|u| *u != user.username);
    if let Some(username) = &username {
        push("username", check_username(username));
    }
    let email = req
        .email
        .map(|e| normalize_email(&e))
        .filter(|e| *e != user.email);
    if let Some(email) = &email {
        push("email", check_email(email));
    }
    let contact = match req.contact {
        Some(raw) => match normalize_contact(&raw) {
            Ok(c) if c == user.contact => None,
            Ok(c) => Some(c),
            Err(message) => {
                push("contact", Err(message));
                None
            }
        },
        None => None,
    };
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }

    if username.is_some() || email.is_some() || contact.is_some() {
        let password = req.current_password.unwrap_or_default();
        if password.is_empty() || !verify_password(&password, &user.password) {
            return Err(ApiError::unauthorized(
                "Current password is required to change username, email or contact",
            ));
        }

        let (u, e, c, uid) = (username.clone(), email.clone(), contact.clone(), user.id.clone());
        let conflict = state
            .run_db(move |db| db.find_user_conflict(u.as_deref(), e.as_deref(), c.as_deref(), Some(&uid)))
            .await?;
        if let Some(field) = conflict {
            return Err(ApiError::conflict(format!("This {field} is already in use")));
        }
    }

    let changes = ProfileChanges {
        name,
        username,
        email,
        contact,
    };
    let (email_changed, contact_changed) = (changes.email.is_some(), changes.contact.is_some());
    let sends = u32::from(email_changed) + u32::from(contact_changed);
    if sends > 0 {
        otp::reserve(&state, &user.id, sends).await?;
    }

    let uid = user.id.clone();
    state
        .run_db(move |db| db.update_profile(&uid, &changes))
        .await
        .map_err(|e| e.or_conflict("Username, email or contact is already in use"))?;

    // Re-read so OTP delivery goes to the new address. The change is saved
    // either way; a failed send is recovered with a resend.
    let updated = load_user(&state, &user.id).await?;
    if email_changed {
        if let Err(e) = otp::send(&state, &updated, OtpPurpose::Email).await {
            warn!("Email OTP after profile change failed for {}: {}", updated.id, e);
        }
    }
    if contact_changed {
        if let Err(e) = otp::send(&state, &updated, OtpPurpose::Phone).await {
            warn!("Phone OTP after profile change failed for {}: {}", updated.id, e);
        }
    }

    let profile = load_profile(&state, &user.id).await?;
    Ok(ok(profile, "Profile updated successfully"))
}

pub async fn toggle_favorite(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    WithRejection(Json(req), _): ApiJson<ToggleFavoriteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (uid, chat_id) = (caller.id.clone(), req.chat_id.clone());
    let favorites = state
        .run_db(move |db| {
            if db.get_chat(&chat_id)?.is_none() {
                return Ok(None);
            }
            db.toggle_favorite(&uid, &chat_id)?;
            Ok(Some(db.list_favorites(&uid)?))
        })
        .await?
        .ok_or_else(|| ApiError::not_found("Chat not found"))?;

    Ok(ok(FavoritesResponse { favorites }, "Favorites updated"))
}

pub async fn toggle_block(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    WithRejection(Json(req), _): ApiJson<ToggleBlockRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.user_id == caller.id {
        return Err(ApiError::bad_request("You cannot block yourself"));
    }
    let (uid, target) = (caller.id.clone(), req.user_id.clone());
    let blocked_users = state
        .run_db(move |db| {
            if db.get_user_by_id(&target)?.is_none() {
                return Ok(None);
            }
            db.toggle_block(&uid, &target)?;
            Ok(Some(db.list_blocked(&uid)?))
        })
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;

    Ok(ok(BlockedUsersResponse { blocked_users }, "Blocked users updated"))
}
