use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, patch, post},
};
use tower_http::services::ServeDir;

use crate::middleware::require_auth;
use crate::state::AppState;
use crate::{auth, chats, messages, profile, socket};

/// Room for five full attachments plus the text fields.
const MESSAGE_BODY_LIMIT: usize = messages::MAX_ATTACHMENTS * messages::MAX_ATTACHMENT_SIZE + 1024 * 1024;
const PROFILE_BODY_LIMIT: usize = 4 * 1024 * 1024;

/// Every HTTP and WebSocket route. CORS and request tracing are layered on
/// by the binary.
pub fn build_router(state: AppState) -> Router {
    let auth_public = Router::new()
        .route("/register", post(auth::register))
        .route("/login", post(auth::login))
        .route("/refresh-token", post(auth::refresh_token))
        .route("/verify-email", post(auth::verify_email))
        .route("/verify-phone", post(auth::verify_phone))
        .route("/resend-email-otp", post(auth::resend_email_otp))
        .route("/resend-phone-otp", post(auth::resend_phone_otp))
        .route("/forgot-password", post(auth::forgot_password))
        .route("/reset-password", post(auth::reset_password));

    let auth_protected = Router::new()
        .route("/logout", post(auth::logout))
        .route("/change-password", post(auth::change_password))
        .route("/current-user", get(auth::current_user))
        .route("/avatar", patch(profile::update_avatar))
        .route("/profile", patch(profile::update_profile))
        .route("/favorites", post(profile::toggle_favorite))
        .route("/block", post(profile::toggle_block))
        .layer(DefaultBodyLimit::max(PROFILE_BODY_LIMIT))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let chat_routes = Router::new()
        .route("/", get(chats::get_all_chats))
        .route("/users", get(chats::search_available_users))
        .route("/c/{receiver_id}", post(chats::create_or_get_one_on_one_chat))
        .route("/group", post(chats::create_group_chat))
        .route(
            "/group/{chat_id}",
            get(chats::get_group_chat_details)
                .patch(chats::rename_group_chat)
                .delete(chats::delete_group_chat),
        )
        .route(
            "/group/{chat_id}/{participant_id}",
            post(chats::add_participant).delete(chats::remove_participant),
        )
        .route("/leave/group/{chat_id}", delete(chats::leave_group_chat))
        .route("/remove/{chat_id}", delete(chats::delete_one_on_one_chat))
        .route("/{chat_id}/read", post(chats::mark_chat_read))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let message_routes = Router::new()
        .route(
            "/{chat_id}",
            get(messages::get_all_messages).post(messages::send_message),
        )
        .route("/{chat_id}/{message_id}", delete(messages::delete_message))
        .layer(DefaultBodyLimit::max(MESSAGE_BODY_LIMIT))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let blobs = ServeDir::new(state.storage.dir());

    Router::new()
        .nest("/api/v1/auth", auth_public.merge(auth_protected))
        .nest("/api/v1/chatty/chats", chat_routes)
        .nest("/api/v1/chatty/messages", message_routes)
        .route("/socket", get(socket::ws_upgrade))
        .nest_service("/attachments", blobs)
        .with_state(state)
}
