use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::HeaderMap,
    response::IntoResponse,
};
use serde::Deserialize;

use chatty_gateway::connection;

use crate::middleware::access_token;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct SocketQuery {
    pub token: Option<String>,
}

/// GET /socket. Browsers cannot set headers on a WebSocket handshake, so
/// the token may also come from the `accessToken` cookie or `?token=`.
/// Authentication happens after the upgrade so failures reach the client
/// as a `socketError` frame.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<SocketQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let token = access_token(&headers).or(query.token.filter(|t| !t.is_empty()));
    let dispatcher = state.dispatcher.clone();
    let db = state.db.clone();
    let secret = state.auth.access_secret.clone();
    ws.on_upgrade(move |socket| connection::handle_connection(socket, dispatcher, db, secret, token))
}
