use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{DecodingKey, Validation, decode};
use tracing::{debug, info, warn};

use chatty_db::Database;
use chatty_types::api::Claims;
use chatty_types::events::{ChatEvent, ClientCommand};

use crate::dispatcher::{ConnId, Dispatcher, chat_room};

/// Heartbeat interval: server sends a Ping every 25 seconds.
/// If 2 consecutive Pongs are missed the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

type Sink = SplitSink<WebSocket, Message>;

#[derive(Debug, Clone)]
struct SocketUser {
    id: String,
    username: String,
}

/// Handle one socket from upgrade to close. `token` is whatever the upgrade
/// request carried (cookie, `?token=` or bearer header); an unusable token
/// gets a `socketError` followed by a close frame.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    db: Arc<Database>,
    jwt_secret: String,
    token: Option<String>,
) {
    let (mut sender, receiver) = socket.split();

    let user = match authenticate(&db, &jwt_secret, token.as_deref()).await {
        Ok(user) => user,
        Err(reason) => {
            warn!("Socket handshake rejected: {}", reason);
            let _ = send_event(&mut sender, &ChatEvent::SocketError(reason.to_string())).await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    info!("{} ({}) connected to socket", user.username, user.id);

    let (conn_id, user_rx) = dispatcher.register(&user.id).await;
    if send_event(&mut sender, &ChatEvent::Connected).await.is_err() {
        dispatcher.unregister(conn_id).await;
        return;
    }

    run_connection_loop(sender, receiver, user_rx, &dispatcher, db, conn_id, &user).await;

    dispatcher.unregister(conn_id).await;
    info!("{} ({}) disconnected from socket", user.username, user.id);
}

async fn run_connection_loop(
    mut sender: Sink,
    mut receiver: SplitStream<WebSocket>,
    mut user_rx: tokio::sync::mpsc::UnboundedReceiver<ChatEvent>,
    dispatcher: &Dispatcher,
    db: Arc<Database>,
    conn_id: ConnId,
    user: &SocketUser,
) {
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received;

    // Forward room events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = user_rx.recv() => {
                    let Some(event) = event else { break };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let dispatcher_recv = dispatcher.clone();
    let user_recv = user.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&dispatcher_recv, &db, conn_id, &user_recv, cmd).await;
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            user_recv.username,
                            user_recv.id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

async fn handle_command(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    conn_id: ConnId,
    user: &SocketUser,
    cmd: ClientCommand,
) {
    match cmd {
        ClientCommand::JoinChat(chat_id) => {
            let db = db.clone();
            let user_id = user.id.clone();
            let lookup_id = chat_id.clone();
            let allowed = tokio::task::spawn_blocking(move || db.is_participant(&lookup_id, &user_id))
                .await
                .map_err(anyhow::Error::from)
                .and_then(|r| r);

            match allowed {
                Ok(true) => {
                    debug!("{} ({}) joined chat {}", user.username, user.id, chat_id);
                    dispatcher.join(conn_id, &chat_room(&chat_id)).await;
                }
                Ok(false) => {
                    reply_error(dispatcher, conn_id, user, "You are not a participant of this chat").await;
                }
                Err(e) => {
                    warn!("joinChat lookup failed for {}: {}", chat_id, e);
                    reply_error(dispatcher, conn_id, user, "Unable to join chat").await;
                }
            }
        }

        ClientCommand::Typing(chat_id) => {
            relay_typing(dispatcher, conn_id, user, &chat_id, ChatEvent::Typing(chat_id.clone())).await;
        }

        ClientCommand::StopTyping(chat_id) => {
            relay_typing(dispatcher, conn_id, user, &chat_id, ChatEvent::StopTyping(chat_id.clone()))
                .await;
        }
    }
}

/// Typing indicators only flow inside rooms the connection has joined.
async fn relay_typing(
    dispatcher: &Dispatcher,
    conn_id: ConnId,
    user: &SocketUser,
    chat_id: &str,
    event: ChatEvent,
) {
    let room = chat_room(chat_id);
    if !dispatcher.is_member(conn_id, &room).await {
        reply_error(dispatcher, conn_id, user, "Join the chat before sending typing events").await;
        return;
    }
    dispatcher.emit_except(&room, conn_id, event).await;
}

/// A socketError for this connection only, not the whole user room.
async fn reply_error(dispatcher: &Dispatcher, conn_id: ConnId, user: &SocketUser, reason: &str) {
    debug!("socketError to {} ({}): {}", user.username, user.id, reason);
    dispatcher
        .emit_to_conn(conn_id, ChatEvent::SocketError(reason.to_string()))
        .await;
}

async fn authenticate(
    db: &Arc<Database>,
    jwt_secret: &str,
    token: Option<&str>,
) -> Result<SocketUser, &'static str> {
    let token = token
        .filter(|t| !t.is_empty())
        .ok_or("Un-authorized handshake. Token is missing")?;

    let claims = decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| "Un-authorized handshake. Token is invalid")?
    .claims;

    let db = db.clone();
    let user_id = claims.sub.clone();
    let user = tokio::task::spawn_blocking(move || db.get_user_by_id(&user_id))
        .await
        .map_err(|_| "Something went wrong while connecting to the socket")?
        .map_err(|_| "Something went wrong while connecting to the socket")?
        .ok_or("Un-authorized handshake. Token is invalid")?;

    Ok(SocketUser {
        id: user.id,
        username: user.username,
    })
}

async fn send_event(sender: &mut Sink, event: &ChatEvent) -> Result<(), ()> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to serialize {} event: {}", event.name(), e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}
