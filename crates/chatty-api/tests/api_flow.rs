use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use chatty_api::notify::{EmailSender, SmsSender};
use chatty_api::routes::build_router;
use chatty_api::state::{AppStateInner, AuthConfig};
use chatty_api::storage::Storage;
use chatty_db::Database;
use chatty_gateway::dispatcher::Dispatcher;
use chatty_types::events::ChatEvent;

/// Every email and SMS the app tried to send, as (recipient, body).
#[derive(Clone, Default)]
struct Outbox(Arc<Mutex<Vec<(String, String)>>>);

impl Outbox {
    /// Latest code sent to `to`.
    fn otp_for(&self, to: &str) -> String {
        let sent = self.0.lock().unwrap();
        let (_, body) = sent
            .iter()
            .rev()
            .find(|(recipient, _)| recipient == to)
            .unwrap_or_else(|| panic!("nothing sent to {to}"));
        six_digits(body).expect("code in message")
    }
}

fn six_digits(text: &str) -> Option<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i].is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            if i - start == 6 {
                return Some(chars[start..i].iter().collect());
            }
        } else {
            i += 1;
        }
    }
    None
}

#[async_trait]
impl EmailSender for Outbox {
    async fn send_email(&self, to: &str, _subject: &str, html: &str) -> Result<(), String> {
        self.0.lock().unwrap().push((to.to_string(), html.to_string()));
        Ok(())
    }
}

#[async_trait]
impl SmsSender for Outbox {
    async fn send_sms(&self, to: &str, body: &str) -> Result<(), String> {
        self.0.lock().unwrap().push((to.to_string(), body.to_string()));
        Ok(())
    }
}

struct TestApp {
    router: Router,
    outbox: Outbox,
    dispatcher: Dispatcher,
}

impl TestApp {
    async fn new() -> Self {
        let outbox = Outbox::default();
        let dir = std::env::temp_dir().join(format!("chatty-api-test-{}", uuid::Uuid::new_v4()));
        let storage = Storage::new(dir, "http://localhost:8000").await.unwrap();
        let dispatcher = Dispatcher::new();
        let state = Arc::new(AppStateInner {
            db: Arc::new(Database::open_in_memory().unwrap()),
            dispatcher: dispatcher.clone(),
            storage,
            auth: AuthConfig {
                access_secret: "test-access-secret".into(),
                refresh_secret: "test-refresh-secret".into(),
                access_ttl: chrono::Duration::hours(1),
                refresh_ttl: chrono::Duration::days(10),
                secure_cookies: false,
            },
            mailer: Arc::new(outbox.clone()),
            sms: Arc::new(outbox.clone()),
            sms_country_code: "+91".into(),
        });
        Self {
            router: build_router(state),
            outbox,
            dispatcher,
        }
    }

    async fn send(&self, req: Request<Body>) -> (StatusCode, Vec<String>, Value) {
        let resp = self.router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let cookies = resp
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, cookies, body)
    }

    async fn post_json(&self, uri: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
        let (status, _, body) = self.send(json_request("POST", uri, token, body)).await;
        (status, body)
    }

    async fn register(&self, n: u32) -> (StatusCode, Value) {
        self.post_json(
            "/api/v1/auth/register",
            None,
            json!({
                "email": format!("user{n}@example.com"),
                "username": format!("user{n}"),
                "password": "Secret@123",
                "name": format!("User {n}"),
                "contact": format!("98765432{n:02}"),
                "dateOfBirth": "1995-04-12",
            }),
        )
        .await
    }

    async fn verify(&self, n: u32) {
        let email = format!("user{n}@example.com");
        let contact = format!("98765432{n:02}");
        let (status, _) = self
            .post_json(
                "/api/v1/auth/verify-email",
                None,
                json!({ "email": email, "otp": self.outbox.otp_for(&email) }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = self
            .post_json(
                "/api/v1/auth/verify-phone",
                None,
                json!({ "contact": contact, "otp": self.outbox.otp_for(&format!("+91{contact}")) }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    async fn login(&self, n: u32, password: &str) -> (StatusCode, Value) {
        self.post_json(
            "/api/v1/auth/login",
            None,
            json!({ "username": format!("user{n}"), "password": password }),
        )
        .await
    }

    /// Registered, verified and logged in: (user id, access token).
    async fn user(&self, n: u32) -> (String, String) {
        let (status, _) = self.register(n).await;
        assert_eq!(status, StatusCode::CREATED);
        self.verify(n).await;
        let (status, body) = self.login(n, "Secret@123").await;
        assert_eq!(status, StatusCode::OK, "{body}");
        (
            body["data"]["user"]["_id"].as_str().unwrap().to_string(),
            body["data"]["accessToken"].as_str().unwrap().to_string(),
        )
    }

    async fn send_text(&self, chat_id: &str, token: &str, content: &str) -> (StatusCode, Value) {
        let (status, _, body) = self
            .send(multipart_request(
                &format!("/api/v1/chatty/messages/{chat_id}"),
                token,
                &[("content", content)],
            ))
            .await;
        (status, body)
    }

    async fn one_on_one(&self, token: &str, other_id: &str) -> String {
        let (status, chat) = self
            .post_json(&format!("/api/v1/chatty/chats/c/{other_id}"), Some(token), json!({}))
            .await;
        assert!(status.is_success(), "{chat}");
        chat["data"]["_id"].as_str().unwrap().to_string()
    }

    async fn group(&self, token: &str, name: &str, others: &[&str]) -> String {
        let (status, chat) = self
            .post_json(
                "/api/v1/chatty/chats/group",
                Some(token),
                json!({ "name": name, "participants": others }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{chat}");
        chat["data"]["_id"].as_str().unwrap().to_string()
    }
}

/// Every event waiting on a receiver, by name.
fn event_names(rx: &mut tokio::sync::mpsc::UnboundedReceiver<ChatEvent>) -> Vec<&'static str> {
    let mut names = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        names.push(ev.name());
    }
    names
}

fn json_request(method: &str, uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn empty_request(method: &str, uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

struct FilePart<'a> {
    field: &'a str,
    file_name: &'a str,
    mime: &'a str,
    data: Vec<u8>,
}

fn multipart_request(uri: &str, token: &str, fields: &[(&str, &str)]) -> Request<Body> {
    upload_request("POST", uri, token, fields, &[])
}

fn upload_request(
    method: &str,
    uri: &str,
    token: &str,
    fields: &[(&str, &str)],
    files: &[FilePart],
) -> Request<Body> {
    let boundary = "chatty-test-boundary";
    let mut body: Vec<u8> = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    for file in files {
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                file.field, file.file_name, file.mime
            )
            .as_bytes(),
        );
        body.extend_from_slice(&file.data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn duplicate_email_is_conflict() {
    let app = TestApp::new().await;
    let (status, body) = app.register(1).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["user"]["username"], "user1");

    let (status, body) = app
        .post_json(
            "/api/v1/auth/register",
            None,
            json!({
                "email": "user1@example.com",
                "username": "someone_else",
                "password": "Secret@123",
                "name": "Someone",
                "contact": "9123456789",
                "dateOfBirth": "1990-01-01",
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn invalid_registration_lists_fields() {
    let app = TestApp::new().await;
    let (status, body) = app
        .post_json("/api/v1/auth/register", None, json!({ "email": "nope" }))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let fields: Vec<&str> = body["errors"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["field"].as_str().unwrap())
        .collect();
    assert!(fields.contains(&"email"));
    assert!(fields.contains(&"password"));
}

#[tokio::test]
async fn login_requires_both_verifications() {
    let app = TestApp::new().await;
    app.register(1).await;
    let login = json!({ "email": "user1@example.com", "password": "Secret@123" });

    let (status, _) = app.post_json("/api/v1/auth/login", None, login.clone()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Email alone is not enough.
    let (status, _) = app
        .post_json(
            "/api/v1/auth/verify-email",
            None,
            json!({ "email": "user1@example.com", "otp": app.outbox.otp_for("user1@example.com") }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = app.post_json("/api/v1/auth/login", None, login.clone()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .post_json(
            "/api/v1/auth/verify-phone",
            None,
            json!({ "contact": "9876543201", "otp": app.outbox.otp_for("+919876543201") }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, cookies, body) = app
        .send(json_request("POST", "/api/v1/auth/login", None, login))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(cookies.iter().any(|c| c.starts_with("accessToken=") && c.contains("HttpOnly")));
    assert!(cookies.iter().any(|c| c.starts_with("refreshToken=")));

    let token = body["data"]["accessToken"].as_str().unwrap();
    let (status, _, body) = app
        .send(empty_request("GET", "/api/v1/auth/current-user", token))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["isEmailVerified"], true);
}

#[tokio::test]
async fn wrong_otp_is_rejected() {
    let app = TestApp::new().await;
    app.register(1).await;
    let good = app.outbox.otp_for("user1@example.com");
    let bad = if good == "123456" { "654321" } else { "123456" };
    let (status, body) = app
        .post_json(
            "/api/v1/auth/verify-email",
            None,
            json!({ "email": "user1@example.com", "otp": bad }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Invalid OTP.");
}

#[tokio::test]
async fn sixth_otp_in_a_day_is_rate_limited() {
    let app = TestApp::new().await;
    // Registration sends two codes.
    app.register(1).await;
    let resend = json!({ "email": "user1@example.com" });
    for _ in 0..3 {
        let (status, _) = app
            .post_json("/api/v1/auth/resend-email-otp", None, resend.clone())
            .await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, body) = app
        .post_json("/api/v1/auth/resend-email-otp", None, resend)
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["message"], "Maximum 5 OTP requests allowed in 24 hours");
}

#[tokio::test]
async fn protected_routes_need_a_token() {
    let app = TestApp::new().await;
    let req = Request::builder()
        .uri("/api/v1/chatty/chats")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = app.send(req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "Unauthorized request");
}

#[tokio::test]
async fn group_needs_three_distinct_members() {
    let app = TestApp::new().await;
    let (_, token1) = app.user(1).await;
    let (id2, _) = app.user(2).await;

    let (status, body) = app
        .post_json(
            "/api/v1/chatty/chats/group",
            Some(&token1),
            json!({ "name": "Pair", "participants": [id2, id2] }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Seems like you have passed duplicate participants.");
}

#[tokio::test]
async fn only_admin_renames_group() {
    let app = TestApp::new().await;
    let (id1, token1) = app.user(1).await;
    let (id2, token2) = app.user(2).await;
    let (id3, _) = app.user(3).await;

    let (status, body) = app
        .post_json(
            "/api/v1/chatty/chats/group",
            Some(&token1),
            json!({ "name": "Trio", "participants": [id2, id3] }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["admin"], id1.as_str());
    assert_eq!(body["data"]["participants"].as_array().unwrap().len(), 3);
    let chat_id = body["data"]["_id"].as_str().unwrap().to_string();
    let uri = format!("/api/v1/chatty/chats/group/{chat_id}");

    let (status, _, _) = app
        .send(json_request("PATCH", &uri, Some(&token2), json!({ "name": "Mine" })))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _, body) = app
        .send(json_request("PATCH", &uri, Some(&token1), json!({ "name": "Renamed" })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["name"], "Renamed");
}

#[tokio::test]
async fn one_on_one_chat_is_reused() {
    let app = TestApp::new().await;
    let (_, token1) = app.user(1).await;
    let (id2, _) = app.user(2).await;
    let uri = format!("/api/v1/chatty/chats/c/{id2}");

    let (status, first) = app.post_json(&uri, Some(&token1), json!({})).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, second) = app.post_json(&uri, Some(&token1), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["data"]["_id"], second["data"]["_id"]);
}

#[tokio::test]
async fn empty_message_is_rejected() {
    let app = TestApp::new().await;
    let (_, token1) = app.user(1).await;
    let (id2, _) = app.user(2).await;
    let (_, chat) = app
        .post_json(&format!("/api/v1/chatty/chats/c/{id2}"), Some(&token1), json!({}))
        .await;
    let chat_id = chat["data"]["_id"].as_str().unwrap();

    let (status, body) = app.send_text(chat_id, &token1, "   ").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Message or Attachments is required.");
}

#[tokio::test]
async fn deleting_last_message_moves_last_message_back() {
    let app = TestApp::new().await;
    let (_, token1) = app.user(1).await;
    let (id2, token2) = app.user(2).await;
    let (_, chat) = app
        .post_json(&format!("/api/v1/chatty/chats/c/{id2}"), Some(&token1), json!({}))
        .await;
    let chat_id = chat["data"]["_id"].as_str().unwrap().to_string();

    let (status, first) = app.send_text(&chat_id, &token1, "first").await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, second) = app.send_text(&chat_id, &token1, "second").await;
    assert_eq!(status, StatusCode::CREATED);
    let first_id = first["data"]["_id"].as_str().unwrap();
    let second_id = second["data"]["_id"].as_str().unwrap();

    // Only the sender may delete.
    let uri = format!("/api/v1/chatty/messages/{chat_id}/{second_id}");
    let (status, _, _) = app.send(empty_request("DELETE", &uri, &token2)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _, _) = app.send(empty_request("DELETE", &uri, &token1)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = app
        .send(empty_request("GET", "/api/v1/chatty/chats", &token1))
        .await;
    assert_eq!(status, StatusCode::OK);
    let chats = body["data"].as_array().unwrap();
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0]["lastMessage"]["_id"], first_id);
    assert_eq!(chats[0]["lastMessage"]["content"], "first");
}

#[tokio::test]
async fn fetching_messages_marks_them_delivered() {
    let app = TestApp::new().await;
    let (_, token1) = app.user(1).await;
    let (id2, token2) = app.user(2).await;
    let (_, chat) = app
        .post_json(&format!("/api/v1/chatty/chats/c/{id2}"), Some(&token1), json!({}))
        .await;
    let chat_id = chat["data"]["_id"].as_str().unwrap().to_string();
    let (_, sent) = app.send_text(&chat_id, &token1, "hello").await;
    assert_eq!(sent["data"]["status"], "sent");

    let uri = format!("/api/v1/chatty/messages/{chat_id}");
    let (status, _, body) = app.send(empty_request("GET", &uri, &token2)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["status"], "delivered");

    let (_, _, chats) = app
        .send(empty_request("GET", "/api/v1/chatty/chats", &token2))
        .await;
    assert_eq!(chats["data"][0]["unreadMessageCount"], 1);

    let (status, body) = app
        .post_json(&format!("/api/v1/chatty/chats/{chat_id}/read"), Some(&token2), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["updated"], 1);

    let (_, _, body) = app.send(empty_request("GET", &uri, &token1)).await;
    assert_eq!(body["data"][0]["status"], "read");
}

#[tokio::test]
async fn refresh_token_rotates_and_old_one_is_rejected() {
    let app = TestApp::new().await;
    app.user(1).await;
    let (_, body) = app.login(1, "Secret@123").await;
    let first = body["data"]["refreshToken"].as_str().unwrap().to_string();

    let (status, cookies, body) = app
        .send(json_request(
            "POST",
            "/api/v1/auth/refresh-token",
            None,
            json!({ "refreshToken": first }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["message"], "Access token refreshed");
    assert!(cookies.iter().any(|c| c.starts_with("refreshToken=")));
    let second = body["data"]["refreshToken"].as_str().unwrap().to_string();
    assert_ne!(first, second);

    let (status, body) = app
        .post_json("/api/v1/auth/refresh-token", None, json!({ "refreshToken": first }))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "Refresh token is expired or used");

    let (status, _) = app
        .post_json("/api/v1/auth/refresh-token", None, json!({ "refreshToken": second }))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app
        .post_json("/api/v1/auth/refresh-token", None, json!({ "refreshToken": "garbage" }))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "Invalid refresh token");
}

#[tokio::test]
async fn password_reset_revokes_refresh_token() {
    let app = TestApp::new().await;
    app.user(1).await;
    let (_, body) = app.login(1, "Secret@123").await;
    let refresh = body["data"]["refreshToken"].as_str().unwrap().to_string();

    let (status, body) = app
        .post_json(
            "/api/v1/auth/forgot-password",
            None,
            json!({ "email": "user1@example.com" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Password reset OTP sent");

    let (status, body) = app
        .post_json(
            "/api/v1/auth/reset-password",
            None,
            json!({
                "email": "user1@example.com",
                "otp": app.outbox.otp_for("user1@example.com"),
                "newPassword": "Better@456",
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["message"], "Password reset successfully");

    let (status, _) = app
        .post_json("/api/v1/auth/refresh-token", None, json!({ "refreshToken": refresh }))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app.login(1, "Secret@123").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = app.login(1, "Better@456").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn profile_changes_need_password_and_fresh_verification() {
    let app = TestApp::new().await;
    let (_, token) = app.user(1).await;
    app.user(2).await;

    let (status, _, body) = app
        .send(json_request(
            "PATCH",
            "/api/v1/auth/profile",
            Some(&token),
            json!({ "email": "fresh@example.com" }),
        ))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        body["message"],
        "Current password is required to change username, email or contact"
    );

    let (status, _, body) = app
        .send(json_request(
            "PATCH",
            "/api/v1/auth/profile",
            Some(&token),
            json!({ "email": "user2@example.com", "currentPassword": "Secret@123" }),
        ))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["message"], "This email is already in use");

    // A name alone needs no password.
    let (status, _, body) = app
        .send(json_request(
            "PATCH",
            "/api/v1/auth/profile",
            Some(&token),
            json!({ "name": "Renamed User" }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["name"], "Renamed User");
    assert_eq!(body["data"]["isEmailVerified"], true);

    let (status, _, body) = app
        .send(json_request(
            "PATCH",
            "/api/v1/auth/profile",
            Some(&token),
            json!({ "email": "Fresh@Example.com", "currentPassword": "Secret@123" }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["email"], "fresh@example.com");
    assert_eq!(body["data"]["isEmailVerified"], false);
    assert_eq!(body["data"]["isContactVerified"], true);

    let (status, _) = app
        .post_json(
            "/api/v1/auth/verify-email",
            None,
            json!({ "email": "fresh@example.com", "otp": app.outbox.otp_for("fresh@example.com") }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let (_, _, body) = app
        .send(empty_request("GET", "/api/v1/auth/current-user", &token))
        .await;
    assert_eq!(body["data"]["isEmailVerified"], true);
}

#[tokio::test]
async fn email_change_is_refused_once_the_otp_quota_is_spent() {
    let app = TestApp::new().await;
    // Registration already used two of the five daily codes.
    let (_, token) = app.user(1).await;
    let change = |k: u32| {
        json_request(
            "PATCH",
            "/api/v1/auth/profile",
            Some(&token),
            json!({ "email": format!("new{k}@example.com"), "currentPassword": "Secret@123" }),
        )
    };

    for k in 1..=3 {
        let (status, _, body) = app.send(change(k)).await;
        assert_eq!(status, StatusCode::OK, "{body}");
    }
    let (status, _, body) = app.send(change(4)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["message"], "Maximum 5 OTP requests allowed in 24 hours");

    // The refused change left nothing behind.
    let (_, _, body) = app
        .send(empty_request("GET", "/api/v1/auth/current-user", &token))
        .await;
    assert_eq!(body["data"]["email"], "new3@example.com");
}

#[tokio::test]
async fn avatar_must_be_a_small_image() {
    let app = TestApp::new().await;
    let (_, token) = app.user(1).await;
    let avatar = |mime: &'static str, size: usize| {
        upload_request(
            "PATCH",
            "/api/v1/auth/avatar",
            &token,
            &[],
            &[FilePart {
                field: "avatar",
                file_name: "me.png",
                mime,
                data: vec![7u8; size],
            }],
        )
    };

    let (status, _, body) = app.send(avatar("text/plain", 64)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Avatar must be an image");

    let (status, _, body) = app.send(avatar("image/png", 1024 * 1024 + 1)).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["message"], "Avatar must be at most 1 MB");

    let (status, _, body) = app.send(avatar("image/png", 2048)).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let url = body["data"]["avatar"]["url"].as_str().unwrap();
    assert!(url.starts_with("http://localhost:8000/attachments/avatars/"));
}

#[tokio::test]
async fn attachments_are_typed_and_limited() {
    let app = TestApp::new().await;
    let (_, token1) = app.user(1).await;
    let (id2, _) = app.user(2).await;
    let chat_id = app.one_on_one(&token1, &id2).await;
    let uri = format!("/api/v1/chatty/messages/{chat_id}");
    let file = |file_name: &'static str, mime: &'static str, size: usize| FilePart {
        field: "attachments",
        file_name,
        mime,
        data: vec![1u8; size],
    };

    let (status, _, body) = app
        .send(upload_request(
            "POST",
            &uri,
            &token1,
            &[("content", "see attached")],
            &[file("cat.png", "image/png", 128), file("notes.pdf", "application/pdf", 256)],
        ))
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    let attachments = body["data"]["attachments"].as_array().unwrap();
    assert_eq!(attachments.len(), 2);
    assert_eq!(attachments[0]["type"], "image");
    assert_eq!(attachments[0]["mimeType"], "image/png");
    assert_eq!(attachments[0]["size"], 128);
    assert_eq!(attachments[1]["type"], "document");

    // Stored blobs are served back.
    let key = attachments[0]["key"].as_str().unwrap();
    let blob = Request::builder()
        .uri(format!("/attachments/{key}"))
        .body(Body::empty())
        .unwrap();
    let resp = app.router.clone().oneshot(blob).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let six: Vec<FilePart> = (0..6).map(|_| file("a.txt", "text/plain", 8)).collect();
    let (status, _, body) = app
        .send(upload_request("POST", &uri, &token1, &[], &six))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "At most 5 attachments per message");

    let (status, _, body) = app
        .send(upload_request(
            "POST",
            &uri,
            &token1,
            &[],
            &[file("big.bin", "application/octet-stream", 16 * 1024 * 1024 + 1)],
        ))
        .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["message"], "Each attachment must be at most 16 MB");
}

#[tokio::test]
async fn admin_hands_over_before_leaving() {
    let app = TestApp::new().await;
    let (id1, token1) = app.user(1).await;
    let (id2, token2) = app.user(2).await;
    let (id3, _) = app.user(3).await;
    let chat_id = app.group(&token1, "Trio", &[id2.as_str(), id3.as_str()]).await;
    let leave = format!("/api/v1/chatty/chats/leave/group/{chat_id}");

    let (status, _, body) = app
        .send(json_request("DELETE", &leave, Some(&token1), json!({})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "New admin ID is required if admin leaves.");

    let (_, mut rx3) = app.dispatcher.register(&id3).await;
    let (status, _, body) = app
        .send(json_request("DELETE", &leave, Some(&token1), json!({ "newAdminId": id2 })))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["message"], "Left the group chat successfully");
    assert_eq!(event_names(&mut rx3), ["leaveChat"]);

    let details = format!("/api/v1/chatty/chats/group/{chat_id}");
    let (status, _, body) = app.send(empty_request("GET", &details, &token2)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["admin"], id2.as_str());
    assert_eq!(body["data"]["participants"].as_array().unwrap().len(), 2);
    let (status, _, _) = app.send(empty_request("GET", &details, &token1)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // The new admin can bring the old one back, once.
    let (_, mut rx1) = app.dispatcher.register(&id1).await;
    let add = format!("/api/v1/chatty/chats/group/{chat_id}/{id1}");
    let (status, body) = app.post_json(&add, Some(&token2), json!({})).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["participants"].as_array().unwrap().len(), 3);
    assert_eq!(event_names(&mut rx1), ["newChat"]);
    let (status, body) = app.post_json(&add, Some(&token2), json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["message"], "Participant already in the group chat");
}

#[tokio::test]
async fn only_admin_removes_participants() {
    let app = TestApp::new().await;
    let (_, token1) = app.user(1).await;
    let (id2, token2) = app.user(2).await;
    let (id3, _) = app.user(3).await;
    let chat_id = app.group(&token1, "Trio", &[id2.as_str(), id3.as_str()]).await;
    let remove = format!("/api/v1/chatty/chats/group/{chat_id}/{id3}");

    let (status, _, _) = app.send(empty_request("DELETE", &remove, &token2)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (_, mut rx3) = app.dispatcher.register(&id3).await;
    let (status, _, body) = app.send(empty_request("DELETE", &remove, &token1)).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["message"], "User removed successfully");
    let ids: Vec<&str> = body["data"]["participants"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["_id"].as_str().unwrap())
        .collect();
    assert!(!ids.contains(&id3.as_str()));
    assert_eq!(event_names(&mut rx3), ["leaveChat"]);
}

#[tokio::test]
async fn deleting_a_group_removes_its_messages_and_files() {
    let app = TestApp::new().await;
    let (_, token1) = app.user(1).await;
    let (id2, token2) = app.user(2).await;
    let (id3, _) = app.user(3).await;
    let chat_id = app.group(&token1, "Trio", &[id2.as_str(), id3.as_str()]).await;

    let (status, _, body) = app
        .send(upload_request(
            "POST",
            &format!("/api/v1/chatty/messages/{chat_id}"),
            &token2,
            &[("content", "photo")],
            &[FilePart {
                field: "attachments",
                file_name: "p.jpg",
                mime: "image/jpeg",
                data: vec![9u8; 32],
            }],
        ))
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    let key = body["data"]["attachments"][0]["key"].as_str().unwrap().to_string();

    let group = format!("/api/v1/chatty/chats/group/{chat_id}");
    let (status, _, body) = app.send(empty_request("DELETE", &group, &token2)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["message"], "Only admin can delete the group");

    let (_, mut rx2) = app.dispatcher.register(&id2).await;
    let (status, _, _) = app.send(empty_request("DELETE", &group, &token1)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(event_names(&mut rx2), ["leaveChat"]);

    let (status, _, _) = app
        .send(empty_request("GET", &format!("/api/v1/chatty/messages/{chat_id}"), &token2))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (_, _, body) = app
        .send(empty_request("GET", "/api/v1/chatty/chats", &token2))
        .await;
    assert!(body["data"].as_array().unwrap().is_empty());

    let blob = Request::builder()
        .uri(format!("/attachments/{key}"))
        .body(Body::empty())
        .unwrap();
    let resp = app.router.clone().oneshot(blob).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn remove_route_deletes_one_on_one_chats_only() {
    let app = TestApp::new().await;
    let (_, token1) = app.user(1).await;
    let (id2, token2) = app.user(2).await;
    let (id3, token3) = app.user(3).await;

    // A plain member cannot use the 1:1 route to wipe a group.
    let group_id = app.group(&token1, "Trio", &[id2.as_str(), id3.as_str()]).await;
    let (status, _, body) = app
        .send(empty_request("DELETE", &format!("/api/v1/chatty/chats/remove/{group_id}"), &token2))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["message"], "Chat doesn't exist");
    let (status, _, _) = app
        .send(empty_request("GET", &format!("/api/v1/chatty/chats/group/{group_id}"), &token2))
        .await;
    assert_eq!(status, StatusCode::OK);

    let chat_id = app.one_on_one(&token1, &id2).await;
    let remove = format!("/api/v1/chatty/chats/remove/{chat_id}");
    let (status, _, _) = app.send(empty_request("DELETE", &remove, &token3)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, mut rx2) = app.dispatcher.register(&id2).await;
    let (status, _, body) = app.send(empty_request("DELETE", &remove, &token1)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Chat deleted successfully");
    assert_eq!(event_names(&mut rx2), ["leaveChat"]);

    let (status, _, _) = app.send(empty_request("DELETE", &remove, &token1)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn chat_events_reach_connected_members() {
    let app = TestApp::new().await;
    let (id1, token1) = app.user(1).await;
    let (id2, _) = app.user(2).await;
    let (_, mut rx1) = app.dispatcher.register(&id1).await;
    let (_, mut rx2) = app.dispatcher.register(&id2).await;

    let chat_id = app.one_on_one(&token1, &id2).await;
    assert_eq!(event_names(&mut rx2), ["newChat"]);
    assert!(event_names(&mut rx1).is_empty());

    let (status, _) = app.send_text(&chat_id, &token1, "hi there").await;
    assert_eq!(status, StatusCode::CREATED);
    match rx2.try_recv() {
        Ok(ChatEvent::MessageReceived(message)) => {
            assert_eq!(message.content, "hi there");
            assert_eq!(message.chat, chat_id);
        }
        other => panic!("expected messageReceived, got {other:?}"),
    }
    assert!(event_names(&mut rx1).is_empty());
}
