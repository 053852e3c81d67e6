use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString};
use axum::{
    Extension, Json,
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::IntoResponse,
};
use axum_extra::extract::{
    CookieJar, WithRejection,
    cookie::{Cookie, SameSite},
};
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use chatty_db::models::UserRow;
use chatty_db::queries::{NewUser, OtpPurpose};
use chatty_types::api::{
    ChangePasswordRequest, Claims, ForgotPasswordRequest, LoginRequest, LoginResponse,
    RefreshClaims, RefreshTokenRequest, RegisterRequest, RegisterResponse, ResendEmailOtpRequest,
    ResendPhoneOtpRequest, ResetPasswordRequest, TokenPair, VerifyEmailRequest,
    VerifyPhoneRequest,
};
use chatty_types::models::UserProfile;

use crate::error::ApiError;
use crate::middleware::{AuthUser, authenticate};
use crate::otp;
use crate::response::{ApiJson, created, ok, optional_json};
use crate::state::{AppState, AppStateInner, AuthConfig};
use crate::validation::{
    normalize_contact, normalize_email, normalize_username, validate_password,
    validate_registration,
};

pub const ACCESS_COOKIE: &str = "accessToken";
pub const REFRESH_COOKIE: &str = "refreshToken";

const MAX_LOGIN_ATTEMPTS: u32 = 5;
const LOCK_MINUTES: i64 = 30;

// -- Tokens & passwords --

fn create_access_token(auth: &AuthConfig, user: &UserRow) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user.id.clone(),
        username: user.username.clone(),
        email: user.email.clone(),
        exp: (Utc::now() + auth.access_ttl).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(auth.access_secret.as_bytes()),
    )?;

    Ok(token)
}

fn create_refresh_token(auth: &AuthConfig, user_id: &str) -> anyhow::Result<String> {
    let claims = RefreshClaims {
        sub: user_id.to_string(),
        jti: Uuid::new_v4().to_string(),
        exp: (Utc::now() + auth.refresh_ttl).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(auth.refresh_secret.as_bytes()),
    )?;

    Ok(token)
}

fn issue_tokens(auth: &AuthConfig, user: &UserRow) -> Result<TokenPair, ApiError> {
    Ok(TokenPair {
        access_token: create_access_token(auth, user)?,
        refresh_token: create_refresh_token(auth, &user.id)?,
    })
}

pub fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt = SaltString::encode_b64(&rand::random::<[u8; 16]>())
        .map_err(|e| anyhow::anyhow!("salt encoding failed: {}", e))?;
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hashing failed: {}", e))?
        .to_string();
    Ok(hash)
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            warn!("Stored password hash is unreadable: {}", e);
            false
        }
    }
}

fn token_cookie(name: &'static str, value: String, secure: bool) -> Cookie<'static> {
    Cookie::build((name, value))
        .http_only(true)
        .secure(secure)
        .same_site(if secure { SameSite::None } else { SameSite::Lax })
        .path("/")
        .build()
}

fn set_auth_cookies(jar: CookieJar, auth: &AuthConfig, pair: &TokenPair) -> CookieJar {
    jar.add(token_cookie(ACCESS_COOKIE, pair.access_token.clone(), auth.secure_cookies))
        .add(token_cookie(REFRESH_COOKIE, pair.refresh_token.clone(), auth.secure_cookies))
}

fn clear_auth_cookies(jar: CookieJar) -> CookieJar {
    jar.remove(Cookie::build(ACCESS_COOKIE).path("/"))
        .remove(Cookie::build(REFRESH_COOKIE).path("/"))
}

// -- Lookups --

async fn find_user_by_email(state: &AppStateInner, email: &str) -> Result<UserRow, ApiError> {
    let email = normalize_email(email);
    state
        .run_db(move |db| db.get_user_by_email(&email))
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))
}

async fn find_user_by_contact(state: &AppStateInner, contact: &str) -> Result<UserRow, ApiError> {
    // Anything that does not look like a phone number cannot match a user.
    let Ok(contact) = normalize_contact(contact) else {
        return Err(ApiError::not_found("User not found"));
    };
    state
        .run_db(move |db| db.get_user_by_contact(&contact))
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))
}

pub(crate) async fn load_user(state: &AppStateInner, user_id: &str) -> Result<UserRow, ApiError> {
    let uid = user_id.to_string();
    state
        .run_db(move |db| db.get_user_by_id(&uid))
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))
}

/// Sanitized profile including favorites and blocked users.
pub(crate) async fn load_profile(state: &AppStateInner, user_id: &str) -> Result<UserProfile, ApiError> {
    let uid = user_id.to_string();
    state
        .run_db(move |db| {
            let user = db.get_user_by_id(&uid)?;
            let favorites = db.list_favorites(&uid)?;
            let blocked = db.list_blocked(&uid)?;
            Ok(user.map(|u| u.to_profile(favorites, blocked)))
        })
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))
}

// -- Handlers --

pub async fn register(
    State(state): State<AppState>,
    WithRejection(Json(req), _): ApiJson<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let valid = validate_registration(&req)?;

    let (username, email, contact) = (valid.username.clone(), valid.email.clone(), valid.contact.clone());
    let conflict = state
        .run_db(move |db| {
            db.find_user_conflict(Some(&username), Some(&email), Some(&contact), None)
        })
        .await?;
    if conflict.is_some() {
        return Err(ApiError::conflict(
            "User with email, username or contact already exists",
        ));
    }

    let new_user = NewUser {
        id: Uuid::new_v4().to_string(),
        username: valid.username,
        email: valid.email,
        contact: valid.contact,
        name: valid.name,
        password_hash: hash_password(&valid.password)?,
        date_of_birth: Some(valid.date_of_birth),
    };
    let user = state
        .run_db(move |db| db.create_user(&new_user))
        .await
        .map_err(|e| e.or_conflict("User with email, username or contact already exists"))?;
    info!("Registered user {} ({})", user.username, user.id);

    // The account exists either way; a failed send can be retried via resend.
    for purpose in [OtpPurpose::Email, OtpPurpose::Phone] {
        if let Err(e) = otp::issue(&state, &user, purpose).await {
            warn!("Initial {:?} OTP for {} not delivered: {}", purpose, user.id, e);
        }
    }

    Ok(created(
        RegisterResponse {
            user: user.to_profile(vec![], vec![]),
            message: "Please verify both your email and phone number to complete registration."
                .into(),
        },
        "User registered successfully.",
    ))
}

pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    WithRejection(Json(req), _): ApiJson<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let username = req.username.as_deref().map(normalize_username).filter(|s| !s.is_empty());
    let email = req.email.as_deref().map(normalize_email).filter(|s| !s.is_empty());
    if username.is_none() && email.is_none() {
        return Err(ApiError::bad_request("Username or email is required"));
    }

    let user = state
        .run_db(move |db| match (username, email) {
            (Some(username), _) => db.get_user_by_username(&username),
            (None, Some(email)) => db.get_user_by_email(&email),
            (None, None) => Ok(None),
        })
        .await?
        .ok_or_else(|| ApiError::not_found("User does not exist"))?;

    if user.is_locked(Utc::now()) {
        return Err(ApiError::Locked(
            "Account is locked due to too many failed login attempts. Please try again later."
                .into(),
        ));
    }
    if !user.is_email_verified {
        return Err(ApiError::unauthorized("Please verify your email before logging in."));
    }
    if !user.is_contact_verified {
        return Err(ApiError::unauthorized(
            "Please verify your phone number before logging in.",
        ));
    }

    if !verify_password(&req.password, &user.password) {
        let uid = user.id.clone();
        let lock_until = Utc::now() + Duration::minutes(LOCK_MINUTES);
        let locked = state
            .run_db(move |db| db.record_failed_login(&uid, MAX_LOGIN_ATTEMPTS, lock_until))
            .await?;
        if locked {
            warn!("Locking account {} after {} failed logins", user.id, MAX_LOGIN_ATTEMPTS);
        }
        return Err(ApiError::unauthorized("Invalid credentials"));
    }

    let pair = issue_tokens(&state.auth, &user)?;
    let uid = user.id.clone();
    let refresh = pair.refresh_token.clone();
    state.run_db(move |db| db.record_login(&uid, &refresh)).await?;

    let profile = load_profile(&state, &user.id).await?;
    info!("{} ({}) logged in", user.username, user.id);

    let jar = set_auth_cookies(jar, &state.auth, &pair);
    Ok((
        jar,
        ok(
            LoginResponse {
                user: profile,
                access_token: pair.access_token,
                refresh_token: pair.refresh_token,
            },
            "User logged in successfully",
        ),
    ))
}

pub async fn refresh_token(
    State(state): State<AppState>,
    jar: CookieJar,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let req: RefreshTokenRequest = optional_json(&body)?;
    let incoming = jar
        .get(REFRESH_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|t| !t.is_empty())
        .or(req.refresh_token)
        .ok_or_else(|| ApiError::unauthorized("Unauthorized request"))?;

    let claims = decode::<RefreshClaims>(
        &incoming,
        &DecodingKey::from_secret(state.auth.refresh_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| ApiError::unauthorized("Invalid refresh token"))?
    .claims;

    let uid = claims.sub.clone();
    let user = state
        .run_db(move |db| db.get_user_by_id(&uid))
        .await?
        .ok_or_else(|| ApiError::unauthorized("Invalid refresh token"))?;

    if user.refresh_token.as_deref() != Some(incoming.as_str()) {
        return Err(ApiError::unauthorized("Refresh token is expired or used"));
    }

    let pair = issue_tokens(&state.auth, &user)?;
    let uid = user.id.clone();
    let refresh = pair.refresh_token.clone();
    state
        .run_db(move |db| db.set_refresh_token(&uid, Some(&refresh)))
        .await?;

    let jar = set_auth_cookies(jar, &state.auth, &pair);
    Ok((jar, ok(pair, "Access token refreshed")))
}

pub async fn logout(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    jar: CookieJar,
) -> Result<impl IntoResponse, ApiError> {
    let uid = user.id.clone();
    state.run_db(move |db| db.set_refresh_token(&uid, None)).await?;
    info!("{} ({}) logged out", user.username, user.id);
    Ok((clear_auth_cookies(jar), ok(json!({}), "User logged out")))
}

pub async fn verify_email(
    State(state): State<AppState>,
    WithRejection(Json(req), _): ApiJson<VerifyEmailRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (Some(email), Some(code)) = (non_empty(req.email), non_empty(req.otp)) else {
        return Err(ApiError::bad_request("Email and OTP are required"));
    };
    let user = find_user_by_email(&state, &email).await?;
    otp::verify(&state, &user, OtpPurpose::Email, &code).await?;
    Ok(ok(json!({}), "Email verified successfully"))
}

pub async fn verify_phone(
    State(state): State<AppState>,
    WithRejection(Json(req), _): ApiJson<VerifyPhoneRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (Some(contact), Some(code)) = (non_empty(req.contact), non_empty(req.otp)) else {
        return Err(ApiError::bad_request("Phone number and OTP are required"));
    };
    let user = find_user_by_contact(&state, &contact).await?;
    otp::verify(&state, &user, OtpPurpose::Phone, &code).await?;
    Ok(ok(json!({}), "Phone number verified successfully"))
}

/// Public (by `email` in the body) or authenticated (by session) resend.
pub async fn resend_email_otp(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let req: ResendEmailOtpRequest = optional_json(&body)?;
    let user = match non_empty(req.email) {
        Some(email) => find_user_by_email(&state, &email).await?,
        None => {
            let caller = authenticate(&state, &headers)
                .await
                .map_err(|_| ApiError::bad_request("Email is required"))?;
            load_user(&state, &caller.id).await?
        }
    };

    if user.is_email_verified {
        return Err(ApiError::bad_request("Email is already verified"));
    }
    otp::issue(&state, &user, OtpPurpose::Email).await?;
    Ok(ok(json!({}), "Email OTP has been resent"))
}

pub async fn resend_phone_otp(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let req: ResendPhoneOtpRequest = optional_json(&body)?;
    let user = match non_empty(req.contact) {
        Some(contact) => find_user_by_contact(&state, &contact).await?,
        None => {
            let caller = authenticate(&state, &headers)
                .await
                .map_err(|_| ApiError::bad_request("Phone number is required"))?;
            load_user(&state, &caller.id).await?
        }
    };

    if user.is_contact_verified {
        return Err(ApiError::bad_request("Phone number is already verified"));
    }
    otp::issue(&state, &user, OtpPurpose::Phone).await?;
    Ok(ok(json!({}), "Phone OTP has been resent"))
}

pub async fn forgot_password(
    State(state): State<AppState>,
    WithRejection(Json(req), _): ApiJson<ForgotPasswordRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(email) = non_empty(req.email) else {
        return Err(ApiError::bad_request("Email is required"));
    };
    let user = find_user_by_email(&state, &email).await?;
    otp::issue(&state, &user, OtpPurpose::PasswordReset).await?;
    Ok(ok(json!({}), "Password reset OTP sent"))
}

pub async fn reset_password(
    State(state): State<AppState>,
    WithRejection(Json(req), _): ApiJson<ResetPasswordRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (Some(email), Some(code), Some(new_password)) =
        (non_empty(req.email), non_empty(req.otp), non_empty(req.new_password))
    else {
        return Err(ApiError::bad_request("All fields are required"));
    };
    let user = find_user_by_email(&state, &email).await?;
    validate_password("newPassword", &new_password)?;
    otp::verify(&state, &user, OtpPurpose::PasswordReset, &code).await?;

    let hash = hash_password(&new_password)?;
    let uid = user.id.clone();
    state.run_db(move |db| db.update_password(&uid, &hash)).await?;
    info!("Password reset for {}", user.id);
    Ok(ok(json!({}), "Password reset successfully"))
}

pub async fn change_password(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    WithRejection(Json(req), _): ApiJson<ChangePasswordRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = load_user(&state, &caller.id).await?;
    if !verify_password(&req.old_password, &user.password) {
        return Err(ApiError::bad_request("Invalid old password"));
    }
    validate_password("newPassword", &req.new_password)?;

    let hash = hash_password(&req.new_password)?;
    let uid = user.id.clone();
    state.run_db(move |db| db.update_password(&uid, &hash)).await?;
    Ok(ok(json!({}), "Password changed successfully"))
}

pub async fn current_user(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
) -> Result<impl IntoResponse, ApiError> {
    let profile = load_profile(&state, &caller.id).await?;
    Ok(ok(profile, "Current user fetched successfully"))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
