use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use chatty_db::models::UserRow;
use chatty_db::queries::OtpPurpose;

use crate::error::ApiError;
use crate::notify;
use crate::state::AppState;

pub const OTP_TTL_MINUTES: i64 = 5;
pub const MAX_OTP_REQUESTS: u32 = 5;
pub const OTP_WINDOW_HOURS: i64 = 24;

pub fn generate_otp() -> String {
    rand::rng().random_range(100_000..=999_999).to_string()
}

pub fn hash_otp(otp: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(otp.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compare a submitted code against the stored hash and expiry.
pub fn check_otp(
    stored_hash: Option<&str>,
    expires_at: Option<DateTime<Utc>>,
    submitted: &str,
    now: DateTime<Utc>,
) -> Result<(), ApiError> {
    let Some(stored_hash) = stored_hash else {
        return Err(ApiError::bad_request("No OTP found. Please request a new one."));
    };
    if expires_at.is_none_or(|at| at <= now) {
        return Err(ApiError::bad_request("OTP has expired. Please request a new one."));
    }
    if hash_otp(submitted.trim()) != stored_hash {
        return Err(ApiError::bad_request("Invalid OTP."));
    }
    Ok(())
}

/// Verify the code for `purpose` and clear it (setting the verified flag
/// for email/phone).
pub async fn verify(
    state: &AppState,
    user: &UserRow,
    purpose: OtpPurpose,
    submitted: &str,
) -> Result<(), ApiError> {
    let (hash, expiry) = purpose.stored(user);
    check_otp(hash, expiry, submitted, Utc::now())?;

    let user_id = user.id.clone();
    state.run_db(move |db| db.complete_otp(&user_id, purpose)).await
}

/// Count `sends` upcoming codes against the rolling 24 h limit. Either all
/// of them are logged or, when the limit would be passed, none are.
pub async fn reserve(state: &AppState, user_id: &str, sends: u32) -> Result<(), ApiError> {
    let now = Utc::now();
    let since = now - Duration::hours(OTP_WINDOW_HOURS);
    let uid = user_id.to_string();
    let allowed = state
        .run_db(move |db| db.try_record_otp_requests(&uid, now, since, MAX_OTP_REQUESTS, sends))
        .await?;
    if !allowed {
        return Err(ApiError::TooManyRequests(
            "Maximum 5 OTP requests allowed in 24 hours".into(),
        ));
    }
    Ok(())
}

/// Generate, store and deliver a fresh code for `purpose`.
/// Email and phone verification codes count toward the rate limit.
pub async fn issue(state: &AppState, user: &UserRow, purpose: OtpPurpose) -> Result<(), ApiError> {
    if purpose != OtpPurpose::PasswordReset {
        reserve(state, &user.id, 1).await?;
    }
    send(state, user, purpose).await
}

/// Store and deliver a code without touching the rate limit; callers that
/// need it go through `reserve` first.
pub async fn send(state: &AppState, user: &UserRow, purpose: OtpPurpose) -> Result<(), ApiError> {
    let otp = generate_otp();
    let hash = hash_otp(&otp);
    let expires_at = Utc::now() + Duration::minutes(OTP_TTL_MINUTES);
    let uid = user.id.clone();
    state
        .run_db(move |db| db.set_otp(&uid, purpose, &hash, expires_at))
        .await?;

    let delivered = match purpose {
        OtpPurpose::Email => {
            let (subject, html) = notify::verification_email(&user.username, &otp);
            state.mailer.send_email(&user.email, &subject, &html).await
        }
        OtpPurpose::PasswordReset => {
            let (subject, html) = notify::password_reset_email(&user.username, &otp);
            state.mailer.send_email(&user.email, &subject, &html).await
        }
        OtpPurpose::Phone => {
            let to = format!("{}{}", state.sms_country_code, user.contact);
            state.sms.send_sms(&to, &notify::verification_sms(&otp)).await
        }
    };

    match delivered {
        Ok(()) => {
            info!("{:?} OTP sent to user {}", purpose, user.id);
            Ok(())
        }
        Err(e) => {
            warn!("{:?} OTP delivery to user {} failed: {}", purpose, user.id, e);
            Err(ApiError::Internal(anyhow::anyhow!("OTP delivery failed: {}", e)))
        }
    }
}
