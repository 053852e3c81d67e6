use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate, Utc};
use email_address::EmailAddress;
use regex::Regex;

use chatty_types::api::{FieldError, RegisterRequest};

use crate::error::ApiError;

static USERNAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_]{3,20}$").expect("valid username regex"));

static CONTACT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\+91)?[6-9]\d{9}$").expect("valid contact regex"));

const MIN_AGE_YEARS: i32 = 10;
const PASSWORD_SPECIALS: &str = "@$!%*?&";

/// Registration input after validation and normalisation.
#[derive(Debug)]
pub struct ValidRegistration {
    pub email: String,
    pub username: String,
    pub password: String,
    pub name: String,
    pub contact: String,
    pub date_of_birth: NaiveDate,
}

#[derive(Default)]
struct Errors(Vec<FieldError>);

impl Errors {
    fn check(&mut self, field: &str, result: Result<(), String>) {
        if let Err(message) = result {
            self.0.push(FieldError {
                field: field.to_string(),
                message,
            });
        }
    }

    fn finish(self) -> Result<(), ApiError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(ApiError::Validation(self.0))
        }
    }
}

pub fn validate_registration(req: &RegisterRequest) -> Result<ValidRegistration, ApiError> {
    let email = normalize_email(&req.email);
    let username = normalize_username(&req.username);
    let name = req.name.trim().to_string();

    let mut errors = Errors::default();
    errors.check("email", check_email(&email));
    errors.check("username", check_username(&username));
    errors.check("password", check_password(&req.password));
    errors.check("name", check_name(&name));
    let contact = normalize_contact(&req.contact);
    errors.check(
        "contact",
        contact.as_ref().map(|_| ()).map_err(Clone::clone),
    );
    let dob = parse_date_of_birth(&req.date_of_birth);
    errors.check("dateOfBirth", dob.as_ref().map(|_| ()).map_err(Clone::clone));
    errors.finish()?;

    Ok(ValidRegistration {
        email,
        username,
        password: req.password.clone(),
        name,
        contact: contact.map_err(ApiError::bad_request)?,
        date_of_birth: dob.map_err(ApiError::bad_request)?,
    })
}

/// Password policy as a single-field 422.
pub fn validate_password(field: &str, password: &str) -> Result<(), ApiError> {
    let mut errors = Errors::default();
    errors.check(field, check_password(password));
    errors.finish()
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub fn normalize_username(username: &str) -> String {
    username.trim().to_lowercase()
}

pub fn check_email(email: &str) -> Result<(), String> {
    if email.is_empty() {
        return Err("Email is required".into());
    }
    if !EmailAddress::is_valid(email) {
        return Err("Email is invalid".into());
    }
    Ok(())
}

pub fn check_username(username: &str) -> Result<(), String> {
    if username.is_empty() {
        return Err("Username is required".into());
    }
    if !USERNAME_RE.is_match(username) {
        return Err(
            "Username must be 3-20 characters of lowercase letters, digits or underscores".into(),
        );
    }
    Ok(())
}

pub fn check_name(name: &str) -> Result<(), String> {
    let len = name.chars().count();
    if !(2..=50).contains(&len) {
        return Err("Name must be between 2 and 50 characters".into());
    }
    Ok(())
}

pub fn check_password(password: &str) -> Result<(), String> {
    let strong = password.chars().count() >= 8
        && password.chars().any(|c| c.is_ascii_lowercase())
        && password.chars().any(|c| c.is_ascii_uppercase())
        && password.chars().any(|c| c.is_ascii_digit())
        && password.chars().any(|c| PASSWORD_SPECIALS.contains(c));
    if !strong {
        return Err(format!(
            "Password must be at least 8 characters with an uppercase letter, a lowercase letter, a number and one of {PASSWORD_SPECIALS}"
        ));
    }
    Ok(())
}

/// Accepts `9876543210` or `+919876543210`; stores the 10 national digits.
pub fn normalize_contact(contact: &str) -> Result<String, String> {
    let contact = contact.trim();
    if contact.is_empty() {
        return Err("Contact number is required".into());
    }
    if !CONTACT_RE.is_match(contact) {
        return Err("Contact number is invalid".into());
    }
    Ok(contact.trim_start_matches("+91").to_string())
}

pub fn parse_date_of_birth(raw: &str) -> Result<NaiveDate, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("Date of birth is required".into());
    }
    // Accept a bare date or a full ISO-8601 timestamp.
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| chrono::DateTime::parse_from_rfc3339(raw).map(|dt| dt.date_naive()))
        .map_err(|_| "Date of birth must be an ISO-8601 date".to_string())?;

    let today = Utc::now().date_naive();
    if date > today {
        return Err("Date of birth cannot be in the future".into());
    }
    if age_on(date, today) < MIN_AGE_YEARS {
        return Err(format!("You must be at least {MIN_AGE_YEARS} years old"));
    }
    Ok(date)
}

fn age_on(dob: NaiveDate, today: NaiveDate) -> i32 {
    let mut age = today.year() - dob.year();
    if (today.month(), today.day()) < (dob.month(), dob.day()) {
        age -= 1;
    }
    age
}
