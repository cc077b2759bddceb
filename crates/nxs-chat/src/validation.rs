//! Sign-up form and username rules.

use crate::error::{ChatError, Result};
use crate::models::Gender;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

pub const MIN_PASSWORD_LEN: usize = 8;
pub const MIN_USERNAME_LEN: usize = 3;

static EMAIL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap());
static USERNAME_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9_.]+$").unwrap());

/// Raw sign-up input as typed.
#[derive(Debug, Clone, Default)]
pub struct SignUpForm {
    pub full_name: String,
    pub email: String,
    pub date_of_birth: String,
    pub gender: String,
    pub password: String,
    pub confirm_password: String,
}

/// A sign-up form that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidSignUp {
    pub full_name: String,
    pub email: String,
    pub date_of_birth: NaiveDate,
    pub gender: Gender,
    pub password: String,
}

/// One message per failing field, in form order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldErrors(pub Vec<(&'static str, String)>);

impl FieldErrors {
    fn push(&mut self, field: &'static str, message: impl Into<String>) {
        self.0.push((field, message.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, m)| m.as_str())
    }
}

impl std::fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{}: {}", k, v)).collect();
        write!(f, "{}", parts.join("; "))
    }
}

fn parse_gender(value: &str) -> Option<Gender> {
    match value.trim().to_lowercase().as_str() {
        "male" => Some(Gender::Male),
        "female" => Some(Gender::Female),
        "other" => Some(Gender::Other),
        _ => None,
    }
}

pub fn validate_password(password: &str) -> std::result::Result<(), String> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        ));
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        return Err("Password must contain an uppercase letter".to_string());
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err("Password must contain a number".to_string());
    }
    Ok(())
}

impl SignUpForm {
    pub fn validate(&self) -> std::result::Result<ValidSignUp, FieldErrors> {
        let mut errors = FieldErrors::default();

        let full_name = self.full_name.trim();
        if full_name.is_empty() {
            errors.push("full_name", "Full name is required");
        }

        let email = self.email.trim().to_lowercase();
        if email.is_empty() {
            errors.push("email", "Email is required");
        } else if !EMAIL_REGEX.is_match(&email) {
            errors.push("email", "Email is invalid");
        }

        let date_of_birth = if self.date_of_birth.trim().is_empty() {
            errors.push("date_of_birth", "Date of birth is required");
            None
        } else {
            match NaiveDate::parse_from_str(self.date_of_birth.trim(), "%Y-%m-%d") {
                Ok(d) => Some(d),
                Err(_) => {
                    errors.push("date_of_birth", "Date of birth must be YYYY-MM-DD");
                    None
                }
            }
        };

        let gender = parse_gender(&self.gender);
        if gender.is_none() {
            errors.push("gender", "Gender is required");
        }

        if let Err(message) = validate_password(&self.password) {
            errors.push("password", message);
        }
        if self.password != self.confirm_password {
            errors.push("confirm_password", "Passwords do not match");
        }

        match (date_of_birth, gender) {
            (Some(date_of_birth), Some(gender)) if errors.is_empty() => Ok(ValidSignUp {
                full_name: full_name.to_string(),
                email,
                date_of_birth,
                gender,
                password: self.password.clone(),
            }),
            _ => Err(errors),
        }
    }
}

/// Lowercase and check a username's shape.
pub fn normalize_username(raw: &str) -> Result<String> {
    let username = raw.trim().to_lowercase();
    if username.chars().count() < MIN_USERNAME_LEN {
        return Err(ChatError::validation(format!(
            "Username must be at least {} characters",
            MIN_USERNAME_LEN
        )));
    }
    if !USERNAME_REGEX.is_match(&username) {
        return Err(ChatError::validation(
            "Username may only contain letters, numbers, underscores and dots",
        ));
    }
    Ok(username)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form() -> SignUpForm {
        SignUpForm {
            full_name: "Ada Lovelace".into(),
            email: "Ada@Example.com".into(),
            date_of_birth: "1990-12-10".into(),
            gender: "female".into(),
            password: "Engine123".into(),
            confirm_password: "Engine123".into(),
        }
    }

    #[test]
    fn test_valid_form() {
        let valid = form().validate().unwrap();
        assert_eq!(valid.email, "ada@example.com");
        assert_eq!(valid.gender, Gender::Female);
        assert_eq!(valid.date_of_birth, NaiveDate::from_ymd_opt(1990, 12, 10).unwrap());
    }

    #[test]
    fn test_every_field_reports() {
        let errors = SignUpForm::default().validate().unwrap_err();
        for field in ["full_name", "email", "date_of_birth", "gender", "password"] {
            assert!(errors.get(field).is_some(), "missing error for {}", field);
        }
        // Both empty, so they match.
        assert!(errors.get("confirm_password").is_none());
    }

    #[test]
    fn test_password_rules() {
        assert!(validate_password("Short1").is_err());
        assert!(validate_password("nouppercase1").is_err());
        assert!(validate_password("NoDigitsHere").is_err());
        assert!(validate_password("Good1234").is_ok());

        let mut f = form();
        f.confirm_password = "Engine124".into();
        let errors = f.validate().unwrap_err();
        assert_eq!(errors.get("confirm_password"), Some("Passwords do not match"));
    }

    #[test]
    fn test_email_and_date_shapes() {
        let mut f = form();
        f.email = "not-an-email".into();
        f.date_of_birth = "10/12/1990".into();
        let errors = f.validate().unwrap_err();
        assert_eq!(errors.get("email"), Some("Email is invalid"));
        assert!(errors.get("date_of_birth").is_some());
        assert!(errors.to_string().contains("email: Email is invalid"));
    }

    #[test]
    fn test_username_rules() {
        assert_eq!(normalize_username("  Neo.One_ ").unwrap(), "neo.one_");
        assert!(normalize_username("ab").is_err());
        assert!(normalize_username("bad name").is_err());
        assert!(normalize_username("émile").is_err());
    }
}
