/// Request validation
///
/// Each request body declares its field rules with `validator` derives. Rules
/// that span fields (password confirmation) go through `RequestRules`. Both
/// run before any handler touches the store.
use crate::error::{AuthError, AuthResult, FieldError};
use std::borrow::Cow;
use validator::{Validate, ValidationError, ValidationErrors};

pub const USERNAME_MIN: usize = 3;
pub const USERNAME_MAX: usize = 30;
pub const PASSWORD_MIN: usize = 8;
pub const PASSWORD_MAX: usize = 128;

/// Field rules plus any cross-field checks
pub trait RequestRules: Validate {
    fn cross_field(&self) -> Vec<FieldError> {
        Vec::new()
    }
}

/// Run every rule for a request and collect field-level messages
pub fn validate_request<T: RequestRules>(request: &T) -> AuthResult<()> {
    let mut fields = match request.validate() {
        Ok(()) => Vec::new(),
        Err(errors) => flatten(&errors),
    };
    fields.extend(request.cross_field());

    if fields.is_empty() {
        return Ok(());
    }

    fields.sort_by(|a, b| a.field.cmp(&b.field));
    Err(AuthError::Validation {
        message: "Request validation failed".to_string(),
        fields,
    })
}

fn flatten(errors: &ValidationErrors) -> Vec<FieldError> {
    errors
        .field_errors()
        .into_iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |e| FieldError {
                field: camel_case(&field),
                message: e
                    .message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| format!("Invalid value ({})", e.code)),
            })
        })
        .collect()
}

/// Field names are reported the way clients send them
fn camel_case(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut upper = false;
    for c in field.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Emails are compared and stored trimmed and lower-cased
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn invalid(code: &'static str, message: &'static str) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.message = Some(Cow::Borrowed(message));
    err
}

/// Letters, digits, underscore and hyphen; must start with a letter or digit
pub fn validate_username(username: &str) -> Result<(), ValidationError> {
    let len = username.chars().count();
    if !(USERNAME_MIN..=USERNAME_MAX).contains(&len) {
        return Err(invalid(
            "username_length",
            "Username must be between 3 and 30 characters",
        ));
    }

    let mut chars = username.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !first_ok || !rest_ok {
        return Err(invalid(
            "username_format",
            "Username may only contain letters, numbers, underscores and hyphens",
        ));
    }

    Ok(())
}

/// At least 8 characters with upper, lower, digit and symbol
pub fn validate_password_strength(password: &str) -> Result<(), ValidationError> {
    let len = password.chars().count();
    if len < PASSWORD_MIN {
        return Err(invalid(
            "password_length",
            "Password must be at least 8 characters",
        ));
    }
    if len > PASSWORD_MAX {
        return Err(invalid(
            "password_length",
            "Password must be at most 128 characters",
        ));
    }

    let has_upper = password.chars().any(|c| c.is_uppercase());
    let has_lower = password.chars().any(|c| c.is_lowercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    let has_symbol = password
        .chars()
        .any(|c| !c.is_alphanumeric() && !c.is_whitespace());

    if !(has_upper && has_lower && has_digit && has_symbol) {
        return Err(invalid(
            "password_strength",
            "Password must contain an uppercase letter, a lowercase letter, a number and a symbol",
        ));
    }

    Ok(())
}

pub fn validate_accept_terms(accepted: &bool) -> Result<(), ValidationError> {
    if *accepted {
        Ok(())
    } else {
        Err(invalid("terms", "You must accept the terms and conditions"))
    }
}

/// Confirmation field must repeat the password exactly
pub fn confirmation_mismatch(password: &str, confirmation: &str, field: &str) -> Option<FieldError> {
    (password != confirmation).then(|| FieldError {
        field: field.to_string(),
        message: "Passwords do not match".to_string(),
    })
}
