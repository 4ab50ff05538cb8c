//! Password hashing and strength rules

use crate::core::auth::error::AuthError;

/// Minimum password length
pub const MIN_PASSWORD_LEN: usize = 8;

/// Hash a password with bcrypt
pub fn hash_password(password: &str, cost: u32) -> Result<String, AuthError> {
    bcrypt::hash(password, cost).map_err(|e| AuthError::Internal(e.to_string()))
}

/// Constant-time comparison against a bcrypt hash.
/// An unparseable hash never matches.
pub fn verify_password(password: &str, hash: &str) -> bool {
    match bcrypt::verify(password, hash) {
        Ok(valid) => valid,
        Err(e) => {
            tracing::warn!("Stored password hash unusable: {}", e);
            false
        }
    }
}

/// At least 8 characters with an uppercase letter, a lowercase letter and a digit
pub fn validate_password_strength(password: &str) -> Result<(), AuthError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthError::PasswordTooShort);
    }

    let has_uppercase = password.chars().any(|c| c.is_uppercase());
    let has_lowercase = password.chars().any(|c| c.is_lowercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());

    if !has_uppercase || !has_lowercase || !has_digit {
        return Err(AuthError::PasswordTooWeak);
    }

    Ok(())
}
