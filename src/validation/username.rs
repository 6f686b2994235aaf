//! Username checks for audited writes

use crate::error::{SyncError, SyncResult};

/// Shared system accounts that do not identify a person
pub const REFUSED_USERNAMES: &[&str] = &["root", "ubuntu"];

/// Maximum username length
pub const MAX_USERNAME_LENGTH: usize = 128;

/// Validate the username a write is attributed to
pub fn validate_username(username: &str) -> SyncResult<()> {
    let reason = if username.trim().is_empty() {
        Some("username is required")
    } else if username.len() > MAX_USERNAME_LENGTH {
        Some("username is too long")
    } else if username.chars().any(char::is_control) {
        Some("username contains control characters")
    } else if REFUSED_USERNAMES.contains(&username.trim().to_lowercase().as_str()) {
        Some("shared system accounts cannot be audited")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(SyncError::InvalidUsername {
            username: username.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usernames() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("a.smith@example.org").is_ok());
        assert!(validate_username("").is_err());
        assert!(validate_username("   ").is_err());
        assert!(validate_username("root").is_err());
        assert!(validate_username("Ubuntu").is_err());
        assert!(validate_username("bad\nname").is_err());
    }
}
