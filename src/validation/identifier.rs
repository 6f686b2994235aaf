//! Identifier validation.
//!
//! Table and column names are interpolated into SQL by the query compiler
//! and the sync statements, so every name is checked against a strict
//! grammar before it reaches a statement. Data values are always bound as
//! parameters and never pass through here.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{SyncError, SyncResult};

/// Maximum length for identifiers
pub const MAX_IDENTIFIER_LENGTH: usize = 255;

static IDENTIFIER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z_0-9]*$").unwrap());

/// Validate a table or column name.
///
/// # Rules
///
/// - Must not be empty
/// - Must not exceed 255 characters
/// - Must start with an ASCII letter or underscore
/// - May contain ASCII letters, digits and underscores
///
/// # Examples
///
/// ```
/// use table_sync::validation::identifier::validate_identifier;
///
/// assert!(validate_identifier("order_id").is_ok());
/// assert!(validate_identifier("1abc").is_err());
/// assert!(validate_identifier("a b").is_err());
/// ```
pub fn validate_identifier(name: &str) -> SyncResult<()> {
    if name.is_empty() {
        return Err(invalid(name, "identifier cannot be empty"));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(invalid(
            name,
            &format!(
                "exceeds maximum length (max: {MAX_IDENTIFIER_LENGTH}, got: {})",
                name.len()
            ),
        ));
    }

    if !IDENTIFIER_RE.is_match(name) {
        let reason = if name.starts_with(|c: char| c.is_ascii_digit()) {
            "must start with a letter or underscore"
        } else {
            "may only contain letters, digits and underscores"
        };
        return Err(invalid(name, reason));
    }

    Ok(())
}

/// Validate every name in `names`, stopping at the first failure
pub fn validate_identifiers<'a, I>(names: I) -> SyncResult<()>
where
    I: IntoIterator<Item = &'a String>,
{
    names.into_iter().try_for_each(|n| validate_identifier(n))
}

fn invalid(name: &str, reason: &str) -> SyncError {
    SyncError::InvalidIdentifier {
        identifier: name.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_identifiers() {
        assert!(validate_identifier("item").is_ok());
        assert!(validate_identifier("_private").is_ok());
        assert!(validate_identifier("Order2").is_ok());
    }

    #[test]
    fn test_invalid_identifiers() {
        for bad in ["", "1abc", "a b", "a-b", "a.b", "a;drop", "é"] {
            let err = validate_identifier(bad).unwrap_err();
            assert!(
                matches!(err, SyncError::InvalidIdentifier { .. }),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_too_long() {
        let name = "a".repeat(MAX_IDENTIFIER_LENGTH + 1);
        assert!(validate_identifier(&name).is_err());
        assert!(validate_identifier(&"a".repeat(MAX_IDENTIFIER_LENGTH)).is_ok());
    }

    #[test]
    fn test_match_is_anchored_at_end() {
        // a valid prefix followed by garbage must not pass
        assert!(validate_identifier("abc$").is_err());
    }
}
