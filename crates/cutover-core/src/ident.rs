//! Identifier safety for generated SQL
//!
//! Dynamic tables are created and upserted with identifiers taken from
//! runbook specifications and query projections. Every such identifier must
//! match `^[A-Za-z0-9_]+$` before it is spliced into a statement; values are
//! always bound as parameters.

use crate::error::{CoreError, Result};

/// Whether `name` matches `^[A-Za-z0-9_]+$`.
pub fn is_safe_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Validate `name` for use as a table or column identifier.
pub fn ensure_safe_identifier(name: &str) -> Result<()> {
    if is_safe_identifier(name) {
        Ok(())
    } else {
        Err(CoreError::UnsafeIdentifier(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_plain_identifiers() {
        assert!(is_safe_identifier("user_id"));
        assert!(is_safe_identifier("Column2"));
        assert!(is_safe_identifier("_batch_time"));
    }

    #[test]
    fn test_rejects_injection_shapes() {
        assert!(!is_safe_identifier(""));
        assert!(!is_safe_identifier("user id"));
        assert!(!is_safe_identifier("users;drop table x"));
        assert!(!is_safe_identifier("a\"b"));
        assert!(!is_safe_identifier("naïve"));
    }

    #[test]
    fn test_ensure_returns_typed_error() {
        assert!(matches!(
            ensure_safe_identifier("bad name"),
            Err(CoreError::UnsafeIdentifier(_))
        ));
    }
}
