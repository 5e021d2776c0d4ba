// Authentication configuration loaded from environment variables.

/// Authentication mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    /// No authentication required (local development)
    #[default]
    None,
    /// Bearer tokens mapped to admin/reader roles
    Token,
}

impl AuthMode {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "token" => AuthMode::Token,
            _ => AuthMode::None,
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub mode: AuthMode,
    /// Tokens authorized for write operations
    pub admin_tokens: Vec<String>,
    /// Tokens authorized for read operations
    pub reader_tokens: Vec<String>,
}

impl AuthConfig {
    /// Load from `CUTOVER_AUTH_MODE`, `CUTOVER_ADMIN_TOKENS`, and
    /// `CUTOVER_READER_TOKENS` (comma-separated).
    pub fn from_env() -> Self {
        let mode = std::env::var("CUTOVER_AUTH_MODE")
            .map(|s| AuthMode::from_str(&s))
            .unwrap_or_default();

        Self {
            mode,
            admin_tokens: split_tokens(std::env::var("CUTOVER_ADMIN_TOKENS").ok()),
            reader_tokens: split_tokens(std::env::var("CUTOVER_READER_TOKENS").ok()),
        }
    }
}

fn split_tokens(raw: Option<String>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!(AuthMode::from_str("token"), AuthMode::Token);
        assert_eq!(AuthMode::from_str("TOKEN"), AuthMode::Token);
        assert_eq!(AuthMode::from_str("none"), AuthMode::None);
        assert_eq!(AuthMode::from_str(""), AuthMode::None);
    }

    #[test]
    fn test_split_tokens() {
        assert_eq!(
            split_tokens(Some("a, b,,c".to_string())),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert!(split_tokens(None).is_empty());
    }
}
