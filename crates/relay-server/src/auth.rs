//! Identity verification for new sockets.
//!
//! The relay never parses credentials itself. The first frame's token is
//! handed to an [`IdentityVerifier`], which resolves it to a user.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use relay_core::UserId;
use thiserror::Error;

/// Why a socket failed to authenticate.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No authenticate frame within the configured timeout.
    #[error("authentication timed out")]
    Timeout,
    /// The socket closed before authenticating.
    #[error("socket closed before authentication")]
    Closed,
    /// The first frame was not an authenticate message.
    #[error("expected authenticate frame: {0}")]
    Malformed(String),
    /// The verifier did not accept the token.
    #[error("token rejected")]
    Rejected,
    /// The verifier itself failed.
    #[error("identity service unavailable: {0}")]
    Unavailable(String),
}

impl AuthError {
    /// Close-frame reason string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "authentication_timeout",
            Self::Closed => "client_closed",
            Self::Malformed(_) => "authentication_malformed",
            Self::Rejected => "authentication_rejected",
            Self::Unavailable(_) => "authentication_unavailable",
        }
    }
}

/// Resolves an opaque token to the user it belongs to.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Verify `token`.
    async fn verify(&self, token: &str) -> Result<UserId, AuthError>;
}

/// Fixed token → user table, for development and tests.
#[derive(Clone, Debug, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, UserId>,
}

impl StaticTokenVerifier {
    /// Verifier over `(token, user)` pairs.
    pub fn new<I, T, U>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (T, U)>,
        T: Into<String>,
        U: Into<UserId>,
    {
        Self {
            tokens: pairs
                .into_iter()
                .map(|(t, u)| (t.into(), u.into()))
                .collect(),
        }
    }

    /// Load a JSON object mapping tokens to user IDs.
    pub fn from_file(path: &Path) -> Result<Self, AuthError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AuthError::Unavailable(format!("{}: {e}", path.display())))?;
        let tokens: HashMap<String, String> = serde_json::from_str(&content)
            .map_err(|e| AuthError::Unavailable(format!("{}: {e}", path.display())))?;
        Ok(Self::new(tokens))
    }

    /// Number of known tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether no token is known.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl IdentityVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        self.tokens.get(token).cloned().ok_or(AuthError::Rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    #[tokio::test]
    async fn known_token_resolves_user() {
        let verifier = StaticTokenVerifier::new([("secret", "u1")]);
        assert_eq!(verifier.verify("secret").await.unwrap(), UserId::from("u1"));
    }

    #[tokio::test]
    async fn unknown_token_rejected() {
        let verifier = StaticTokenVerifier::new([("secret", "u1")]);
        assert_matches!(verifier.verify("guess").await, Err(AuthError::Rejected));
    }

    #[tokio::test]
    async fn loads_token_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"tok-a": "alice", "tok-b": "bob"}}"#).unwrap();
        let verifier = StaticTokenVerifier::from_file(file.path()).unwrap();
        assert_eq!(verifier.len(), 2);
        assert_eq!(verifier.verify("tok-b").await.unwrap(), UserId::from("bob"));
    }

    #[test]
    fn bad_token_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[1, 2]").unwrap();
        assert_matches!(
            StaticTokenVerifier::from_file(file.path()),
            Err(AuthError::Unavailable(_))
        );
    }
}
