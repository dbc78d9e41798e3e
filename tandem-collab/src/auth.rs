//! Connection authentication.

use std::collections::HashMap;

use uuid::Uuid;

use crate::error::CollabError;
use crate::protocol::UserId;

/// Resolves handshake credentials to a user.
pub trait Authenticator: Send + Sync + 'static {
    fn authenticate(&self, token: &str) -> Result<UserId, CollabError>;
}

/// Fixed token table, typically loaded from `TANDEM_TOKENS`.
#[derive(Debug, Clone, Default)]
pub struct TokenAuthenticator {
    tokens: HashMap<String, UserId>,
}

impl TokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: UserId) -> Self {
        self.tokens.insert(token.into(), user_id);
        self
    }

    /// Parse `token=uuid,token=uuid`. Malformed entries are skipped.
    pub fn parse(table: &str) -> Self {
        let mut auth = Self::new();
        for entry in table.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let Some((token, user)) = entry.split_once('=') else {
                log::warn!("ignoring token entry without '='");
                continue;
            };
            match Uuid::parse_str(user.trim()) {
                Ok(user_id) => {
                    auth.tokens.insert(token.trim().to_string(), user_id);
                }
                Err(err) => log::warn!("ignoring token entry with invalid user id: {err}"),
            }
        }
        auth
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authenticator for TokenAuthenticator {
    fn authenticate(&self, token: &str) -> Result<UserId, CollabError> {
        self.tokens
            .get(token)
            .copied()
            .ok_or_else(|| CollabError::Authentication("unknown token".into()))
    }
}

/// Accepts every token, deriving a stable user id from it. For local
/// development only.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAuthenticator;

impl Authenticator for OpenAuthenticator {
    fn authenticate(&self, token: &str) -> Result<UserId, CollabError> {
        if token.is_empty() {
            return Err(CollabError::Authentication("empty token".into()));
        }
        Ok(Uuid::new_v5(&Uuid::NAMESPACE_OID, token.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_lookup() {
        let alice = Uuid::new_v4();
        let auth = TokenAuthenticator::new().with_token("secret", alice);
        assert_eq!(auth.authenticate("secret").unwrap(), alice);
        assert!(matches!(
            auth.authenticate("wrong"),
            Err(CollabError::Authentication(_))
        ));
    }

    #[test]
    fn test_parse_skips_bad_entries() {
        let a = Uuid::new_v4();
        let table = format!("alpha={a}, broken, beta=not-a-uuid,,");
        let auth = TokenAuthenticator::parse(&table);
        assert_eq!(auth.len(), 1);
        assert_eq!(auth.authenticate("alpha").unwrap(), a);
    }

    #[test]
    fn test_open_authenticator_is_stable() {
        let auth = OpenAuthenticator;
        assert_eq!(auth.authenticate("bob").unwrap(), auth.authenticate("bob").unwrap());
        assert_ne!(auth.authenticate("bob").unwrap(), auth.authenticate("eve").unwrap());
        assert!(auth.authenticate("").is_err());
    }
}
