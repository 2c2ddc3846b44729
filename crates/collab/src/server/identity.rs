//! Resolving who a connection belongs to.

use crate::ids::UserId;
use crate::message::UserJoinPayload;
use crate::presence::Identity;
use std::collections::HashMap;

/// Turns a `user-join` payload into a verified identity.
///
/// Implement this to plug in real authentication; the payload's optional
/// `token` is the credential.
#[trait_variant::make(Send)]
pub trait IdentityProvider: Send + Sync {
    /// Returns the identity to use, or a message explaining the refusal.
    async fn resolve(&self, join: &UserJoinPayload) -> Result<Identity, String>;
}

/// Accepts the claimed identity as-is. For trusted networks and tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct TrustedIdentityProvider;

impl IdentityProvider for TrustedIdentityProvider {
    async fn resolve(&self, join: &UserJoinPayload) -> Result<Identity, String> {
        if join.user_id.as_str().is_empty() {
            return Err("userId must not be empty".to_string());
        }
        Ok(Identity {
            user_id: join.user_id.clone(),
            display_name: join.display_name.clone(),
            color: join.color.clone(),
        })
    }
}

/// Maps bearer tokens to fixed identities.
#[derive(Clone, Debug, Default)]
pub struct TokenIdentityProvider {
    tokens: HashMap<String, Identity>,
}

impl TokenIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&mut self, token: impl Into<String>, user_id: UserId, display_name: impl Into<String>) {
        self.tokens
            .insert(token.into(), Identity::new(user_id, display_name));
    }
}

impl IdentityProvider for TokenIdentityProvider {
    async fn resolve(&self, join: &UserJoinPayload) -> Result<Identity, String> {
        let token = join.token.as_deref().ok_or("missing token")?;
        let mut identity = self.tokens.get(token).cloned().ok_or("invalid token")?;
        identity.color = join.color.clone();
        Ok(identity)
    }
}
