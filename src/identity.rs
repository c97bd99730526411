/// Source of the optional sign-in credential. Queried on every request so a
/// sign-in or sign-out applies to the next turn.
pub trait IdentityProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
    fn user_id(&self) -> Option<String>;
}

/// Signed-out user.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymous;

impl IdentityProvider for Anonymous {
    fn bearer_token(&self) -> Option<String> {
        None
    }

    fn user_id(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct StaticIdentity {
    pub token: String,
    pub user_id: String,
}

impl StaticIdentity {
    pub fn new(token: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            user_id: user_id.into(),
        }
    }
}

impl IdentityProvider for StaticIdentity {
    fn bearer_token(&self) -> Option<String> {
        Some(self.token.clone()).filter(|t| !t.is_empty())
    }

    fn user_id(&self) -> Option<String> {
        Some(self.user_id.clone()).filter(|id| !id.is_empty())
    }
}
