//! Authenticated identity used to join collaboration sessions.
//!
//! The supervisor never falls back to an anonymous session: an absent
//! identity or an absent credential is a hard precondition failure for
//! `connect()`.

use uuid::Uuid;

/// The caller's authenticated identity and session credential.
#[derive(Debug, Clone, PartialEq)]
pub struct UserIdentity {
    pub id: Uuid,
    pub name: String,
    /// CSS color token used by peers to render this user.
    pub color: String,
    pub avatar: Option<String>,
    /// Bearer credential presented to the collaboration server.
    pub token: Option<String>,
}

impl UserIdentity {
    /// Create an identity with a fresh id and a stable color derived from it.
    pub fn new(name: impl Into<String>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            name: name.into(),
            color: color_for(id),
            avatar: None,
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_avatar(mut self, url: impl Into<String>) -> Self {
        self.avatar = Some(url.into());
        self
    }
}

/// Stable, visually distinct color token derived from a user id.
///
/// Hue comes from the uuid hash; saturation and lightness are fixed so that
/// every user gets a vivid, readable color.
pub fn color_for(id: Uuid) -> String {
    let hue = (id.as_u128() % 360) as u16;
    format!("hsl({hue}, 70%, 60%)")
}

/// Source of the current authenticated identity.
///
/// Injected into the supervisor at construction so that the session layer
/// stays decoupled from however the embedding application manages auth.
pub trait IdentityProvider: Send + Sync {
    fn current(&self) -> Option<UserIdentity>;
}

/// Default provider holding a fixed identity (or none, when signed out).
pub struct StaticIdentity(Option<UserIdentity>);

impl StaticIdentity {
    pub fn signed_in(user: UserIdentity) -> Self {
        Self(Some(user))
    }

    pub fn signed_out() -> Self {
        Self(None)
    }
}

impl IdentityProvider for StaticIdentity {
    fn current(&self) -> Option<UserIdentity> {
        self.0.clone()
    }
}
