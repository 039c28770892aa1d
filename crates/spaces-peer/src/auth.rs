//! Auth state machine (spec §4.6): `loading -> {unauthenticated,
//! authenticated, error}`, `unauthenticated -> authenticated`.

use spaces_core::id::UserDid;
use tokio::sync::watch;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthState {
    Loading,
    Unauthenticated,
    Authenticated { user: UserDid },
    Error { message: String },
}

impl AuthState {
    pub fn user(&self) -> Option<&UserDid> {
        match self {
            Self::Authenticated { user } => Some(user),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated { .. })
    }

    /// Enforces the allowed-transition table in spec §4.6. `loading` may
    /// move anywhere; `unauthenticated` may only become `authenticated`;
    /// `authenticated` and `error` are terminal for this simple 3-state
    /// machine (a fresh login after `error` re-enters via `loading`).
    fn can_transition_to(&self, next: &AuthState) -> bool {
        match self {
            Self::Loading => true,
            Self::Unauthenticated => matches!(next, Self::Authenticated { .. }),
            Self::Authenticated { .. } | Self::Error { .. } => false,
        }
    }
}

/// Publishes [`AuthState`] changes to subscribers (the RPC surface pushes
/// these to the UI as reactive status, spec §4.8).
pub struct AuthCell {
    tx: watch::Sender<AuthState>,
}

impl AuthCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(AuthState::Loading);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.tx.subscribe()
    }

    pub fn get(&self) -> AuthState {
        self.tx.borrow().clone()
    }

    /// Applies `next` if the transition is legal; returns whether it took
    /// effect. Illegal transitions are silently refused rather than
    /// panicking — a stale restore racing a fresh login should not crash
    /// the peer.
    pub fn transition(&self, next: AuthState) -> bool {
        let allowed = self.tx.borrow().can_transition_to(&next);
        if allowed {
            let _ = self.tx.send(next);
        }
        allowed
    }
}

impl Default for AuthCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(s: &str) -> UserDid {
        s.parse().unwrap()
    }

    #[test]
    fn loading_moves_to_authenticated_directly() {
        let cell = AuthCell::new();
        assert!(cell.transition(AuthState::Authenticated { user: user("did:plc:abc") }));
        assert!(cell.get().is_authenticated());
    }

    #[test]
    fn unauthenticated_cannot_go_back_to_loading() {
        let cell = AuthCell::new();
        assert!(cell.transition(AuthState::Unauthenticated));
        assert!(!cell.transition(AuthState::Loading));
        assert_eq!(cell.get(), AuthState::Unauthenticated);
    }

    #[test]
    fn authenticated_is_terminal() {
        let cell = AuthCell::new();
        assert!(cell.transition(AuthState::Unauthenticated));
        assert!(cell.transition(AuthState::Authenticated { user: user("did:plc:abc") }));
        assert!(!cell.transition(AuthState::Unauthenticated));
    }
}
