//! Credential gate between the session layer and the sync loops.
//!
//! The host hands in bearer credentials; the loops ask for the current one
//! before every provider call. An expired or rejected credential blocks the
//! loops until the host supplies a fresh one.

use chrono::{DateTime, Utc};
use driftsync_engine::Timestamp;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// A bearer credential scoped to one tenant.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub tenant: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("tenant", &self.tenant)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Credential {
    pub fn new(token: impl Into<String>, tenant: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            tenant: tenant.into(),
            expires_at: None,
        }
    }

    pub fn expiring_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Whether the credential has expired at `now` (milliseconds).
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        match (self.expires_at, DateTime::<Utc>::from_timestamp_millis(now as i64)) {
            (Some(expiry), Some(now)) => now >= expiry,
            _ => false,
        }
    }
}

/// Holder of the current credential.
#[derive(Debug)]
pub struct AuthGate {
    credential: watch::Sender<Option<Credential>>,
    blocked: AtomicBool,
}

impl Default for AuthGate {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthGate {
    pub fn new() -> Self {
        let (credential, _) = watch::channel(None);
        Self {
            credential,
            blocked: AtomicBool::new(false),
        }
    }

    /// Install a (refreshed) credential and lift any block.
    ///
    /// Returns `true` if the gate was blocked before.
    pub fn set(&self, credential: Credential) -> bool {
        self.credential.send_replace(Some(credential));
        let was_blocked = self.blocked.swap(false, Ordering::SeqCst);
        if was_blocked {
            tracing::info!("Fresh credential received, sync resumed");
        }
        was_blocked
    }

    /// Drop the credential (sign-out).
    pub fn clear(&self) {
        self.credential.send_replace(None);
    }

    /// The credential to use at `now`, if it is usable.
    ///
    /// An expired credential blocks the gate.
    pub fn current(&self, now: Timestamp) -> Option<Credential> {
        if self.is_blocked() {
            return None;
        }
        let credential = self.credential.borrow().clone()?;
        if credential.is_expired_at(now) {
            self.block("credential expired");
            return None;
        }
        Some(credential)
    }

    /// Block until [`AuthGate::set`] is called.
    ///
    /// Returns `true` only for the call that actually blocked the gate.
    pub fn block(&self, reason: &str) -> bool {
        let newly = !self.blocked.swap(true, Ordering::SeqCst);
        if newly {
            tracing::warn!(reason, "Sync blocked on authentication");
        }
        newly
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }

    /// Receiver that changes whenever a credential is set or cleared.
    pub fn watch(&self) -> watch::Receiver<Option<Credential>> {
        self.credential.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_credential_means_none() {
        let gate = AuthGate::new();
        assert!(gate.current(0).is_none());
        assert!(!gate.is_blocked());
    }

    #[test]
    fn expired_credential_blocks_until_refreshed() {
        let gate = AuthGate::new();
        let expiry = DateTime::<Utc>::from_timestamp_millis(10_000).unwrap();
        gate.set(Credential::new("t1", "acme").expiring_at(expiry));

        assert!(gate.current(5_000).is_some());
        assert!(gate.current(10_000).is_none());
        assert!(gate.is_blocked());

        assert!(gate.set(Credential::new("t2", "acme")));
        assert_eq!(gate.current(20_000).unwrap().token, "t2");
    }

    #[test]
    fn block_reports_only_the_transition() {
        let gate = AuthGate::new();
        assert!(gate.block("401"));
        assert!(!gate.block("401 again"));
    }

    #[test]
    fn debug_redacts_token() {
        let out = format!("{:?}", Credential::new("secret", "acme"));
        assert!(!out.contains("secret"));
    }

    #[tokio::test]
    async fn watch_sees_refresh() {
        let gate = AuthGate::new();
        let mut rx = gate.watch();
        gate.set(Credential::new("t", "acme"));
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_some());
    }
}
