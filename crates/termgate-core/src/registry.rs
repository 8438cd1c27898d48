//! Handoff registry: backend sessions parked under one-time tokens.
//!
//! A session connected on behalf of a client waits here until that client
//! opens its WebSocket and presents the token. Claims are honored once, and
//! only from the host that asked for the connection. Entries nobody claims
//! within the recycle delay are evicted by [`HandoffRegistry::sweep`], which
//! drops (and thereby closes) their sessions.
//!
//! The registry holds no lock of its own; every operation takes `&mut self`,
//! so whoever owns it decides how access is serialized.

use crate::addr::OriginAddr;
use crate::token::{generate_token, short_token};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// A session waiting to be claimed.
struct PendingEntry<S> {
    session: S,
    origin: OriginAddr,
    created_at: Instant,
}

/// Why a claim was refused. Only for logging; the requester just gets closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ClaimRejected {
    #[error("unknown or already claimed token")]
    UnknownToken,
    #[error("requester host does not match origin")]
    OriginMismatch,
}

/// Map from one-time token to pending backend session.
pub struct HandoffRegistry<S> {
    entries: HashMap<String, PendingEntry<S>>,
    recycle_delay: Duration,
}

impl<S> HandoffRegistry<S> {
    /// Create an empty registry whose entries live at most `recycle_delay`.
    pub fn new(recycle_delay: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            recycle_delay,
        }
    }

    /// Park `session` for `origin` and return its fresh token.
    pub fn register(&mut self, session: S, origin: OriginAddr) -> String {
        self.register_at(session, origin, Instant::now())
    }

    /// [`register`](Self::register) with an explicit creation time.
    pub fn register_at(&mut self, session: S, origin: OriginAddr, now: Instant) -> String {
        let mut token = generate_token();
        while self.entries.contains_key(&token) {
            token = generate_token();
        }

        info!(token = %short_token(&token), origin = %origin, "session parked");
        self.entries.insert(
            token.clone(),
            PendingEntry {
                session,
                origin,
                created_at: now,
            },
        );
        token
    }

    /// Take the session registered under `token`, if `requester` is on the
    /// same host as the one that registered it.
    ///
    /// A refused claim never modifies the registry: a mismatched requester
    /// cannot burn the token for its rightful owner.
    pub fn claim(&mut self, token: &str, requester: &OriginAddr) -> Result<S, ClaimRejected> {
        let entry = self.entries.get(token).ok_or(ClaimRejected::UnknownToken)?;

        if !entry.origin.same_host(requester) {
            warn!(
                token = %short_token(token),
                origin = %entry.origin,
                requester = %requester,
                "claim from foreign host refused"
            );
            return Err(ClaimRejected::OriginMismatch);
        }

        let entry = self
            .entries
            .remove(token)
            .ok_or(ClaimRejected::UnknownToken)?;
        debug!(
            token = %short_token(token),
            waited_ms = entry.created_at.elapsed().as_millis() as u64,
            "session claimed"
        );
        Ok(entry.session)
    }

    /// Evict every entry older than the recycle delay, closing its session.
    ///
    /// Returns the number of entries evicted.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let delay = self.recycle_delay;
        let before = self.entries.len();

        self.entries.retain(|token, entry| {
            let age = now.saturating_duration_since(entry.created_at);
            if age > delay {
                info!(
                    token = %short_token(token),
                    origin = %entry.origin,
                    age_ms = age.as_millis() as u64,
                    "recycling unclaimed session"
                );
                false
            } else {
                true
            }
        });

        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!(count = evicted, remaining = self.entries.len(), "sweep evicted sessions");
        }
        evicted
    }

    /// Close every pending session (process shutdown).
    pub fn drain(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub fn contains(&self, token: &str) -> bool {
        self.entries.contains_key(token)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Stand-in session that counts how often it was closed (dropped).
    struct Session {
        name: &'static str,
        closes: Arc<AtomicUsize>,
    }

    impl Drop for Session {
        fn drop(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn session(name: &'static str) -> (Session, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        (
            Session {
                name,
                closes: closes.clone(),
            },
            closes,
        )
    }

    fn addr(host: &str) -> OriginAddr {
        OriginAddr::new(host, Some(40000))
    }

    const DELAY: Duration = Duration::from_secs(3);

    #[test]
    fn claim_once() {
        let mut reg = HandoffRegistry::new(DELAY);
        let (a, _) = session("A");
        let token = reg.register(a, addr("10.0.0.5"));

        let claimed = reg.claim(&token, &addr("10.0.0.5")).unwrap();
        assert_eq!(claimed.name, "A");
        assert_eq!(
            reg.claim(&token, &addr("10.0.0.5")).err(),
            Some(ClaimRejected::UnknownToken)
        );
        assert!(reg.is_empty());
    }

    #[test]
    fn unknown_token_leaves_registry_untouched() {
        let mut reg = HandoffRegistry::new(DELAY);
        let (a, closes) = session("A");
        let token = reg.register(a, addr("10.0.0.5"));

        for bogus in ["", "deadbeef", "not-a-token"] {
            assert_eq!(
                reg.claim(bogus, &addr("10.0.0.5")).err(),
                Some(ClaimRejected::UnknownToken)
            );
        }
        assert_eq!(reg.len(), 1);
        assert!(reg.contains(&token));
        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn foreign_host_cannot_claim_or_burn() {
        let mut reg = HandoffRegistry::new(DELAY);
        let (a, closes) = session("A");
        let token = reg.register(a, addr("10.0.0.5"));

        assert_eq!(
            reg.claim(&token, &addr("10.0.0.6")).err(),
            Some(ClaimRejected::OriginMismatch)
        );
        assert!(reg.contains(&token));
        assert_eq!(closes.load(Ordering::SeqCst), 0);

        // Different port, same host: still the rightful owner.
        let owner = OriginAddr::new("10.0.0.5", Some(51234));
        assert_eq!(reg.claim(&token, &owner).unwrap().name, "A");
    }

    #[test]
    fn sweep_recycles_expired_entries_once() {
        let mut reg = HandoffRegistry::new(DELAY);
        let t0 = Instant::now();
        let (b, closes) = session("B");
        let token = reg.register_at(b, addr("10.0.0.9"), t0);

        assert_eq!(reg.sweep(t0 + DELAY + Duration::from_secs(1)), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(reg.claim(&token, &addr("10.0.0.9")).is_err());

        assert_eq!(reg.sweep(t0 + DELAY * 4), 0);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sweep_spares_fresh_entries() {
        let mut reg = HandoffRegistry::new(DELAY);
        let t0 = Instant::now();
        let (old, old_closes) = session("old");
        let (young, young_closes) = session("young");
        reg.register_at(old, addr("10.0.0.1"), t0);
        let young_token = reg.register_at(young, addr("10.0.0.2"), t0 + Duration::from_secs(2));

        // Exactly one delay old is not yet expired.
        assert_eq!(reg.sweep(t0 + DELAY), 0);
        assert_eq!(reg.sweep(t0 + DELAY + Duration::from_millis(1)), 1);
        assert_eq!(old_closes.load(Ordering::SeqCst), 1);
        assert_eq!(young_closes.load(Ordering::SeqCst), 0);
        assert!(reg.contains(&young_token));
    }

    #[test]
    fn claimed_session_is_not_closed_by_sweep() {
        let mut reg = HandoffRegistry::new(DELAY);
        let t0 = Instant::now();
        let (a, closes) = session("A");
        let token = reg.register_at(a, addr("10.0.0.5"), t0);
        let claimed = reg.claim(&token, &addr("10.0.0.5")).unwrap();

        assert_eq!(reg.sweep(t0 + DELAY * 10), 0);
        assert_eq!(closes.load(Ordering::SeqCst), 0);
        drop(claimed);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drain_closes_everything() {
        let mut reg = HandoffRegistry::new(DELAY);
        let (a, a_closes) = session("A");
        let (b, b_closes) = session("B");
        reg.register(a, addr("10.0.0.1"));
        reg.register(b, addr("10.0.0.2"));

        assert_eq!(reg.drain(), 2);
        assert!(reg.is_empty());
        assert_eq!(a_closes.load(Ordering::SeqCst), 1);
        assert_eq!(b_closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_have_one_winner() {
        let reg = Arc::new(tokio::sync::Mutex::new(HandoffRegistry::new(DELAY)));
        let (a, _) = session("A");
        let token = reg.lock().await.register(a, addr("10.0.0.5"));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let reg = reg.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                reg.lock().await.claim(&token, &addr("10.0.0.5")).is_ok()
            }));
        }

        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
