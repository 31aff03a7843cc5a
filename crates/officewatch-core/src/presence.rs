//! Per-identity presence tracking.
//!
//! Turns frame-by-frame identity matches into entry/exit transitions. Each identity moves
//! Unseen -> Inside -> Exited -> Inside -> ... A match opens a session only from Unseen or
//! Exited; while Inside, matches only refresh `last_seen`. The periodic [`PresenceTracker::sweep`]
//! is the only path from Inside to Exited.
//!
//! One cooldown drives both the entry debounce and the absence-driven exit.
//!
//! State is in-memory and owned by a single monitoring run. It is not restored from the
//! attendance store on restart.

use crate::store::{AttendanceStore, StoreError, DEFAULT_ACTION};
use crate::types::{AttendanceSession, IdentityId};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Default cooldown: five minutes.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStatus {
    Inside,
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceState {
    /// Time of the most recent qualifying match.
    pub last_seen: DateTime<Utc>,
    pub status: PresenceStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    Entered,
    Exited,
}

/// A state change that was committed to the attendance store.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub kind: TransitionKind,
    pub identity_id: IdentityId,
    pub at: DateTime<Utc>,
    /// The session as persisted. `None` for an exit where the store had no open session left.
    pub session: Option<AttendanceSession>,
}

/// A transition that could not be persisted. The tracker state was left unchanged, so the
/// same transition is attempted again on the next opportunity.
#[derive(Error, Debug)]
pub enum PresenceError {
    #[error("failed to open session for identity {identity_id}: {source}")]
    OpenSession {
        identity_id: IdentityId,
        #[source]
        source: StoreError,
    },
    #[error("failed to close session for identity {identity_id}: {source}")]
    CloseSession {
        identity_id: IdentityId,
        #[source]
        source: StoreError,
    },
}

impl PresenceError {
    pub fn identity_id(&self) -> IdentityId {
        match self {
            PresenceError::OpenSession { identity_id, .. }
            | PresenceError::CloseSession { identity_id, .. } => *identity_id,
        }
    }
}

/// Per-identity session tracker.
#[derive(Debug)]
pub struct PresenceTracker {
    cooldown: Duration,
    states: BTreeMap<IdentityId, PresenceState>,
}

impl PresenceTracker {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            states: BTreeMap::new(),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn state(&self, identity_id: IdentityId) -> Option<&PresenceState> {
        self.states.get(&identity_id)
    }

    /// Identities currently considered inside.
    pub fn inside(&self) -> impl Iterator<Item = IdentityId> + '_ {
        self.states
            .iter()
            .filter(|(_, s)| s.status == PresenceStatus::Inside)
            .map(|(id, _)| *id)
    }

    /// Number of identities seen during this run.
    pub fn tracked(&self) -> usize {
        self.states.len()
    }

    /// Feed one qualifying match for `identity_id` observed at `now`.
    ///
    /// Returns the `Entered` transition when a session was opened, `None` when the match
    /// only refreshed an identity that is already inside.
    pub fn observe(
        &mut self,
        identity_id: IdentityId,
        now: DateTime<Utc>,
        store: &dyn AttendanceStore,
    ) -> Result<Option<Transition>, PresenceError> {
        if let Some(state) = self.states.get_mut(&identity_id) {
            if state.status == PresenceStatus::Inside {
                let since = elapsed(now, state.last_seen);
                if since < self.cooldown {
                    tracing::trace!(identity_id, ?since, "debounced repeat sighting");
                } else {
                    // Still inside: the exit sweep has not fired, so no new session.
                    tracing::debug!(identity_id, ?since, "sparse sighting of identity already inside");
                }
                state.last_seen = now;
                return Ok(None);
            }
        }

        let reentry = self.states.contains_key(&identity_id);
        let session = store
            .open_session(identity_id, DEFAULT_ACTION)
            .map_err(|source| PresenceError::OpenSession {
                identity_id,
                source,
            })?;

        self.states.insert(
            identity_id,
            PresenceState {
                last_seen: now,
                status: PresenceStatus::Inside,
            },
        );
        tracing::debug!(identity_id, session = session.id, reentry, "session opened");

        Ok(Some(Transition {
            kind: TransitionKind::Entered,
            identity_id,
            at: now,
            session: Some(session),
        }))
    }

    /// Close the session of every inside identity unseen for longer than the cooldown.
    ///
    /// Runs once per tick whether or not anything was matched. Identities whose close
    /// failed stay inside and are retried by the next sweep.
    pub fn sweep(
        &mut self,
        now: DateTime<Utc>,
        store: &dyn AttendanceStore,
    ) -> Vec<Result<Transition, PresenceError>> {
        let cooldown = self.cooldown;
        let stale: Vec<IdentityId> = self
            .states
            .iter()
            .filter(|(_, s)| {
                s.status == PresenceStatus::Inside && elapsed(now, s.last_seen) > cooldown
            })
            .map(|(id, _)| *id)
            .collect();

        let mut results = Vec::with_capacity(stale.len());
        for identity_id in stale {
            let session = match store.close_session(identity_id) {
                Ok(session) => Some(session),
                Err(StoreError::NoActiveSession(_)) => {
                    // Closed elsewhere; nothing left to persist.
                    tracing::warn!(identity_id, "no open session to close; marking exited");
                    None
                }
                Err(source) => {
                    results.push(Err(PresenceError::CloseSession {
                        identity_id,
                        source,
                    }));
                    continue;
                }
            };

            if let Some(state) = self.states.get_mut(&identity_id) {
                state.status = PresenceStatus::Exited;
            }
            results.push(Ok(Transition {
                kind: TransitionKind::Exited,
                identity_id,
                at: now,
                session,
            }));
        }
        results
    }
}

/// Wall-clock time between two instants. A clock step backwards counts as no time passing.
fn elapsed(now: DateTime<Utc>, then: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionStatus;
    use chrono::{NaiveDate, TimeZone};
    use std::sync::Mutex;

    /// In-memory store enforcing one inside session per identity.
    #[derive(Default)]
    struct MemoryStore {
        sessions: Mutex<Vec<AttendanceSession>>,
        fail_writes: Mutex<bool>,
    }

    impl MemoryStore {
        fn set_failing(&self, failing: bool) {
            *self.fail_writes.lock().unwrap() = failing;
        }

        fn sessions(&self) -> Vec<AttendanceSession> {
            self.sessions.lock().unwrap().clone()
        }

        fn check_failing(&self) -> Result<(), StoreError> {
            if *self.fail_writes.lock().unwrap() {
                return Err(StoreError::backend(std::io::Error::other("database is locked")));
            }
            Ok(())
        }
    }

    impl AttendanceStore for MemoryStore {
        fn open_session(&self, identity_id: IdentityId, action: &str) -> Result<AttendanceSession, StoreError> {
            self.check_failing()?;
            let mut sessions = self.sessions.lock().unwrap();
            let now = Utc::now();
            for s in sessions.iter_mut() {
                if s.identity_id == identity_id && s.status == SessionStatus::Inside {
                    s.status = SessionStatus::Exited;
                    s.exit_time = Some(now);
                }
            }
            let session = AttendanceSession {
                id: sessions.len() as i64 + 1,
                identity_id,
                entry_time: now,
                exit_time: None,
                status: SessionStatus::Inside,
                date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
                action: action.to_string(),
            };
            sessions.push(session.clone());
            Ok(session)
        }

        fn close_session(&self, identity_id: IdentityId) -> Result<AttendanceSession, StoreError> {
            self.check_failing()?;
            let mut sessions = self.sessions.lock().unwrap();
            let s = sessions
                .iter_mut()
                .find(|s| s.identity_id == identity_id && s.status == SessionStatus::Inside)
                .ok_or(StoreError::NoActiveSession(identity_id))?;
            s.status = SessionStatus::Exited;
            s.exit_time = Some(Utc::now());
            Ok(s.clone())
        }

        fn is_inside(&self, identity_id: IdentityId) -> Result<bool, StoreError> {
            Ok(self
                .sessions
                .lock()
                .unwrap()
                .iter()
                .any(|s| s.identity_id == identity_id && s.status == SessionStatus::Inside))
        }
    }

    fn t(minutes: i64, seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
            + chrono::TimeDelta::minutes(minutes)
            + chrono::TimeDelta::seconds(seconds)
    }

    fn entered(results: &[Option<Transition>]) -> usize {
        results
            .iter()
            .flatten()
            .filter(|t| t.kind == TransitionKind::Entered)
            .count()
    }

    #[test]
    fn test_first_sighting_opens_session() {
        let store = MemoryStore::default();
        let mut tracker = PresenceTracker::new(DEFAULT_COOLDOWN);

        let tr = tracker.observe(1, t(0, 0), &store).unwrap().unwrap();
        assert_eq!(tr.kind, TransitionKind::Entered);
        assert_eq!(tr.identity_id, 1);
        assert_eq!(tr.session.as_ref().unwrap().action, DEFAULT_ACTION);
        assert_eq!(tracker.state(1).unwrap().status, PresenceStatus::Inside);
        assert!(store.is_inside(1).unwrap());
    }

    #[test]
    fn test_continuous_sightings_debounced() {
        let store = MemoryStore::default();
        let mut tracker = PresenceTracker::new(DEFAULT_COOLDOWN);

        // Seen every second for four minutes.
        let mut results = Vec::new();
        for s in 0..240 {
            let now = t(0, s);
            results.push(tracker.observe(1, now, &store).unwrap());
            assert!(tracker.sweep(now, &store).is_empty());
        }
        assert_eq!(entered(&results), 1);
        assert_eq!(store.sessions().len(), 1);
        assert_eq!(tracker.state(1).unwrap().last_seen, t(0, 239));
    }

    #[test]
    fn test_sparse_sighting_while_inside_only_refreshes() {
        let store = MemoryStore::default();
        let mut tracker = PresenceTracker::new(DEFAULT_COOLDOWN);

        tracker.observe(1, t(0, 0), &store).unwrap();
        // Past the cooldown, but no sweep ran in between.
        let tr = tracker.observe(1, t(6, 0), &store).unwrap();
        assert!(tr.is_none());
        assert_eq!(tracker.state(1).unwrap().last_seen, t(6, 0));
        assert_eq!(store.sessions().len(), 1);
    }

    #[test]
    fn test_sweep_waits_for_cooldown() {
        let store = MemoryStore::default();
        let mut tracker = PresenceTracker::new(DEFAULT_COOLDOWN);

        tracker.observe(1, t(0, 0), &store).unwrap();
        assert!(tracker.sweep(t(4, 59), &store).is_empty());
        // Exactly the cooldown is not yet "longer than" the cooldown.
        assert!(tracker.sweep(t(5, 0), &store).is_empty());
        let results = tracker.sweep(t(5, 1), &store);
        assert_eq!(results.len(), 1);
        let tr = results[0].as_ref().unwrap();
        assert_eq!(tr.kind, TransitionKind::Exited);
        assert_eq!(tracker.state(1).unwrap().status, PresenceStatus::Exited);
        assert!(!store.is_inside(1).unwrap());
    }

    #[test]
    fn test_reentry_after_exit() {
        let store = MemoryStore::default();
        let mut tracker = PresenceTracker::new(DEFAULT_COOLDOWN);

        let mut events = vec![tracker.observe(1, t(0, 0), &store).unwrap()];
        let exits = tracker.sweep(t(5, 1), &store);
        assert_eq!(exits.len(), 1);
        // Re-entry is immediate once exited, regardless of elapsed time.
        events.push(tracker.observe(1, t(5, 2), &store).unwrap());

        assert_eq!(entered(&events), 2);
        let sessions = store.sessions();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].status, SessionStatus::Exited);
        assert_eq!(sessions[1].status, SessionStatus::Inside);
    }

    #[test]
    fn test_office_day_scenario() {
        let store = MemoryStore::default();
        let mut tracker = PresenceTracker::new(Duration::from_secs(5 * 60));
        let mut entered_events = 0;
        let mut exits = 0;

        // 0:00 A seen at distance 0.30.
        if tracker.observe(7, t(0, 0), &store).unwrap().is_some() {
            entered_events += 1;
        }
        tracker.sweep(t(0, 0), &store);
        // 0:01 A seen again at 0.28.
        assert!(tracker.observe(7, t(1, 0), &store).unwrap().is_none());
        assert!(tracker.sweep(t(1, 0), &store).is_empty());
        // 0:07 nothing seen since 0:01.
        for r in tracker.sweep(t(7, 0), &store) {
            assert_eq!(r.unwrap().kind, TransitionKind::Exited);
            exits += 1;
        }
        // 0:12 A seen at 0.31.
        if tracker.observe(7, t(12, 0), &store).unwrap().is_some() {
            entered_events += 1;
        }

        assert_eq!(entered_events, 2);
        assert_eq!(exits, 1);
        assert_eq!(store.sessions().len(), 2);
    }

    #[test]
    fn test_never_two_inside_sessions() {
        let store = MemoryStore::default();
        let mut tracker = PresenceTracker::new(Duration::from_secs(10));

        for step in 0..200i64 {
            let now = t(0, step);
            // Seen in bursts: 5 ticks on, 15 ticks off.
            if step % 20 < 5 {
                tracker.observe(1, now, &store).unwrap();
            }
            for r in tracker.sweep(now, &store) {
                r.unwrap();
            }
            let inside = store
                .sessions()
                .iter()
                .filter(|s| s.identity_id == 1 && s.status == SessionStatus::Inside)
                .count();
            assert!(inside <= 1, "step {step}: {inside} inside sessions");
        }
    }

    #[test]
    fn test_failed_open_does_not_advance_state() {
        let store = MemoryStore::default();
        let mut tracker = PresenceTracker::new(DEFAULT_COOLDOWN);

        store.set_failing(true);
        let err = tracker.observe(1, t(0, 0), &store).unwrap_err();
        assert!(matches!(err, PresenceError::OpenSession { identity_id: 1, .. }));
        assert!(tracker.state(1).is_none());

        // Retried on the next sighting once the store recovers.
        store.set_failing(false);
        let tr = tracker.observe(1, t(0, 1), &store).unwrap();
        assert!(tr.is_some());
        assert_eq!(store.sessions().len(), 1);
    }

    #[test]
    fn test_failed_close_is_retried() {
        let store = MemoryStore::default();
        let mut tracker = PresenceTracker::new(DEFAULT_COOLDOWN);
        tracker.observe(1, t(0, 0), &store).unwrap();

        store.set_failing(true);
        let results = tracker.sweep(t(6, 0), &store);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap_err().identity_id(), 1);
        assert_eq!(tracker.state(1).unwrap().status, PresenceStatus::Inside);

        store.set_failing(false);
        let results = tracker.sweep(t(6, 1), &store);
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());
        assert_eq!(tracker.state(1).unwrap().status, PresenceStatus::Exited);
        // Nothing left to sweep.
        assert!(tracker.sweep(t(20, 0), &store).is_empty());
    }

    #[test]
    fn test_missing_session_still_exits() {
        let store = MemoryStore::default();
        let mut tracker = PresenceTracker::new(DEFAULT_COOLDOWN);
        tracker.observe(1, t(0, 0), &store).unwrap();
        store.close_session(1).unwrap();

        let results = tracker.sweep(t(6, 0), &store);
        let tr = results[0].as_ref().unwrap();
        assert_eq!(tr.kind, TransitionKind::Exited);
        assert!(tr.session.is_none());
        assert_eq!(tracker.state(1).unwrap().status, PresenceStatus::Exited);
    }

    #[test]
    fn test_sweep_covers_unmatched_identities() {
        let store = MemoryStore::default();
        let mut tracker = PresenceTracker::new(DEFAULT_COOLDOWN);
        tracker.observe(1, t(0, 0), &store).unwrap();
        tracker.observe(2, t(3, 0), &store).unwrap();

        let results = tracker.sweep(t(6, 0), &store);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap().identity_id, 1);
        assert_eq!(tracker.inside().collect::<Vec<_>>(), vec![2]);
        assert_eq!(tracker.tracked(), 2);
    }

    #[test]
    fn test_clock_step_backwards_counts_as_fresh() {
        let store = MemoryStore::default();
        let mut tracker = PresenceTracker::new(DEFAULT_COOLDOWN);
        tracker.observe(1, t(10, 0), &store).unwrap();
        assert!(tracker.sweep(t(0, 0), &store).is_empty());
    }
}
