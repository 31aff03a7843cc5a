//! Interfaces to the durable attendance log and the identity directory.
//!
//! Both live outside the recognition core. Implementations must make `open_session` and
//! `close_session` atomic with respect to the "one inside session per identity and date" rule.

use crate::types::{AttendanceSession, Identity, IdentityId};
use thiserror::Error;

/// Action label recorded when nothing classified the person's activity.
pub const DEFAULT_ACTION: &str = "Unknown";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no active session for identity {0}")]
    NoActiveSession(IdentityId),
    #[error("storage backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StoreError::Backend(Box::new(err))
    }
}

/// Durable log of attendance sessions.
pub trait AttendanceStore: Send + Sync {
    /// Open a new inside session, closing any earlier inside session for the identity.
    fn open_session(
        &self,
        identity_id: IdentityId,
        action: &str,
    ) -> Result<AttendanceSession, StoreError>;

    /// Close the identity's active inside session.
    fn close_session(&self, identity_id: IdentityId) -> Result<AttendanceSession, StoreError>;

    /// Whether the identity has an inside session today.
    fn is_inside(&self, identity_id: IdentityId) -> Result<bool, StoreError>;
}

/// Lookup of human-readable identity details.
pub trait IdentityDirectory: Send + Sync {
    /// `Ok(None)` when the id is unknown, e.g. a stale gallery entry.
    fn resolve(&self, identity_id: IdentityId) -> Result<Option<Identity>, StoreError>;
}
