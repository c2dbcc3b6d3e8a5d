//! L3 — session authenticator (spec §4.4).
//!
//! The session secret is a weak, non-cryptographic access gate (spec
//! §9): `myfs-YYYYMMDD` where the date is the local date at session
//! start. It is never stored. The master secret is the real boundary
//! and is handled entirely by [`crate::volume`].

use chrono::NaiveDate;

use crate::error::{MyfsError, Result};

const SESSION_PREFIX: &str = "myfs-";
const SESSION_DATE_FMT: &str = "%Y%m%d";

/// `Closed → SessionOpen → VolumeOpen → Closed` (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    SessionOpen,
    VolumeOpen,
}

/// Validate a session secret against `today`. Caller supplies `today`
/// (normally `chrono::Local::now().date_naive()`) so the date source
/// is injectable in tests (spec P8).
pub fn validate_session_secret(secret: &str, today: NaiveDate) -> Result<()> {
    let date_part = secret.strip_prefix(SESSION_PREFIX).ok_or(MyfsError::AuthFailed)?;
    let parsed = NaiveDate::parse_from_str(date_part, SESSION_DATE_FMT).map_err(|_| MyfsError::AuthFailed)?;
    if parsed == today {
        Ok(())
    } else {
        Err(MyfsError::AuthFailed)
    }
}

/// Drives the `Closed → SessionOpen → VolumeOpen → Closed` state machine.
/// Holds no key material itself — callers pass the session explicitly
/// to every volume operation rather than relying on ambient authority
/// (spec §9).
pub struct Session {
    state: SessionState,
}

impl Session {
    pub fn new() -> Self {
        Session { state: SessionState::Closed }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// `Closed → SessionOpen`.
    pub fn open(&mut self, session_secret: &str, today: NaiveDate) -> Result<()> {
        if self.state != SessionState::Closed {
            return Err(MyfsError::InvalidInput("session already open".into()));
        }
        validate_session_secret(session_secret, today)?;
        self.state = SessionState::SessionOpen;
        Ok(())
    }

    /// `SessionOpen → VolumeOpen`. Called by [`crate::volume::Volume::open`]
    /// once the master secret, machine binding and table integrity have
    /// all checked out.
    pub fn mark_volume_open(&mut self) -> Result<()> {
        if self.state != SessionState::SessionOpen {
            return Err(MyfsError::InvalidInput("no open session to attach a volume to".into()));
        }
        self.state = SessionState::VolumeOpen;
        Ok(())
    }

    /// `VolumeOpen|SessionOpen → Closed`. Idempotent.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
