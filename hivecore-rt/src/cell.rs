//! The per-actor cell: identity, state slot, dirty flag, timestamps.
//!
//! A cell is owned by exactly one worker task for the actor's whole
//! lifetime, which is what makes every field here plain data: no locks
//! guard domain state, the single-writer discipline does.

// Layer 1: Standard library
// (none)

// Layer 2: Third-party
use chrono::{DateTime, Utc};

// Layer 3: Internal
// (none)

/// Lifecycle status of an actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ActorStatus {
    /// Created; state not yet loaded.
    Init = 0,
    /// Processing messages.
    Running = 1,
    /// Draining the mailbox ahead of shutdown; enqueues are rejected.
    Stopping = 2,
    /// Terminal.
    Stopped = 3,
}

impl ActorStatus {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Init,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }

    /// Whether new messages may still be enqueued.
    pub fn accepts_messages(&self) -> bool {
        matches!(self, Self::Init | Self::Running)
    }
}

/// Mutable actor interior handed to handlers.
pub struct ActorCell<S> {
    actor_id: String,
    state: Option<S>,
    dirty: bool,
    pub last_active: DateTime<Utc>,
    pub last_save: DateTime<Utc>,
}

impl<S> ActorCell<S> {
    pub(crate) fn new(actor_id: String) -> Self {
        let now = Utc::now();
        Self {
            actor_id,
            state: None,
            dirty: false,
            last_active: now,
            last_save: now,
        }
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    /// Read-only state access; `None` until the loader has produced one.
    pub fn state(&self) -> Option<&S> {
        self.state.as_ref()
    }

    /// Mutable state access; marks the actor dirty for the next flush.
    pub fn state_mut(&mut self) -> Option<&mut S> {
        if self.state.is_some() {
            self.dirty = true;
        }
        self.state.as_mut()
    }

    /// Install state (initial load or handler-created); marks dirty unless
    /// this is the load itself.
    pub fn set_state(&mut self, state: S) {
        self.state = Some(state);
        self.dirty = true;
    }

    pub(crate) fn install_loaded(&mut self, state: S) {
        self.state = Some(state);
        self.dirty = false;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Clear the dirty flag after a successful flush. Runs on the worker
    /// task, so no write can interleave between save and clear.
    pub(crate) fn mark_flushed(&mut self, at: DateTime<Utc>) {
        self.dirty = false;
        self.last_save = at;
    }

    pub(crate) fn touch(&mut self, at: DateTime<Utc>) {
        self.last_active = at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_accepts_messages() {
        assert!(ActorStatus::Init.accepts_messages());
        assert!(ActorStatus::Running.accepts_messages());
        assert!(!ActorStatus::Stopping.accepts_messages());
        assert!(!ActorStatus::Stopped.accepts_messages());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            ActorStatus::Init,
            ActorStatus::Running,
            ActorStatus::Stopping,
            ActorStatus::Stopped,
        ] {
            assert_eq!(ActorStatus::from_u8(status as u8), status);
        }
    }

    #[test]
    fn test_state_mut_marks_dirty() {
        let mut cell: ActorCell<u32> = ActorCell::new("a-1".to_string());
        assert!(!cell.is_dirty());
        cell.install_loaded(5);
        assert!(!cell.is_dirty());
        if let Some(state) = cell.state_mut() {
            *state = 6;
        }
        assert!(cell.is_dirty());
    }

    #[test]
    fn test_flush_clears_dirty() {
        let mut cell: ActorCell<u32> = ActorCell::new("a-1".to_string());
        cell.set_state(1);
        assert!(cell.is_dirty());
        cell.mark_flushed(Utc::now());
        assert!(!cell.is_dirty());
    }

    #[test]
    fn test_state_mut_on_unloaded_does_not_mark_dirty() {
        let mut cell: ActorCell<u32> = ActorCell::new("a-1".to_string());
        assert!(cell.state_mut().is_none());
        assert!(!cell.is_dirty());
    }
}
