//! Player lifecycle bookkeeping.
//!
//! [`Lifecycle`] holds the current [`PlayerState`] and answers the guard questions the
//! control surface asks before acting. It does no locking of its own; the player keeps
//! it inside its state mutex.

use skyplayer_types::PlayerState;

#[derive(Debug, Default)]
pub struct Lifecycle {
    state: PlayerState,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    /// Move to `next`. Returns `true` only if the state actually changed.
    pub fn transition(&mut self, next: PlayerState) -> bool {
        if self.state == next {
            return false;
        }
        tracing::info!(from = %self.state, to = %next, "player state");
        self.state = next;
        true
    }

    pub fn can_set_source(&self) -> bool {
        matches!(self.state, PlayerState::Idle | PlayerState::Initialized)
    }

    pub fn can_prepare(&self) -> bool {
        matches!(self.state, PlayerState::Initialized | PlayerState::Stopped)
    }

    pub fn can_start(&self) -> bool {
        matches!(self.state, PlayerState::Prepared | PlayerState::Paused)
    }

    pub fn can_pause(&self) -> bool {
        self.state == PlayerState::Started
    }

    pub fn can_seek(&self) -> bool {
        matches!(self.state, PlayerState::Started | PlayerState::Paused)
    }

    pub fn can_stop(&self) -> bool {
        matches!(
            self.state,
            PlayerState::Prepared | PlayerState::Started | PlayerState::Paused | PlayerState::Completed
        )
    }

    /// Engine completion is only meaningful once something could have played.
    pub fn can_complete(&self) -> bool {
        matches!(
            self.state,
            PlayerState::Prepared | PlayerState::Started | PlayerState::Paused
        )
    }

    /// Prepared counts as playing for hosts that poll right after preparing.
    pub fn is_playing(&self) -> bool {
        matches!(self.state, PlayerState::Prepared | PlayerState::Started)
    }

    pub fn is_released(&self) -> bool {
        self.state == PlayerState::End
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(state: PlayerState) -> Lifecycle {
        let mut l = Lifecycle::new();
        l.transition(state);
        l
    }

    #[test]
    fn same_state_transition_reports_no_change() {
        let mut l = Lifecycle::new();
        assert!(!l.transition(PlayerState::Idle));
        assert!(l.transition(PlayerState::Initialized));
        assert!(!l.transition(PlayerState::Initialized));
    }

    #[test]
    fn start_guard() {
        assert!(!at(PlayerState::Idle).can_start());
        assert!(at(PlayerState::Prepared).can_start());
        assert!(at(PlayerState::Paused).can_start());
        assert!(!at(PlayerState::Started).can_start());
        assert!(!at(PlayerState::Error).can_start());
    }

    #[test]
    fn pause_and_seek_guards() {
        assert!(at(PlayerState::Started).can_pause());
        assert!(!at(PlayerState::Paused).can_pause());
        assert!(at(PlayerState::Paused).can_seek());
        assert!(!at(PlayerState::Prepared).can_seek());
        assert!(!at(PlayerState::Completed).can_seek());
    }

    #[test]
    fn completion_guard() {
        assert!(at(PlayerState::Started).can_complete());
        assert!(!at(PlayerState::Idle).can_complete());
        assert!(!at(PlayerState::Completed).can_complete());
    }

    #[test]
    fn playing_includes_prepared() {
        assert!(at(PlayerState::Prepared).is_playing());
        assert!(at(PlayerState::Started).is_playing());
        assert!(!at(PlayerState::Paused).is_playing());
    }
}
