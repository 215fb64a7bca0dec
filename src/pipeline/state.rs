//! Player state management

use std::time::Instant;

/// Player lifecycle state machine
///
/// State transitions are validated so the presentation loop, the command
/// handlers and shutdown agree on what the player is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    /// Player is constructed but no input is open
    Idle,

    /// Queues are allocated and worker threads are starting
    Opening,

    /// Frames are being presented
    Playing {
        /// When playback started or last resumed
        started_at: Instant,
    },

    /// All clocks are frozen (can resume to Playing)
    Paused {
        /// When playback was paused
        paused_at: Instant,
    },

    /// Queues are aborted and threads are being joined
    Stopping,

    /// Playback ended; the player cannot be restarted
    Stopped,
}

impl PlayerState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &PlayerState) -> bool {
        use PlayerState::*;

        match (self, target) {
            (Idle, Opening) => true,

            (Opening, Playing { .. }) => true,
            (Opening, Paused { .. }) => true, // start paused
            (Opening, Stopping) => true,      // open failed

            (Playing { .. }, Paused { .. }) => true,
            (Playing { .. }, Stopping) => true,

            (Paused { .. }, Playing { .. }) => true,
            (Paused { .. }, Stopping) => true,

            (Stopping, Stopped) => true,

            (Stopped, _) => false,

            (a, b) if a == b => true,

            _ => false,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            PlayerState::Idle => "Idle",
            PlayerState::Opening => "Opening",
            PlayerState::Playing { .. } => "Playing",
            PlayerState::Paused { .. } => "Paused",
            PlayerState::Stopping => "Stopping",
            PlayerState::Stopped => "Stopped",
        }
    }

    /// Check if the player is presenting or paused
    pub fn is_active(&self) -> bool {
        matches!(self, PlayerState::Playing { .. } | PlayerState::Paused { .. })
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, PlayerState::Paused { .. })
    }

    /// Check if the player is stopped or stopping
    pub fn is_stopped(&self) -> bool {
        matches!(self, PlayerState::Stopped | PlayerState::Stopping)
    }

    /// Time spent playing since the last start or resume
    pub fn playing_duration(&self) -> Option<std::time::Duration> {
        if let PlayerState::Playing { started_at } = self {
            Some(started_at.elapsed())
        } else {
            None
        }
    }
}

impl std::fmt::Display for PlayerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        let now = Instant::now();
        let playing = PlayerState::Playing { started_at: now };
        let paused = PlayerState::Paused { paused_at: now };

        assert!(PlayerState::Idle.can_transition_to(&PlayerState::Opening));
        assert!(PlayerState::Opening.can_transition_to(&playing));
        assert!(PlayerState::Opening.can_transition_to(&paused));
        assert!(playing.can_transition_to(&paused));
        assert!(paused.can_transition_to(&playing));
        assert!(paused.can_transition_to(&PlayerState::Stopping));
        assert!(PlayerState::Stopping.can_transition_to(&PlayerState::Stopped));
        assert!(playing.can_transition_to(&playing));
    }

    #[test]
    fn test_invalid_transitions() {
        let playing = PlayerState::Playing {
            started_at: Instant::now(),
        };

        assert!(!PlayerState::Idle.can_transition_to(&playing)); // must open first
        assert!(!PlayerState::Idle.can_transition_to(&PlayerState::Stopped));
        assert!(!PlayerState::Stopped.can_transition_to(&PlayerState::Opening));
        assert!(!PlayerState::Stopped.can_transition_to(&PlayerState::Idle));
    }

    #[test]
    fn test_state_checks() {
        let paused = PlayerState::Paused {
            paused_at: Instant::now(),
        };
        assert!(paused.is_active());
        assert!(paused.is_paused());
        assert!(!paused.is_stopped());
        assert!(paused.playing_duration().is_none());
        assert!(PlayerState::Stopping.is_stopped());
        assert_eq!(PlayerState::Opening.to_string(), "Opening");
    }
}
