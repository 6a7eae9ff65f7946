//! # Call Lifecycle States
//!
//! ```text
//! INITIATED ──► STREAMING ◄──► HUMAN_TAKEOVER
//!     │             │                │
//!     │             └──► ENDING ◄────┘
//!     │                    │
//!     └──────────────► ENDED ◄┘
//! ```
//!
//! `INITIATED → ENDED` is only taken when the AI leg never came up; every
//! other path into `ENDED` goes through `ENDING`.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallState {
    /// Telephony stream accepted, AI transport not connected yet
    Initiated,
    /// Both legs connected, audio relayed between caller and AI
    Streaming,
    /// Caller audio routed to a human operator, AI paused
    HumanTakeover,
    /// Termination requested, adapters shutting down
    Ending,
    /// Both adapters closed; terminal
    Ended,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Initiated => "INITIATED",
            CallState::Streaming => "STREAMING",
            CallState::HumanTakeover => "HUMAN_TAKEOVER",
            CallState::Ending => "ENDING",
            CallState::Ended => "ENDED",
        }
    }

    pub fn can_transition_to(self, next: CallState) -> bool {
        use CallState::*;
        matches!(
            (self, next),
            (Initiated, Streaming)
                | (Initiated, Ended)
                | (Streaming, HumanTakeover)
                | (Streaming, Ending)
                | (HumanTakeover, Streaming)
                | (HumanTakeover, Ending)
                | (Ending, Ended)
        )
    }

    /// Relay running (AI or human in control).
    pub fn is_active(self) -> bool {
        matches!(self, CallState::Streaming | CallState::HumanTakeover)
    }

    pub fn is_closing(self) -> bool {
        matches!(self, CallState::Ending | CallState::Ended)
    }

    pub fn is_terminal(self) -> bool {
        self == CallState::Ended
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a call ended. The first recorded reason wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    CallerHungUp,
    TelephonyDisconnected,
    AiUnavailable,
    OperatorEnded,
    AssistantEnded,
    MaxDurationReached,
    Shutdown,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::CallerHungUp => "caller_hung_up",
            EndReason::TelephonyDisconnected => "telephony_disconnected",
            EndReason::AiUnavailable => "ai_unavailable",
            EndReason::OperatorEnded => "operator_ended",
            EndReason::AssistantEnded => "assistant_ended",
            EndReason::MaxDurationReached => "max_duration_reached",
            EndReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CallState::*;

    const ALL: [CallState; 5] = [Initiated, Streaming, HumanTakeover, Ending, Ended];

    #[test]
    fn test_initiated_reaches_only_streaming_or_ended() {
        let reachable: Vec<_> = ALL
            .iter()
            .copied()
            .filter(|s| Initiated.can_transition_to(*s))
            .collect();
        assert_eq!(reachable, vec![Streaming, Ended]);
    }

    #[test]
    fn test_ended_is_terminal() {
        assert!(ALL.iter().all(|s| !Ended.can_transition_to(*s)));
        assert!(Ended.is_terminal());
    }

    #[test]
    fn test_no_active_state_skips_ending() {
        assert!(!Streaming.can_transition_to(Ended));
        assert!(!HumanTakeover.can_transition_to(Ended));
        assert!(Ending.can_transition_to(Ended));
    }

    #[test]
    fn test_every_state_reaches_ended() {
        // breadth-first over the transition relation
        for start in ALL {
            let mut seen = vec![start];
            let mut frontier = vec![start];
            while let Some(state) = frontier.pop() {
                for next in ALL {
                    if state.can_transition_to(next) && !seen.contains(&next) {
                        seen.push(next);
                        frontier.push(next);
                    }
                }
            }
            assert!(seen.contains(&Ended), "{} cannot reach ENDED", start);
        }
    }

    #[test]
    fn test_serialization_names() {
        assert_eq!(serde_json::to_string(&HumanTakeover).unwrap(), "\"HUMAN_TAKEOVER\"");
        assert_eq!(
            serde_json::to_string(&EndReason::AiUnavailable).unwrap(),
            "\"ai_unavailable\""
        );
    }
}
