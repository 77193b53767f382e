/// Session states and the legal transitions between them

use serde::{Deserialize, Serialize};

/// Pipeline position of a session. Declaration order is the total order
/// used for comparisons such as "already shutting down".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SessionState {
    #[default]
    NotReady,

    EngineSetupRequested,
    EngineSetupOk,
    EngineSetupFailed,
    EngineRunFailed,

    InferiorSetupRequested,
    InferiorSetupFailed,
    InferiorSetupOk,

    EngineRunRequested,
    InferiorRunRequested,
    InferiorRunOk,
    InferiorRunFailed,

    InferiorUnrunnable,

    InferiorStopRequested,
    InferiorStopOk,
    InferiorStopFailed,

    InferiorShutdownRequested,
    InferiorShutdownOk,
    InferiorShutdownFailed,

    EngineShutdownRequested,
    EngineShutdownOk,
    EngineShutdownFailed,

    Finished,
}

impl SessionState {
    pub const ALL: [SessionState; 23] = [
        SessionState::NotReady,
        SessionState::EngineSetupRequested,
        SessionState::EngineSetupOk,
        SessionState::EngineSetupFailed,
        SessionState::EngineRunFailed,
        SessionState::InferiorSetupRequested,
        SessionState::InferiorSetupFailed,
        SessionState::InferiorSetupOk,
        SessionState::EngineRunRequested,
        SessionState::InferiorRunRequested,
        SessionState::InferiorRunOk,
        SessionState::InferiorRunFailed,
        SessionState::InferiorUnrunnable,
        SessionState::InferiorStopRequested,
        SessionState::InferiorStopOk,
        SessionState::InferiorStopFailed,
        SessionState::InferiorShutdownRequested,
        SessionState::InferiorShutdownOk,
        SessionState::InferiorShutdownFailed,
        SessionState::EngineShutdownRequested,
        SessionState::EngineShutdownOk,
        SessionState::EngineShutdownFailed,
        SessionState::Finished,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            SessionState::NotReady => "NotReady",
            SessionState::EngineSetupRequested => "EngineSetupRequested",
            SessionState::EngineSetupOk => "EngineSetupOk",
            SessionState::EngineSetupFailed => "EngineSetupFailed",
            SessionState::EngineRunFailed => "EngineRunFailed",
            SessionState::InferiorSetupRequested => "InferiorSetupRequested",
            SessionState::InferiorSetupFailed => "InferiorSetupFailed",
            SessionState::InferiorSetupOk => "InferiorSetupOk",
            SessionState::EngineRunRequested => "EngineRunRequested",
            SessionState::InferiorRunRequested => "InferiorRunRequested",
            SessionState::InferiorRunOk => "InferiorRunOk",
            SessionState::InferiorRunFailed => "InferiorRunFailed",
            SessionState::InferiorUnrunnable => "InferiorUnrunnable",
            SessionState::InferiorStopRequested => "InferiorStopRequested",
            SessionState::InferiorStopOk => "InferiorStopOk",
            SessionState::InferiorStopFailed => "InferiorStopFailed",
            SessionState::InferiorShutdownRequested => "InferiorShutdownRequested",
            SessionState::InferiorShutdownOk => "InferiorShutdownOk",
            SessionState::InferiorShutdownFailed => "InferiorShutdownFailed",
            SessionState::EngineShutdownRequested => "EngineShutdownRequested",
            SessionState::EngineShutdownOk => "EngineShutdownOk",
            SessionState::EngineShutdownFailed => "EngineShutdownFailed",
            SessionState::Finished => "Finished",
        }
    }

    /// States reachable from `self` without a forced transition.
    pub fn legal_successors(self) -> &'static [SessionState] {
        use SessionState::*;
        match self {
            NotReady => &[EngineSetupRequested],

            EngineSetupRequested => &[EngineSetupOk, EngineSetupFailed],
            // The backend adapter must have torn itself down before
            // reporting a setup failure.
            EngineSetupFailed => &[Finished],
            EngineSetupOk => &[InferiorSetupRequested, EngineShutdownRequested],

            InferiorSetupRequested => &[InferiorSetupOk, InferiorSetupFailed],
            InferiorSetupFailed => &[EngineShutdownRequested],
            InferiorSetupOk => &[EngineRunRequested, InferiorShutdownRequested],

            EngineRunRequested => &[
                InferiorRunRequested,
                InferiorStopRequested,
                InferiorUnrunnable,
                EngineRunFailed,
            ],
            EngineRunFailed => &[InferiorShutdownRequested],

            InferiorRunRequested => &[InferiorRunOk, InferiorRunFailed],
            InferiorRunFailed => &[InferiorStopOk],
            InferiorRunOk => &[InferiorStopRequested, InferiorStopOk],

            InferiorStopRequested => &[InferiorStopOk, InferiorStopFailed],
            InferiorStopOk => &[InferiorRunRequested, InferiorShutdownRequested, InferiorStopOk],
            InferiorStopFailed => &[EngineShutdownRequested],

            InferiorUnrunnable => &[InferiorShutdownRequested],
            InferiorShutdownRequested => &[InferiorShutdownOk, InferiorShutdownFailed],
            InferiorShutdownOk => &[EngineShutdownRequested],
            InferiorShutdownFailed => &[EngineShutdownRequested],

            EngineShutdownRequested => &[EngineShutdownOk, EngineShutdownFailed],
            EngineShutdownOk => &[Finished],
            EngineShutdownFailed => &[Finished],

            // Restart.
            Finished => &[EngineSetupRequested],
        }
    }

    pub fn can_transition_to(self, to: SessionState) -> bool {
        self.legal_successors().contains(&to)
    }

    /// Whether the backend can safely take breakpoint edits in this state.
    pub fn accepts_breakpoint_changes(self) -> bool {
        matches!(
            self,
            SessionState::InferiorSetupRequested
                | SessionState::InferiorSetupOk
                | SessionState::EngineRunRequested
                | SessionState::InferiorRunOk
                | SessionState::InferiorStopOk
                | SessionState::InferiorUnrunnable
        )
    }

    /// Whether user-facing debugger actions should be enabled.
    pub fn debugger_actions_enabled(self) -> bool {
        matches!(
            self,
            SessionState::InferiorSetupRequested
                | SessionState::InferiorRunOk
                | SessionState::InferiorUnrunnable
                | SessionState::InferiorStopOk
        )
    }

    pub fn is_shutting_down(self) -> bool {
        self >= SessionState::InferiorShutdownRequested
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

pub fn is_allowed_transition(from: SessionState, to: SessionState) -> bool {
    from.can_transition_to(to)
}
