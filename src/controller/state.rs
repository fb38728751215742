//! Runnable controller states, transitions and method writeability.
//!
//! # State Machine
//!
//! ```text
//!                 reset                 configure               run
//! Fault|Disabled|Aborted ──▶ Resetting ──▶ Ready ──▶ Configuring ──▶ Armed ──▶ Running
//!                                            ▲                        ▲ │         │
//!                                            │           more steps   │ │ pause   │
//!                                            │◀── PostRun ────────────┘ ▼         │
//!                                            │      ▲               Seeking ◀─────┤
//!                                            │      └─────────────────── │ ───────┘
//!                                            │                  Paused ◀─┘
//!                                            │
//!          Ready|Editable ──▶ Saving ──▶ Ready      Editable ──▶ Reverting ──▶ Ready
//!
//! any abortable state ──▶ Aborting ──▶ Aborted        any state ──▶ Disabled
//! ```

use serde::{Deserialize, Serialize};

/// State of a runnable controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunnableState {
    /// Switched off; only reset and disable are accepted
    Disabled,
    /// A hook failed; waits for reset
    Fault,
    /// Idle and ready to configure
    Ready,
    /// Running Configure hooks
    Configuring,
    /// Configured and ready to run
    Armed,
    /// Running Run or Resume hooks
    Running,
    /// Running PostRunArmed or PostRunReady hooks
    PostRun,
    /// Paused at a known step, waiting for resume
    Paused,
    /// Repositioning after a pause request
    Seeking,
    /// Running Abort hooks
    Aborting,
    /// Aborted; waits for reset
    Aborted,
    /// Returning to Ready
    Resetting,
    /// Layout and exports may be edited
    Editable,
    /// Writing a design
    Saving,
    /// Restoring the last design
    Reverting,
    /// Loading a design
    Loading,
}

impl std::fmt::Display for RunnableState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

impl std::str::FromStr for RunnableState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunnableState::ALL
            .iter()
            .copied()
            .find(|state| state.to_string() == s)
            .ok_or_else(|| format!("unknown state '{s}'"))
    }
}

impl RunnableState {
    /// Every state, in declaration order.
    pub const ALL: [RunnableState; 16] = [
        RunnableState::Disabled,
        RunnableState::Fault,
        RunnableState::Ready,
        RunnableState::Configuring,
        RunnableState::Armed,
        RunnableState::Running,
        RunnableState::PostRun,
        RunnableState::Paused,
        RunnableState::Seeking,
        RunnableState::Aborting,
        RunnableState::Aborted,
        RunnableState::Resetting,
        RunnableState::Editable,
        RunnableState::Saving,
        RunnableState::Reverting,
        RunnableState::Loading,
    ];

    /// Check whether the controller may move from `self` to `to`.
    pub fn can_transition_to(self, to: RunnableState) -> bool {
        use RunnableState::*;
        if to == Disabled {
            return true;
        }
        if to == Fault {
            return !matches!(self, Disabled | Fault);
        }
        match self {
            Disabled | Fault | Aborted => to == Resetting,
            Resetting => to == Ready,
            Ready => matches!(to, Configuring | Editable | Saving | Loading | Aborting),
            Configuring => matches!(to, Armed | Aborting),
            Armed => matches!(to, Running | Seeking | Resetting | Aborting),
            Running => matches!(to, PostRun | Seeking | Aborting),
            PostRun => matches!(to, Armed | Ready | Seeking | Aborting),
            Paused => matches!(to, Running | Seeking | Aborting),
            Seeking => matches!(to, Paused | Armed | Aborting),
            Aborting => to == Aborted,
            Editable => matches!(to, Saving | Reverting | Loading),
            Saving | Reverting | Loading => to == Ready,
        }
    }

    /// True for states that end in Aborted when abort is called.
    pub fn is_abortable(self) -> bool {
        ControllerMethod::Abort.writeable_in(self)
    }

    /// True while a scan is between configure and completion.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            RunnableState::Configuring
                | RunnableState::Running
                | RunnableState::PostRun
                | RunnableState::Seeking
                | RunnableState::Aborting
                | RunnableState::Resetting
        )
    }
}

/// Methods exposed by a runnable controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerMethod {
    /// Check and tweak parameters
    Validate,
    /// Program a scan
    Configure,
    /// Execute configured steps
    Run,
    /// Stop and reposition
    Pause,
    /// Continue after pause
    Resume,
    /// Stop everything
    Abort,
    /// Return to Ready
    Reset,
    /// Switch off
    Disable,
    /// Write a design
    Save,
    /// Allow layout and export edits
    Edit,
    /// Discard edits
    Revert,
    /// Load a named design
    SetDesign,
}

impl ControllerMethod {
    /// Every method.
    pub const ALL: [ControllerMethod; 12] = [
        ControllerMethod::Validate,
        ControllerMethod::Configure,
        ControllerMethod::Run,
        ControllerMethod::Pause,
        ControllerMethod::Resume,
        ControllerMethod::Abort,
        ControllerMethod::Reset,
        ControllerMethod::Disable,
        ControllerMethod::Save,
        ControllerMethod::Edit,
        ControllerMethod::Revert,
        ControllerMethod::SetDesign,
    ];

    /// Wire name of the method
    pub fn name(self) -> &'static str {
        match self {
            ControllerMethod::Validate => "validate",
            ControllerMethod::Configure => "configure",
            ControllerMethod::Run => "run",
            ControllerMethod::Pause => "pause",
            ControllerMethod::Resume => "resume",
            ControllerMethod::Abort => "abort",
            ControllerMethod::Reset => "reset",
            ControllerMethod::Disable => "disable",
            ControllerMethod::Save => "save",
            ControllerMethod::Edit => "edit",
            ControllerMethod::Revert => "revert",
            ControllerMethod::SetDesign => "setDesign",
        }
    }

    /// Look a method up by wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.name() == name)
    }

    /// Whether the method may be called in `state`.
    pub fn writeable_in(self, state: RunnableState) -> bool {
        use RunnableState::*;
        match self {
            ControllerMethod::Validate => state != Disabled,
            ControllerMethod::Configure => state == Ready,
            ControllerMethod::Run => state == Armed,
            ControllerMethod::Pause => matches!(state, Armed | Running | PostRun),
            ControllerMethod::Resume => state == Paused,
            ControllerMethod::Abort => matches!(
                state,
                Ready | Configuring | Armed | Running | PostRun | Paused | Seeking
            ),
            ControllerMethod::Reset => matches!(state, Fault | Disabled | Aborted | Armed),
            ControllerMethod::Disable => true,
            ControllerMethod::Save | ControllerMethod::Edit => matches!(state, Ready | Editable),
            ControllerMethod::Revert => state == Editable,
            ControllerMethod::SetDesign => matches!(state, Ready | Editable),
        }
    }
}

impl std::fmt::Display for ControllerMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
