//! Input-processing mode of a client editor.
//!
//! Programmatic mutations (remote application, replay) must never be
//! mistaken for user edits. Rather than a pair of ad hoc flags, the gate is
//! a small state machine:
//!
//! ```text
//!            applying_remote()            begin_replay()
//!   Idle ───────────────────▶ ApplyingRemote     Idle ─────────▶ Replaying
//!    ▲                             │               ▲                 │
//!    └──── ModeGuard dropped ──────┘               └── end_replay() ─┘
//! ```
//!
//! Leaving `ApplyingRemote` arms a one-shot suppression so the input event
//! the host fires for the programmatic change is swallowed exactly once.

use log::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMode {
    #[default]
    Idle,
    ApplyingRemote,
    Replaying,
}

#[derive(Debug, Clone, Default)]
pub struct InputGate {
    mode: InputMode,
    suppress_next: bool,
    /// Whether leaving `ApplyingRemote` arms the one-shot suppression.
    suppress_echo: bool,
}

impl InputGate {
    pub fn new(suppress_echo: bool) -> Self {
        Self {
            mode: InputMode::Idle,
            suppress_next: false,
            suppress_echo,
        }
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn is_replaying(&self) -> bool {
        self.mode == InputMode::Replaying
    }

    /// Decide whether an input event should be treated as a user edit.
    ///
    /// Consumes the one-shot suppression if it is armed.
    pub fn accepts_input(&mut self) -> bool {
        match self.mode {
            InputMode::Idle if self.suppress_next => {
                self.suppress_next = false;
                trace!("input event suppressed (programmatic echo)");
                false
            }
            InputMode::Idle => true,
            InputMode::ApplyingRemote | InputMode::Replaying => false,
        }
    }

    /// Whether remote updates may be applied right now.
    pub fn accepts_remote(&self) -> bool {
        self.mode == InputMode::Idle
    }

    /// Enter `ApplyingRemote` for the lifetime of the returned guard.
    pub fn applying_remote(&mut self) -> ModeGuard<'_> {
        debug_assert_eq!(self.mode, InputMode::Idle);
        self.mode = InputMode::ApplyingRemote;
        ModeGuard { gate: self }
    }

    /// Enter `Replaying`. Returns `false` if the gate is not idle.
    pub fn begin_replay(&mut self) -> bool {
        if self.mode != InputMode::Idle {
            return false;
        }
        debug!("entering replay mode");
        self.mode = InputMode::Replaying;
        true
    }

    /// Leave `Replaying`. Idempotent.
    pub fn end_replay(&mut self) {
        if self.mode == InputMode::Replaying {
            debug!("leaving replay mode");
            self.mode = InputMode::Idle;
        }
    }

    /// Drop any armed suppression (used after a full resync).
    pub fn clear_suppression(&mut self) {
        self.suppress_next = false;
    }
}

/// Scoped `ApplyingRemote` transition; restores `Idle` on every exit path.
pub struct ModeGuard<'a> {
    gate: &'a mut InputGate,
}

impl Drop for ModeGuard<'_> {
    fn drop(&mut self) {
        self.gate.mode = InputMode::Idle;
        if self.gate.suppress_echo {
            self.gate.suppress_next = true;
        }
    }
}
