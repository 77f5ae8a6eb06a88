//! Watch lifecycle for one monitored instance.
//!
//! ```text
//!            enable                 located
//! Disabled ─────────▶ Searching ─────────────▶ Observing
//!    ▲                  │   ▲                     │
//!    │                  │   └── retry (fixed)     │
//!    └── disable/clear ─┴─────────────────────────┘
//! ```
//!
//! Exhausting the locate attempts leaves the machine in `Searching` with no
//! retry pending; a later `enable` starts a fresh round. The machine only
//! tracks state; the monitor owns timers and side effects.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WatchState {
    Disabled,
    Searching { attempts: u32, exhausted: bool },
    Observing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocateOutcome {
    Located,
    Retry { attempt: u32 },
    Exhausted { attempts: u32 },
    /// An attempt arrived while not searching (stale timer, late event).
    Ignored,
}

#[derive(Debug, Clone)]
pub struct WatchMachine {
    state: WatchState,
    max_attempts: u32,
}

impl WatchMachine {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            state: WatchState::Disabled,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn state(&self) -> WatchState {
        self.state
    }

    pub fn is_observing(&self) -> bool {
        self.state == WatchState::Observing
    }

    /// True while another locate attempt is expected.
    pub fn is_searching(&self) -> bool {
        matches!(
            self.state,
            WatchState::Searching {
                exhausted: false,
                ..
            }
        )
    }

    /// Returns true when a new search round started.
    pub fn enable(&mut self) -> bool {
        match self.state {
            WatchState::Observing => false,
            WatchState::Searching {
                exhausted: false, ..
            } => false,
            WatchState::Disabled
            | WatchState::Searching {
                exhausted: true, ..
            } => {
                self.state = WatchState::Searching {
                    attempts: 0,
                    exhausted: false,
                };
                true
            }
        }
    }

    pub fn record_attempt(&mut self, found: bool) -> LocateOutcome {
        let WatchState::Searching {
            attempts,
            exhausted: false,
        } = self.state
        else {
            return LocateOutcome::Ignored;
        };

        let attempt = attempts + 1;
        if found {
            self.state = WatchState::Observing;
            return LocateOutcome::Located;
        }

        let exhausted = attempt >= self.max_attempts;
        self.state = WatchState::Searching {
            attempts: attempt,
            exhausted,
        };
        if exhausted {
            LocateOutcome::Exhausted { attempts: attempt }
        } else {
            LocateOutcome::Retry { attempt }
        }
    }

    /// Returns the state that was left.
    pub fn disable(&mut self) -> WatchState {
        std::mem::replace(&mut self.state, WatchState::Disabled)
    }

    /// Navigation boundary. Observation never resumes on its own afterwards.
    pub fn clear(&mut self) -> WatchState {
        self.disable()
    }
}
