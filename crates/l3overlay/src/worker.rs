//! Lifecycle state machine shared by every managed resource.
//!
//! ```text
//! stopped -> starting -> started -> stopping -> stopped -> removing -> removed
//! ```
//!
//! Resources call `begin_*` before their side effects and `finish_*` only
//! once those succeed. A failed side effect leaves the worker in
//! `Starting`/`Stopping`; nothing is rolled back.

use std::fmt;

use crate::error::StateError;

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    /// Initial state, and the state after a completed stop.
    #[default]
    Stopped,
    /// Start in progress (or failed part way).
    Starting,
    /// Running.
    Started,
    /// Stop in progress (or failed part way).
    Stopping,
    /// Removal in progress.
    Removing,
    /// Terminal.
    Removed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Started => write!(f, "started"),
            Self::Stopping => write!(f, "stopping"),
            Self::Removing => write!(f, "removing"),
            Self::Removed => write!(f, "removed"),
        }
    }
}

/// Guarded lifecycle state plus the one-shot setup flag.
#[derive(Debug, Clone)]
pub struct WorkerState {
    description: String,
    state: State,
    setup: bool,
    requires_setup: bool,
}

impl WorkerState {
    /// A worker that may start without `setup()`.
    #[must_use]
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            state: State::Stopped,
            setup: false,
            requires_setup: false,
        }
    }

    /// A worker that refuses to start until `setup()` has completed.
    #[must_use]
    pub fn with_setup(description: impl Into<String>) -> Self {
        Self {
            requires_setup: true,
            ..Self::new(description)
        }
    }

    /// Human readable description used in errors and logs.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> State {
        self.state
    }

    /// Whether `setup()` has completed.
    #[must_use]
    pub const fn is_setup(&self) -> bool {
        self.setup
    }

    /// Mark setup as done. Fails if it already was.
    pub fn finish_setup(&mut self) -> Result<(), StateError> {
        self.check_setup()?;
        self.setup = true;
        Ok(())
    }

    /// Check that setup may proceed, without marking it done.
    pub fn check_setup(&self) -> Result<(), StateError> {
        if self.state == State::Removed {
            return Err(StateError::AlreadyRemoved(self.description.clone()));
        }
        if self.setup {
            return Err(StateError::AlreadySetup(self.description.clone()));
        }
        Ok(())
    }

    /// Enter `Starting`.
    pub fn begin_start(&mut self) -> Result<(), StateError> {
        match self.state {
            State::Starting | State::Started => {
                Err(StateError::AlreadyStarted(self.description.clone()))
            }
            State::Removing | State::Removed => {
                Err(StateError::AlreadyRemoved(self.description.clone()))
            }
            State::Stopping => Err(StateError::AlreadyStopping(self.description.clone())),
            State::Stopped if self.requires_setup && !self.setup => {
                Err(StateError::NotSetup(self.description.clone()))
            }
            State::Stopped => {
                self.state = State::Starting;
                Ok(())
            }
        }
    }

    /// Enter `Started`.
    pub fn finish_start(&mut self) {
        self.state = State::Started;
    }

    /// Enter `Stopping`.
    pub fn begin_stop(&mut self) -> Result<(), StateError> {
        match self.state {
            State::Started => {
                self.state = State::Stopping;
                Ok(())
            }
            State::Stopping => Err(StateError::AlreadyStopping(self.description.clone())),
            State::Stopped => Err(StateError::AlreadyStopped(self.description.clone())),
            State::Removing | State::Removed => {
                Err(StateError::AlreadyRemoved(self.description.clone()))
            }
            State::Starting => Err(StateError::NotStarted(self.description.clone())),
        }
    }

    /// Enter `Stopped`.
    pub fn finish_stop(&mut self) {
        self.state = State::Stopped;
    }

    /// Enter `Removing`.
    pub fn begin_remove(&mut self) -> Result<(), StateError> {
        match self.state {
            State::Stopped => {
                self.state = State::Removing;
                Ok(())
            }
            State::Removing | State::Removed => {
                Err(StateError::AlreadyRemoved(self.description.clone()))
            }
            _ => Err(StateError::NotStopped(self.description.clone())),
        }
    }

    /// Enter `Removed`.
    pub fn finish_remove(&mut self) {
        self.state = State::Removed;
    }

    /// Fail unless started.
    pub fn require_started(&self) -> Result<(), StateError> {
        if self.state == State::Started {
            Ok(())
        } else {
            Err(StateError::NotStarted(self.description.clone()))
        }
    }
}

/// Read access to a resource's lifecycle state.
pub trait Worker {
    /// The underlying state machine.
    fn worker(&self) -> &WorkerState;

    /// Whether `setup()` has completed.
    fn is_setup(&self) -> bool {
        self.worker().is_setup()
    }

    /// Whether the worker is starting.
    fn is_starting(&self) -> bool {
        self.worker().state() == State::Starting
    }

    /// Whether the worker is started.
    fn is_started(&self) -> bool {
        self.worker().state() == State::Started
    }

    /// Whether the worker is stopping.
    fn is_stopping(&self) -> bool {
        self.worker().state() == State::Stopping
    }

    /// Whether the worker is stopped.
    fn is_stopped(&self) -> bool {
        self.worker().state() == State::Stopped
    }

    /// Whether the worker is removed.
    fn is_removed(&self) -> bool {
        self.worker().state() == State::Removed
    }
}

impl Worker for WorkerState {
    fn worker(&self) -> &WorkerState {
        self
    }
}
