//! Progress reporting for invocations.
//!
//! The runner announces each phase it enters and the final outcome through a
//! [`Reporter`] it is handed at construction, rather than through global state.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use tracing::{error, info};

use super::response::Invocation;
use crate::error::ErrorKind;

/// Steps of an invocation, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Validating,
    AcquiringProxy,
    StartingProxy,
    AwaitingReadiness,
    Connecting,
    Executing,
    Releasing,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Validating => "Reading configuration",
            Self::AcquiringProxy => "Acquiring Cloud SQL Proxy",
            Self::StartingProxy => "Starting Cloud SQL Proxy",
            Self::AwaitingReadiness => "Waiting for Cloud SQL Proxy",
            Self::Connecting => "Connecting to the database",
            Self::Executing => "Executing SQL query",
            Self::Releasing => "Releasing database connection",
        };
        f.write_str(text)
    }
}

/// Receives invocation progress.
pub trait Reporter: Send + Sync {
    /// Called when the invocation enters `phase`.
    fn phase(&self, phase: Phase);

    /// Called once with the final result.
    fn finished(&self, invocation: &Invocation);
}

/// Emits progress as tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn phase(&self, phase: Phase) {
        info!("{phase}...");
    }

    fn finished(&self, invocation: &Invocation) {
        let elapsed_ms = invocation.elapsed.as_millis() as u64;
        match invocation.error_kind {
            None => info!(elapsed_ms, "{}", invocation.response.message),
            Some(kind) => error!(elapsed_ms, "{kind}: {}", invocation.response.message),
        }
    }
}

/// Records progress for later inspection.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    phases: Mutex<Vec<Phase>>,
    outcomes: Mutex<Vec<Option<ErrorKind>>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Phases reported so far, in order.
    pub fn phases(&self) -> Vec<Phase> {
        self.phases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Error kind of every finished invocation (`None` for successes).
    pub fn outcomes(&self) -> Vec<Option<ErrorKind>> {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn saw(&self, phase: Phase) -> bool {
        self.phases().contains(&phase)
    }
}

impl Reporter for RecordingReporter {
    fn phase(&self, phase: Phase) {
        self.phases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(phase);
    }

    fn finished(&self, invocation: &Invocation) {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(invocation.error_kind);
    }
}
