//! Stage reporting and non-fatal warnings.
//!
//! Nothing in the engine prints directly. Stage and timing lines and degraded-result
//! warnings go through a [`Diagnostics`] sink chosen by the caller, so verbosity is a
//! property of one call rather than process-wide state.

use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Output level derived from a layer's integer `verbose` setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// `verbose == 0`
    Silent,
    /// `1..=49`: stage lines on stderr.
    Info,
    /// `>= 50`: stage lines redirected to stdout.
    Redirect,
}

impl Verbosity {
    pub fn from_level(level: u32) -> Self {
        match level {
            0 => Self::Silent,
            1..=49 => Self::Info,
            _ => Self::Redirect,
        }
    }
}

/// Where a message comes from: `[layer | case] `.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Origin {
    pub layer: Option<String>,
    pub case: Option<String>,
}

impl Origin {
    pub fn layer(name: &str) -> Self {
        Self {
            layer: Some(name.to_string()),
            case: None,
        }
    }

    pub fn with_case(&self, case: &str) -> Self {
        Self {
            layer: self.layer.clone(),
            case: Some(case.to_string()),
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.layer, &self.case) {
            (None, None) => Ok(()),
            (Some(layer), Some(case)) => write!(f, "[{layer} | {case}] "),
            (Some(layer), None) => write!(f, "[{layer}] "),
            (None, Some(case)) => write!(f, "[{case}] "),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WarningKind {
    FitFailed,
    PredictFailed,
    ParallelProcessing,
}

impl fmt::Display for WarningKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::FitFailed => "FitFailedWarning",
            Self::PredictFailed => "PredictFailedWarning",
            Self::ParallelProcessing => "ParallelProcessingWarning",
        })
    }
}

/// A failure that was tolerated: the call completes with a degraded result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub kind: WarningKind,
    pub origin: Origin,
    pub message: String,
}

impl Warning {
    pub fn new(kind: WarningKind, origin: &Origin, message: impl Into<String>) -> Self {
        Self {
            kind,
            origin: origin.clone(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}{}", self.kind, self.origin, self.message)
    }
}

/// Receiver for stage lines and warnings. Shared by every worker of a call.
pub trait Diagnostics: Send + Sync {
    fn stage(&self, message: &str);
    fn warn(&self, warning: Warning);
}

/// Prints stage lines according to a [`Verbosity`] and logs warnings.
#[derive(Debug, Clone, Copy)]
pub struct ConsoleDiagnostics {
    verbosity: Verbosity,
}

impl ConsoleDiagnostics {
    pub fn new(verbosity: Verbosity) -> Self {
        Self { verbosity }
    }
}

impl Diagnostics for ConsoleDiagnostics {
    fn stage(&self, message: &str) {
        match self.verbosity {
            Verbosity::Silent => {}
            Verbosity::Info => eprintln!("{message}"),
            Verbosity::Redirect => println!("{message}"),
        }
    }

    fn warn(&self, warning: Warning) {
        log::warn!("{warning}");
    }
}

/// Keeps everything it receives. Used by tests and by callers that want to inspect
/// which instances were dropped.
#[derive(Debug, Default)]
pub struct RecordingDiagnostics {
    stages: Mutex<Vec<String>>,
    warnings: Mutex<Vec<Warning>>,
}

impl RecordingDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stages(&self) -> Vec<String> {
        self.stages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn warnings(&self) -> Vec<Warning> {
        self.warnings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn warnings_of(&self, kind: WarningKind) -> Vec<Warning> {
        self.warnings()
            .into_iter()
            .filter(|w| w.kind == kind)
            .collect()
    }
}

impl Diagnostics for RecordingDiagnostics {
    fn stage(&self, message: &str) {
        self.stages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.to_string());
    }

    fn warn(&self, warning: Warning) {
        log::warn!("{warning}");
        self.warnings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(warning);
    }
}

/// `HH:MM:SS` rendering of an elapsed time.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
