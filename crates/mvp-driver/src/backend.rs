//! Backend abstraction for MVP program execution
//!
//! A backend receives encoded program images and runs them against device
//! memory. Starting and completing are separate calls so a backend can run
//! asynchronously while the host builds the next program.

use crate::error::Result;
use crate::memory::DeviceMemory;
use mvp_chip::image::ProgramImage;
use std::fmt::Debug;

/// MVP backend trait - unified interface for program execution
pub trait MvpBackend: Debug + Send {
    /// Start running a program image.
    ///
    /// The caller guarantees no other program is running (see
    /// [`MvpBackend::is_busy`]).
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot accept the program.
    fn start(&mut self, image: &ProgramImage) -> Result<()>;

    /// Block until the running program (if any) completes.
    ///
    /// # Errors
    ///
    /// Returns `Fault` if the program faulted.
    fn wait(&mut self, memory: &mut DeviceMemory) -> Result<Completion>;

    /// True while a started program has not been waited for.
    fn is_busy(&self) -> bool;

    /// Get backend type for debugging
    fn backend_type(&self) -> BackendType;
}

/// Result of one completed program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Completion {
    /// Instructions executed.
    pub instructions: u64,
    /// Interrupt flags raised (`regs::irq` layout).
    pub flags: u32,
}

/// Backend type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    /// Software interpreter of the program registers
    Software,

    /// Recording backend, optionally forwarding to another backend
    Trace,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Software => write!(f, "Software (virtual MVP)"),
            Self::Trace => write!(f, "Trace"),
        }
    }
}

/// Backend selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendSelection {
    /// Software interpreter
    Software,

    /// Software interpreter wrapped in a trace recorder
    Traced,

    /// Record programs without running them
    RecordOnly,
}

/// Create the backend for `selection`.
pub fn select_backend(selection: BackendSelection) -> Box<dyn MvpBackend> {
    use crate::backends::software::SoftwareBackend;
    use crate::backends::trace::TraceBackend;

    match selection {
        BackendSelection::Software => {
            tracing::info!("Using software MVP backend");
            Box::new(SoftwareBackend::new())
        }
        BackendSelection::Traced => {
            tracing::info!("Using traced software MVP backend");
            Box::new(TraceBackend::forwarding(Box::new(SoftwareBackend::new())).0)
        }
        BackendSelection::RecordOnly => {
            tracing::info!("Using record-only MVP backend");
            Box::new(TraceBackend::recording().0)
        }
    }
}
