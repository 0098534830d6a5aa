//! Trace backend.
//!
//! Records every program image it is asked to start, then either forwards
//! it to an inner backend or drops it. The returned [`TraceLog`] handle
//! stays readable after the backend has been boxed into an engine.

use crate::backend::{BackendType, Completion, MvpBackend};
use crate::error::{MvpError, Result};
use crate::memory::DeviceMemory;
use crate::program::Program;
use mvp_chip::image::ProgramImage;
use std::sync::{Arc, Mutex, PoisonError};

/// Shared list of recorded program images.
#[derive(Debug, Clone, Default)]
pub struct TraceLog {
    images: Arc<Mutex<Vec<ProgramImage>>>,
}

impl TraceLog {
    fn push(&self, image: ProgramImage) {
        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(image);
    }

    /// Number of programs recorded.
    pub fn len(&self) -> usize {
        self.images.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies of the recorded images.
    pub fn images(&self) -> Vec<ProgramImage> {
        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Decode every recorded image.
    ///
    /// # Errors
    ///
    /// Returns the first decode error.
    pub fn programs(&self) -> Result<Vec<Program>> {
        self.images().iter().map(Program::from_image).collect()
    }

    /// Forget recorded images.
    pub fn clear(&self) {
        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Recording backend.
#[derive(Debug)]
pub struct TraceBackend {
    inner: Option<Box<dyn MvpBackend>>,
    log: TraceLog,
    busy: bool,
}

impl TraceBackend {
    /// Record programs without running them.
    pub fn recording() -> (Self, TraceLog) {
        let log = TraceLog::default();
        (
            Self {
                inner: None,
                log: log.clone(),
                busy: false,
            },
            log,
        )
    }

    /// Record programs and run them on `inner`.
    pub fn forwarding(inner: Box<dyn MvpBackend>) -> (Self, TraceLog) {
        let (mut backend, log) = Self::recording();
        backend.inner = Some(inner);
        (backend, log)
    }
}

impl MvpBackend for TraceBackend {
    fn start(&mut self, image: &ProgramImage) -> Result<()> {
        if self.busy {
            return Err(MvpError::invalid_state("trace backend is already running a program"));
        }
        self.log.push(image.clone());
        if let Some(inner) = &mut self.inner {
            inner.start(image)?;
        }
        self.busy = true;
        Ok(())
    }

    fn wait(&mut self, memory: &mut DeviceMemory) -> Result<Completion> {
        self.busy = false;
        match &mut self.inner {
            Some(inner) => inner.wait(memory),
            None => Ok(Completion::default()),
        }
    }

    fn is_busy(&self) -> bool {
        self.busy
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Trace
    }
}
