//! Accelerator handle and build/run sessions.
//!
//! [`Mvp`] owns one program context and one execution engine. Kernels work
//! through a [`Session`], which keeps the ping-pong slot states in step with
//! the engine: it waits for the accelerator before a still-running buffer
//! is rebuilt, and marks buffers idle once their programs complete. A probe
//! session has no engine; it builds and seals programs but never runs them.

use crate::backend::MvpBackend;
use crate::builder::ProgramContext;
use crate::engine::ExecutionEngine;
use crate::error::Result;
use crate::memory::DeviceMemory;
use std::ops::{Deref, DerefMut};
use tracing::trace;

/// Accelerator handle: program context plus execution engine.
#[derive(Debug)]
pub struct Mvp {
    context: ProgramContext,
    engine: ExecutionEngine,
    wait_each_program: bool,
}

impl Mvp {
    /// Handle over an existing engine.
    pub fn new(engine: ExecutionEngine) -> Self {
        Self {
            context: ProgramContext::new(),
            engine,
            wait_each_program: false,
        }
    }

    /// Handle over `backend` with `memory`.
    pub fn with_backend(backend: Box<dyn MvpBackend>, memory: DeviceMemory) -> Self {
        Self::new(ExecutionEngine::new(backend, memory))
    }

    /// Software handle with `memory_size` bytes of device memory.
    pub fn software(memory_size: usize) -> Self {
        Self::new(ExecutionEngine::software(memory_size))
    }

    /// Block after every program instead of overlapping build and run.
    #[must_use]
    pub fn with_wait_each_program(mut self, wait: bool) -> Self {
        self.wait_each_program = wait;
        self
    }

    /// The execution engine.
    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    /// The execution engine, mutably.
    pub fn engine_mut(&mut self) -> &mut ExecutionEngine {
        &mut self.engine
    }

    /// Device memory.
    pub fn memory(&self) -> &DeviceMemory {
        self.engine.memory()
    }

    /// Device memory, mutably.
    pub fn memory_mut(&mut self) -> &mut DeviceMemory {
        self.engine.memory_mut()
    }

    /// The program context (last built programs are inspectable here).
    pub fn context(&self) -> &ProgramContext {
        &self.context
    }

    /// Start an executing session; the context is re-initialised.
    pub fn session(&mut self) -> Session<'_> {
        self.context.init();
        Session {
            ctx: &mut self.context,
            engine: Some(&mut self.engine),
            wait_each_program: self.wait_each_program,
        }
    }
}

/// One tensor operation's exclusive use of a context (and engine).
#[derive(Debug)]
pub struct Session<'a> {
    ctx: &'a mut ProgramContext,
    engine: Option<&'a mut ExecutionEngine>,
    wait_each_program: bool,
}

impl<'a> Session<'a> {
    /// Session that builds programs without running them.
    pub fn probe(ctx: &'a mut ProgramContext) -> Self {
        ctx.init();
        Self {
            ctx,
            engine: None,
            wait_each_program: false,
        }
    }

    /// True if programs are handed to an engine.
    pub fn is_executing(&self) -> bool {
        self.engine.is_some()
    }

    /// Start building the next program.
    ///
    /// Waits for the accelerator first if the target buffer is still in
    /// flight.
    ///
    /// # Errors
    ///
    /// Returns a fault of the program waited for, or `InvalidState`.
    pub fn begin_program(&mut self) -> Result<()> {
        let next = self.ctx.next_slot();
        if self.ctx.slot_state(next) == crate::builder::SlotState::InFlight {
            if let Some(engine) = self.engine.as_deref_mut() {
                trace!("buffer {next} still in flight, waiting");
                engine.wait_for_completion()?;
                self.ctx.retire();
            }
        }
        self.ctx.begin_program()
    }

    /// Seal the program and hand it to the engine.
    ///
    /// # Errors
    ///
    /// Returns the sticky build error, or an engine error.
    pub fn execute_program(&mut self) -> Result<()> {
        self.ctx.seal()?;
        let Some(engine) = self.engine.as_deref_mut() else {
            return Ok(());
        };
        if engine.is_busy() {
            engine.wait_for_completion()?;
            self.ctx.retire();
        }
        engine.execute(self.ctx.program(), self.wait_each_program)?;
        self.ctx.mark_in_flight()?;
        if self.wait_each_program {
            self.ctx.retire();
        }
        Ok(())
    }

    /// Barrier for all programs issued in this session.
    ///
    /// # Errors
    ///
    /// Returns the fault of an outstanding program.
    pub fn wait_for_completion(&mut self) -> Result<()> {
        if let Some(engine) = self.engine.as_deref_mut() {
            engine.wait_for_completion()?;
        }
        self.ctx.retire();
        Ok(())
    }

    /// Device memory, when executing.
    pub fn memory_mut(&mut self) -> Option<&mut DeviceMemory> {
        self.engine.as_deref_mut().map(ExecutionEngine::memory_mut)
    }
}

impl Deref for Session<'_> {
    type Target = ProgramContext;

    fn deref(&self) -> &ProgramContext {
        self.ctx
    }
}

impl DerefMut for Session<'_> {
    fn deref_mut(&mut self) -> &mut ProgramContext {
        self.ctx
    }
}
