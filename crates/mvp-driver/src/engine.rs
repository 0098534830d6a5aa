//! Execution engine.
//!
//! Hands sealed programs to a backend and tracks the single program that may
//! be in flight. Starting a program while another one runs first waits for
//! the running one, so at most one program is ever outstanding.

use crate::backend::{BackendType, MvpBackend};
use crate::backends::software::SoftwareBackend;
use crate::error::Result;
use crate::memory::DeviceMemory;
use crate::program::Program;
use mvp_chip::regs::irq;
use tracing::debug;

/// Counters accumulated over the engine's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecutionStats {
    /// Programs started.
    pub programs: u64,
    /// Instructions executed by completed programs.
    pub instructions: u64,
    /// Programs whose stores saturated at least once.
    pub saturated_programs: u64,
}

/// Program execution engine.
#[derive(Debug)]
pub struct ExecutionEngine {
    backend: Box<dyn MvpBackend>,
    memory: DeviceMemory,
    stats: ExecutionStats,
}

impl ExecutionEngine {
    /// Engine over `backend` and `memory`.
    pub fn new(backend: Box<dyn MvpBackend>, memory: DeviceMemory) -> Self {
        Self {
            backend,
            memory,
            stats: ExecutionStats::default(),
        }
    }

    /// Software engine with `memory_size` bytes of device memory.
    pub fn software(memory_size: usize) -> Self {
        Self::new(Box::new(SoftwareBackend::new()), DeviceMemory::new(memory_size))
    }

    /// Start `program`; block until it completes when `wait` is set.
    ///
    /// # Errors
    ///
    /// Returns a fault from the previously running program, a decode error
    /// from the backend, or (with `wait`) a fault from this program.
    pub fn execute(&mut self, program: &Program, wait: bool) -> Result<()> {
        if self.backend.is_busy() {
            self.wait_for_completion()?;
        }
        let image = program.encode();
        self.backend.start(&image)?;
        self.stats.programs += 1;
        debug!(
            "program {} started ({} instructions, {} loops)",
            self.stats.programs, program.instr_count, program.loop_count
        );
        if wait {
            self.wait_for_completion()?;
        }
        Ok(())
    }

    /// Barrier: return once no program is running.
    ///
    /// # Errors
    ///
    /// Returns the fault of the program that was running.
    pub fn wait_for_completion(&mut self) -> Result<()> {
        if !self.backend.is_busy() {
            return Ok(());
        }
        let done = self.backend.wait(&mut self.memory)?;
        self.stats.instructions += done.instructions;
        if done.flags & irq::STORECONVERTOF != 0 {
            self.stats.saturated_programs += 1;
        }
        Ok(())
    }

    /// True while a program is outstanding.
    pub fn is_busy(&self) -> bool {
        self.backend.is_busy()
    }

    /// Device memory. Call [`ExecutionEngine::wait_for_completion`] before
    /// reading outputs.
    pub fn memory(&self) -> &DeviceMemory {
        &self.memory
    }

    /// Mutable device memory.
    pub fn memory_mut(&mut self) -> &mut DeviceMemory {
        &mut self.memory
    }

    /// Accumulated counters.
    pub fn stats(&self) -> ExecutionStats {
        self.stats
    }

    /// Backend in use.
    pub fn backend_type(&self) -> BackendType {
        self.backend.backend_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::trace::TraceBackend;
    use crate::builder::ProgramContext;
    use crate::program::{AluConfig, LoadConfig, StoreConfig};
    use mvp_chip::opcode::AluOp;

    fn tiny() -> Program {
        let mut ctx = ProgramContext::new();
        ctx.begin_program().unwrap();
        ctx.compute(AluOp::Noop, AluConfig::new(), LoadConfig::NONE, StoreConfig::NONE);
        ctx.seal().unwrap();
        ctx.program().clone()
    }

    #[test]
    fn one_program_in_flight() {
        let (backend, log) = TraceBackend::forwarding(Box::new(SoftwareBackend::new()));
        let mut engine = ExecutionEngine::new(Box::new(backend), DeviceMemory::new(16));
        let p = tiny();
        engine.execute(&p, false).unwrap();
        assert!(engine.is_busy());
        engine.execute(&p, false).unwrap();
        assert!(engine.is_busy());
        engine.wait_for_completion().unwrap();
        assert!(!engine.is_busy());
        assert_eq!(log.len(), 2);
        assert_eq!(engine.stats().programs, 2);
        assert_eq!(engine.stats().instructions, 2);
    }

    #[test]
    fn blocking_execute() {
        let mut engine = ExecutionEngine::software(16);
        engine.execute(&tiny(), true).unwrap();
        assert!(!engine.is_busy());
        assert_eq!(engine.backend_type(), BackendType::Software);
    }
}
