//! Program area.
//!
//! Storage for the program buffers and builder bookkeeping. Callers either
//! own a private [`ProgramArea`] or borrow the process-wide one through
//! [`ProgramArea::global`], whose lock is held for one whole tensor
//! operation.

use crate::builder::ProgramContext;
use crate::program::Program;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

/// Program buffers plus the builder context that owns them.
#[derive(Debug, Clone, Default)]
pub struct ProgramArea {
    context: ProgramContext,
}

static GLOBAL: OnceLock<Mutex<ProgramArea>> = OnceLock::new();

impl ProgramArea {
    /// Empty area.
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclusive access to the process-wide area.
    ///
    /// A panic while the lock was held leaves the area usable; the next
    /// kernel calls `init` before building.
    pub fn global() -> MutexGuard<'static, ProgramArea> {
        GLOBAL
            .get_or_init(|| Mutex::new(Self::new()))
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The single-program buffer (ping-pong buffer 0).
    pub fn program(&mut self) -> &mut Program {
        &mut self.context.programs_mut()[0]
    }

    /// Both ping-pong buffers.
    pub fn programs(&mut self) -> &mut [Program; 2] {
        self.context.programs_mut()
    }

    /// The builder context.
    pub fn context(&mut self) -> &mut ProgramContext {
        &mut self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_program_is_first_buffer() {
        let mut area = ProgramArea::new();
        area.program().instr_count = 3;
        assert_eq!(area.programs()[0].instr_count, 3);
        assert_eq!(area.context().programs()[0].instr_count, 3);
    }

    #[test]
    fn global_area_is_shared() {
        {
            let mut area = ProgramArea::global();
            area.context().init();
            area.context().begin_program().unwrap();
        }
        let mut area = ProgramArea::global();
        assert!(area.context().is_ok());
    }
}
