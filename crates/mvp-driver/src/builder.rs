//! Program builder.
//!
//! [`ProgramContext`] assembles programs one instruction at a time into one
//! of two ping-pong buffers. Each buffer slot moves through
//!
//! ```text
//! Idle ──begin_program──▶ Building ──seal──▶ Sealed ──mark_in_flight──▶ InFlight
//!   ▲                                                                      │
//!   └──────────────────────────────── retire ◀─────────────────────────────┘
//! ```
//!
//! and a slot that is `InFlight` can never be rebuilt. Builder errors are
//! sticky (see [`BuildStatus`]): after the first failure every further
//! operation is a no-op and [`ProgramContext::seal`] reports the error.

use crate::array::{ArrayDescriptor, DataType, Dim};
use crate::error::{MvpError, Result};
use crate::program::{
    AluConfig, ArrayId, Instruction, LoadConfig, LoopConfig, Program, Reg, RegValue, StoreConfig,
};
use crate::status::BuildStatus;
use mvp_chip::limits::{MAX_LOOP_ITERATIONS, NUM_INSTRUCTIONS, NUM_LOOPS};
use mvp_chip::opcode::AluOp;
use mvp_chip::regs::loopcfg;
use tracing::trace;

/// Lifecycle state of one program buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Free for building.
    Idle,
    /// Being assembled.
    Building,
    /// Complete, end-of-program set, not yet started.
    Sealed,
    /// Handed to the accelerator and not yet completed.
    InFlight,
}

/// Builder state plus the two program buffers.
#[derive(Debug, Clone)]
pub struct ProgramContext {
    programs: [Program; 2],
    states: [SlotState; 2],
    active: usize,
    loop_stack: [usize; NUM_LOOPS],
    depth: usize,
    pending_begin: u8,
    last_closed: Option<usize>,
    status: BuildStatus,
}

impl Default for ProgramContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramContext {
    /// Fresh context with buffer 0 active.
    pub fn new() -> Self {
        Self {
            programs: [Program::default(), Program::default()],
            states: [SlotState::Idle; 2],
            active: 0,
            loop_stack: [0; NUM_LOOPS],
            depth: 0,
            pending_begin: 0,
            last_closed: None,
            status: BuildStatus::new(),
        }
    }

    /// Reset bookkeeping and the sticky status, select buffer 0.
    ///
    /// Slot states are kept: a buffer that is still in flight stays
    /// protected until it is retired.
    pub fn init(&mut self) {
        self.active = 0;
        self.depth = 0;
        self.pending_begin = 0;
        self.last_closed = None;
        self.status.reset();
        for s in &mut self.states {
            if *s != SlotState::InFlight {
                *s = SlotState::Idle;
            }
        }
    }

    /// Index of the buffer that the next `begin_program` will use.
    pub const fn next_slot(&self) -> usize {
        1 - self.active
    }

    /// Index of the active buffer.
    pub const fn active_slot(&self) -> usize {
        self.active
    }

    /// State of buffer `slot` (0 or 1).
    pub fn slot_state(&self, slot: usize) -> SlotState {
        self.states[slot]
    }

    /// The active program.
    pub fn program(&self) -> &Program {
        &self.programs[self.active]
    }

    /// Both program buffers.
    pub fn programs(&self) -> &[Program; 2] {
        &self.programs
    }

    pub(crate) fn programs_mut(&mut self) -> &mut [Program; 2] {
        &mut self.programs
    }

    /// Start the next program in the other ping-pong buffer.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if that buffer is still in flight.
    pub fn begin_program(&mut self) -> Result<()> {
        let next = self.next_slot();
        if self.states[next] == SlotState::InFlight {
            return Err(MvpError::invalid_state(format!(
                "program buffer {next} is still in flight"
            )));
        }
        if self.states[self.active] == SlotState::Building {
            self.states[self.active] = SlotState::Idle;
        }
        self.active = next;
        self.programs[next] = Program::default();
        self.states[next] = SlotState::Building;
        self.depth = 0;
        self.pending_begin = 0;
        self.last_closed = None;
        trace!("begin_program: buffer {next}");
        Ok(())
    }

    fn building(&mut self) -> bool {
        if !self.status.is_ok() {
            return false;
        }
        let state = self.states[self.active];
        self.status.check(state == SlotState::Building, || {
            MvpError::invalid_state(format!("program buffer is {state:?}, not Building"))
        })
    }

    /// Open a loop of `iterations` around the instructions emitted next.
    pub fn begin_loop(&mut self, iterations: usize) {
        if !self.building() {
            return;
        }
        let index = self.programs[self.active].loop_count;
        if !self.status.check(index < NUM_LOOPS, || {
            MvpError::invalid_parameter(format!("loop budget of {NUM_LOOPS} exhausted"))
        }) {
            return;
        }
        if !self.status.check((1..=MAX_LOOP_ITERATIONS).contains(&iterations), || {
            MvpError::invalid_range(format!(
                "loop iterations {iterations} outside 1..={MAX_LOOP_ITERATIONS}"
            ))
        }) {
            return;
        }
        let program = &mut self.programs[self.active];
        program.loops[index] = LoopConfig {
            iterations,
            begin: program.instr_count,
            ..LoopConfig::default()
        };
        program.loop_count += 1;
        self.loop_stack[self.depth] = index;
        self.depth += 1;
        self.pending_begin |= 1 << index;
        self.last_closed = None;
        trace!("begin_loop L{index} x{iterations}");
    }

    /// Close the innermost open loop at the most recently emitted instruction.
    pub fn end_loop(&mut self) {
        if !self.building() {
            return;
        }
        if !self.status.check(self.depth > 0, || {
            MvpError::invalid_parameter("end_loop without matching begin_loop")
        }) {
            return;
        }
        let index = self.loop_stack[self.depth - 1];
        let program = &mut self.programs[self.active];
        let begin = program.loops[index].begin;
        if !self.status.check(program.instr_count > begin, || {
            MvpError::invalid_parameter(format!("loop L{index} has an empty body"))
        }) {
            return;
        }
        let end = program.instr_count - 1;
        program.loops[index].end = end;
        program.instructions[end].loop_end |= 1 << index;
        self.depth -= 1;
        self.last_closed = Some(index);
        trace!("end_loop L{index} at {end}");
    }

    fn postloop(&mut self, array: ArrayId, dim: Dim, reset: bool) {
        if !self.building() {
            return;
        }
        let Some(index) = self.last_closed else {
            self.status.record(MvpError::invalid_parameter(
                "post-loop action must directly follow end_loop",
            ));
            return;
        };
        let bit = loopcfg::array_dim_bit(array.index(), dim.index());
        let l = &mut self.programs[self.active].loops[index];
        if reset {
            l.reset |= bit;
        } else {
            l.incr |= bit;
        }
    }

    /// Increment `dim` of `array` each time the loop just closed completes.
    pub fn postloop_incr_dim(&mut self, array: ArrayId, dim: Dim) {
        self.postloop(array, dim, false);
    }

    /// Reset `dim` of `array` each time the loop just closed completes.
    pub fn postloop_reset_dim(&mut self, array: ArrayId, dim: Dim) {
        self.postloop(array, dim, true);
    }

    /// Append one instruction.
    pub fn compute(&mut self, op: AluOp, alu: AluConfig, load: LoadConfig, store: StoreConfig) {
        if !self.building() {
            return;
        }
        let program = &mut self.programs[self.active];
        let index = program.instr_count;
        if !self.status.check(index < NUM_INSTRUCTIONS, || {
            MvpError::invalid_parameter(format!("instruction budget of {NUM_INSTRUCTIONS} exhausted"))
        }) {
            return;
        }
        program.instructions[index] = Instruction {
            op,
            alu,
            load,
            store,
            loop_begin: self.pending_begin,
            ..Instruction::default()
        };
        program.instr_count += 1;
        self.pending_begin = 0;
        self.last_closed = None;
    }

    /// Configure array slot `id`. Sizes and strides are `[vec, row, col]`.
    pub fn config_array(
        &mut self,
        id: ArrayId,
        base: u32,
        dtype: DataType,
        sizes: [usize; 3],
        strides: [i32; 3],
    ) {
        if !self.building() {
            return;
        }
        if let Some(desc) = self.status.absorb(ArrayDescriptor::new(base, dtype, sizes, strides)) {
            self.programs[self.active].arrays[id.index()] = Some(desc);
        }
    }

    /// Set the initial value of a register.
    pub fn set_reg(&mut self, reg: Reg, value: RegValue) {
        if self.building() {
            self.programs[self.active].regs[reg.index()] = value;
        }
    }

    /// Set a register to `value` in both lanes.
    pub fn set_reg_f16(&mut self, reg: Reg, value: f32) {
        self.set_reg(reg, RegValue::splat(value));
    }

    /// Record a kernel-level condition into the sticky status.
    pub fn check(&mut self, cond: bool, err: impl FnOnce() -> MvpError) -> bool {
        self.status.check(cond, err)
    }

    /// Record an error into the sticky status.
    pub fn fail(&mut self, err: MvpError) {
        self.status.record(err);
    }

    /// The sticky status.
    ///
    /// # Errors
    ///
    /// Returns the first error recorded since `init`.
    pub fn status(&self) -> Result<()> {
        self.status.to_result()
    }

    /// True while no error has been recorded.
    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    /// Finish the active program: set end-of-program on its last instruction.
    ///
    /// # Errors
    ///
    /// Returns the sticky error, `InvalidParameter` for an unclosed loop or an
    /// empty program, or `InvalidState` if the buffer is not being built.
    pub fn seal(&mut self) -> Result<()> {
        self.status()?;
        let state = self.states[self.active];
        if state != SlotState::Building {
            return Err(MvpError::invalid_state(format!("cannot seal a {state:?} program")));
        }
        if self.depth != 0 {
            let err = MvpError::invalid_parameter(format!("{} loop(s) left open", self.depth));
            self.status.record(err.clone());
            return Err(err);
        }
        let program = &mut self.programs[self.active];
        if program.instr_count == 0 {
            let err = MvpError::invalid_parameter("program has no instructions");
            self.status.record(err.clone());
            return Err(err);
        }
        program.instructions[program.instr_count - 1].end_program = true;
        self.states[self.active] = SlotState::Sealed;
        trace!(
            "sealed buffer {}: {} instructions, {} loops",
            self.active,
            program.instr_count,
            program.loop_count
        );
        Ok(())
    }

    /// Mark the sealed active program as handed to the accelerator.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the active program is not sealed.
    pub fn mark_in_flight(&mut self) -> Result<()> {
        let state = self.states[self.active];
        if state != SlotState::Sealed {
            return Err(MvpError::invalid_state(format!(
                "cannot start a {state:?} program"
            )));
        }
        self.states[self.active] = SlotState::InFlight;
        Ok(())
    }

    /// Mark every in-flight buffer idle after the accelerator completed all
    /// outstanding work. A sealed buffer not yet started keeps its state.
    pub fn retire(&mut self) {
        for s in &mut self.states {
            if *s == SlotState::InFlight {
                *s = SlotState::Idle;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::program::Stream;

    fn nop(ctx: &mut ProgramContext) {
        ctx.compute(AluOp::Noop, AluConfig::new(), LoadConfig::NONE, StoreConfig::NONE);
    }

    #[test]
    fn begin_program_alternates_buffers() {
        let mut ctx = ProgramContext::new();
        ctx.begin_program().unwrap();
        let first = ctx.active_slot();
        ctx.begin_program().unwrap();
        assert_ne!(ctx.active_slot(), first);
        ctx.begin_program().unwrap();
        assert_eq!(ctx.active_slot(), first);
    }

    #[test]
    fn loop_markers_and_postloop_actions() {
        let mut ctx = ProgramContext::new();
        ctx.begin_program().unwrap();
        ctx.begin_loop(4);
        ctx.begin_loop(3);
        ctx.compute(
            AluOp::Copy,
            AluConfig::new().z(Reg::R1).a(Reg::R2),
            LoadConfig::one(Stream::new(Reg::R2, ArrayId::A0).incr(Dim::Col)),
            StoreConfig::NONE,
        );
        ctx.end_loop();
        ctx.postloop_incr_dim(ArrayId::A0, Dim::Row);
        ctx.postloop_reset_dim(ArrayId::A0, Dim::Col);
        nop(&mut ctx);
        ctx.end_loop();
        ctx.seal().unwrap();

        let p = ctx.program();
        assert_eq!(p.instr_count, 2);
        assert_eq!(p.instructions[0].loop_begin, 0b11);
        assert_eq!(p.instructions[0].loop_end, 0b10);
        assert_eq!(p.instructions[1].loop_end, 0b01);
        assert!(p.instructions[1].end_program);
        assert!(p.loops[1].increments(ArrayId::A0, Dim::Row));
        assert!(p.loops[1].resets(ArrayId::A0, Dim::Col));
        assert!(!p.loops[0].increments(ArrayId::A0, Dim::Row));
        assert_eq!((p.loops[0].begin, p.loops[0].end), (0, 1));
    }

    #[test]
    fn ninth_instruction_is_rejected_without_overwriting() {
        let mut ctx = ProgramContext::new();
        ctx.begin_program().unwrap();
        ctx.compute(AluOp::Clear, AluConfig::new().z(Reg::R7), LoadConfig::NONE, StoreConfig::NONE);
        for _ in 1..NUM_INSTRUCTIONS {
            nop(&mut ctx);
        }
        assert!(ctx.is_ok());
        nop(&mut ctx);
        let err = ctx.seal().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
        assert_eq!(ctx.program().instr_count, NUM_INSTRUCTIONS);
        assert_eq!(ctx.program().instructions[0].op, AluOp::Clear);
    }

    #[test]
    fn ninth_loop_is_rejected() {
        let mut ctx = ProgramContext::new();
        ctx.begin_program().unwrap();
        for _ in 0..=NUM_LOOPS {
            ctx.begin_loop(2);
        }
        nop(&mut ctx);
        for _ in 0..=NUM_LOOPS {
            ctx.end_loop();
        }
        assert_eq!(ctx.status().unwrap_err().kind(), ErrorKind::InvalidParameter);
        assert_eq!(ctx.program().loop_count, NUM_LOOPS);
    }

    #[test]
    fn iteration_count_range() {
        let mut ctx = ProgramContext::new();
        ctx.begin_program().unwrap();
        ctx.begin_loop(1025);
        assert_eq!(ctx.status().unwrap_err().kind(), ErrorKind::InvalidRange);

        ctx.init();
        ctx.begin_program().unwrap();
        ctx.begin_loop(0);
        assert_eq!(ctx.status().unwrap_err().kind(), ErrorKind::InvalidRange);
    }

    #[test]
    fn nesting_errors() {
        let mut ctx = ProgramContext::new();
        ctx.begin_program().unwrap();
        ctx.end_loop();
        assert!(!ctx.is_ok());

        ctx.init();
        ctx.begin_program().unwrap();
        ctx.begin_loop(2);
        ctx.end_loop();
        assert!(ctx.status().is_err(), "empty loop body");

        ctx.init();
        ctx.begin_program().unwrap();
        ctx.begin_loop(2);
        nop(&mut ctx);
        assert!(ctx.seal().is_err(), "unclosed loop");

        ctx.init();
        ctx.begin_program().unwrap();
        nop(&mut ctx);
        ctx.postloop_incr_dim(ArrayId::A1, Dim::Vec);
        assert!(ctx.status().is_err(), "postloop without end_loop");
    }

    #[test]
    fn sealed_program_is_immutable() {
        let mut ctx = ProgramContext::new();
        ctx.begin_program().unwrap();
        nop(&mut ctx);
        ctx.seal().unwrap();
        nop(&mut ctx);
        assert_eq!(ctx.program().instr_count, 1);
        assert_eq!(ctx.status().unwrap_err().kind(), ErrorKind::Fail);
    }

    #[test]
    fn in_flight_buffer_cannot_be_rebuilt() {
        let mut ctx = ProgramContext::new();
        ctx.begin_program().unwrap();
        nop(&mut ctx);
        ctx.seal().unwrap();
        ctx.mark_in_flight().unwrap();
        let busy = ctx.active_slot();

        ctx.begin_program().unwrap();
        nop(&mut ctx);
        ctx.seal().unwrap();
        assert!(ctx.begin_program().is_err());
        assert_eq!(ctx.slot_state(busy), SlotState::InFlight);

        ctx.retire();
        assert!(ctx.begin_program().is_ok());
        assert_eq!(ctx.active_slot(), busy);
    }

    #[test]
    fn array_errors_are_sticky() {
        let mut ctx = ProgramContext::new();
        ctx.begin_program().unwrap();
        ctx.config_array(ArrayId::A0, 0, DataType::Int8, [1, 1, 1], [4096, 1, 1]);
        ctx.begin_loop(9999);
        assert_eq!(ctx.status().unwrap_err().kind(), ErrorKind::InvalidRange);
        assert!(ctx.program().arrays[0].is_none());
    }
}
