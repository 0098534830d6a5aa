//! Program builder and execution engine for the MVP matrix/vector processor.
//!
//! The MVP is a small streaming fp16 ALU driven by micro-programs of at most
//! 8 instructions, 8 nested loops and 5 three-dimensional array walks. This
//! crate builds those programs and runs them.
//!
//! # Layers
//!
//! ```text
//! ArrayDescriptor / Program      pure model (array, program)
//!        ↓
//! ProgramContext                 builder with sticky status and ping-pong slots
//!        ↓
//! Session / Mvp                  keeps slots in step with the engine
//!        ↓
//! ExecutionEngine                one program in flight, completion barrier
//!        ↓
//! MvpBackend                     SoftwareBackend (interpreter) | TraceBackend
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use mvp_driver::prelude::*;
//! use mvp_driver::AluOp;
//!
//! # fn main() -> mvp_driver::Result<()> {
//! let mut mvp = Mvp::software(4096);
//! let src = mvp.memory_mut().alloc(16, 2)?;
//! let dst = mvp.memory_mut().alloc(16, 2)?;
//!
//! let mut session = mvp.session();
//! session.begin_program()?;
//! session.config_array(ArrayId::A0, src.addr, DataType::Int8, [1, 1, 16], [0, 0, 1]);
//! session.config_array(ArrayId::A1, dst.addr, DataType::Int8, [1, 1, 16], [0, 0, 1]);
//! session.begin_loop(16);
//! session.compute(
//!     AluOp::Copy,
//!     AluConfig::new().z(Reg::R1).a(Reg::R0),
//!     LoadConfig::one(Stream::new(Reg::R0, ArrayId::A0).incr(Dim::Col)),
//!     StoreConfig::one(Stream::new(Reg::R1, ArrayId::A1).incr(Dim::Col)),
//! );
//! session.end_loop();
//! session.execute_program()?;
//! session.wait_for_completion()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

mod area;
mod array;
mod backend;
pub mod backends;
mod builder;
mod engine;
mod error;
mod memory;
mod program;
mod session;
mod status;

/// Hardware limits (re-exported from mvp-chip).
pub mod limits {
    pub use mvp_chip::limits::*;
}

pub use area::ProgramArea;
pub use array::{ArrayDescriptor, DataType, Dim};
pub use backend::{select_backend, BackendSelection, BackendType, Completion, MvpBackend};
pub use backends::{SoftwareBackend, TraceBackend, TraceLog};
pub use builder::{ProgramContext, SlotState};
pub use engine::{ExecutionEngine, ExecutionStats};
pub use error::{ErrorKind, FaultKind, MvpError, Result};
pub use memory::{Buffer, DeviceMemory, DEFAULT_BASE};
pub use mvp_chip::image::ProgramImage;
pub use mvp_chip::opcode::AluOp;
pub use program::{
    AluConfig, AluInput, ArrayId, Instruction, LoadConfig, LoopConfig, Program, Reg, RegValue,
    Stream, StoreConfig,
};
pub use session::{Mvp, Session};
pub use status::BuildStatus;

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        AluConfig, ArrayId, Buffer, DataType, DeviceMemory, Dim, LoadConfig, Mvp, MvpError, Reg,
        Result, Session, StoreConfig, Stream,
    };
}
