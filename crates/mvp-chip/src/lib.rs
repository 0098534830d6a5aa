//! Silicon model for the MVP matrix/vector processor.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of the accelerator: hardware limits, the register map with its
//! bit fields, the ALU opcode table, and the layout of the program image the
//! driver writes into the program registers.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`limits`] | Register/array/loop/instruction counts, dimension and stride ranges |
//! | [`regs`] | Register block offsets and bit definitions |
//! | [`opcode`] | ALU operation codes and their operand usage |
//! | [`image`] | Program image: the 69 program words in register order |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod image;
pub mod limits;
pub mod opcode;
pub mod regs;
