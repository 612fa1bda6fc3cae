//! PASM code generation library.
//!
//! This crate is the middle-end and assembly back-end of a multi-language
//! compiler for the two-generation "Propeller-style" microcontroller family:
//! cores with a small register-addressable execution memory (*cog* memory)
//! and a larger memory shared between cores (*hub* memory), executing
//! instructions that are conditional on a per-instruction predicate.
//!
//! The front ends hand us typed-checked module ASTs (see [`ast`]); we lower
//! them to a linear intermediate representation ([`ir`]), assign registers
//! and code placement ([`regalloc`]), and serialize the result either to
//! assembler text ([`emit`]), to a raw machine image ([`emit::image`]), or
//! to an experimental stack-machine bytecode ([`bytecode`]).

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

pub use crate::context::{CompileContext, Options, OutputMode};
pub use crate::diag::{CodegenError, CodegenResult, Severity, SourceLoc};

pub mod ast;
pub mod bytecode;
pub mod emit;
pub mod ir;
pub mod isa;
pub mod lower;
pub mod regalloc;
pub mod typecheck;
pub mod types;

mod context;
mod diag;

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
