//! Low-level single-pass code generation.
//!
//! This crate owns the target-independent half of the compiler back end:
//! the IR data model and builder, the optimisation pipeline, the binary
//! emission buffer, and the x86-64 fast code generator. It compiles one
//! function at a time; symbol resolution, object emission and the parallel
//! driver live in `keel-module`.
//!
//! Failure model: the public compile entry points never return errors.
//! Misuse of the builder, IR corruption and unimplemented lowering paths
//! panic after printing the offending function; the verifier reports
//! structural problems as values so a driver can refuse to compile.

mod entity;

pub mod binemit;
pub mod ir;
pub mod isa;
pub mod opt;
pub mod verifier;

pub use opt::OptLevel;
