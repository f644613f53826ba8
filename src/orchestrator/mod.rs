//! Session orchestration.
//!
//! Owns the pass loop around the motion engine, the operator gate that ends
//! it, and the cleanup that runs on every exit path. CLI code calls into this
//! module and only consumes the events it emits.

mod controller;
pub(crate) mod gate;
mod shutdown;

pub(crate) use controller::{run_program, LoopEnd};
