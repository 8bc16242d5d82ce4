//! Intermediate representation.
//!
//! The IR is a conventional CFG form: a [`Module`] owns functions and
//! globals, a [`Function`] owns basic blocks, and each block is a run of
//! instructions closed by exactly one terminator.

mod types;

pub use types::*;
