//! Transformation passes.
//!
//! Each pass is a self-contained sub-module taking the whole [`Module`]
//! (or one function, for `merge_calls`) and reporting whether it changed
//! anything; validation passes return nothing and fail hard instead. The
//! top-level [`run_pipeline`] runs them in their contractual order:
//!
//! prepare → precheck → global_dce → global_to_stack → inline_ctors →
//! flatten (which uses merge_calls per caller) → lower_switch → postcheck

pub mod call_graph;
pub mod flatten;
pub mod global_dce;
pub mod global_to_stack;
pub mod inline_ctors;
pub mod lower_switch;
pub mod merge_calls;
pub mod postcheck;
pub mod precheck;
pub mod prepare;
pub mod utils;

use crate::ir::Module;
use crate::TransformOptions;
use anyhow::Result;
use tracing::debug;

/// Run the whole pipeline in order.
pub fn run_pipeline(module: &mut Module, options: &TransformOptions) -> Result<()> {
    debug!("pipeline: prepare");
    prepare::run(module)?;
    if options.validate {
        debug!("pipeline: precheck");
        precheck::run(module)?;
    }
    debug!("pipeline: global_dce");
    global_dce::run(module)?;
    debug!("pipeline: global_to_stack");
    global_to_stack::run(module)?;
    debug!("pipeline: inline_ctors");
    inline_ctors::run(module)?;
    debug!("pipeline: flatten");
    flatten::run(module)?;
    if options.lower_switches {
        debug!("pipeline: lower_switch");
        lower_switch::run(module)?;
    }
    if options.validate {
        debug!("pipeline: postcheck");
        postcheck::run(module)?;
    }
    Ok(())
}
