//! monoform — whole-program flattening pipeline.
//!
//! This crate rewrites an IR document describing a multi-function program
//! into a single self-contained function with no globals, no external
//! calls and no multi-way branches, ready for translation into a
//! restricted straight-line target.

pub mod emit;
pub mod ir;
pub mod parser;
pub mod passes;

// Re-export key types for convenience
pub use anyhow::{Context, Result};

/// Configuration options for the transformation pipeline.
#[derive(Debug, Clone)]
pub struct TransformOptions {
    /// Run the entry and exit validation gates (precheck/postcheck).
    pub validate: bool,
    /// Rewrite merge dispatch switches into two-way branch chains.
    pub lower_switches: bool,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            validate: true,
            lower_switches: true,
        }
    }
}

/// Flatten a textual IR document into a single-function document.
///
/// This is the main entry point for the pipeline. It parses the source
/// text, runs every pass in order, and returns the transformed document.
///
/// # Example
/// ```
/// use monoform::{transform, TransformOptions};
///
/// let src = r#"
/// fn @main() -> i32 entry local_unnamed_addr {
/// b0:
///   %r = call @id(i32 5)
///   ret %r
/// }
/// fn @id(%x: i32) -> i32 internal unnamed_addr {
/// b0:
///   ret %x
/// }
/// "#;
/// let out = transform(src, &TransformOptions::default()).unwrap();
/// assert!(!out.contains("@id"));
/// ```
pub fn transform(source: &str, options: &TransformOptions) -> Result<String> {
    let mut module = parser::parse_module(source).context("failed to parse IR document")?;

    passes::run_pipeline(&mut module, options).context("transformation pipeline failed")?;

    Ok(emit::emit_module(&module))
}
