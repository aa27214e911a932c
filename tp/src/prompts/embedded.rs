//! Embedded prompts
//!
//! These are compiled into the binary from .pmt files at build time.

use tracing::debug;

/// Single-shot task prompt
pub const TASK: &str = include_str!("../../prompts/task.pmt");

/// Iteration loop prompt (carries the promise instruction)
pub const ITERATION: &str = include_str!("../../prompts/iteration.pmt");

/// Read-only codebase analysis prompt
pub const ANALYSIS: &str = include_str!("../../prompts/analysis.pmt");

/// Get the embedded prompt by name
pub fn get_embedded(name: &str) -> Option<&'static str> {
    debug!(%name, "get_embedded: called");
    match name {
        "task" => Some(TASK),
        "iteration" => Some(ITERATION),
        "analysis" => Some(ANALYSIS),
        _ => {
            debug!("get_embedded: no match found");
            None
        }
    }
}
