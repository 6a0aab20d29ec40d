//! Subprocess handle for the external conversion tool.

mod handle;

pub use handle::*;
