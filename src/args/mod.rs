//! Argument construction for the `convert` command line.

mod builder;
mod value;

pub use builder::*;
pub use value::*;
