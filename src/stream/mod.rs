//! Duplex image stream over an external `convert` process.

mod adapter;
mod error;
mod events;
mod pump;
mod state;
mod unifier;

pub use adapter::*;
pub use error::*;
pub use events::*;
pub use state::*;
pub use unifier::*;
