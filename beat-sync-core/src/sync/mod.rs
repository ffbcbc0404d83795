//! Sync Engine
//!
//! Leader election and state reconciliation between the peers of a session.

mod engine;
mod observer;
mod state;

#[cfg(test)]
mod tests;

pub use engine::*;
pub use observer::*;
pub use state::*;
