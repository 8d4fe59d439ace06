//! Shared test doubles for stepflow crates.
//!
//! [`ScriptedBackend`] plays back canned agent replies per step,
//! [`ScriptedSandbox`] interprets a tiny line-based script instead of real
//! code, and the `*_reply` helpers build reply bodies in the shape agents
//! are expected to produce.

mod backend;
mod fixtures;
mod sandbox;

pub use backend::ScriptedBackend;
pub use fixtures::{code_reply, outputs_reply, plan_reply, with_fragment};
pub use sandbox::ScriptedSandbox;
