//! Shape Supervisor - runs an external text-to-3D generator as a child
//! process and turns its output into typed progress and lifecycle events.

pub mod config;
pub mod display;
pub mod protocol;
pub mod supervisor;
