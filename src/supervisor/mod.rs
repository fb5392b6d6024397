//! Supervision of the external generator process.
//!
//! [`ProcessManager`] owns the single session slot and the child process,
//! [`OutputReader`] turns the child's output into events on a background
//! thread, and [`EventPump`] delivers those events to subscribers on the
//! consumer's context.

mod dispatch;
mod error;
mod manager;
mod process;
mod reader;
mod state;

pub use dispatch::*;
pub use error::*;
pub use manager::*;
pub use process::*;
pub use reader::*;
pub use state::*;
