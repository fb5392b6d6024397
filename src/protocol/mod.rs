//! Wire protocol between the supervisor and the generator process.
//!
//! Parameters travel in as a base64 launch argument; events travel out as
//! JSON lines or progress-bar text on the child's output streams.

mod classifier;
mod events;
mod params;

pub use classifier::*;
pub use events::*;
pub use params::*;
