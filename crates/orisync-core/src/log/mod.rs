// # Action Log Implementations
//
// Durable storage strategies for the offline action queue.

pub mod file;
pub mod memory;

pub use file::{FileActionLog, FileActionLogFactory};
pub use memory::{MemoryActionLog, MemoryActionLogFactory};
