//! Storage module for share payloads
//!
//! Backends implement [`Storage`]; the lifecycle core always talks to them
//! through [`RetryingStorage`], which bounds every call with a timeout and a
//! fixed number of attempts.

mod local;
mod memory;
mod retry;
mod types;

pub use local::LocalStorage;
pub use memory::MemoryStorage;
pub use retry::{RetryPolicy, RetryingStorage};
pub use types::*;
