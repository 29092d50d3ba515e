//! Cache store implementations
//!
//! - `memory`: in-process store with the same atomicity guarantees as the cluster
//! - `test`: wraps `memory` with fault injection and synchronisation helpers

pub mod memory;
pub mod test;

pub use memory::MemoryCacheStore;
pub use test::TestCacheStore;
