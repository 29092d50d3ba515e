//! Courier ties the mailbox, the persistence sweeper and the rate limiters
//! to one configuration file and one process lifecycle.

pub mod controller;

pub use controller::{Courier, SHUTDOWN_BROADCAST};
