pub mod clock;
pub mod logging;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use tracing;

#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
    Finalised,
}
