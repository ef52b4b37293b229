//! Process lifecycle: shutdown coordination and run watchdog.

pub mod shutdown;
pub mod watchdog;

pub use shutdown::ShutdownCoordinator;
pub use watchdog::{Watchdog, WatchdogGuard};
