//! Coordination layer
//!
//! - Trigger scheduling (periodic sweep, event subscription, heartbeat)
//! - Graceful shutdown handling

pub mod scheduler;
pub mod shutdown;

pub use scheduler::{Scheduler, SchedulerHandle, SchedulerSettings, TriggerStatus};
pub use shutdown::{
    install_signal_handlers, GracefulShutdown, ShutdownConfig, ShutdownError, ShutdownPhase,
    ShutdownReport, ShutdownSignal, ShutdownToken,
};
