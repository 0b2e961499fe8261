//! Narrow interfaces to the systems around the core
//!
//! Each interface has a small production implementation so the daemon runs
//! end to end; tests swap in the doubles from [`crate::testing`].

pub mod events;
pub mod inventory;
pub mod remote;

pub use events::{BroadcastPublisher, Event, EventPublisher, NoopPublisher};
pub use inventory::{
    BreakerId, BreakerTarget, Credentials, Inventory, SensorId, SensorTarget, ServerId,
    ServerTarget, StaticInventory,
};
pub use remote::{CommandOutput, RemoteShell, SshCommandShell};
