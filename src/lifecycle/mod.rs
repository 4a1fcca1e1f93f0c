//! Storage Pool Lifecycle
//!
//! Status transitions, maintenance cascades, deletion and the bounded
//! host-connection batch for shared pools.

pub mod connect;
pub mod expunge;
pub mod manager;

pub use connect::{ConnectOptions, HostConnector};
pub use expunge::{ExpungeMode, VolumeExpunger};
pub use manager::{LifecycleDeps, StoragePoolLifecycleManager};
