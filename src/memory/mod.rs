//! In-Memory Adapters
//!
//! Implementations of every port that keep state in process. They back the
//! standalone binary and the test suites.

pub mod driver;
pub mod fixtures;
pub mod gateway;
pub mod store;

pub use driver::{DriverRegistry, SimulatedDriver};
pub use gateway::{SimulatedFailure, SimulatedGateway};
pub use store::{InMemoryStore, Inventory};
