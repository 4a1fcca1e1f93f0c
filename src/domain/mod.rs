//! Domain layer - Core records, request values and port definitions
//!
//! This module defines the records the engine reasons about and the traits
//! (ports) that adapters implement, following hexagonal architecture
//! principles.

pub mod model;
pub mod plan;
pub mod ports;

pub use model::*;
pub use plan::*;
pub use ports::*;
