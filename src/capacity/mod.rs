//! Capacity
//!
//! Admission decisions for storage pools and the capacity rows derived from
//! pool counters.

pub mod admission;
pub mod records;

pub use admission::{CapacityAdmissionChecker, SpaceCheck};
pub use records::CapacityTracker;
