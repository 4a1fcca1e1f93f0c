//! Storage access groups

pub mod groups;

pub use groups::{parse_groups, MoveVerdict, StorageAccessGroupMatcher, NO_COMMON_HOST};
