//! Core policy logic
//!
//! Everything here except [`document`] is synchronous and free of I/O:
//!
//! - [`model`]: Firewalls, policies, rules and their enums
//! - [`validate`]: Single-rule validation
//! - [`rule_constraints`]: Business rules for valid field combinations
//! - [`interval`]: Interval and interval-set value types
//! - [`match_space`]: N-dimensional match spaces built from intervals
//! - [`analyze`]: Shadowing and overlap detection
//! - [`compile`]: Policy compilation into versioned instruction sets
//! - [`render`]: nftables text and JSON output
//! - [`state`]: Firewall lifecycle transitions
//! - [`error`]: Error types shared by the whole crate
//! - [`document`]: Policy JSON files read by the CLI

pub mod analyze;
pub mod compile;
pub mod document;
pub mod error;
pub mod interval;
pub mod match_space;
pub mod model;
pub mod render;
pub mod rule_constraints;
pub mod state;
pub mod validate;

#[cfg(test)]
pub mod test_helpers;
