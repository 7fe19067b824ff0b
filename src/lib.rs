//! FireFlow - firewall policy compiler and application pipeline
//!
//! Validates filtering rules, detects shadowing and conflicts, compiles
//! policies into immutable versioned instruction sets, and applies them to
//! firewalls through a retrying, lease-guarded task pipeline.
//!
//! # Architecture
//!
//! - [`core`] - Rule model, validation, analysis, compilation, rendering
//! - [`orchestrator`] - Application tasks, queue, lease, retry, targets
//! - [`store`] - Persistence port with in-memory and JSON-file adapters
//! - [`engine`] - Use-case operations with auditing
//! - [`audit`] - JSON-lines audit log
//! - [`validators`] - Input validation for names, labels, scopes
//! - [`config`] - Configuration persistence
//! - [`utils`] - XDG directories and atomic writes
//!
//! # Safety Properties
//!
//! - First-match semantics are preserved by compilation
//! - Restrictive instructions are delivered before permissive ones
//! - The applied version changes only after the target confirms
//! - Failed applications roll back to the last applied version
//! - SHA-256 checksums over compiled instructions

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod engine;
pub mod orchestrator;
pub mod store;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::compile::{CompiledPolicy, Instruction, compile};
pub use core::error::{Error, Result};
pub use core::model::{Action, DefaultAction, FilteringPolicy, Firewall, Protocol, Rule};
pub use engine::Engine;
pub use orchestrator::Orchestrator;
