//! Common test infrastructure
//!
//! Wires a scheduler node over a temporary job database with in-memory
//! identity, provisioning and connector collaborators. Tests should only
//! import from this module.

mod env;
mod fixtures;

pub use env::{TestEnv, ADMIN, DOMAIN};
#[allow(unused_imports)]
pub use fixtures::*;
