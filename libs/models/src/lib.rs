//! # pv6-models
//!
//! Data model shared by the per-host agent and the coordinator.
//!
//! ## Ownership
//!
//! - `Ipv6Address` records are produced by the address classifier and never mutated
//! - `ProxyInstance` values are owned by the agent's instance manager; everything
//!   else only ever sees snapshots (clones)
//! - `NodeReport` is the unit of agent -> coordinator reporting and is always
//!   replaced wholesale, never merged
//!
//! The JSON shapes defined here are the wire format of both HTTP surfaces.

mod error;
mod types;

pub use error::ModelError;
pub use types::*;
