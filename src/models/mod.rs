//! Domain model module declarations.
//!
//! Mirrors §3 (Data Model) of the gateway specification: one module per
//! entity family, each carrying its lifecycle helpers.

pub mod accumulator;
pub mod agent_message;
pub mod im_message;
pub mod permission;
pub mod session;
