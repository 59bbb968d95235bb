#![forbid(unsafe_code)]
//! `im-cowork-gateway` — IM-to-agent gateway library.
//!
//! Bridges a fleet of chat platforms to a long-running tool-using agent
//! runtime. The coordination layer lives in [`multiplexer`] (per-conversation
//! session routing and human-in-the-loop permission confirmation) and
//! [`runner`] (the streaming engine that drives the agent child process).

mod errors;
pub use errors::{AppError, Result};

pub mod audit;
pub mod config;
pub mod gateway;
pub mod ipc;
pub mod models;
pub mod multiplexer;
pub mod persistence;
pub mod runner;
pub mod transport;
