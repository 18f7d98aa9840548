//! Corral is a single-host supervisor that keeps a small fleet of worker
//! processes alive and routes JSON messages between them. Workers connect back
//! over TCP, announce themselves with a handshake, and from then on count as
//! healthy for as long as the connection stays open.

/// CLI interface.
pub mod cli;

/// Worker-side control connection.
pub mod client;

/// Configuration management.
pub mod config;

/// Error handling.
pub mod error;

/// Connection-based health checks.
pub mod health;

/// Wire framing for control connections.
pub mod ipc;

/// Log file locations.
pub mod logs;

/// Control message type.
pub mod message;

/// Process launching and signalling.
pub mod process;

/// Node registry.
pub mod registry;

/// Message routing.
pub mod router;

/// TCP control listener.
pub mod server;

/// Managed service state machine.
pub mod service;

/// Service definitions.
pub mod spec;

/// The supervisor.
pub mod supervisor;

#[cfg(test)]
pub(crate) mod test_utils;
