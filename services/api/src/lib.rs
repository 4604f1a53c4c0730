//! Tandem API Library Crate
//!
//! All the logic for the Tandem web service: configuration, persistence,
//! the session manager, the WebSocket transport, REST handlers, and
//! routing. The `api` binary is a thin wrapper around this library.

pub mod config;
pub mod db;
pub mod handlers;
pub mod manager;
pub mod models;
pub mod router;
pub mod state;
pub mod ws;
