//! Terminal stream relay and agent session bridge.
//!
//! [`relay`] turns a raw terminal output stream into visible bytes plus
//! clipboard requests, and paces the visible bytes into frame-sized writes.
//! [`session`] tracks one agent conversation per tab: its history, usage,
//! and the permission and question requests that block the agent until
//! the user answers.

pub mod commands;
pub mod config;
pub mod display;
pub mod error;
pub mod event;
pub mod protocol;
pub mod relay;
pub mod session;

pub use error::{BridgeError, Result};
