//! Structured agent path: session lifecycle, history and pending decisions.

pub mod bridge;
pub mod driver;
pub mod history;
pub mod message;
pub mod pending;
pub mod registry;
pub mod runner;
pub mod state;
