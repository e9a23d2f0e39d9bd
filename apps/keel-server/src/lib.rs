//! Keel server library.
//!
//! This library exposes the server components for testing.

pub mod admin;
pub mod config;
pub mod machine;
pub mod net;
pub mod server;
