//! Walletgate - Telegram wallet Mini App backend
//!
//! HTTP boundary over the `gatecore` auth library: init data login,
//! PIN set/check/verify, health. The binary in `main.rs` wires the
//! router to configuration; the router itself is exported for
//! integration tests.

pub mod cli;
pub mod webapp;
