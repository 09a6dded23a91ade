//! Gatecore - authentication core for the Walletgate Mini App backend
//!
//! This library provides the non-HTTP half of the wallet backend:
//! Telegram init data verification, account resolution against the
//! wallet store, and the PIN lockout state machine.
//!
//! # Module Structure
//!
//! - `core`: Configuration, errors, and logging
//! - `auth`: Init data verifier, account resolver, PIN guard
//! - `storage`: Wallet account store (SQLite)

pub mod auth;
pub mod core;
pub mod storage;

// Re-export commonly used types for convenience
pub use auth::{verify_init_data, InitDataError, PinError, PinPolicy, VerifiedUser};
pub use core::{config, AppError, AppResult};
pub use storage::{create_pool, get_connection, DbConnection, DbPool, WalletAccount};
