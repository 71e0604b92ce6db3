//! # broadside-core
//!
//! Core types shared by the Broadside transport and bot protocol crates:
//! - Error taxonomy and `Result` alias
//! - Game configuration announced to players
//! - Ships and board coordinates
//! - Timing configuration for subprocess teardown and bot reads

pub mod config;
pub mod error;
pub mod ship;

pub use config::{BotTimeouts, GameConfig, MAX_BOARD_EDGE, ShutdownPolicy};
pub use error::{BroadsideError, Result};
pub use ship::{Coordinate, Ship};

/// Version announced to bots in the game info message
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");
