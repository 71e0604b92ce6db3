//! Bot players for the Broadside game server
//!
//! This crate provides:
//! - The pipe-delimited line protocol spoken between server and bots
//! - `BotClient`, which spawns a bot executable and drives it as a player

pub mod client;
pub mod protocol;

pub use client::BotClient;
pub use protocol::{BotMessage, GameInfo, ParseError, ServerMessage, Shot};
