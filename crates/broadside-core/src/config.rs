//! Game and transport configuration

use crate::error::{BroadsideError, Result};
use crate::ship::Ship;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Largest board edge; one letter per column between the first and last ship id
pub const MAX_BOARD_EDGE: u32 = (Ship::MAX_ID as u32) - (Ship::MIN_ID as u32);

/// Game configuration announced to every participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameConfig {
    /// Game title shown to players and bots
    pub title: String,
    /// Players needed before the game can start
    pub min_players: u32,
    /// Seats available in one game
    pub max_players: u32,
    /// Points needed to win, 0 when unset; at most the board area
    #[serde(default)]
    pub point_goal: u32,
    /// Columns per board
    pub board_width: u32,
    /// Rows per board
    pub board_height: u32,
    /// Fleet every player places
    pub ships: Vec<Ship>,
}

impl Default for GameConfig {
    fn default() -> Self {
        let ships = [('A', 5), ('B', 4), ('C', 3), ('D', 3), ('E', 2)]
            .into_iter()
            .map(|(id, length)| Ship::new_unchecked(id, length))
            .collect();
        Self {
            title: "Default".into(),
            min_players: 2,
            max_players: 9,
            point_goal: 0,
            board_width: 10,
            board_height: 10,
            ships,
        }
    }
}

impl GameConfig {
    /// Load and validate a configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            BroadsideError::Resource(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    /// Parse and validate a configuration from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        let config: GameConfig = serde_json::from_str(text)
            .map_err(|e| BroadsideError::InvalidArgument(format!("invalid game config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Number of cells in a board descriptor
    pub fn board_area(&self) -> usize {
        (self.board_width as usize) * (self.board_height as usize)
    }

    pub fn ship_count(&self) -> usize {
        self.ships.len()
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(BroadsideError::InvalidArgument(msg));

        if self.title.trim().is_empty() {
            return invalid("game title is empty".into());
        }
        if self.title.contains(['|', '\n']) {
            return invalid(format!("game title {:?} contains a reserved character", self.title));
        }
        if self.ships.is_empty() {
            return invalid("game has no ships".into());
        }
        if self.min_players < 2 {
            return invalid(format!("min players {} is below 2", self.min_players));
        }
        if self.max_players < self.min_players {
            return invalid(format!(
                "max players {} is below min players {}",
                self.max_players, self.min_players
            ));
        }
        for (name, edge) in [("width", self.board_width), ("height", self.board_height)] {
            if !(1..=MAX_BOARD_EDGE).contains(&edge) {
                return invalid(format!("board {} {} outside 1..={}", name, edge, MAX_BOARD_EDGE));
            }
        }
        if self.point_goal as usize > self.board_area() {
            return invalid(format!(
                "point goal {} exceeds board area {}",
                self.point_goal,
                self.board_area()
            ));
        }
        Ok(())
    }
}

/// Teardown escalation bounds for a subprocess channel
#[derive(Debug, Clone, Copy)]
pub struct ShutdownPolicy {
    /// How long to wait for a voluntary exit after closing the pipes
    pub exit_wait: Duration,
    /// How long to wait after SIGTERM before sending SIGKILL
    pub terminate_wait: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            exit_wait: Duration::from_millis(1000),
            terminate_wait: Duration::from_millis(1000),
        }
    }
}

/// Read bounds for the bot line protocol
#[derive(Debug, Clone, Copy)]
pub struct BotTimeouts {
    /// Wait for the `I` line after spawning
    pub handshake: Duration,
    /// Wait for the `J` reply to a `G` message
    pub join: Duration,
    /// Wait for the `S`/`K` reply to a shot query
    pub shot: Duration,
}

impl Default for BotTimeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_millis(1000),
            join: Duration::from_millis(1000),
            shot: Duration::from_millis(3000),
        }
    }
}
