//! Ship definitions and board coordinates

use crate::error::{BroadsideError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A ship in the game configuration, written on the wire as `<id><length>` (e.g. `A5`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ship {
    id: char,
    length: u32,
}

impl Ship {
    pub const MIN_LENGTH: u32 = 2;
    pub const MAX_LENGTH: u32 = 8;
    pub const MIN_ID: char = 'A';
    pub const MAX_ID: char = 'W';

    /// Create a ship, normalizing the id to upper case
    pub fn new(id: char, length: u32) -> Result<Self> {
        let ship = Self {
            id: id.to_ascii_uppercase(),
            length,
        };
        if !Self::is_valid_id(ship.id) {
            return Err(BroadsideError::InvalidArgument(format!(
                "ship id '{}' outside {}..={}",
                id,
                Self::MIN_ID,
                Self::MAX_ID
            )));
        }
        if !(Self::MIN_LENGTH..=Self::MAX_LENGTH).contains(&length) {
            return Err(BroadsideError::InvalidArgument(format!(
                "ship {} length {} outside {}..={}",
                ship.id,
                length,
                Self::MIN_LENGTH,
                Self::MAX_LENGTH
            )));
        }
        Ok(ship)
    }

    pub(crate) const fn new_unchecked(id: char, length: u32) -> Self {
        Self { id, length }
    }

    pub fn is_valid_id(id: char) -> bool {
        (Self::MIN_ID..=Self::MAX_ID).contains(&id)
    }

    pub fn id(&self) -> char {
        self.id
    }

    pub fn length(&self) -> u32 {
        self.length
    }
}

impl fmt::Display for Ship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.id, self.length)
    }
}

impl FromStr for Ship {
    type Err = BroadsideError;

    fn from_str(s: &str) -> Result<Self> {
        let mut chars = s.chars();
        let id = chars
            .next()
            .ok_or_else(|| BroadsideError::InvalidArgument("empty ship descriptor".into()))?;
        let length = chars.as_str().parse::<u32>().map_err(|_| {
            BroadsideError::InvalidArgument(format!("invalid ship descriptor: {:?}", s))
        })?;
        if !Self::is_valid_id(id) {
            return Err(BroadsideError::InvalidArgument(format!(
                "invalid ship descriptor: {:?}",
                s
            )));
        }
        Self::new(id, length)
    }
}

impl TryFrom<String> for Ship {
    type Error = BroadsideError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Ship> for String {
    fn from(ship: Ship) -> Self {
        ship.to_string()
    }
}

/// A 1-based board cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Coordinate {
    pub x: u32,
    pub y: u32,
}

impl Coordinate {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for Coordinate {
    /// Columns below 26 render as a letter (`c4`), wider boards as `x,y`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.x {
            1..=25 => {
                let column = (b'a' + (self.x - 1) as u8) as char;
                write!(f, "{}{}", column, self.y)
            }
            _ => write!(f, "{},{}", self.x, self.y),
        }
    }
}

impl FromStr for Coordinate {
    type Err = BroadsideError;

    /// Accepts both display forms: `c4` and `30,7`
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || BroadsideError::InvalidArgument(format!("invalid coordinate: {:?}", s));

        if let Some((x, y)) = s.split_once(',') {
            let x = x.trim().parse().map_err(|_| invalid())?;
            let y = y.trim().parse().map_err(|_| invalid())?;
            return Ok(Coordinate { x, y });
        }

        let mut chars = s.chars();
        let column = chars.next().filter(char::is_ascii_lowercase).ok_or_else(invalid)?;
        let y = chars.as_str().parse().map_err(|_| invalid())?;
        Ok(Coordinate {
            x: (column as u32) - ('a' as u32) + 1,
            y,
        })
    }
}
