//! Wire protocol between the game server and bot players
//!
//! Every message is one line of `|`-separated fields whose first field is a
//! single-letter code. Fields are trimmed when parsed. There is no escaping:
//! a `|` inside free text (chat messages, titles) splits the field.

use broadside_core::{Coordinate, GameConfig, SERVER_VERSION, Ship};
use thiserror::Error;

pub const DELIMITER: char = '|';

/// Reasons a line does not match the grammar
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty message")]
    Empty,

    #[error("unexpected message code '{0}'")]
    UnexpectedCode(String),

    #[error("message '{code}' has {actual} fields, expected {expected}")]
    FieldCount {
        code: char,
        expected: usize,
        actual: usize,
    },

    #[error("missing {0}")]
    MissingField(&'static str),

    #[error("invalid {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },
}

/// Split a line into trimmed fields
pub fn split_fields(line: &str) -> Vec<&str> {
    line.trim().split(DELIMITER).map(str::trim).collect()
}

fn join_fields<I, S>(code: char, fields: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut line = String::from(code);
    for field in fields {
        line.push(DELIMITER);
        line.push_str(field.as_ref());
    }
    line
}

fn parse_uint(field: &'static str, value: &str) -> Result<u32, ParseError> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::InvalidField {
            field,
            value: value.to_string(),
        });
    }
    value.parse().map_err(|_| ParseError::InvalidField {
        field,
        value: value.to_string(),
    })
}

fn required<'a>(field: &'static str, value: Option<&&'a str>) -> Result<&'a str, ParseError> {
    match value {
        Some(v) if !v.is_empty() => Ok(*v),
        _ => Err(ParseError::MissingField(field)),
    }
}

fn expect_count(code: char, fields: &[&str], expected: usize) -> Result<(), ParseError> {
    if fields.len() != expected {
        return Err(ParseError::FieldCount {
            code,
            expected,
            actual: fields.len(),
        });
    }
    Ok(())
}

/// Everything a bot learns from the `G` message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameInfo {
    pub server_version: String,
    pub started: bool,
    pub joined: u32,
    pub config: GameConfig,
}

impl GameInfo {
    /// A game that has not started and has no players yet
    pub fn new(config: GameConfig) -> Self {
        Self {
            server_version: SERVER_VERSION.to_string(),
            started: false,
            joined: 0,
            config,
        }
    }
}

/// A shot chosen by a bot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shot {
    pub target: String,
    pub coordinate: Coordinate,
}

/// Messages sent by the server to a bot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// `G`: describe the game being joined
    GameInfo(GameInfo),
    /// `J`: a player joined
    PlayerJoined { player: String },
    /// `Y`: the bot's own board layout
    AssignBoard { board: String },
    /// `S`: the game started with this turn order
    GameStarted { order: Vec<String> },
    /// `N`: it is `player`'s turn
    Turn { player: String },
    /// `B`
    BoardUpdate {
        player: String,
        status: String,
        board: String,
        score: u32,
        skips: u32,
        turns: u32,
    },
    /// `K`: a player's turn was skipped
    Skip { player: String, reason: String },
    /// `F`
    GameFinished {
        state: String,
        turns: u32,
        players: u32,
    },
    /// `R`: final standing of one player
    PlayerResult {
        player: String,
        score: u32,
        skips: u32,
        turns: u32,
        status: String,
    },
    /// `M`
    Message {
        from: String,
        text: String,
        group: String,
    },
    /// `H`: `player` hit `target` at `coordinate`
    Hit {
        player: String,
        target: String,
        coordinate: Coordinate,
    },
}

impl ServerMessage {
    pub fn code(&self) -> char {
        match self {
            ServerMessage::GameInfo(_) => 'G',
            ServerMessage::PlayerJoined { .. } => 'J',
            ServerMessage::AssignBoard { .. } => 'Y',
            ServerMessage::GameStarted { .. } => 'S',
            ServerMessage::Turn { .. } => 'N',
            ServerMessage::BoardUpdate { .. } => 'B',
            ServerMessage::Skip { .. } => 'K',
            ServerMessage::GameFinished { .. } => 'F',
            ServerMessage::PlayerResult { .. } => 'R',
            ServerMessage::Message { .. } => 'M',
            ServerMessage::Hit { .. } => 'H',
        }
    }

    pub fn to_line(&self) -> String {
        let code = self.code();
        match self {
            ServerMessage::GameInfo(info) => {
                let config = &info.config;
                let mut fields = vec![
                    info.server_version.clone(),
                    config.title.clone(),
                    if info.started { "Y" } else { "N" }.to_string(),
                    config.min_players.to_string(),
                    config.max_players.to_string(),
                    info.joined.to_string(),
                    config.point_goal.to_string(),
                    config.board_width.to_string(),
                    config.board_height.to_string(),
                    config.ship_count().to_string(),
                ];
                fields.extend(config.ships.iter().map(Ship::to_string));
                join_fields(code, fields)
            }
            ServerMessage::PlayerJoined { player } | ServerMessage::Turn { player } => {
                join_fields(code, [player])
            }
            ServerMessage::AssignBoard { board } => join_fields(code, [board]),
            ServerMessage::GameStarted { order } => join_fields(code, order),
            ServerMessage::BoardUpdate {
                player,
                status,
                board,
                score,
                skips,
                turns,
            } => join_fields(
                code,
                [
                    player.clone(),
                    status.clone(),
                    board.clone(),
                    score.to_string(),
                    skips.to_string(),
                    turns.to_string(),
                ],
            ),
            ServerMessage::Skip { player, reason } => join_fields(code, [player, reason]),
            ServerMessage::GameFinished {
                state,
                turns,
                players,
            } => join_fields(
                code,
                [state.clone(), turns.to_string(), players.to_string()],
            ),
            ServerMessage::PlayerResult {
                player,
                score,
                skips,
                turns,
                status,
            } => join_fields(
                code,
                [
                    player.clone(),
                    score.to_string(),
                    skips.to_string(),
                    turns.to_string(),
                    status.clone(),
                ],
            ),
            ServerMessage::Message { from, text, group } => {
                join_fields(code, [from, text, group])
            }
            ServerMessage::Hit {
                player,
                target,
                coordinate,
            } => join_fields(
                code,
                [player.clone(), target.clone(), coordinate.to_string()],
            ),
        }
    }

    /// Parse a server line the way a bot would
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let fields = split_fields(line);
        let code = match fields[0] {
            "" => return Err(ParseError::Empty),
            c if c.chars().count() == 1 => c.chars().next().unwrap_or_default(),
            other => return Err(ParseError::UnexpectedCode(other.to_string())),
        };
        let owned = |i: usize| fields[i].to_string();

        match code {
            'G' => parse_game_info(&fields).map(ServerMessage::GameInfo),
            'J' => {
                expect_count(code, &fields, 2)?;
                Ok(ServerMessage::PlayerJoined { player: owned(1) })
            }
            'Y' => {
                expect_count(code, &fields, 2)?;
                Ok(ServerMessage::AssignBoard {
                    board: required("board", fields.get(1))?.to_string(),
                })
            }
            'S' => Ok(ServerMessage::GameStarted {
                order: fields[1..].iter().map(|s| s.to_string()).collect(),
            }),
            'N' => {
                expect_count(code, &fields, 2)?;
                Ok(ServerMessage::Turn { player: owned(1) })
            }
            'B' => {
                expect_count(code, &fields, 7)?;
                Ok(ServerMessage::BoardUpdate {
                    player: owned(1),
                    status: owned(2),
                    board: owned(3),
                    score: parse_uint("score", fields[4])?,
                    skips: parse_uint("skips", fields[5])?,
                    turns: parse_uint("turns", fields[6])?,
                })
            }
            'K' => {
                expect_count(code, &fields, 3)?;
                Ok(ServerMessage::Skip {
                    player: owned(1),
                    reason: owned(2),
                })
            }
            'F' => {
                expect_count(code, &fields, 4)?;
                Ok(ServerMessage::GameFinished {
                    state: owned(1),
                    turns: parse_uint("turn count", fields[2])?,
                    players: parse_uint("player count", fields[3])?,
                })
            }
            'R' => {
                expect_count(code, &fields, 6)?;
                Ok(ServerMessage::PlayerResult {
                    player: owned(1),
                    score: parse_uint("score", fields[2])?,
                    skips: parse_uint("skips", fields[3])?,
                    turns: parse_uint("turns", fields[4])?,
                    status: owned(5),
                })
            }
            'M' => {
                expect_count(code, &fields, 4)?;
                Ok(ServerMessage::Message {
                    from: owned(1),
                    text: owned(2),
                    group: owned(3),
                })
            }
            'H' => {
                expect_count(code, &fields, 4)?;
                let coordinate =
                    fields[3]
                        .parse::<Coordinate>()
                        .map_err(|_| ParseError::InvalidField {
                            field: "coordinate",
                            value: owned(3),
                        })?;
                Ok(ServerMessage::Hit {
                    player: owned(1),
                    target: owned(2),
                    coordinate,
                })
            }
            _ => Err(ParseError::UnexpectedCode(code.to_string())),
        }
    }
}

fn parse_game_info(fields: &[&str]) -> Result<GameInfo, ParseError> {
    const HEADER: usize = 11;
    if fields.len() < HEADER {
        return Err(ParseError::FieldCount {
            code: 'G',
            expected: HEADER,
            actual: fields.len(),
        });
    }

    let started = match fields[3] {
        "Y" => true,
        "N" => false,
        other => {
            return Err(ParseError::InvalidField {
                field: "started flag",
                value: other.to_string(),
            });
        }
    };
    let ship_count = parse_uint("ship count", fields[10])? as usize;
    expect_count('G', fields, HEADER + ship_count)?;

    let ships = fields[HEADER..]
        .iter()
        .map(|s| {
            s.parse::<Ship>().map_err(|_| ParseError::InvalidField {
                field: "ship",
                value: s.to_string(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(GameInfo {
        server_version: required("server version", fields.get(1))?.to_string(),
        started,
        joined: parse_uint("joined count", fields[6])?,
        config: GameConfig {
            title: fields[2].to_string(),
            min_players: parse_uint("min players", fields[4])?,
            max_players: parse_uint("max players", fields[5])?,
            point_goal: parse_uint("point goal", fields[7])?,
            board_width: parse_uint("board width", fields[8])?,
            board_height: parse_uint("board height", fields[9])?,
            ships,
        },
    })
}

/// Messages sent by a bot to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotMessage {
    /// `I`: identity sent once at startup
    Info {
        name: String,
        version: String,
        display_name: Option<String>,
    },
    /// `J`: request to join; the board is absent once the game has started
    Join {
        player: String,
        board: Option<String>,
    },
    /// `S`: chosen shot
    Shot(Shot),
    /// `K`: forfeit this move
    Skip,
}

impl BotMessage {
    pub fn to_line(&self) -> String {
        match self {
            BotMessage::Info {
                name,
                version,
                display_name,
            } => {
                let mut fields = vec![name.as_str(), version.as_str()];
                if let Some(display) = display_name {
                    fields.push(display);
                }
                join_fields('I', fields)
            }
            BotMessage::Join { player, board } => {
                let mut fields = vec![player.as_str()];
                if let Some(board) = board {
                    fields.push(board);
                }
                join_fields('J', fields)
            }
            BotMessage::Shot(shot) => join_fields(
                'S',
                [
                    shot.target.clone(),
                    shot.coordinate.x.to_string(),
                    shot.coordinate.y.to_string(),
                ],
            ),
            BotMessage::Skip => "K".to_string(),
        }
    }

    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let fields = split_fields(line);
        match fields[0] {
            "" => Err(ParseError::Empty),
            "I" => {
                if !(3..=4).contains(&fields.len()) {
                    return Err(ParseError::FieldCount {
                        code: 'I',
                        expected: 3,
                        actual: fields.len(),
                    });
                }
                Ok(BotMessage::Info {
                    name: required("bot name", fields.get(1))?.to_string(),
                    version: required("bot version", fields.get(2))?.to_string(),
                    display_name: fields
                        .get(3)
                        .filter(|s| !s.is_empty())
                        .map(|s| s.to_string()),
                })
            }
            "J" => {
                if !(2..=3).contains(&fields.len()) {
                    return Err(ParseError::FieldCount {
                        code: 'J',
                        expected: 3,
                        actual: fields.len(),
                    });
                }
                Ok(BotMessage::Join {
                    player: required("player name", fields.get(1))?.to_string(),
                    board: fields.get(2).map(|s| s.to_string()),
                })
            }
            "S" => {
                expect_count('S', &fields, 4)?;
                Ok(BotMessage::Shot(Shot {
                    target: required("target player", fields.get(1))?.to_string(),
                    coordinate: Coordinate::new(
                        parse_uint("x coordinate", fields[2])?,
                        parse_uint("y coordinate", fields[3])?,
                    ),
                }))
            }
            "K" => Ok(BotMessage::Skip),
            other => Err(ParseError::UnexpectedCode(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_game_info_round_trip() {
        let config = GameConfig {
            title: "Weekend Cup".into(),
            point_goal: 12,
            board_width: 12,
            board_height: 8,
            ..GameConfig::default()
        };
        let info = GameInfo {
            server_version: "2.1".into(),
            started: false,
            joined: 3,
            config,
        };

        let line = ServerMessage::GameInfo(info.clone()).to_line();
        assert_eq!(line, "G|2.1|Weekend Cup|N|2|9|3|12|12|8|5|A5|B4|C3|D3|E2");
        assert_eq!(ServerMessage::parse(&line).unwrap(), ServerMessage::GameInfo(info));
    }

    #[test]
    fn test_game_info_rejects_ship_count_mismatch() {
        let err = ServerMessage::parse("G|1.0|T|N|2|9|0|0|10|10|2|A5").unwrap_err();
        assert!(matches!(err, ParseError::FieldCount { code: 'G', .. }));
        let err = ServerMessage::parse("G|1.0|T|maybe|2|9|0|0|10|10|1|A5").unwrap_err();
        assert!(matches!(err, ParseError::InvalidField { .. }));
    }

    #[test]
    fn test_server_notifications_wire_form() {
        let cases = [
            (
                ServerMessage::GameStarted {
                    order: vec!["ann".into(), "bob".into()],
                },
                "S|ann|bob",
            ),
            (
                ServerMessage::BoardUpdate {
                    player: "ann".into(),
                    status: "active".into(),
                    board: "..X.".into(),
                    score: 4,
                    skips: 0,
                    turns: 7,
                },
                "B|ann|active|..X.|4|0|7",
            ),
            (
                ServerMessage::Hit {
                    player: "ann".into(),
                    target: "bob".into(),
                    coordinate: Coordinate::new(3, 5),
                },
                "H|ann|bob|c5",
            ),
            (
                ServerMessage::GameFinished {
                    state: "finished".into(),
                    turns: 40,
                    players: 2,
                },
                "F|finished|40|2",
            ),
            (
                ServerMessage::PlayerResult {
                    player: "bob".into(),
                    score: 17,
                    skips: 1,
                    turns: 40,
                    status: "winner".into(),
                },
                "R|bob|17|1|40|winner",
            ),
        ];
        for (message, line) in cases {
            assert_eq!(message.to_line(), line);
            assert_eq!(ServerMessage::parse(line).unwrap(), message);
        }
    }

    #[test]
    fn test_delimiter_in_free_text_is_not_escaped() {
        let message = ServerMessage::Message {
            from: "ann".into(),
            text: "left|right".into(),
            group: "all".into(),
        };
        let line = message.to_line();
        assert_eq!(line, "M|ann|left|right|all");
        assert!(matches!(
            ServerMessage::parse(&line),
            Err(ParseError::FieldCount { code: 'M', .. })
        ));
    }

    #[test]
    fn test_bot_info_display_name_is_optional() {
        assert_eq!(
            BotMessage::parse("I|hunter|1.2").unwrap(),
            BotMessage::Info {
                name: "hunter".into(),
                version: "1.2".into(),
                display_name: None,
            }
        );
        assert_eq!(
            BotMessage::parse(" I | hunter | 1.2 | Captain \n").unwrap(),
            BotMessage::Info {
                name: "hunter".into(),
                version: "1.2".into(),
                display_name: Some("Captain".into()),
            }
        );
        assert!(BotMessage::parse("I||1.2").is_err());
        assert!(BotMessage::parse("I|hunter").is_err());
    }

    #[test]
    fn test_bot_shot_parsing() {
        assert_eq!(
            BotMessage::parse("S|bob|3|7").unwrap(),
            BotMessage::Shot(Shot {
                target: "bob".into(),
                coordinate: Coordinate::new(3, 7),
            })
        );
        assert_eq!(BotMessage::parse("K").unwrap(), BotMessage::Skip);
        assert!(BotMessage::parse("S|bob|3").is_err());
        assert!(BotMessage::parse("S|bob|-3|7").is_err());
        assert!(BotMessage::parse("S||3|7").is_err());
        assert!(matches!(
            BotMessage::parse("X|1"),
            Err(ParseError::UnexpectedCode(_))
        ));
        assert_eq!(BotMessage::parse(""), Err(ParseError::Empty));
    }

    #[test]
    fn test_bot_join_board_optional() {
        let join = BotMessage::Join {
            player: "hunter".into(),
            board: Some("....".into()),
        };
        assert_eq!(join.to_line(), "J|hunter|....");
        assert_eq!(BotMessage::parse("J|hunter|....").unwrap(), join);
        assert_eq!(
            BotMessage::parse("J|hunter").unwrap(),
            BotMessage::Join {
                player: "hunter".into(),
                board: None,
            }
        );
    }
}
