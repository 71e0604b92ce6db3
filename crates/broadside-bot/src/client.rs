//! Driving a bot subprocess as a game participant

use crate::protocol::{BotMessage, GameInfo, ServerMessage, Shot};
use broadside_core::{BotTimeouts, BroadsideError, Coordinate, Result};
use broadside_transport::{
    ChannelState, IoDirection, Pid, Readable, SubprocessChannel,
};
use std::os::fd::BorrowedFd;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// A bot player speaking the line protocol over its stdin/stdout.
///
/// The subprocess is torn down when the client is dropped, including when
/// construction fails part way through the handshake.
#[derive(Debug)]
pub struct BotClient {
    /// Bidirectional pipe pair to the bot process
    channel: SubprocessChannel,
    /// Name from the `I` handshake
    bot_name: String,
    /// Version from the `I` handshake
    bot_version: String,
    /// Display name, or the bot name when none was given
    player_name: String,
    /// Reply deadlines for joins and shots
    timeouts: BotTimeouts,
}

impl BotClient {
    /// Spawn `command` and read its `I` handshake
    pub fn start(command: &str, timeouts: BotTimeouts) -> Result<Self> {
        let channel =
            SubprocessChannel::new(IoDirection::Bidirectional, alias_for(command), command);
        Self::from_channel(channel, timeouts)
    }

    /// Handshake over an existing channel, spawning it first if needed
    pub fn from_channel(mut channel: SubprocessChannel, timeouts: BotTimeouts) -> Result<Self> {
        if channel.state() == ChannelState::Unspawned {
            channel.run()?;
        }

        let identity = channel.alias().to_string();
        let line = read_from(&mut channel, timeouts.handshake, &identity)?.ok_or_else(|| {
            BroadsideError::protocol(
                &identity,
                "",
                format!("no info message within {} ms", timeouts.handshake.as_millis()),
            )
        })?;

        match BotMessage::parse(&line) {
            Ok(BotMessage::Info {
                name,
                version,
                display_name,
            }) => {
                let player_name = display_name.unwrap_or_else(|| name.clone());
                info!(
                    bot = %name,
                    version = %version,
                    player = %player_name,
                    pid = channel.pid().map(Pid::as_raw),
                    "Bot connected"
                );
                Ok(Self {
                    channel,
                    bot_name: name,
                    bot_version: version,
                    player_name,
                    timeouts,
                })
            }
            Ok(_) => Err(BroadsideError::protocol(
                identity,
                line,
                "expected info message",
            )),
            Err(e) => Err(BroadsideError::protocol(
                identity,
                line,
                format!("invalid info message: {}", e),
            )),
        }
    }

    /// Start the bot and enroll it in a game.
    ///
    /// Returns the client and, for a game that has not started, the board
    /// the bot generated.
    pub fn join(
        command: &str,
        game: &GameInfo,
        timeouts: BotTimeouts,
    ) -> Result<(Self, Option<String>)> {
        let mut client = Self::start(command, timeouts)?;
        let board = client.new_game(game)?;
        Ok((client, board))
    }

    /// Send `G` and validate the bot's `J` reply.
    ///
    /// The reply must name this bot's player and carry a board of exactly
    /// one cell per square unless the game has already started.
    pub fn new_game(&mut self, game: &GameInfo) -> Result<Option<String>> {
        self.send(ServerMessage::GameInfo(game.clone()))?;

        let line = self.read(self.timeouts.join)?.ok_or_else(|| {
            self.protocol_error("", format!(
                "no join message within {} ms",
                self.timeouts.join.as_millis()
            ))
        })?;

        let (player, board) = match BotMessage::parse(&line) {
            Ok(BotMessage::Join { player, board }) => (player, board),
            Ok(_) => return Err(self.protocol_error(&line, "expected join message")),
            Err(e) => {
                return Err(self.protocol_error(&line, format!("invalid join message: {}", e)));
            }
        };
        if player != self.player_name {
            return Err(self.protocol_error(
                &line,
                format!("join names '{}' instead of '{}'", player, self.player_name),
            ));
        }

        match (game.started, board) {
            (true, None) => Ok(None),
            (true, Some(_)) => Err(self.protocol_error(&line, "board sent for a started game")),
            (false, None) => Err(self.protocol_error(&line, "missing board descriptor")),
            (false, Some(board)) => {
                let area = game.config.board_area();
                if board.chars().count() != area {
                    return Err(self.protocol_error(
                        &line,
                        format!("board has {} cells, expected {}", board.chars().count(), area),
                    ));
                }
                Ok(Some(board))
            }
        }
    }

    /// Wait for the bot's move; `None` means it skipped its turn
    pub fn request_shot(&mut self) -> Result<Option<Shot>> {
        let line = self.read(self.timeouts.shot)?.ok_or_else(|| {
            self.protocol_error("", format!(
                "no shot message within {} ms",
                self.timeouts.shot.as_millis()
            ))
        })?;

        match BotMessage::parse(&line) {
            Ok(BotMessage::Shot(shot)) => Ok(Some(shot)),
            Ok(BotMessage::Skip) => Ok(None),
            Ok(_) => Err(self.protocol_error(&line, "expected shot or skip")),
            Err(e) => Err(self.protocol_error(&line, format!("invalid shot message: {}", e))),
        }
    }

    pub fn assign_board(&self, board: &str) -> Result<()> {
        self.send(ServerMessage::AssignBoard {
            board: board.to_string(),
        })
    }

    pub fn announce_join(&self, player: &str) -> Result<()> {
        self.send(ServerMessage::PlayerJoined {
            player: player.to_string(),
        })
    }

    pub fn announce_start(&self, order: &[String]) -> Result<()> {
        self.send(ServerMessage::GameStarted {
            order: order.to_vec(),
        })
    }

    pub fn announce_board_update(
        &self,
        player: &str,
        status: &str,
        board: &str,
        score: u32,
        skips: u32,
        turns: u32,
    ) -> Result<()> {
        self.send(ServerMessage::BoardUpdate {
            player: player.to_string(),
            status: status.to_string(),
            board: board.to_string(),
            score,
            skips,
            turns,
        })
    }

    pub fn announce_skip(&self, player: &str, reason: &str) -> Result<()> {
        self.send(ServerMessage::Skip {
            player: player.to_string(),
            reason: reason.to_string(),
        })
    }

    pub fn announce_turn(&self, player: &str) -> Result<()> {
        self.send(ServerMessage::Turn {
            player: player.to_string(),
        })
    }

    /// Relay chat text; a `|` inside `text` is sent as is, a line break is
    /// an `InvalidArgument` error
    pub fn announce_message(&self, from: &str, text: &str, group: &str) -> Result<()> {
        self.send(ServerMessage::Message {
            from: from.to_string(),
            text: text.to_string(),
            group: group.to_string(),
        })
    }

    pub fn announce_hit(&self, player: &str, target: &str, coordinate: Coordinate) -> Result<()> {
        self.send(ServerMessage::Hit {
            player: player.to_string(),
            target: target.to_string(),
            coordinate,
        })
    }

    pub fn announce_finish(&self, state: &str, turns: u32, players: u32) -> Result<()> {
        self.send(ServerMessage::GameFinished {
            state: state.to_string(),
            turns,
            players,
        })
    }

    pub fn announce_result(
        &self,
        player: &str,
        score: u32,
        skips: u32,
        turns: u32,
        status: &str,
    ) -> Result<()> {
        self.send(ServerMessage::PlayerResult {
            player: player.to_string(),
            score,
            skips,
            turns,
            status: status.to_string(),
        })
    }

    pub fn bot_name(&self) -> &str {
        &self.bot_name
    }

    pub fn bot_version(&self) -> &str {
        &self.bot_version
    }

    pub fn player_name(&self) -> &str {
        &self.player_name
    }

    pub fn pid(&self) -> Option<Pid> {
        self.channel.pid()
    }

    pub fn channel(&self) -> &SubprocessChannel {
        &self.channel
    }

    /// Close the bot's pipes and reap it
    pub fn close(&mut self) {
        self.channel.close();
    }

    fn send(&self, message: ServerMessage) -> Result<()> {
        let line = message.to_line();
        if line.contains(['\n', '\r']) {
            return Err(BroadsideError::InvalidArgument(format!(
                "message for bot '{}' contains a line break: {:?}",
                self.bot_name, line
            )));
        }
        debug!("[server→{}] {}", self.bot_name, line);
        self.channel.send_line(&line).map_err(|e| match e {
            BroadsideError::State(_) | BroadsideError::InvalidArgument(_) => e,
            other => BroadsideError::State(format!(
                "bot '{}' is not writable: {}",
                self.bot_name, other
            )),
        })
    }

    fn read(&mut self, timeout: Duration) -> Result<Option<String>> {
        read_from(&mut self.channel, timeout, &self.bot_name)
    }

    fn protocol_error(&self, line: &str, reason: impl Into<String>) -> BroadsideError {
        BroadsideError::protocol(&self.bot_name, line, reason)
    }
}

impl Readable for BotClient {
    fn readable_fd(&self) -> Option<BorrowedFd<'_>> {
        self.channel.read_handle()
    }
}

fn read_from(
    channel: &mut SubprocessChannel,
    timeout: Duration,
    bot: &str,
) -> Result<Option<String>> {
    let line = channel.read_line(timeout)?;
    if let Some(line) = &line {
        debug!("[{}→server] {}", bot, line);
    }
    Ok(line.map(|l| l.trim().to_string()).filter(|l| !l.is_empty()))
}

/// Name a bot by its executable until it introduces itself
fn alias_for(command: &str) -> String {
    command
        .split_whitespace()
        .next()
        .and_then(|exe| Path::new(exe).file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "bot".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use broadside_core::GameConfig;
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const BOARD_16: &str = "..AA....B..B....";

    fn timeouts() -> BotTimeouts {
        BotTimeouts {
            handshake: Duration::from_secs(5),
            join: Duration::from_secs(5),
            shot: Duration::from_secs(5),
        }
    }

    fn small_game() -> GameInfo {
        GameInfo::new(GameConfig {
            board_width: 4,
            board_height: 4,
            ..GameConfig::default()
        })
    }

    fn bot_script(body: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", body).unwrap();
        file.flush().unwrap();
        file
    }

    fn command(script: &NamedTempFile, args: &[&Path]) -> String {
        let mut command = format!("sh {}", script.path().display());
        for arg in args {
            command.push(' ');
            command.push_str(&arg.display().to_string());
        }
        command
    }

    fn shooter_script(shot_reply: &str) -> NamedTempFile {
        bot_script(&format!(
            r#"echo "I|hunter|1.0|Captain"
while read -r line; do
  case "$line" in
    G\|*) echo "J|Captain|{board}" ;;
    N\|Captain) echo "{shot}" ;;
  esac
done
"#,
            board = BOARD_16,
            shot = shot_reply
        ))
    }

    #[test]
    fn test_handshake_join_and_shot() {
        let script = shooter_script("S|rival|3|4");
        let (mut bot, board) = BotClient::join(&command(&script, &[]), &small_game(), timeouts())
            .unwrap();

        assert_eq!(bot.bot_name(), "hunter");
        assert_eq!(bot.bot_version(), "1.0");
        assert_eq!(bot.player_name(), "Captain");
        assert_eq!(board.as_deref(), Some(BOARD_16));

        bot.announce_turn("Captain").unwrap();
        let shot = bot.request_shot().unwrap().unwrap();
        assert_eq!(shot.target, "rival");
        assert_eq!(shot.coordinate, Coordinate::new(3, 4));
    }

    #[test]
    fn test_skip_reply_is_empty_shot() {
        let script = shooter_script("K");
        let (mut bot, _) =
            BotClient::join(&command(&script, &[]), &small_game(), timeouts()).unwrap();
        bot.announce_turn("Captain").unwrap();
        assert_eq!(bot.request_shot().unwrap(), None);
    }

    #[test]
    fn test_malformed_shot_is_protocol_error() {
        let script = shooter_script("S|rival|three|4");
        let (mut bot, _) =
            BotClient::join(&command(&script, &[]), &small_game(), timeouts()).unwrap();
        bot.announce_turn("Captain").unwrap();

        let err = bot.request_shot().unwrap_err();
        match err {
            BroadsideError::Protocol { bot, line, .. } => {
                assert_eq!(bot, "hunter");
                assert_eq!(line, "S|rival|three|4");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_player_name_defaults_to_bot_name() {
        let script = bot_script(
            r#"echo "I|plain|2.0"
while read -r line; do :; done
"#,
        );
        let bot = BotClient::start(&command(&script, &[]), timeouts()).unwrap();
        assert_eq!(bot.player_name(), "plain");
    }

    #[test]
    fn test_mismatched_join_tears_down_bot() {
        let pid_file = NamedTempFile::new().unwrap();
        let script = bot_script(&format!(
            r#"echo $$ > "$1"
echo "I|hunter|1.0|Captain"
while read -r line; do
  case "$line" in
    G\|*) echo "J|Impostor|{}" ;;
  esac
done
"#,
            BOARD_16
        ));

        let err = BotClient::join(
            &command(&script, &[pid_file.path()]),
            &small_game(),
            timeouts(),
        )
        .unwrap_err();
        assert!(err.is_protocol());
        assert!(err.to_string().contains("J|Impostor"));

        let pid: i32 = std::fs::read_to_string(pid_file.path())
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_eq!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH));
    }

    #[test]
    fn test_join_board_must_cover_every_cell() {
        let script = bot_script(
            r#"echo "I|hunter|1.0"
while read -r line; do
  case "$line" in
    G\|*) echo "J|hunter|...." ;;
  esac
done
"#,
        );
        let err = BotClient::join(&command(&script, &[]), &small_game(), timeouts()).unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn test_started_game_join_has_no_board() {
        let script = bot_script(
            r#"echo "I|hunter|1.0"
while read -r line; do
  case "$line" in
    G\|*) echo "J|hunter" ;;
  esac
done
"#,
        );
        let game = GameInfo {
            started: true,
            joined: 2,
            ..small_game()
        };
        let (_bot, board) = BotClient::join(&command(&script, &[]), &game, timeouts()).unwrap();
        assert_eq!(board, None);

        // The same reply is short for a game still accepting boards
        let err = BotClient::join(&command(&script, &[]), &small_game(), timeouts()).unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn test_game_info_reaches_bot_intact() {
        let received = NamedTempFile::new().unwrap();
        let script = bot_script(&format!(
            r#"echo "I|hunter|1.0"
while read -r line; do
  case "$line" in
    G\|*) printf '%s\n' "$line" > "$1"; echo "J|hunter|{}" ;;
  esac
done
"#,
            BOARD_16
        ));
        let game = small_game();
        let (mut bot, _) = BotClient::join(
            &command(&script, &[received.path()]),
            &game,
            timeouts(),
        )
        .unwrap();
        bot.close();

        let line = std::fs::read_to_string(received.path()).unwrap();
        match ServerMessage::parse(line.trim_end()).unwrap() {
            ServerMessage::GameInfo(parsed) => {
                assert_eq!(parsed.config.min_players, game.config.min_players);
                assert_eq!(parsed.config.max_players, game.config.max_players);
                assert_eq!(parsed.config.point_goal, game.config.point_goal);
                assert_eq!(parsed.config.board_width, 4);
                assert_eq!(parsed.config.board_height, 4);
                assert_eq!(parsed.config.ships, game.config.ships);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_notifications_are_written_in_order() {
        let received = NamedTempFile::new().unwrap();
        let script = bot_script(
            r#"echo "I|scribe|0.1"
while read -r line; do printf '%s\n' "$line" >> "$1"; done
"#,
        );
        let mut bot = BotClient::start(&command(&script, &[received.path()]), timeouts()).unwrap();

        bot.announce_join("ann").unwrap();
        bot.assign_board(BOARD_16).unwrap();
        bot.announce_start(&["ann".to_string(), "scribe".to_string()])
            .unwrap();
        bot.announce_turn("ann").unwrap();
        bot.announce_hit("ann", "scribe", Coordinate::new(2, 3)).unwrap();
        bot.announce_board_update("scribe", "active", BOARD_16, 0, 0, 1)
            .unwrap();
        bot.announce_skip("ann", "timeout").unwrap();
        bot.announce_message("ann", "gg|wp", "all").unwrap();
        bot.announce_finish("finished", 9, 2).unwrap();
        bot.announce_result("scribe", 3, 1, 9, "loser").unwrap();
        bot.close();

        let lines = std::fs::read_to_string(received.path()).unwrap();
        let expected = [
            "J|ann".to_string(),
            format!("Y|{}", BOARD_16),
            "S|ann|scribe".to_string(),
            "N|ann".to_string(),
            "H|ann|scribe|b3".to_string(),
            format!("B|scribe|active|{}|0|0|1", BOARD_16),
            "K|ann|timeout".to_string(),
            "M|ann|gg|wp|all".to_string(),
            "F|finished|9|2".to_string(),
            "R|scribe|3|1|9|loser".to_string(),
        ];
        assert_eq!(lines.lines().collect::<Vec<_>>(), expected);
    }

    #[test]
    fn test_line_break_in_message_is_not_forwarded() {
        let received = NamedTempFile::new().unwrap();
        let script = bot_script(
            r#"echo "I|scribe|0.1"
while read -r line; do printf '%s\n' "$line" >> "$1"; done
"#,
        );
        let mut bot = BotClient::start(&command(&script, &[received.path()]), timeouts()).unwrap();

        let err = bot
            .announce_message("ann", "hi\nS|victim|1|1", "all")
            .unwrap_err();
        assert!(matches!(err, BroadsideError::InvalidArgument(_)));
        let err = bot.announce_skip("ann", "late\r\nF|over|0|0").unwrap_err();
        assert!(matches!(err, BroadsideError::InvalidArgument(_)));

        // The bot stays usable and saw none of the rejected text
        bot.announce_turn("ann").unwrap();
        bot.close();

        let lines = std::fs::read_to_string(received.path()).unwrap();
        assert_eq!(lines.lines().collect::<Vec<_>>(), ["N|ann"]);
    }

    #[test]
    fn test_announce_after_close_is_state_error() {
        let script = bot_script(
            r#"echo "I|plain|2.0"
while read -r line; do :; done
"#,
        );
        let mut bot = BotClient::start(&command(&script, &[]), timeouts()).unwrap();
        bot.close();
        assert!(bot.announce_turn("plain").unwrap_err().is_state());
    }

    #[test]
    fn test_bad_handshake_is_protocol_error() {
        let script = bot_script("echo \"hello there\"\n");
        let err = BotClient::start(&command(&script, &[]), timeouts()).unwrap_err();
        assert!(err.is_protocol());

        let err = BotClient::start("/nonexistent/bot", timeouts()).unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn test_silent_bot_times_out() {
        let script = bot_script("exec sleep 5\n");
        let short = BotTimeouts {
            handshake: Duration::from_millis(100),
            ..timeouts()
        };
        let err = BotClient::start(&command(&script, &[]), short).unwrap_err();
        assert!(err.is_protocol());
        assert!(err.to_string().contains("no info message"));
    }

    #[test]
    fn test_alias_uses_executable_name() {
        assert_eq!(alias_for("/opt/bots/hunter --fast"), "hunter");
        assert_eq!(alias_for(""), "bot");
    }
}
