//! Bot probe binary
//!
//! Spawns a bot executable and walks it through a one-shot game: handshake,
//! join, a single turn, then the final result. Useful for checking that a bot
//! speaks the protocol before entering it in a real game.
//!
//! Usage: bot-probe [--config game.json] -- <bot command...>

use anyhow::{Context, Result, bail};
use broadside_bot::{BotClient, GameInfo};
use broadside_core::{BotTimeouts, GameConfig};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

struct Args {
    config: Option<PathBuf>,
    command: String,
}

fn parse_args() -> Result<Args> {
    let mut config = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args.next().context("--config requires a file")?;
                config = Some(PathBuf::from(path));
            }
            "--" => break,
            other => bail!("unexpected argument '{}'", other),
        }
    }

    let command = args.collect::<Vec<_>>().join(" ");
    if command.is_empty() {
        bail!("usage: bot-probe [--config game.json] -- <bot command...>");
    }
    Ok(Args { config, command })
}

fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => GameConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => GameConfig::default(),
    };

    info!("Probing bot: {}", args.command);
    let game = GameInfo::new(config);
    let (mut bot, board) = BotClient::join(&args.command, &game, BotTimeouts::default())
        .map_err(|e| anyhow::anyhow!("Bot failed to join: {}", e))?;

    let player = bot.player_name().to_string();
    bot.announce_join(&player)?;
    if let Some(board) = &board {
        bot.assign_board(board)?;
    }
    bot.announce_start(std::slice::from_ref(&player))?;
    bot.announce_turn(&player)?;
    let shot = bot.request_shot()?;
    bot.announce_finish("finished", 1, 1)?;
    bot.announce_result(&player, 0, u32::from(shot.is_none()), 1, "winner")?;

    println!(
        "bot={} version={} player={}",
        bot.bot_name(),
        bot.bot_version(),
        player
    );
    match shot {
        Some(shot) => println!("shot target={} at {}", shot.target, shot.coordinate),
        None => println!("shot skipped"),
    }

    bot.close();
    info!("Probe complete");
    Ok(())
}
