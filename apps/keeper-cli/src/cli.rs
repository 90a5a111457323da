use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use keeper_core::{EnginePool, EngineWrapper, Subscription, load_config};
use keeper_uci::{SearchLimits, UciFactory, commands, matchers};
use tracing::{debug, info, warn};

/// Pool purpose used for every search issued by the CLI.
const SEARCH_PURPOSE: &str = "search";

/// Game id of a one-off `bestmove` search.
const CLI_GAME: &str = "cli";

/// Distinct game ids a soak run rotates through.
const SOAK_TABLES: u32 = 3;

const DEFAULT_MOVETIME_MS: u64 = 1_000;

/// Slack on top of the movetime before a search counts as hung.
const SEARCH_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "keeper", about = "Run UCI engines through a self-healing engine pool")]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, global = true, default_value = "keeper.yaml")]
    pub config: PathBuf,

    /// Directory for JSON log files (stderr only when omitted)
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    /// UCI engine executable
    #[arg(short, long, global = true, default_value = "stockfish")]
    pub engine: String,

    /// Argument passed to the engine executable (repeatable)
    #[arg(long = "engine-arg", global = true, allow_hyphen_values = true)]
    pub engine_args: Vec<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Search one position and print the best move
    Bestmove {
        /// Position in FEN (defaults to the start position)
        #[arg(long)]
        fen: Option<String>,

        /// Moves played from the position, in long algebraic notation
        #[arg(long, num_args = 1..)]
        moves: Vec<String>,

        /// Search time in milliseconds
        #[arg(long, conflicts_with = "depth")]
        movetime: Option<u64>,

        /// Search depth in plies
        #[arg(long)]
        depth: Option<u32>,

        /// Engine option as Name=Value (repeatable)
        #[arg(long = "option", value_parser = parse_option)]
        options: Vec<(String, String)>,
    },

    /// Run many short searches through the pool and print pool statistics
    Soak {
        /// Number of searches to run
        #[arg(short, long, default_value_t = 20)]
        games: u32,

        /// Search time per game in milliseconds
        #[arg(long, default_value_t = 50)]
        movetime: u64,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let config = load_config(&self.config)
            .with_context(|| format!("failed to load config: {}", self.config.display()))?;
        let factory = UciFactory::new(&self.engine)
            .args(self.engine_args)
            .into_shared();
        let pool = EnginePool::new(config.pool, config.wrapper, factory);

        let result = match self.command {
            Commands::Bestmove {
                fen,
                moves,
                movetime,
                depth,
                options,
            } => {
                let limits = match depth {
                    Some(depth) => SearchLimits::depth(depth),
                    None => SearchLimits::movetime(movetime.unwrap_or(DEFAULT_MOVETIME_MS)),
                };
                bestmove(&pool, fen.as_deref(), &moves, limits, &options).await
            }
            Commands::Soak { games, movetime } => soak(&pool, games, movetime).await,
        };

        pool.terminate_all();
        result
    }
}

async fn bestmove(
    pool: &EnginePool,
    fen: Option<&str>,
    moves: &[String],
    limits: SearchLimits,
    options: &[(String, String)],
) -> Result<()> {
    let wrapper = pool
        .acquire(SEARCH_PURPOSE, CLI_GAME)
        .await
        .context("failed to start engine")?;
    let _events = log_events(&wrapper);

    let setup: Vec<String> = options
        .iter()
        .map(|(name, value)| commands::set_option(name, value))
        .collect();
    wrapper
        .apply_config(setup)
        .await
        .context("failed to apply engine options")?;

    let outcome = wrapper
        .send_command(
            [commands::position(fen, moves), commands::go(&limits)],
            matchers::search(),
            search_timeout(&limits),
        )
        .await
        .context("search failed")?;

    if let Some(score) = outcome.score {
        println!("score {score}");
    }
    let best = outcome.best;
    match best.ponder {
        Some(ponder) => println!("bestmove {} ponder {ponder}", best.mv),
        None => println!("bestmove {}", best.mv),
    }
    pool.release(SEARCH_PURPOSE, CLI_GAME, true);
    Ok(())
}

async fn soak(pool: &EnginePool, games: u32, movetime: u64) -> Result<()> {
    let limits = SearchLimits::movetime(movetime);
    let timeout = search_timeout(&limits);
    let mut watched = HashSet::new();

    for game in 0..games {
        let game_id = format!("soak-{}", game % SOAK_TABLES);
        let wrapper = pool
            .acquire(SEARCH_PURPOSE, &game_id)
            .await
            .with_context(|| format!("failed to acquire engine for {game_id}"))?;
        if watched.insert(wrapper.id()) {
            log_events(&wrapper);
        }

        let search = wrapper.send_command(
            [commands::position(None, &[]), commands::go(&limits)],
            matchers::search(),
            timeout,
        );
        let outcome = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(game, "soak interrupted");
                break;
            }
            outcome = search => outcome,
        };
        match outcome {
            Ok(outcome) => info!(
                game,
                game_id = %game_id,
                mv = %outcome.best.mv,
                score = ?outcome.score,
                "search finished"
            ),
            Err(error) => warn!(game, game_id = %game_id, %error, "search failed"),
        }
        pool.release(SEARCH_PURPOSE, &game_id, false);
    }

    println!("{}", serde_json::to_string_pretty(&pool.stats())?);
    Ok(())
}

/// Mirror a wrapper's events into the log at debug level.
fn log_events(wrapper: &EngineWrapper) -> Subscription {
    let id = wrapper.id();
    wrapper.on_event(move |event| debug!(wrapper = id, event = event.name(), ?event, "engine event"))
}

fn search_timeout(limits: &SearchLimits) -> Duration {
    Duration::from_millis(limits.movetime_ms.unwrap_or_default()) + SEARCH_GRACE
}

/// Parse `Name=Value`. The name may contain spaces; the value may be empty.
fn parse_option(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected Name=Value, got `{raw}`"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing option name in `{raw}`"));
    }
    Ok((name.to_owned(), value.trim().to_owned()))
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_should_have_consistent_clap_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_should_parse_engine_option() {
        assert_eq!(
            parse_option("Hash=64"),
            Ok(("Hash".to_owned(), "64".to_owned()))
        );
        assert_eq!(
            parse_option("Skill Level = 5"),
            Ok(("Skill Level".to_owned(), "5".to_owned()))
        );
        assert_eq!(
            parse_option("SyzygyPath="),
            Ok(("SyzygyPath".to_owned(), String::new()))
        );
    }

    #[test]
    fn test_should_reject_malformed_engine_option() {
        assert!(parse_option("Hash").is_err());
        assert!(parse_option("=64").is_err());
    }

    #[test]
    fn test_should_parse_bestmove_arguments() {
        let cli = Cli::try_parse_from([
            "keeper",
            "--engine",
            "/usr/bin/stockfish",
            "bestmove",
            "--moves",
            "e2e4",
            "e7e5",
            "--depth",
            "12",
            "--option",
            "Threads=2",
        ])
        .expect("should parse");

        assert_eq!(cli.engine, "/usr/bin/stockfish");
        let Commands::Bestmove {
            moves,
            depth,
            movetime,
            options,
            fen,
        } = cli.command
        else {
            panic!("expected bestmove");
        };
        assert_eq!(moves, vec!["e2e4", "e7e5"]);
        assert_eq!(depth, Some(12));
        assert_eq!(movetime, None);
        assert_eq!(fen, None);
        assert_eq!(options, vec![("Threads".to_owned(), "2".to_owned())]);
    }

    #[test]
    fn test_should_reject_movetime_with_depth() {
        let result = Cli::try_parse_from([
            "keeper", "bestmove", "--movetime", "100", "--depth", "5",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_should_parse_soak_with_engine_args() {
        let cli = Cli::try_parse_from([
            "keeper",
            "soak",
            "--games",
            "5",
            "--engine-arg",
            "--threads=1",
            "--log-dir",
            "/tmp/keeper-logs",
        ])
        .expect("should parse");

        assert_eq!(cli.engine_args, vec!["--threads=1"]);
        assert_eq!(cli.log_dir, Some(PathBuf::from("/tmp/keeper-logs")));
        assert!(matches!(cli.command, Commands::Soak { games: 5, movetime: 50 }));
    }

    #[test]
    fn test_should_add_grace_to_search_timeout() {
        assert_eq!(search_timeout(&SearchLimits::movetime(500)), Duration::from_millis(5_500));
        assert_eq!(search_timeout(&SearchLimits::depth(10)), SEARCH_GRACE);
    }
}
