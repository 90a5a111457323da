//! Response-line matchers for [`EngineWrapper::send_command`](keeper_core::EngineWrapper::send_command).
//!
//! Each matcher returns `Some` for the line that completes an exchange and
//! `None` for everything else.

use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;

/// Result of a search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BestMove {
    /// Move in long algebraic notation, or `(none)` when the side to move
    /// has no legal move.
    pub mv: String,
    pub ponder: Option<String>,
}

/// Engine evaluation from the side to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum Score {
    /// Centipawns.
    Cp(i32),
    /// Mate in N moves; negative when being mated.
    Mate(i32),
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cp(value) => write!(f, "cp {value}"),
            Self::Mate(value) => write!(f, "mate {value}"),
        }
    }
}

/// A finished search: the best move and the last score reported before it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchOutcome {
    pub best: BestMove,
    pub score: Option<Score>,
}

/// Matcher that completes at `bestmove` and remembers the last `info`
/// score seen on the way.
pub fn search() -> impl Fn(&str) -> Option<SearchOutcome> + Send + Sync {
    let last = Mutex::new(None);
    move |line: &str| {
        if let Some(current) = score(line) {
            *last.lock() = Some(current);
            return None;
        }
        best_move(line).map(|best| SearchOutcome {
            best,
            score: last.lock().take(),
        })
    }
}

/// Matches `bestmove <move> [ponder <move>]`.
pub fn best_move(line: &str) -> Option<BestMove> {
    let mut tokens = line.split_whitespace();
    if tokens.next()? != "bestmove" {
        return None;
    }
    let mv = tokens.next()?.to_owned();
    let ponder = match tokens.next() {
        Some("ponder") => tokens.next().map(str::to_owned),
        _ => None,
    };
    Some(BestMove { mv, ponder })
}

/// Matches the score of an `info ... score cp|mate <n> ...` line.
pub fn score(line: &str) -> Option<Score> {
    let mut tokens = line.split_whitespace();
    if tokens.next()? != "info" {
        return None;
    }
    tokens.find(|token| *token == "score")?;
    let kind = tokens.next()?;
    let value = tokens.next()?.parse().ok()?;
    match kind {
        "cp" => Some(Score::Cp(value)),
        "mate" => Some(Score::Mate(value)),
        _ => None,
    }
}

/// Matches `readyok`.
pub fn ready_ok(line: &str) -> Option<()> {
    (line.trim() == "readyok").then_some(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_parse_best_move_with_ponder() {
        let best = best_move("bestmove e2e4 ponder e7e5").expect("should match");
        assert_eq!(best.mv, "e2e4");
        assert_eq!(best.ponder.as_deref(), Some("e7e5"));
    }

    #[test]
    fn test_should_parse_best_move_without_ponder() {
        let best = best_move("bestmove (none)").expect("should match");
        assert_eq!(best.mv, "(none)");
        assert!(best.ponder.is_none());
    }

    #[test]
    fn test_should_ignore_non_best_move_lines() {
        assert!(best_move("info depth 10 score cp 20").is_none());
        assert!(best_move("bestmove").is_none());
        assert!(best_move("").is_none());
    }

    #[test]
    fn test_should_parse_scores() {
        assert_eq!(
            score("info depth 18 seldepth 24 score cp -35 nodes 1000 pv e2e4"),
            Some(Score::Cp(-35))
        );
        assert_eq!(score("info depth 30 score mate 3 pv h5f7"), Some(Score::Mate(3)));
        assert_eq!(score("info string hello"), None);
        assert_eq!(score("bestmove e2e4"), None);
    }

    #[test]
    fn test_should_serialize_score_with_kind_tag() {
        let json = serde_json::to_value(Score::Mate(-2)).expect("should serialize");
        assert_eq!(json["kind"], "mate");
        assert_eq!(json["value"], -2);
    }

    #[test]
    fn test_should_attach_last_score_to_search_outcome() {
        let matcher = search();
        assert!(matcher("info depth 1 score cp 15 pv e2e4").is_none());
        assert!(matcher("info depth 2 score mate 4 pv d1h5").is_none());
        assert!(matcher("info string NNUE enabled").is_none());

        let outcome = matcher("bestmove d1h5 ponder g7g6").expect("should match");

        assert_eq!(outcome.best.mv, "d1h5");
        assert_eq!(outcome.score, Some(Score::Mate(4)));
        assert_eq!(outcome.score.map(|score| score.to_string()).as_deref(), Some("mate 4"));
    }

    #[test]
    fn test_should_complete_search_without_score() {
        let outcome = search()("bestmove e2e4").expect("should match");
        assert_eq!(outcome.best.mv, "e2e4");
        assert!(outcome.score.is_none());
    }

    #[test]
    fn test_should_match_ready_ok() {
        assert_eq!(ready_ok("readyok"), Some(()));
        assert_eq!(ready_ok("readyok\r"), Some(()));
        assert_eq!(ready_ok("uciok"), None);
    }
}
