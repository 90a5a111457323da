//! Builders for UCI command lines.

use std::fmt::{self, Display, Write};

use serde::{Deserialize, Serialize};

/// Interrupts a running search; the engine answers with `bestmove`.
pub const STOP: &str = "stop";

/// `setoption name <name> value <value>`
pub fn set_option(name: &str, value: impl Display) -> String {
    format!("setoption name {name} value {value}")
}

/// `position startpos|fen <fen> [moves ...]`
pub fn position(fen: Option<&str>, moves: &[String]) -> String {
    let mut line = match fen {
        Some(fen) => format!("position fen {fen}"),
        None => "position startpos".to_owned(),
    };
    if !moves.is_empty() {
        line.push_str(" moves");
        for mv in moves {
            line.push(' ');
            line.push_str(mv);
        }
    }
    line
}

/// Limits of one search. Unset limits are omitted from the `go` line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SearchLimits {
    pub depth: Option<u32>,
    pub movetime_ms: Option<u64>,
    pub nodes: Option<u64>,
}

impl SearchLimits {
    pub fn depth(depth: u32) -> Self {
        Self {
            depth: Some(depth),
            ..Self::default()
        }
    }

    pub fn movetime(ms: u64) -> Self {
        Self {
            movetime_ms: Some(ms),
            ..Self::default()
        }
    }
}

impl Display for SearchLimits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("go")?;
        if let Some(depth) = self.depth {
            write!(f, " depth {depth}")?;
        }
        if let Some(ms) = self.movetime_ms {
            write!(f, " movetime {ms}")?;
        }
        if let Some(nodes) = self.nodes {
            write!(f, " nodes {nodes}")?;
        }
        Ok(())
    }
}

/// `go [depth N] [movetime MS] [nodes N]`
///
/// Without limits this is a bare `go`, which engines treat as infinite; end
/// it with [`STOP`].
pub fn go(limits: &SearchLimits) -> String {
    let mut line = String::new();
    let _ = write!(line, "{limits}");
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_format_set_option() {
        assert_eq!(set_option("Hash", 64), "setoption name Hash value 64");
        assert_eq!(
            set_option("UCI_LimitStrength", true),
            "setoption name UCI_LimitStrength value true"
        );
    }

    #[test]
    fn test_should_format_start_position_with_moves() {
        assert_eq!(position(None, &[]), "position startpos");
        let moves = vec!["e2e4".to_owned(), "e7e5".to_owned()];
        assert_eq!(position(None, &moves), "position startpos moves e2e4 e7e5");
    }

    #[test]
    fn test_should_format_fen_position() {
        let fen = "8/8/8/8/8/8/8/K6k w - - 0 1";
        assert_eq!(position(Some(fen), &[]), format!("position fen {fen}"));
    }

    #[test]
    fn test_should_format_go_with_limits() {
        assert_eq!(go(&SearchLimits::default()), "go");
        assert_eq!(go(&SearchLimits::depth(12)), "go depth 12");
        let limits = SearchLimits {
            movetime_ms: Some(500),
            nodes: Some(10_000),
            ..SearchLimits::default()
        };
        assert_eq!(go(&limits), "go movetime 500 nodes 10000");
    }
}
