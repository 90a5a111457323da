//! UCI chess engines for keeper.
//!
//! [`UciFactory`] plugs a UCI engine binary into
//! [`EngineWrapper`](keeper_core::EngineWrapper) and
//! [`EnginePool`](keeper_core::EnginePool). [`commands`] builds UCI command
//! lines and [`matchers`] recognizes the lines that complete an exchange.

pub mod commands;
pub mod matchers;
mod process;

pub use commands::SearchLimits;
pub use matchers::{BestMove, Score, SearchOutcome};
pub use process::{UciFactory, UciProcess};
