//! Stats/profile collaborator invoked when a game finishes.

use std::error::Error;

use dashmap::DashMap;
use futures::future::BoxFuture;
use thiserror::Error;
use uuid::Uuid;

use crate::engine::{
    room::GameMode,
    scoring::{Achievement, GameOutcome, PriorStats, check_achievements},
};

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error raised by stats backends regardless of the underlying store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Backend unreachable or failed mid-operation.
    #[error("stats storage unavailable: {message}")]
    Unavailable {
        /// Human-readable context.
        message: String,
        /// Underlying backend failure.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
}

/// Per-player result handed to the collaborator once a game finishes.
#[derive(Debug, Clone)]
pub struct PlayerGameResult {
    /// Stable user id.
    pub user_id: Uuid,
    /// Whether the player is in the winner set.
    pub won: bool,
    /// Final score from the completed-game formula.
    pub score: u64,
    /// Individual card flips.
    pub flips: u32,
    /// Pairs found.
    pub matches: u32,
    /// Missed pairs.
    pub wrong_flips: u32,
    /// Longest match streak this game.
    pub match_streak: u32,
    /// Power-ups consumed.
    pub power_ups_used: u32,
    /// Zero missed pairs.
    pub is_perfect: bool,
    /// Mode the game was played in.
    pub game_mode: GameMode,
    /// Board side length.
    pub board_size: usize,
}

/// Lifetime profile maintained per user.
#[derive(Debug, Clone, Default)]
pub struct PlayerProfile {
    /// Games completed.
    pub games_played: u64,
    /// Games won.
    pub wins: u64,
    /// Sum of final scores.
    pub total_score: u64,
    /// Best single-game final score.
    pub best_score: u64,
    /// Lifetime pairs found.
    pub total_matches: u64,
    /// Lifetime card flips.
    pub total_flips: u64,
}

/// Abstraction over the profile/stat persistence layer.
///
/// `record_result` folds a finished game into the player's profile and
/// returns the achievement ids newly unlocked by that game.
pub trait StatsStore: Send + Sync {
    /// Persist one player's result and report newly unlocked achievements.
    fn record_result(
        &self,
        result: PlayerGameResult,
    ) -> BoxFuture<'static, StorageResult<Vec<Achievement>>>;

    /// Current lifetime profile for a user, if any games were recorded.
    fn profile(&self, user_id: Uuid) -> BoxFuture<'static, StorageResult<Option<PlayerProfile>>>;
}

/// In-process stats store backing the collaborator boundary.
#[derive(Debug, Default)]
pub struct MemoryStatsStore {
    profiles: DashMap<Uuid, PlayerProfile>,
}

impl MemoryStatsStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatsStore for MemoryStatsStore {
    fn record_result(
        &self,
        result: PlayerGameResult,
    ) -> BoxFuture<'static, StorageResult<Vec<Achievement>>> {
        let mut entry = self.profiles.entry(result.user_id).or_default();

        let prior = PriorStats {
            games_played: entry.games_played,
            wins: entry.wins,
        };
        let outcome = GameOutcome {
            won: result.won,
            mode: result.game_mode,
            board_size: result.board_size,
            matches: result.matches,
            wrong_flips: result.wrong_flips,
            best_streak: result.match_streak,
            power_ups_used: result.power_ups_used,
        };
        let unlocked = check_achievements(&outcome, prior);

        entry.games_played += 1;
        if result.won {
            entry.wins += 1;
        }
        entry.total_score += result.score;
        entry.best_score = entry.best_score.max(result.score);
        entry.total_matches += u64::from(result.matches);
        entry.total_flips += u64::from(result.flips);
        drop(entry);

        Box::pin(async move { Ok(unlocked) })
    }

    fn profile(&self, user_id: Uuid) -> BoxFuture<'static, StorageResult<Option<PlayerProfile>>> {
        let profile = self.profiles.get(&user_id).map(|entry| entry.clone());
        Box::pin(async move { Ok(profile) })
    }
}
