//! Pure scoring and achievement evaluation over completed game statistics.

use serde::{Deserialize, Serialize};

use crate::engine::room::GameMode;

/// Points awarded per found pair.
pub const MATCH_POINTS: u64 = 100;
/// Bonus per streak step beyond the first match of a streak.
pub const STREAK_STEP_POINTS: u64 = 50;
/// Maximum efficiency bonus for a flawless flip ratio.
const EFFICIENCY_MAX: f64 = 200.0;
/// Points deducted per consumed power-up.
const POWER_UP_PENALTY: i64 = 25;

/// Final score for a completed game.
///
/// `base + efficiency + streak + time_bonus * mode multiplier - power-up
/// penalty`, clamped to zero. The efficiency bonus rewards fewer flips per
/// match and is zero when no match was found.
pub fn calculate_score(
    mode: GameMode,
    matches: u32,
    flips: u32,
    time_bonus: u32,
    match_streak: u32,
    power_ups_used: u32,
) -> u64 {
    let base = u64::from(matches) * MATCH_POINTS;

    let efficiency = if matches > 0 {
        let ideal = f64::from(matches * 2);
        let ratio = (ideal - f64::from(flips)).max(0.0) / ideal;
        (ratio * EFFICIENCY_MAX).floor() as u64
    } else {
        0
    };

    let streak = if match_streak > 1 {
        u64::from(match_streak - 1) * STREAK_STEP_POINTS
    } else {
        0
    };

    let timed = (f64::from(time_bonus) * mode.time_bonus_multiplier()).floor() as u64;

    let total = (base + efficiency + streak + timed) as i64
        - i64::from(power_ups_used) * POWER_UP_PENALTY;
    total.max(0) as u64
}

/// Accuracy ratio: `matches * 2 / flips`, zero before any flip.
pub fn accuracy(matches: u32, flips: u32) -> f64 {
    if flips == 0 {
        0.0
    } else {
        f64::from(matches * 2) / f64::from(flips)
    }
}

/// Achievement identifiers unlockable at the end of a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Achievement {
    /// First ever win.
    FirstWin,
    /// Zero missed pairs over the whole game.
    PerfectGame,
    /// Won a blitz game.
    BlitzWin,
    /// Reached a streak of five or more matches.
    StreakMaster,
    /// Won while consuming three or more power-ups.
    PowerPlayer,
    /// Won on the largest (8x8) board.
    BoardMaster,
}

/// The per-player facts achievement rules are evaluated against.
#[derive(Debug, Clone)]
pub struct GameOutcome {
    /// Whether the player is in the winner set.
    pub won: bool,
    /// Mode the game was played in.
    pub mode: GameMode,
    /// Board side length.
    pub board_size: usize,
    /// Pairs found.
    pub matches: u32,
    /// Missed pairs.
    pub wrong_flips: u32,
    /// Longest match streak.
    pub best_streak: u32,
    /// Power-ups consumed.
    pub power_ups_used: u32,
}

/// Lifetime stats prior to this game, read from the stats collaborator.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorStats {
    /// Games completed before this one.
    pub games_played: u64,
    /// Wins before this one.
    pub wins: u64,
}

/// Evaluate every achievement rule independently; multiple may fire at once.
pub fn check_achievements(outcome: &GameOutcome, prior: PriorStats) -> Vec<Achievement> {
    let mut unlocked = Vec::new();

    if outcome.won && prior.wins == 0 {
        unlocked.push(Achievement::FirstWin);
    }
    if outcome.matches > 0 && outcome.wrong_flips == 0 {
        unlocked.push(Achievement::PerfectGame);
    }
    if outcome.won && outcome.mode == GameMode::Blitz {
        unlocked.push(Achievement::BlitzWin);
    }
    if outcome.best_streak >= 5 {
        unlocked.push(Achievement::StreakMaster);
    }
    if outcome.won && outcome.power_ups_used >= 3 {
        unlocked.push(Achievement::PowerPlayer);
    }
    if outcome.won && outcome.board_size == 8 {
        unlocked.push(Achievement::BoardMaster);
    }

    unlocked
}
