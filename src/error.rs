//! Rule-violation taxonomy surfaced to clients as sender-only error events.

use thiserror::Error;

/// Errors produced while validating or applying a player action.
///
/// Every variant is recovered at the action-handler boundary and turned into
/// a sender-only `error` event; none of them mutate room state or terminate
/// the room's processing loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GameError {
    /// Malformed or out-of-bounds payload.
    #[error("invalid payload: {0}")]
    Validation(String),
    /// A flip or turn-consuming action from a player who does not hold the turn.
    #[error("it is not your turn")]
    NotYourTurn,
    /// Card is already flipped, already matched, or the id is out of range.
    #[error("invalid card state: {0}")]
    InvalidCardState(String),
    /// Two cards are already face-up and awaiting resolution.
    #[error("two cards are already face up")]
    PendingPairFull,
    /// Roster already holds the configured maximum number of players.
    #[error("room is full")]
    RoomFull,
    /// No active room with the given identifier.
    #[error("room `{0}` not found")]
    RoomNotFound(String),
    /// Password mismatch for a private room.
    #[error("invalid room password")]
    InvalidPassword,
    /// The game has already dealt cards; new players cannot be admitted.
    #[error("game is already in progress")]
    GameInProgress,
    /// Player does not own the requested power-up (or it has no uses left).
    #[error("you do not own that power-up")]
    PowerUpNotOwned,
    /// Power-up target is matched, face-up, out of range, or otherwise unusable.
    #[error("invalid power-up target: {0}")]
    PowerUpInvalidTarget(String),
    /// Action or power-up unsupported in the current mode or game status.
    #[error("not available in the current game mode: {0}")]
    WrongGameMode(String),
    /// Board size/theme mismatch detected at board generation time.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl GameError {
    /// Stable machine-readable code carried in the wire `error` event.
    pub fn code(&self) -> &'static str {
        match self {
            GameError::Validation(_) => "validation_error",
            GameError::NotYourTurn => "not_your_turn",
            GameError::InvalidCardState(_) => "invalid_card_state",
            GameError::PendingPairFull => "pending_pair_full",
            GameError::RoomFull => "room_full",
            GameError::RoomNotFound(_) => "room_not_found",
            GameError::InvalidPassword => "invalid_password",
            GameError::GameInProgress => "game_in_progress",
            GameError::PowerUpNotOwned => "power_up_not_owned",
            GameError::PowerUpInvalidTarget(_) => "power_up_invalid_target",
            GameError::WrongGameMode(_) => "wrong_game_mode",
            GameError::Configuration(_) => "configuration_error",
        }
    }
}

/// Result alias for engine rule checks.
pub type GameResult<T> = Result<T, GameError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(GameError::NotYourTurn.code(), "not_your_turn");
        assert_eq!(GameError::PendingPairFull.code(), "pending_pair_full");
        assert_eq!(
            GameError::RoomNotFound("abc".into()).code(),
            "room_not_found"
        );
    }

    #[test]
    fn messages_are_human_readable() {
        assert_eq!(
            GameError::RoomNotFound("lobby1".into()).to_string(),
            "room `lobby1` not found"
        );
        assert_eq!(GameError::InvalidPassword.to_string(), "invalid room password");
    }
}
