//! Closed, tagged wire types for the realtime protocol.
//!
//! Every inbound action and outbound event is a discriminated union with
//! explicit field types, validated at the boundary before any engine logic
//! runs.

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::{
    dto::{
        game::{CardReveal, CardView, ChatMessageView, FinalPlayerStats, PlayerView, PowerUpView,
            RoomSnapshot},
        validation::validate_room_id,
    },
    engine::room::{FinishReason, GameMode, PowerUpKind, RoomSettings},
    error::GameError,
};

/// Hard cap on raw (pre-trim) chat payloads.
const RAW_CHAT_LIMIT: usize = 2000;
/// Display name limit.
const NAME_LIMIT: usize = 32;

/// Room settings supplied by the creating player; omitted fields use defaults.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct RoomSettingsInput {
    /// Maximum roster size, 2..=4.
    #[validate(range(min = 2, max = 4))]
    pub max_players: Option<usize>,
    /// Board side length, one of 4/6/8.
    #[validate(custom(function = validate_board_size))]
    pub board_size: Option<usize>,
    /// Game mode.
    pub mode: Option<GameMode>,
    /// Theme palette name.
    #[validate(length(min = 1, max = 32))]
    pub theme: Option<String>,
    /// Whether cards may carry power-ups.
    pub power_ups_enabled: Option<bool>,
    /// Countdown override in seconds.
    #[validate(range(min = 10, max = 3600))]
    pub time_limit_secs: Option<u64>,
    /// Hide from lobby listings.
    pub private: Option<bool>,
    /// Join password; implies a private room.
    #[validate(length(max = 64))]
    pub password: Option<String>,
}

impl RoomSettingsInput {
    /// Merge the input over the default settings.
    pub fn into_settings(self) -> RoomSettings {
        let defaults = RoomSettings::default();
        let private = self.private.unwrap_or(false) || self.password.is_some();
        RoomSettings {
            max_players: self.max_players.unwrap_or(defaults.max_players),
            board_size: self.board_size.unwrap_or(defaults.board_size),
            mode: self.mode.unwrap_or(defaults.mode),
            theme: self.theme.unwrap_or(defaults.theme),
            power_ups_enabled: self.power_ups_enabled.unwrap_or(defaults.power_ups_enabled),
            time_limit_secs: self.time_limit_secs,
            private,
            password: self.password,
        }
    }
}

/// Validator for the supported board side lengths.
fn validate_board_size(size: usize) -> Result<(), ValidationError> {
    if crate::engine::room::BOARD_SIZES.contains(&size) {
        Ok(())
    } else {
        let mut err = ValidationError::new("board_size");
        err.message = Some("Board size must be 4, 6, or 8".into());
        Err(err)
    }
}

/// Messages accepted from game WebSocket clients.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// First frame on every connection: resolves the acting identity.
    Identify {
        /// Display name.
        name: String,
        /// Stable user id; minted when absent (guest).
        user_id: Option<Uuid>,
        /// Optional avatar reference.
        avatar: Option<String>,
        /// Explicit guest flag.
        #[serde(default)]
        guest: bool,
    },
    /// Join (or create) a room.
    JoinRoom {
        /// Target room id.
        room_id: String,
        /// Password for private rooms.
        password: Option<String>,
        /// Settings applied only when this join creates the room.
        settings: Option<RoomSettingsInput>,
    },
    /// Leave a room.
    LeaveRoom {
        /// Target room id.
        room_id: String,
    },
    /// Toggle the ready flag while waiting.
    ToggleReady {
        /// Target room id.
        room_id: String,
    },
    /// Flip one card.
    FlipCard {
        /// Target room id.
        room_id: String,
        /// Card index to flip.
        card_id: usize,
    },
    /// Use a held power-up.
    UsePowerup {
        /// Target room id.
        room_id: String,
        /// Catalogue entry to consume.
        power_up: PowerUpKind,
        /// Target card ids (swap: 2, reveal: 1, others: none).
        #[serde(default)]
        targets: Vec<usize>,
    },
    /// Send a chat message.
    SendChat {
        /// Target room id.
        room_id: String,
        /// Raw message text; trimmed and capped server-side.
        text: String,
    },
    /// Request a full state resync.
    GetGameState {
        /// Target room id.
        room_id: String,
    },
    /// Any unrecognized message type.
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    /// Parse and validate a raw text frame.
    pub fn from_json_str(raw: &str) -> Result<Self, GameError> {
        let message: Self =
            serde_json::from_str(raw).map_err(|err| GameError::Validation(err.to_string()))?;
        message.validate_payload()?;
        Ok(message)
    }

    /// The room this message targets, if it is room-scoped.
    pub fn room_id(&self) -> Option<&str> {
        match self {
            ClientMessage::JoinRoom { room_id, .. }
            | ClientMessage::LeaveRoom { room_id }
            | ClientMessage::ToggleReady { room_id }
            | ClientMessage::FlipCard { room_id, .. }
            | ClientMessage::UsePowerup { room_id, .. }
            | ClientMessage::SendChat { room_id, .. }
            | ClientMessage::GetGameState { room_id } => Some(room_id),
            ClientMessage::Identify { .. } | ClientMessage::Unknown => None,
        }
    }

    /// Boundary validation before any engine logic sees the payload.
    fn validate_payload(&self) -> Result<(), GameError> {
        match self {
            ClientMessage::Identify { name, .. } => {
                let trimmed = name.trim();
                if trimmed.is_empty() || trimmed.chars().count() > NAME_LIMIT {
                    return Err(GameError::Validation(format!(
                        "display name must be 1-{NAME_LIMIT} characters"
                    )));
                }
            }
            ClientMessage::JoinRoom {
                room_id, settings, ..
            } => {
                check_room_id(room_id)?;
                if let Some(settings) = settings {
                    settings
                        .validate()
                        .map_err(|errs| GameError::Validation(errs.to_string()))?;
                }
            }
            ClientMessage::SendChat { room_id, text } => {
                check_room_id(room_id)?;
                if text.len() > RAW_CHAT_LIMIT {
                    return Err(GameError::Validation(format!(
                        "chat payload exceeds {RAW_CHAT_LIMIT} bytes"
                    )));
                }
            }
            ClientMessage::UsePowerup {
                room_id, targets, ..
            } => {
                check_room_id(room_id)?;
                if targets.len() > 2 {
                    return Err(GameError::Validation(
                        "power-ups take at most two targets".to_string(),
                    ));
                }
            }
            ClientMessage::LeaveRoom { room_id }
            | ClientMessage::ToggleReady { room_id }
            | ClientMessage::FlipCard { room_id, .. }
            | ClientMessage::GetGameState { room_id } => check_room_id(room_id)?,
            ClientMessage::Unknown => {
                return Err(GameError::Validation("unknown message type".to_string()));
            }
        }
        Ok(())
    }
}

/// Map a room-id format failure into the wire taxonomy.
fn check_room_id(room_id: &str) -> Result<(), GameError> {
    validate_room_id(room_id).map_err(|err| {
        GameError::Validation(
            err.message
                .map(|m| m.to_string())
                .unwrap_or_else(|| "invalid room id".to_string()),
        )
    })
}

/// Why the turn moved to another player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnChangeReason {
    /// Normal rotation after a missed pair.
    Advance,
    /// Turn auto-pass timer elapsed.
    Timeout,
    /// The previous holder left or disconnected.
    HolderLeft,
}

/// Why the same player keeps the turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnContinueReason {
    /// Successful match in a repeat-turn mode.
    Match,
    /// A queued extra-turn power-up fired.
    ExtraTurn,
}

/// Events pushed to clients. Broadcast to the whole room unless noted
/// sender-only on the emitting site.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Sender-only join acknowledgement with the full room snapshot.
    RoomJoined {
        /// Personalized snapshot.
        room: RoomSnapshot,
    },
    /// A player joined (or reconnected to) the room.
    PlayerJoined {
        /// The joining player.
        player: PlayerView,
        /// True when this is a reconnection of an existing roster member.
        reconnected: bool,
    },
    /// A player left or forfeited.
    PlayerLeft {
        /// The departing player's id.
        player_id: Uuid,
    },
    /// Cards dealt, turn order fixed; carries the full starting state.
    GameStarted {
        /// Personalized snapshot (board face-down).
        room: RoomSnapshot,
    },
    /// On-demand full resync.
    GameState {
        /// Personalized snapshot.
        room: RoomSnapshot,
    },
    /// A card was turned face-up.
    CardFlipped {
        /// Acting player.
        player_id: Uuid,
        /// The revealed card.
        card: CardReveal,
        /// Power-up picked up from the card, if it carried one.
        power_up: Option<PowerUpKind>,
    },
    /// The pending pair matched.
    CardsMatched {
        /// Acting player.
        player_id: Uuid,
        /// The two matched card ids.
        card_ids: [usize; 2],
        /// Shared face value.
        value: String,
        /// The player's updated score.
        score: u64,
        /// The player's updated match count.
        matches: u32,
        /// The player's current streak.
        streak: u32,
    },
    /// Unresolved cards flipped back face-down (a missed pair, or a lone
    /// face-up card when a turn times out).
    CardsFlippedBack {
        /// The card ids now face-down again.
        card_ids: Vec<usize>,
    },
    /// The turn moved to another player.
    TurnChanged {
        /// New turn holder.
        player_id: Uuid,
        /// Why the turn moved.
        reason: TurnChangeReason,
    },
    /// The same player keeps the turn.
    TurnContinue {
        /// Turn holder.
        player_id: Uuid,
        /// Why the turn stayed.
        reason: TurnContinueReason,
        /// Extra turns still queued for this player.
        remaining_extra_turns: u32,
    },
    /// Clock drawn among the leaders; two-card tie breaker dealt.
    SuddenDeathTriggered {
        /// The fresh two-card board.
        board: Vec<CardView>,
        /// Turn holder entering the tie breaker.
        turn: Option<Uuid>,
        /// Tie breaker duration.
        duration_ms: u64,
    },
    /// Terminal result broadcast.
    GameOver {
        /// Winner set; empty means a no-winner finish.
        winners: Vec<Uuid>,
        /// Why the game ended.
        reason: FinishReason,
        /// Final per-player statistics.
        stats: Vec<FinalPlayerStats>,
    },
    /// Chat rebroadcast (user or system entry).
    ChatMessage {
        /// The appended entry.
        message: ChatMessageView,
    },
    /// Sender-only inventory refresh after pickup or use.
    PowerUpUpdate {
        /// Full current inventory.
        power_ups: Vec<PowerUpView>,
    },
    /// Sender-only: all unmatched card values, shown for a fixed duration.
    PowerupPeek {
        /// Unmatched cards with values.
        cards: Vec<CardReveal>,
        /// Client display duration.
        duration_ms: u64,
    },
    /// Two face-down cards exchanged values.
    PowerupSwap {
        /// The two cards with their new values.
        cards: [CardReveal; 2],
    },
    /// Sender-only: one card value, shown for a fixed duration.
    PowerupReveal {
        /// The revealed card.
        card: CardReveal,
        /// Client display duration.
        duration_ms: u64,
    },
    /// Room countdown paused.
    PowerupFreeze {
        /// Player who used the freeze.
        player_id: Uuid,
        /// Pause duration.
        duration_ms: u64,
        /// Countdown remaining once the clock resumes.
        remaining_ms: u64,
    },
    /// Unmatched card values redistributed in place.
    PowerupShuffle {
        /// Full board view after the shuffle.
        board: Vec<CardView>,
    },
    /// Sender-only rejection.
    Error {
        /// Stable machine-readable code.
        code: String,
        /// Human-readable message.
        message: String,
    },
}

impl ServerEvent {
    /// Build the wire error event for a rule violation.
    pub fn error(err: &GameError) -> Self {
        ServerEvent::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Outbound frame: every event carries the room's sequence number so clients
/// can discard stale or duplicate deliveries after a resync.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    /// Room sequence number at emission time.
    pub seq: u64,
    /// The event payload.
    pub event: ServerEvent,
}
