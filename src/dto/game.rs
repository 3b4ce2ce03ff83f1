//! View DTOs derived from runtime room state.
//!
//! Snapshots are personalized: card values are serialized only for face-up or
//! matched cards, and a power-up inventory only appears in its owner's view.

use serde::Serialize;
use serde_with::skip_serializing_none;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::engine::{
    room::{
        Card, ChatEntry, ChatKind, GameMode, GameStatus, HeldPowerUp, Player, PowerUpKind,
        RoomSettings, RoomState,
    },
    scoring::Achievement,
};

/// Client-facing view of one card. Face-down cards hide value and power-up.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CardView {
    /// Stable index.
    pub id: usize,
    /// Symbol, present only while face-up or matched.
    pub value: Option<String>,
    /// Face-up and unresolved.
    pub flipped: bool,
    /// Part of a found pair.
    pub matched: bool,
    /// Attached power-up, visible only while the face is visible.
    pub power_up: Option<PowerUpKind>,
}

impl From<&Card> for CardView {
    fn from(card: &Card) -> Self {
        let face_visible = card.flipped || card.matched;
        Self {
            id: card.id,
            value: face_visible.then(|| card.value.clone()),
            flipped: card.flipped,
            matched: card.matched,
            power_up: if face_visible { card.power_up } else { None },
        }
    }
}

/// A card id together with its (deliberately) revealed value.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CardReveal {
    /// Card id.
    pub id: usize,
    /// Face value.
    pub value: String,
}

impl From<&Card> for CardReveal {
    fn from(card: &Card) -> Self {
        Self {
            id: card.id,
            value: card.value.clone(),
        }
    }
}

/// Public view of a roster member.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PlayerView {
    /// Stable user id.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Optional avatar reference.
    pub avatar: Option<String>,
    /// Guest identity flag.
    pub guest: bool,
    /// In-game score.
    pub score: u64,
    /// Pairs found.
    pub matches: u32,
    /// Card flips.
    pub flips: u32,
    /// Current match streak.
    pub streak: u32,
    /// Ready flag while waiting.
    pub ready: bool,
    /// Live connection flag.
    pub connected: bool,
    /// Number of held power-up charges (contents stay private).
    pub power_up_count: u32,
}

impl From<&Player> for PlayerView {
    fn from(player: &Player) -> Self {
        Self {
            id: player.identity.id,
            name: player.identity.name.clone(),
            avatar: player.identity.avatar.clone(),
            guest: player.identity.guest,
            score: player.score,
            matches: player.matches,
            flips: player.flips,
            streak: player.streak,
            ready: player.ready,
            connected: player.connected,
            power_up_count: player.power_ups.iter().map(|held| held.uses).sum(),
        }
    }
}

/// Owner-only view of one held power-up.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PowerUpView {
    /// Catalogue entry.
    pub kind: PowerUpKind,
    /// Remaining uses.
    pub uses: u32,
}

impl From<&HeldPowerUp> for PowerUpView {
    fn from(held: &HeldPowerUp) -> Self {
        Self {
            kind: held.kind,
            uses: held.uses,
        }
    }
}

/// Public settings view; the password never leaves the server.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SettingsView {
    /// Maximum roster size.
    pub max_players: usize,
    /// Board side length.
    pub board_size: usize,
    /// Game mode.
    pub mode: GameMode,
    /// Theme palette name.
    pub theme: String,
    /// Whether cards may carry power-ups.
    pub power_ups_enabled: bool,
    /// Countdown override in seconds, if any.
    pub time_limit_secs: Option<u64>,
    /// Hidden from lobby listings.
    pub private: bool,
}

impl From<&RoomSettings> for SettingsView {
    fn from(settings: &RoomSettings) -> Self {
        Self {
            max_players: settings.max_players,
            board_size: settings.board_size,
            mode: settings.mode,
            theme: settings.theme.clone(),
            power_ups_enabled: settings.power_ups_enabled,
            time_limit_secs: settings.time_limit_secs,
            private: settings.private,
        }
    }
}

/// One chat entry as broadcast to the room.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessageView {
    /// Message id.
    pub id: Uuid,
    /// Author id; absent for system entries.
    pub author_id: Option<Uuid>,
    /// Author display name.
    pub author_name: String,
    /// Message text.
    pub text: String,
    /// Server receive time.
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    /// User or system entry.
    pub kind: ChatKind,
}

impl From<&ChatEntry> for ChatMessageView {
    fn from(entry: &ChatEntry) -> Self {
        Self {
            id: entry.id,
            author_id: entry.author_id,
            author_name: entry.author_name.clone(),
            text: entry.text.clone(),
            at: entry.at,
            kind: entry.kind,
        }
    }
}

/// Countdown state for timed games.
///
/// The deadline is an absolute wall-clock instant rather than a remaining
/// duration, so two snapshots taken with no intervening action serialize
/// identically.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ClockView {
    /// Unix timestamp (ms) at which the countdown reaches zero.
    pub deadline_unix_ms: Option<u64>,
    /// Remaining time while the countdown is frozen by a power-up.
    pub frozen_remaining_ms: Option<u64>,
}

/// Full room snapshot used for join acks and on-demand resyncs.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct RoomSnapshot {
    /// Room identifier.
    pub room_id: String,
    /// Sequence number of the room at snapshot time; clients discard
    /// snapshots whose seq is not newer than what they already applied.
    pub seq: u64,
    /// Lifecycle status.
    pub status: GameStatus,
    /// Room settings.
    pub settings: SettingsView,
    /// Roster in join/turn order.
    pub players: Vec<PlayerView>,
    /// Board views (face-down values hidden).
    pub board: Vec<CardView>,
    /// Current turn holder.
    pub turn: Option<Uuid>,
    /// Countdown state, for timed games.
    pub clock: Option<ClockView>,
    /// Retained chat log.
    pub chat: Vec<ChatMessageView>,
    /// The viewer's own power-up inventory.
    pub your_power_ups: Vec<PowerUpView>,
}

impl RoomSnapshot {
    /// Build a snapshot of `room` personalized for `viewer`.
    pub fn of(room: &RoomState, clock: Option<ClockView>, viewer: Option<Uuid>) -> Self {
        let your_power_ups = viewer
            .and_then(|id| room.players.get(&id))
            .map(|player| player.power_ups.iter().map(PowerUpView::from).collect())
            .unwrap_or_default();

        Self {
            room_id: room.id.clone(),
            seq: room.seq,
            status: room.status,
            settings: SettingsView::from(&room.settings),
            players: room.players.values().map(PlayerView::from).collect(),
            board: room.board.iter().map(CardView::from).collect(),
            turn: room.turn,
            clock,
            chat: room.chat.iter().map(ChatMessageView::from).collect(),
            your_power_ups,
        }
    }
}

/// Final per-player statistics carried in the game-over event.
#[derive(Debug, Clone, Serialize)]
pub struct FinalPlayerStats {
    /// Stable user id.
    pub player_id: Uuid,
    /// Display name.
    pub name: String,
    /// In-game (monotone) score.
    pub score: u64,
    /// Completed-game formula score: efficiency and time bonuses, power-up penalty.
    pub final_score: u64,
    /// Pairs found.
    pub matches: u32,
    /// Card flips.
    pub flips: u32,
    /// matches*2 / flips.
    pub accuracy: f64,
    /// Longest streak.
    pub best_streak: u32,
    /// Power-ups consumed.
    pub power_ups_used: u32,
    /// Zero missed pairs.
    pub perfect: bool,
    /// Achievements newly unlocked by this game.
    pub achievements: Vec<Achievement>,
}
