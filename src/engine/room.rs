//! Runtime state for one game room: roster, board, turn pointer, chat log.
//!
//! A [`RoomState`] is owned exclusively by the room's engine task; nothing
//! outside the engine mutates it.

use std::collections::VecDeque;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Minimum roster size for a game to start.
pub const MIN_PLAYERS: usize = 2;
/// Maximum configurable roster size.
pub const MAX_PLAYERS: usize = 4;
/// Board side lengths supported by the generator.
pub const BOARD_SIZES: [usize; 3] = [4, 6, 8];

/// Stable identity of a participant, resolved by the connection router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerIdentity {
    /// Stable user id.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Optional avatar reference.
    pub avatar: Option<String>,
    /// Whether the identity was minted for an unauthenticated guest.
    pub guest: bool,
}

/// The fixed power-up catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PowerUpKind {
    /// The same player goes again after the current turn resolves.
    ExtraTurn,
    /// Briefly shows all unmatched card values to the owner only.
    Peek,
    /// Exchanges the face values of two unmatched, face-down cards.
    Swap,
    /// Briefly shows one unmatched, face-down card to the owner only.
    RevealOne,
    /// Pauses the room countdown for a fixed duration.
    Freeze,
    /// Redistributes the values of all unmatched, face-down cards.
    Shuffle,
}

impl PowerUpKind {
    /// Whether using this power-up requires holding the turn.
    pub fn requires_turn(self) -> bool {
        !matches!(self, PowerUpKind::Peek | PowerUpKind::Freeze)
    }

    /// Human-readable label used in system chat entries.
    pub fn label(self) -> &'static str {
        match self {
            PowerUpKind::ExtraTurn => "extra turn",
            PowerUpKind::Peek => "peek",
            PowerUpKind::Swap => "swap",
            PowerUpKind::RevealOne => "reveal",
            PowerUpKind::Freeze => "freeze",
            PowerUpKind::Shuffle => "shuffle",
        }
    }

    /// Every catalogue entry, used by the board generator's random roll.
    pub const ALL: [PowerUpKind; 6] = [
        PowerUpKind::ExtraTurn,
        PowerUpKind::Peek,
        PowerUpKind::Swap,
        PowerUpKind::RevealOne,
        PowerUpKind::Freeze,
        PowerUpKind::Shuffle,
    ];
}

/// A power-up held in a player's inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeldPowerUp {
    /// Catalogue entry.
    pub kind: PowerUpKind,
    /// Remaining uses; the entry is dropped when this reaches zero.
    pub uses: u32,
}

/// One participant in a room with their per-game mutable state.
#[derive(Debug, Clone, Serialize)]
pub struct Player {
    /// Stable identity.
    pub identity: PlayerIdentity,
    /// Cumulative in-game score; never decreases during a game.
    pub score: u64,
    /// Pairs found.
    pub matches: u32,
    /// Individual card flips performed.
    pub flips: u32,
    /// Consecutive matches in the current streak.
    pub streak: u32,
    /// Longest streak reached this game.
    pub best_streak: u32,
    /// Missed pairs, used for the perfect-game achievement.
    pub wrong_flips: u32,
    /// Held power-ups.
    pub power_ups: Vec<HeldPowerUp>,
    /// Power-ups consumed this game.
    pub power_ups_used: u32,
    /// Queued extra-turn effects.
    pub extra_turns: u32,
    /// Ready flag while the room is waiting.
    pub ready: bool,
    /// Whether the player currently has a live connection.
    pub connected: bool,
}

impl Player {
    /// Fresh per-game state for a newly admitted identity.
    pub fn new(identity: PlayerIdentity) -> Self {
        Self {
            identity,
            score: 0,
            matches: 0,
            flips: 0,
            streak: 0,
            best_streak: 0,
            wrong_flips: 0,
            power_ups: Vec::new(),
            power_ups_used: 0,
            extra_turns: 0,
            ready: false,
            connected: true,
        }
    }

    /// Credit one use of a power-up picked up from a flipped card.
    pub fn grant_power_up(&mut self, kind: PowerUpKind) {
        if let Some(held) = self.power_ups.iter_mut().find(|held| held.kind == kind) {
            held.uses += 1;
        } else {
            self.power_ups.push(HeldPowerUp { kind, uses: 1 });
        }
    }

    /// Consume one use of a held power-up; `false` if not owned.
    pub fn consume_power_up(&mut self, kind: PowerUpKind) -> bool {
        let Some(index) = self.power_ups.iter().position(|held| held.kind == kind) else {
            return false;
        };
        self.power_ups[index].uses -= 1;
        if self.power_ups[index].uses == 0 {
            self.power_ups.remove(index);
        }
        self.power_ups_used += 1;
        true
    }
}

/// One board cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Card {
    /// Stable index, 0..N-1.
    pub id: usize,
    /// Theme-specific symbol shared by exactly one other card.
    pub value: String,
    /// Face-up and not yet resolved.
    pub flipped: bool,
    /// Part of a found pair.
    pub matched: bool,
    /// Power-up attached at generation time; cleared once picked up.
    pub power_up: Option<PowerUpKind>,
}

/// Supported game modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GameMode {
    /// Untimed, repeat turn on match.
    Classic,
    /// Timed with doubled time bonus; no repeat turn on match.
    Blitz,
    /// Timed, guaranteed tie breaker on a drawn clock.
    SuddenDeath,
    /// Classic rules with a much higher power-up density.
    PowerupFrenzy,
}

impl GameMode {
    /// Whether a successful match lets the same player go again.
    pub fn repeat_turn_on_match(self) -> bool {
        !matches!(self, GameMode::Blitz)
    }

    /// Mode multiplier applied to the raw time bonus.
    pub fn time_bonus_multiplier(self) -> f64 {
        match self {
            GameMode::Blitz => 2.0,
            GameMode::SuddenDeath => 1.5,
            GameMode::Classic | GameMode::PowerupFrenzy => 1.0,
        }
    }
}

/// Immutable per-room settings fixed at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSettings {
    /// Maximum roster size, 2..=4.
    pub max_players: usize,
    /// Board side length, one of 4/6/8.
    pub board_size: usize,
    /// Game mode.
    pub mode: GameMode,
    /// Theme palette name.
    pub theme: String,
    /// Whether cards may carry power-ups.
    pub power_ups_enabled: bool,
    /// Optional countdown override in seconds.
    pub time_limit_secs: Option<u64>,
    /// Hidden from lobby listings.
    pub private: bool,
    /// Join password for private rooms; never serialized to clients.
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            max_players: 2,
            board_size: 4,
            mode: GameMode::Classic,
            theme: "animals".to_string(),
            power_ups_enabled: true,
            time_limit_secs: None,
            private: false,
            password: None,
        }
    }
}

/// Lifecycle status of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GameStatus {
    /// Collecting players and ready flags.
    Waiting,
    /// Board dealt, turns in progress.
    Playing,
    /// Two-card tie breaker after a drawn clock.
    SuddenDeath,
    /// Terminal; results computed and persisted.
    Finished,
}

/// Why a game reached the finished state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Every pair on the board was found.
    BoardComplete,
    /// The clock ran out with a clear leader.
    TimeUp,
    /// First match of the sudden-death round.
    SuddenDeathWinner,
    /// Sudden-death round elapsed with no match; nobody wins.
    SuddenDeathTimeout,
    /// Everyone else left or disconnected.
    LastPlayerWinner,
}

/// Whether a chat entry came from a player or the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    /// Regular player message.
    User,
    /// Engine-generated annotation (power-up use, join/leave).
    System,
}

/// One entry of the bounded, append-only chat log.
#[derive(Debug, Clone, Serialize)]
pub struct ChatEntry {
    /// Unique message id.
    pub id: Uuid,
    /// Author id; `None` for system entries.
    pub author_id: Option<Uuid>,
    /// Author display name (or "system").
    pub author_name: String,
    /// Trimmed, length-capped text.
    pub text: String,
    /// Server-side receive timestamp.
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    /// User or system entry.
    pub kind: ChatKind,
}

impl ChatEntry {
    /// Build a user chat entry.
    pub fn user(author: &PlayerIdentity, text: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            author_id: Some(author.id),
            author_name: author.name.clone(),
            text,
            at: OffsetDateTime::now_utc(),
            kind: ChatKind::User,
        }
    }

    /// Build a system annotation entry.
    pub fn system(text: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            author_id: None,
            author_name: "system".to_string(),
            text,
            at: OffsetDateTime::now_utc(),
            kind: ChatKind::System,
        }
    }
}

/// Mutable record of one game instance.
#[derive(Debug)]
pub struct RoomState {
    /// Room identifier.
    pub id: String,
    /// Settings fixed at creation.
    pub settings: RoomSettings,
    /// Roster keyed by user id, iteration order = join/turn order.
    pub players: IndexMap<Uuid, Player>,
    /// The dealt board; empty while waiting.
    pub board: Vec<Card>,
    /// Current turn holder, if a game is running.
    pub turn: Option<Uuid>,
    /// Lifecycle status.
    pub status: GameStatus,
    /// Face-up, unresolved card ids (0..=2 entries).
    pub pending_pair: Vec<usize>,
    /// A missed pair is face-up awaiting the flip-back timer; flips rejected.
    pub resolving: bool,
    /// Bounded chat log.
    pub chat: VecDeque<ChatEntry>,
    /// Monotonic sequence number attached to every broadcast and snapshot.
    pub seq: u64,
    /// Winner set once finished; empty means a no-winner finish.
    pub winners: Vec<Uuid>,
    /// Why the game finished, once terminal.
    pub finish_reason: Option<FinishReason>,
}

impl RoomState {
    /// Create an empty waiting room.
    pub fn new(id: String, settings: RoomSettings) -> Self {
        Self {
            id,
            settings,
            players: IndexMap::new(),
            board: Vec::new(),
            turn: None,
            status: GameStatus::Waiting,
            pending_pair: Vec::new(),
            resolving: false,
            chat: VecDeque::new(),
            seq: 0,
            winners: Vec::new(),
            finish_reason: None,
        }
    }

    /// Admit a new identity into the roster. The caller checks capacity,
    /// password, and status first; a duplicate id is a no-op returning `false`.
    pub fn admit(&mut self, identity: PlayerIdentity) -> bool {
        if self.players.contains_key(&identity.id) {
            return false;
        }
        self.players.insert(identity.id, Player::new(identity));
        true
    }

    /// Number of currently connected roster members.
    pub fn connected_count(&self) -> usize {
        self.players.values().filter(|p| p.connected).count()
    }

    /// The single remaining connected player, if exactly one.
    pub fn sole_connected_player(&self) -> Option<Uuid> {
        let mut connected = self.players.values().filter(|p| p.connected);
        match (connected.next(), connected.next()) {
            (Some(only), None) => Some(only.identity.id),
            _ => None,
        }
    }

    /// Next connected player in join order after `current`, wrapping around.
    /// Returns `None` when nobody (else) is connected.
    pub fn next_connected_after(&self, current: Uuid) -> Option<Uuid> {
        let ids: Vec<Uuid> = self.players.keys().copied().collect();
        let start = ids.iter().position(|id| *id == current)?;
        (1..=ids.len())
            .map(|offset| ids[(start + offset) % ids.len()])
            .find(|id| self.players.get(id).is_some_and(|p| p.connected))
    }

    /// Ensure the turn holder is a connected roster member; if not, reassign
    /// to the first connected player. Returns the new holder when a
    /// reassignment happened.
    pub fn heal_turn(&mut self) -> Option<Uuid> {
        let holder_ok = self
            .turn
            .and_then(|id| self.players.get(&id))
            .is_some_and(|p| p.connected);
        if holder_ok {
            return None;
        }
        let replacement = self
            .players
            .values()
            .find(|p| p.connected)
            .map(|p| p.identity.id);
        self.turn = replacement;
        replacement
    }

    /// Append a chat entry, evicting the oldest beyond `cap`.
    pub fn push_chat(&mut self, entry: ChatEntry, cap: usize) {
        self.chat.push_back(entry);
        while self.chat.len() > cap {
            self.chat.pop_front();
        }
    }

    /// Card ids that are neither matched nor currently face-up.
    pub fn unmatched_unflipped_ids(&self) -> Vec<usize> {
        self.board
            .iter()
            .filter(|card| !card.matched && !card.flipped)
            .map(|card| card.id)
            .collect()
    }

    /// Whether every card on the board is matched.
    pub fn board_complete(&self) -> bool {
        !self.board.is_empty() && self.board.iter().all(|card| card.matched)
    }

    /// Highest score and the players holding it (supports ties).
    pub fn leaders(&self) -> (u64, Vec<Uuid>) {
        let top = self.players.values().map(|p| p.score).max().unwrap_or(0);
        let leaders = self
            .players
            .values()
            .filter(|p| p.score == top)
            .map(|p| p.identity.id)
            .collect();
        (top, leaders)
    }

    /// Whether the start condition is met: roster full, or everyone (at
    /// least [`MIN_PLAYERS`]) flagged ready.
    pub fn should_start(&self) -> bool {
        if self.status != GameStatus::Waiting {
            return false;
        }
        if self.players.len() >= self.settings.max_players {
            return true;
        }
        self.players.len() >= MIN_PLAYERS && self.players.values().all(|p| p.ready)
    }
}
