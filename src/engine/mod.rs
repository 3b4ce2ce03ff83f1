//! The per-room game engine.
//!
//! Each active room is one actor: a [`GameEngine`] owned by a single tokio
//! task draining an mpsc mailbox. Inbound actions, disconnect notifications,
//! and timer firings are all commands on that mailbox, so every room
//! processes exactly one command at a time in arrival order. Rooms share no
//! mutable state; cross-room parallelism falls out of one task per room.
//!
//! Timers (flip-back delay, turn auto-pass, game clock, freeze, sudden death,
//! disconnect grace) are spawned sleeps that post a [`TimerEvent`] back onto
//! the mailbox. Every timer carries a generation number and is ignored when
//! the engine has since moved on, so cancelled timers can never fire against
//! stale state.

pub mod board;
pub mod room;
pub mod scoring;

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::{
    sync::mpsc,
    time::{Instant, sleep},
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    config::AppConfig,
    dao::stats::{PlayerGameResult, StatsStore},
    dto::{
        game::{CardReveal, CardView, ChatMessageView, ClockView, FinalPlayerStats, PlayerView,
            PowerUpView, RoomSnapshot},
        ws::{Envelope, ServerEvent, TurnChangeReason, TurnContinueReason},
    },
    engine::{
        board::{generate_board, generate_sudden_death_cards},
        room::{ChatEntry, FinishReason, GameStatus, PlayerIdentity, PowerUpKind, RoomState,
            RoomSettings},
        scoring::{MATCH_POINTS, STREAK_STEP_POINTS, accuracy, calculate_score},
    },
    error::{GameError, GameResult},
    state::registry::RoomRegistry,
};

/// Outbound frame channel of one connection.
pub type EventSink = mpsc::UnboundedSender<Envelope>;

/// Player action already resolved to an identity by the connection router.
#[derive(Debug, Clone)]
pub enum ClientAction {
    /// Join the room (or reconnect to it).
    Join {
        /// Password for private rooms.
        password: Option<String>,
    },
    /// Leave the room permanently.
    Leave,
    /// Toggle the ready flag while waiting.
    ToggleReady,
    /// Flip one card.
    Flip {
        /// Card index.
        card_id: usize,
    },
    /// Use a held power-up.
    UsePowerUp {
        /// Catalogue entry.
        kind: PowerUpKind,
        /// Target card ids.
        targets: Vec<usize>,
    },
    /// Send a chat message.
    Chat {
        /// Raw text.
        text: String,
    },
    /// Request a full state resync.
    Resync,
}

/// Timer firings posted back onto the room mailbox.
#[derive(Debug, Clone, Copy)]
pub enum TimerEvent {
    /// Reveal delay after a missed pair elapsed.
    FlipBack {
        /// Generation guard.
        generation: u64,
    },
    /// Turn auto-pass timeout elapsed.
    TurnTimeout {
        /// Generation guard.
        generation: u64,
    },
    /// Game countdown reached zero.
    ClockExpired {
        /// Generation guard.
        generation: u64,
    },
    /// Freeze power-up duration elapsed; the clock resumes.
    FreezeEnded {
        /// Generation guard.
        generation: u64,
    },
    /// Sudden-death round elapsed without a match.
    SuddenDeathExpired {
        /// Generation guard.
        generation: u64,
    },
    /// Disconnect grace window elapsed without a reconnect.
    GraceExpired {
        /// The player whose grace window ran out.
        user_id: Uuid,
        /// Generation guard.
        generation: u64,
    },
}

/// Commands accepted by a room's mailbox.
pub enum RoomCommand {
    /// A player action routed by the connection layer.
    Action {
        /// Acting identity.
        actor: PlayerIdentity,
        /// The action.
        action: ClientAction,
        /// The acting connection's outbound channel (for sender-only events).
        sink: EventSink,
    },
    /// A connection carrying this user closed abruptly.
    Disconnect {
        /// The user whose transport dropped.
        user_id: Uuid,
    },
    /// An engine-owned timer fired.
    Timer(TimerEvent),
    /// Inactivity sweep probe; the room shuts itself down when idle.
    SweepIfIdle {
        /// Idle duration after which the room is reaped.
        idle_after: Duration,
    },
}

/// Cloneable handle used to enqueue commands for a room.
#[derive(Clone, Debug)]
pub struct RoomHandle {
    tx: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    /// Enqueue a command; `false` when the room has already shut down.
    pub fn send(&self, command: RoomCommand) -> bool {
        self.tx.send(command).is_ok()
    }
}

/// Spawn the actor task for a new room and return its handle.
///
/// The task removes itself from the registry when its loop ends, so the
/// handle stored there never outlives the room.
pub fn spawn_room(
    room_id: String,
    settings: RoomSettings,
    config: Arc<AppConfig>,
    stats: Arc<dyn StatsStore>,
    registry: Arc<RoomRegistry>,
) -> RoomHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = RoomHandle { tx: tx.clone() };

    tokio::spawn(async move {
        let mut engine = GameEngine::new(
            RoomState::new(room_id.clone(), settings),
            tx,
            config,
            stats,
        );
        info!(room = %room_id, "room created");

        while let Some(command) = rx.recv().await {
            if engine.handle(command).await == Flow::Shutdown {
                break;
            }
        }

        registry.remove(&room_id);
        info!(room = %room_id, "room closed");
    });

    handle
}

/// Whether the actor loop keeps running after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

/// Authoritative state machine for one room.
struct GameEngine {
    state: RoomState,
    sinks: HashMap<Uuid, EventSink>,
    self_tx: mpsc::UnboundedSender<RoomCommand>,
    config: Arc<AppConfig>,
    stats: Arc<dyn StatsStore>,
    flip_generation: u64,
    turn_generation: u64,
    clock_generation: u64,
    freeze_generation: u64,
    sudden_death_generation: u64,
    grace_generations: HashMap<Uuid, u64>,
    clock_deadline: Option<Instant>,
    clock_deadline_unix_ms: Option<u64>,
    frozen_remaining: Option<Duration>,
    reveal_locks: HashMap<usize, Instant>,
    // The player whose miss is waiting on the flip-back timer.
    flip_back_by: Option<Uuid>,
    last_activity: Instant,
}

impl GameEngine {
    fn new(
        state: RoomState,
        self_tx: mpsc::UnboundedSender<RoomCommand>,
        config: Arc<AppConfig>,
        stats: Arc<dyn StatsStore>,
    ) -> Self {
        Self {
            state,
            sinks: HashMap::new(),
            self_tx,
            config,
            stats,
            flip_generation: 0,
            turn_generation: 0,
            clock_generation: 0,
            freeze_generation: 0,
            sudden_death_generation: 0,
            grace_generations: HashMap::new(),
            clock_deadline: None,
            clock_deadline_unix_ms: None,
            frozen_remaining: None,
            reveal_locks: HashMap::new(),
            flip_back_by: None,
            last_activity: Instant::now(),
        }
    }

    async fn handle(&mut self, command: RoomCommand) -> Flow {
        match command {
            RoomCommand::Action {
                actor,
                action,
                sink,
            } => {
                self.last_activity = Instant::now();
                match self.apply_action(&actor, action, &sink).await {
                    Ok(flow) => flow,
                    Err(err) => {
                        self.reject(&sink, &err);
                        Flow::Continue
                    }
                }
            }
            RoomCommand::Disconnect { user_id } => {
                self.last_activity = Instant::now();
                self.handle_disconnect(user_id).await
            }
            RoomCommand::Timer(event) => self.handle_timer(event).await,
            RoomCommand::SweepIfIdle { idle_after } => self.handle_sweep(idle_after),
        }
    }

    async fn apply_action(
        &mut self,
        actor: &PlayerIdentity,
        action: ClientAction,
        sink: &EventSink,
    ) -> GameResult<Flow> {
        match action {
            ClientAction::Join { password } => {
                self.handle_join(actor, password.as_deref(), sink)?;
                Ok(Flow::Continue)
            }
            ClientAction::Leave => self.handle_leave(actor.id).await,
            ClientAction::ToggleReady => {
                self.handle_toggle_ready(actor.id)?;
                Ok(Flow::Continue)
            }
            ClientAction::Flip { card_id } => {
                self.handle_flip(actor.id, card_id).await?;
                Ok(Flow::Continue)
            }
            ClientAction::UsePowerUp { kind, targets } => {
                self.handle_use_power_up(actor.id, kind, &targets)?;
                Ok(Flow::Continue)
            }
            ClientAction::Chat { text } => {
                self.handle_chat(actor, &text)?;
                Ok(Flow::Continue)
            }
            ClientAction::Resync => {
                self.require_member(actor.id)?;
                let snapshot = self.snapshot_for(Some(actor.id));
                self.send_to(actor.id, ServerEvent::GameState { room: snapshot });
                Ok(Flow::Continue)
            }
        }
    }

    // ----- join / leave / ready -------------------------------------------

    fn handle_join(
        &mut self,
        actor: &PlayerIdentity,
        password: Option<&str>,
        sink: &EventSink,
    ) -> GameResult<()> {
        if let Some(expected) = self.state.settings.password.as_deref() {
            if password != Some(expected) {
                return Err(GameError::InvalidPassword);
            }
        }

        if self.state.players.contains_key(&actor.id) {
            return self.handle_reconnect(actor.id, sink);
        }

        if self.state.status != GameStatus::Waiting {
            return Err(GameError::GameInProgress);
        }
        if self.state.players.len() >= self.state.settings.max_players {
            return Err(GameError::RoomFull);
        }

        self.state.admit(actor.clone());
        self.sinks.insert(actor.id, sink.clone());

        let view = PlayerView::from(&self.state.players[&actor.id]);
        self.broadcast(ServerEvent::PlayerJoined {
            player: view,
            reconnected: false,
        });
        self.system_chat(format!("{} joined the room", actor.name));

        let snapshot = self.snapshot_for(Some(actor.id));
        self.send_to(actor.id, ServerEvent::RoomJoined { room: snapshot });

        self.maybe_start()
    }

    fn handle_reconnect(&mut self, user_id: Uuid, sink: &EventSink) -> GameResult<()> {
        // Cancel any pending grace forfeit for this player.
        *self.grace_generations.entry(user_id).or_default() += 1;

        let player = self
            .state
            .players
            .get_mut(&user_id)
            .ok_or_else(|| GameError::Validation("you are not in this room".to_string()))?;
        player.connected = true;
        let view = PlayerView::from(&*player);

        self.sinks.insert(user_id, sink.clone());
        self.broadcast(ServerEvent::PlayerJoined {
            player: view,
            reconnected: true,
        });

        // A running game may have parked the turn while everyone was away.
        if self.in_play() {
            if let Some(new_holder) = self.state.heal_turn() {
                warn!(room = %self.state.id, "turn holder was unavailable; reassigned");
                self.broadcast(ServerEvent::TurnChanged {
                    player_id: new_holder,
                    reason: TurnChangeReason::HolderLeft,
                });
                self.restart_turn_timer();
            }
        }

        let snapshot = self.snapshot_for(Some(user_id));
        self.send_to(user_id, ServerEvent::RoomJoined { room: snapshot });
        Ok(())
    }

    async fn handle_leave(&mut self, user_id: Uuid) -> GameResult<Flow> {
        self.require_member(user_id)?;

        let next_holder = if self.state.turn == Some(user_id) {
            self.state.next_connected_after(user_id)
        } else {
            None
        };

        let name = self.state.players[&user_id].identity.name.clone();
        self.state.players.shift_remove(&user_id);
        self.sinks.remove(&user_id);

        self.broadcast(ServerEvent::PlayerLeft { player_id: user_id });
        self.system_chat(format!("{name} left the room"));

        if self.state.players.is_empty() {
            return Ok(Flow::Shutdown);
        }

        if self.in_play() {
            return self.departure_guard(next_holder).await;
        }

        if self.state.status == GameStatus::Waiting {
            self.maybe_start()?;
        }
        Ok(Flow::Continue)
    }

    fn handle_toggle_ready(&mut self, user_id: Uuid) -> GameResult<()> {
        if self.state.status != GameStatus::Waiting {
            return Err(GameError::WrongGameMode(
                "the game has already started".to_string(),
            ));
        }

        let player = self
            .state
            .players
            .get_mut(&user_id)
            .ok_or_else(|| GameError::Validation("you are not in this room".to_string()))?;
        player.ready = !player.ready;

        self.broadcast_snapshots(|state, clock, viewer| ServerEvent::GameState {
            room: RoomSnapshot::of(state, clock, Some(viewer)),
        });
        self.maybe_start()
    }

    fn maybe_start(&mut self) -> GameResult<()> {
        if self.state.should_start() {
            self.start_game()?;
        }
        Ok(())
    }

    fn start_game(&mut self) -> GameResult<()> {
        let settings = self.state.settings.clone();
        let palette = self
            .config
            .palette(&settings.theme)
            .ok_or_else(|| GameError::Configuration(format!("unknown theme `{}`", settings.theme)))?;

        let chance = if settings.power_ups_enabled {
            self.config.power_up_chance_for(settings.mode)
        } else {
            0.0
        };
        self.state.board = generate_board(settings.board_size, palette, chance)?;

        self.state.status = GameStatus::Playing;
        self.state.pending_pair.clear();
        self.state.resolving = false;
        for player in self.state.players.values_mut() {
            player.ready = false;
        }
        self.state.turn = self
            .state
            .players
            .values()
            .find(|p| p.connected)
            .map(|p| p.identity.id);

        if let Some(limit) = self
            .config
            .time_limit_for(settings.mode, settings.time_limit_secs)
        {
            self.start_clock(limit);
        }
        self.restart_turn_timer();

        info!(
            room = %self.state.id,
            mode = ?settings.mode,
            board = settings.board_size,
            players = self.state.players.len(),
            "game started"
        );
        self.broadcast_snapshots(|state, clock, viewer| ServerEvent::GameStarted {
            room: RoomSnapshot::of(state, clock, Some(viewer)),
        });
        Ok(())
    }

    // ----- flips -----------------------------------------------------------

    async fn handle_flip(&mut self, user_id: Uuid, card_id: usize) -> GameResult<()> {
        if !self.in_play() {
            return Err(GameError::WrongGameMode("no game in progress".to_string()));
        }
        if self.state.turn != Some(user_id) {
            return Err(GameError::NotYourTurn);
        }
        if self.state.resolving || self.state.pending_pair.len() >= 2 {
            return Err(GameError::PendingPairFull);
        }

        let now = Instant::now();
        self.reveal_locks.retain(|_, until| *until > now);
        if self.reveal_locks.contains_key(&card_id) {
            return Err(GameError::InvalidCardState(
                "card is currently revealed by a power-up".to_string(),
            ));
        }

        let card = self
            .state
            .board
            .get_mut(card_id)
            .ok_or_else(|| GameError::InvalidCardState(format!("card {card_id} out of range")))?;
        if card.matched {
            return Err(GameError::InvalidCardState("card is already matched".to_string()));
        }
        if card.flipped {
            return Err(GameError::InvalidCardState("card is already face up".to_string()));
        }

        card.flipped = true;
        let reveal = CardReveal::from(&*card);
        let picked_up = card.power_up.take();
        self.state.pending_pair.push(card_id);

        let player = self
            .state
            .players
            .get_mut(&user_id)
            .ok_or(GameError::NotYourTurn)?;
        player.flips += 1;
        if let Some(kind) = picked_up {
            player.grant_power_up(kind);
        }

        self.broadcast(ServerEvent::CardFlipped {
            player_id: user_id,
            card: reveal,
            power_up: picked_up,
        });
        if picked_up.is_some() {
            self.send_inventory(user_id);
        }

        if self.state.pending_pair.len() == 2 {
            self.resolve_pending_pair(user_id).await?;
        }
        Ok(())
    }

    async fn resolve_pending_pair(&mut self, user_id: Uuid) -> GameResult<()> {
        let [first, second] = [self.state.pending_pair[0], self.state.pending_pair[1]];
        let matched = self.state.board[first].value == self.state.board[second].value;

        if matched {
            let value = self.state.board[first].value.clone();
            for id in [first, second] {
                let card = &mut self.state.board[id];
                card.matched = true;
                card.flipped = false;
            }
            self.state.pending_pair.clear();

            let player = self
                .state
                .players
                .get_mut(&user_id)
                .ok_or(GameError::NotYourTurn)?;
            player.matches += 1;
            player.streak += 1;
            player.best_streak = player.best_streak.max(player.streak);
            let streak = player.streak;
            player.score += MATCH_POINTS + u64::from(streak.saturating_sub(1)) * STREAK_STEP_POINTS;
            let (score, matches) = (player.score, player.matches);

            self.broadcast(ServerEvent::CardsMatched {
                player_id: user_id,
                card_ids: [first, second],
                value,
                score,
                matches,
                streak,
            });

            if self.state.status == GameStatus::SuddenDeath {
                return self
                    .finish(FinishReason::SuddenDeathWinner, vec![user_id])
                    .await;
            }
            if self.state.board_complete() {
                let (_, leaders) = self.state.leaders();
                return self.finish(FinishReason::BoardComplete, leaders).await;
            }

            if self.state.settings.mode.repeat_turn_on_match() {
                let remaining = self.state.players[&user_id].extra_turns;
                self.broadcast(ServerEvent::TurnContinue {
                    player_id: user_id,
                    reason: TurnContinueReason::Match,
                    remaining_extra_turns: remaining,
                });
                self.restart_turn_timer();
            } else {
                self.advance_after_turn(user_id);
            }
        } else {
            let player = self
                .state
                .players
                .get_mut(&user_id)
                .ok_or(GameError::NotYourTurn)?;
            player.streak = 0;
            player.wrong_flips += 1;

            self.state.resolving = true;
            self.flip_back_by = Some(user_id);
            self.flip_generation += 1;
            self.schedule(
                self.config.reveal_delay(),
                TimerEvent::FlipBack {
                    generation: self.flip_generation,
                },
            );
        }
        Ok(())
    }

    /// Turn resolution after a miss (or a match in non-repeat modes): queued
    /// extra turns fire first, otherwise rotation moves to the next
    /// connected player.
    fn advance_after_turn(&mut self, holder: Uuid) {
        if let Some(player) = self.state.players.get_mut(&holder) {
            if player.connected && player.extra_turns > 0 {
                player.extra_turns -= 1;
                let remaining = player.extra_turns;
                self.broadcast(ServerEvent::TurnContinue {
                    player_id: holder,
                    reason: TurnContinueReason::ExtraTurn,
                    remaining_extra_turns: remaining,
                });
                self.restart_turn_timer();
                return;
            }
        }

        match self.state.next_connected_after(holder) {
            Some(next) => {
                self.state.turn = Some(next);
                self.broadcast(ServerEvent::TurnChanged {
                    player_id: next,
                    reason: TurnChangeReason::Advance,
                });
                self.restart_turn_timer();
            }
            None => {
                // Nobody is connected; park the turn until a reconnect.
                self.state.turn = None;
            }
        }
    }

    // ----- power-ups -------------------------------------------------------

    fn handle_use_power_up(
        &mut self,
        user_id: Uuid,
        kind: PowerUpKind,
        targets: &[usize],
    ) -> GameResult<()> {
        if !self.in_play() {
            return Err(GameError::WrongGameMode("no game in progress".to_string()));
        }
        self.require_member(user_id)?;
        if kind.requires_turn() && self.state.turn != Some(user_id) {
            return Err(GameError::NotYourTurn);
        }

        let owned = self.state.players[&user_id]
            .power_ups
            .iter()
            .any(|held| held.kind == kind && held.uses > 0);
        if !owned {
            return Err(GameError::PowerUpNotOwned);
        }

        // Validate the target before consuming a use: a rejected attempt must
        // leave the inventory untouched. Freeze captures its deadline here so
        // the effect below cannot fail after consumption.
        let mut frozen_deadline = None;
        match kind {
            PowerUpKind::Swap => self.check_swap_targets(targets)?,
            PowerUpKind::RevealOne => {
                self.check_face_down_target(targets, 1)?;
            }
            PowerUpKind::Freeze => {
                if self.frozen_remaining.is_some() {
                    return Err(GameError::PowerUpInvalidTarget(
                        "the countdown is already frozen".to_string(),
                    ));
                }
                frozen_deadline = self.clock_deadline;
                if frozen_deadline.is_none() {
                    return Err(GameError::WrongGameMode(
                        "this game has no countdown to freeze".to_string(),
                    ));
                }
            }
            PowerUpKind::Shuffle => {
                if self.state.unmatched_unflipped_ids().len() < 2 {
                    return Err(GameError::PowerUpInvalidTarget(
                        "nothing left to shuffle".to_string(),
                    ));
                }
            }
            PowerUpKind::ExtraTurn | PowerUpKind::Peek => {}
        }

        let player = self
            .state
            .players
            .get_mut(&user_id)
            .ok_or_else(|| GameError::Validation("you are not in this room".to_string()))?;
        let consumed = player.consume_power_up(kind);
        debug_assert!(consumed, "ownership checked above");
        let name = player.identity.name.clone();

        match kind {
            PowerUpKind::ExtraTurn => {
                if let Some(player) = self.state.players.get_mut(&user_id) {
                    player.extra_turns += 1;
                }
            }
            PowerUpKind::Peek => {
                let cards: Vec<CardReveal> = self
                    .state
                    .board
                    .iter()
                    .filter(|card| !card.matched)
                    .map(CardReveal::from)
                    .collect();
                self.send_to(
                    user_id,
                    ServerEvent::PowerupPeek {
                        cards,
                        duration_ms: self.config.peek_duration_ms,
                    },
                );
            }
            PowerUpKind::Swap => {
                let (a, b) = (targets[0], targets[1]);
                let value_a = self.state.board[a].value.clone();
                let value_b = std::mem::replace(&mut self.state.board[b].value, value_a);
                self.state.board[a].value = value_b;
                let cards = [
                    CardReveal::from(&self.state.board[a]),
                    CardReveal::from(&self.state.board[b]),
                ];
                self.broadcast(ServerEvent::PowerupSwap { cards });
            }
            PowerUpKind::RevealOne => {
                let target = targets[0];
                let duration = Duration::from_millis(self.config.peek_duration_ms);
                self.reveal_locks.insert(target, Instant::now() + duration);
                let card = CardReveal::from(&self.state.board[target]);
                self.send_to(
                    user_id,
                    ServerEvent::PowerupReveal {
                        card,
                        duration_ms: self.config.peek_duration_ms,
                    },
                );
            }
            PowerUpKind::Freeze => {
                if let Some(deadline) = frozen_deadline {
                    self.clock_deadline = None;
                    self.clock_deadline_unix_ms = None;
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    self.frozen_remaining = Some(remaining);
                    self.clock_generation += 1;
                    self.freeze_generation += 1;
                    self.schedule(
                        self.config.freeze_duration(),
                        TimerEvent::FreezeEnded {
                            generation: self.freeze_generation,
                        },
                    );
                    self.broadcast(ServerEvent::PowerupFreeze {
                        player_id: user_id,
                        duration_ms: self.config.freeze_duration_ms,
                        remaining_ms: remaining.as_millis() as u64,
                    });
                }
            }
            PowerUpKind::Shuffle => {
                self.shuffle_face_down_values();
                let board: Vec<CardView> = self.state.board.iter().map(CardView::from).collect();
                self.broadcast(ServerEvent::PowerupShuffle { board });
            }
        }

        self.system_chat(format!("{name} used a {} power-up", kind.label()));
        self.send_inventory(user_id);
        Ok(())
    }

    fn check_swap_targets(&self, targets: &[usize]) -> GameResult<()> {
        self.check_face_down_target(targets, 2)?;
        if targets[0] == targets[1] {
            return Err(GameError::PowerUpInvalidTarget(
                "swap needs two different cards".to_string(),
            ));
        }
        Ok(())
    }

    fn check_face_down_target(&self, targets: &[usize], expected: usize) -> GameResult<()> {
        if targets.len() != expected {
            return Err(GameError::PowerUpInvalidTarget(format!(
                "expected {expected} target card(s), got {}",
                targets.len()
            )));
        }
        for &id in targets {
            let card = self.state.board.get(id).ok_or_else(|| {
                GameError::PowerUpInvalidTarget(format!("card {id} out of range"))
            })?;
            if card.matched || card.flipped {
                return Err(GameError::PowerUpInvalidTarget(format!(
                    "card {id} is not face-down"
                )));
            }
        }
        Ok(())
    }

    /// Redistribute the values of all unmatched, face-down cards in place.
    fn shuffle_face_down_values(&mut self) {
        use rand::seq::SliceRandom;

        let ids = self.state.unmatched_unflipped_ids();
        let mut values: Vec<String> = ids
            .iter()
            .map(|&id| self.state.board[id].value.clone())
            .collect();
        values.shuffle(&mut rand::rng());
        for (&id, value) in ids.iter().zip(values) {
            self.state.board[id].value = value;
        }
    }

    // ----- chat ------------------------------------------------------------

    fn handle_chat(&mut self, actor: &PlayerIdentity, text: &str) -> GameResult<()> {
        self.require_member(actor.id)?;
        let text = crate::dto::validation::normalize_chat_text(text, self.config.chat_max_len)
            .ok_or_else(|| GameError::Validation("empty chat message".to_string()))?;

        let entry = ChatEntry::user(actor, text);
        let view = ChatMessageView::from(&entry);
        self.state.push_chat(entry, self.config.chat_history);
        self.broadcast(ServerEvent::ChatMessage { message: view });
        Ok(())
    }

    fn system_chat(&mut self, text: String) {
        let entry = ChatEntry::system(text);
        let view = ChatMessageView::from(&entry);
        self.state.push_chat(entry, self.config.chat_history);
        self.broadcast(ServerEvent::ChatMessage { message: view });
    }

    // ----- disconnects and the player-count guard --------------------------

    async fn handle_disconnect(&mut self, user_id: Uuid) -> Flow {
        let Some(player) = self.state.players.get_mut(&user_id) else {
            return Flow::Continue;
        };
        if !player.connected {
            return Flow::Continue;
        }
        player.connected = false;
        self.sinks.remove(&user_id);

        if !self.in_play() {
            // No game running: a dropped transport is a departure.
            match self.handle_leave(user_id).await {
                Ok(flow) => return flow,
                Err(err) => {
                    warn!(room = %self.state.id, error = %err, "leave after disconnect failed");
                    return Flow::Continue;
                }
            }
        }

        self.broadcast(ServerEvent::PlayerLeft { player_id: user_id });

        if let Some(grace) = self.config.disconnect_grace() {
            let generation = {
                let counter = self.grace_generations.entry(user_id).or_default();
                *counter += 1;
                *counter
            };
            self.schedule(grace, TimerEvent::GraceExpired {
                user_id,
                generation,
            });
            // The grace window only defers the forfeit; the turn moves on
            // immediately so play never stalls on a dropped holder.
            if self.state.turn == Some(user_id) {
                let next = self.state.next_connected_after(user_id);
                self.reassign_turn(next);
            }
            return Flow::Continue;
        }

        let next_holder = if self.state.turn == Some(user_id) {
            self.state.next_connected_after(user_id)
        } else {
            None
        };
        match self.departure_guard(next_holder).await {
            Ok(flow) => flow,
            Err(err) => {
                warn!(room = %self.state.id, error = %err, "departure guard failed");
                Flow::Continue
            }
        }
    }

    /// Re-evaluate the player-count rule after a leave, disconnect, or grace
    /// expiry while a game is running.
    async fn departure_guard(&mut self, next_holder: Option<Uuid>) -> GameResult<Flow> {
        match self.state.connected_count() {
            0 => {
                // Everyone is gone; delete the room without a finish record.
                info!(room = %self.state.id, "all players gone; deleting room");
                Ok(Flow::Shutdown)
            }
            1 => {
                if let Some(winner) = self.state.sole_connected_player() {
                    self.finish(FinishReason::LastPlayerWinner, vec![winner])
                        .await?;
                }
                Ok(Flow::Continue)
            }
            _ => {
                let holder_connected = self
                    .state
                    .turn
                    .and_then(|id| self.state.players.get(&id))
                    .is_some_and(|p| p.connected);
                if !holder_connected {
                    self.reassign_turn(next_holder);
                }
                Ok(Flow::Continue)
            }
        }
    }

    /// Hand the turn to `next_hint` (or the first connected player) after its
    /// holder dropped out, flipping back any lone card they left face up.
    fn reassign_turn(&mut self, next_hint: Option<Uuid>) {
        self.flip_back_abandoned_card();
        let next = next_hint.or_else(|| {
            self.state
                .players
                .values()
                .find(|p| p.connected)
                .map(|p| p.identity.id)
        });
        self.state.turn = next;
        if let Some(next) = next {
            self.broadcast(ServerEvent::TurnChanged {
                player_id: next,
                reason: TurnChangeReason::HolderLeft,
            });
            self.restart_turn_timer();
        }
    }

    /// A lone face-up card from a departed holder goes back down so the next
    /// player does not inherit half a pair. A full pending pair stays put;
    /// its flip-back timer owns it.
    fn flip_back_abandoned_card(&mut self) {
        if self.state.resolving || self.state.pending_pair.is_empty() {
            return;
        }
        let card_ids: Vec<usize> = self.state.pending_pair.drain(..).collect();
        for &id in &card_ids {
            self.state.board[id].flipped = false;
        }
        self.broadcast(ServerEvent::CardsFlippedBack { card_ids });
    }

    // ----- timers ----------------------------------------------------------

    async fn handle_timer(&mut self, event: TimerEvent) -> Flow {
        match event {
            TimerEvent::FlipBack { generation } => {
                if generation == self.flip_generation && self.state.resolving {
                    self.finish_flip_back();
                }
            }
            TimerEvent::TurnTimeout { generation } => {
                if generation == self.turn_generation && self.in_play() && !self.state.resolving {
                    self.handle_turn_timeout();
                }
            }
            TimerEvent::ClockExpired { generation } => {
                if generation == self.clock_generation && self.state.status == GameStatus::Playing {
                    return self.handle_clock_expired().await;
                }
            }
            TimerEvent::FreezeEnded { generation } => {
                if generation == self.freeze_generation {
                    self.resume_clock();
                }
            }
            TimerEvent::SuddenDeathExpired { generation } => {
                if generation == self.sudden_death_generation
                    && self.state.status == GameStatus::SuddenDeath
                {
                    if let Err(err) = self.finish(FinishReason::SuddenDeathTimeout, vec![]).await {
                        warn!(room = %self.state.id, error = %err, "sudden-death finish failed");
                    }
                }
            }
            TimerEvent::GraceExpired {
                user_id,
                generation,
            } => {
                let current = self.grace_generations.get(&user_id).copied().unwrap_or(0);
                let still_gone = self
                    .state
                    .players
                    .get(&user_id)
                    .is_some_and(|p| !p.connected);
                if generation == current && still_gone && self.in_play() {
                    match self.departure_guard(None).await {
                        Ok(flow) => return flow,
                        Err(err) => {
                            warn!(room = %self.state.id, error = %err, "grace expiry guard failed");
                        }
                    }
                }
            }
        }
        Flow::Continue
    }

    fn finish_flip_back(&mut self) {
        let misser = self.flip_back_by.take();
        let card_ids: Vec<usize> = self.state.pending_pair.drain(..).collect();
        for &id in &card_ids {
            self.state.board[id].flipped = false;
        }
        self.state.resolving = false;
        self.broadcast(ServerEvent::CardsFlippedBack { card_ids });

        // Rotate only while the turn still belongs to the player who missed;
        // a departure during the reveal delay already handed it on.
        if let Some(holder) = self.state.turn {
            if misser == Some(holder) {
                self.advance_after_turn(holder);
            }
        }
    }

    fn handle_turn_timeout(&mut self) {
        // A single face-up card goes back down before the turn passes.
        if !self.state.pending_pair.is_empty() {
            let card_ids: Vec<usize> = self.state.pending_pair.drain(..).collect();
            for &id in &card_ids {
                self.state.board[id].flipped = false;
            }
            self.broadcast(ServerEvent::CardsFlippedBack { card_ids });
        }

        let Some(holder) = self.state.turn else {
            return;
        };
        // A timed-out turn forfeits queued extra turns; rotation moves on.
        if let Some(player) = self.state.players.get_mut(&holder) {
            player.extra_turns = 0;
        }
        if let Some(next) = self.state.next_connected_after(holder) {
            self.state.turn = Some(next);
            self.broadcast(ServerEvent::TurnChanged {
                player_id: next,
                reason: TurnChangeReason::Timeout,
            });
            self.restart_turn_timer();
        }
    }

    async fn handle_clock_expired(&mut self) -> Flow {
        self.clock_deadline = None;
        self.clock_deadline_unix_ms = None;

        let (_, leaders) = self.state.leaders();
        let result = if leaders.len() > 1 {
            self.trigger_sudden_death();
            Ok(())
        } else {
            self.finish(FinishReason::TimeUp, leaders).await
        };
        if let Err(err) = result {
            warn!(room = %self.state.id, error = %err, "clock expiry handling failed");
        }
        Flow::Continue
    }

    fn trigger_sudden_death(&mut self) {
        let board = self
            .config
            .palette(&self.state.settings.theme)
            .ok_or_else(|| GameError::Configuration("theme disappeared".to_string()))
            .and_then(generate_sudden_death_cards);
        let board = match board {
            Ok(board) => board,
            Err(err) => {
                // Should be impossible after a successful deal; degrade to a
                // no-winner style finish attempt on the next tick.
                warn!(room = %self.state.id, error = %err, "sudden-death deal failed");
                return;
            }
        };

        self.state.board = board;
        self.state.status = GameStatus::SuddenDeath;
        self.state.pending_pair.clear();
        self.state.resolving = false;
        self.flip_generation += 1;
        self.flip_back_by = None;
        self.reveal_locks.clear();

        if let Some(new_holder) = self.state.heal_turn() {
            self.broadcast(ServerEvent::TurnChanged {
                player_id: new_holder,
                reason: TurnChangeReason::HolderLeft,
            });
        }

        self.sudden_death_generation += 1;
        self.schedule(
            self.config.sudden_death_round(),
            TimerEvent::SuddenDeathExpired {
                generation: self.sudden_death_generation,
            },
        );
        self.restart_turn_timer();

        info!(room = %self.state.id, "sudden death triggered");
        let board_views: Vec<CardView> = self.state.board.iter().map(CardView::from).collect();
        let turn = self.state.turn;
        self.broadcast(ServerEvent::SuddenDeathTriggered {
            board: board_views,
            turn,
            duration_ms: self.config.sudden_death_round_secs * 1000,
        });
    }

    // ----- clock helpers ---------------------------------------------------

    fn start_clock(&mut self, limit: Duration) {
        self.clock_deadline = Some(Instant::now() + limit);
        self.clock_deadline_unix_ms = Some(unix_ms_after(limit));
        self.clock_generation += 1;
        self.schedule(limit, TimerEvent::ClockExpired {
            generation: self.clock_generation,
        });
    }

    fn resume_clock(&mut self) {
        let Some(remaining) = self.frozen_remaining.take() else {
            return;
        };
        self.clock_deadline = Some(Instant::now() + remaining);
        self.clock_deadline_unix_ms = Some(unix_ms_after(remaining));
        self.clock_generation += 1;
        self.schedule(remaining, TimerEvent::ClockExpired {
            generation: self.clock_generation,
        });
    }

    fn remaining_secs(&self) -> u32 {
        if let Some(remaining) = self.frozen_remaining {
            return remaining.as_secs() as u32;
        }
        self.clock_deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()).as_secs() as u32)
            .unwrap_or(0)
    }

    fn clock_view(&self) -> Option<ClockView> {
        if let Some(remaining) = self.frozen_remaining {
            return Some(ClockView {
                deadline_unix_ms: None,
                frozen_remaining_ms: Some(remaining.as_millis() as u64),
            });
        }
        self.clock_deadline_unix_ms.map(|deadline| ClockView {
            deadline_unix_ms: Some(deadline),
            frozen_remaining_ms: None,
        })
    }

    fn restart_turn_timer(&mut self) {
        self.turn_generation += 1;
        if !self.in_play() {
            return;
        }
        if let Some(timeout) = self.config.turn_timeout() {
            self.schedule(timeout, TimerEvent::TurnTimeout {
                generation: self.turn_generation,
            });
        }
    }

    // ----- finishing -------------------------------------------------------

    async fn finish(&mut self, reason: FinishReason, winners: Vec<Uuid>) -> GameResult<()> {
        let time_bonus = self.remaining_secs();

        self.state.status = GameStatus::Finished;
        self.state.finish_reason = Some(reason);
        self.state.winners = winners.clone();
        self.state.turn = None;
        self.state.resolving = false;
        self.state.pending_pair.clear();
        self.flip_back_by = None;
        self.reveal_locks.clear();

        // Invalidate every outstanding timer.
        self.flip_generation += 1;
        self.turn_generation += 1;
        self.clock_generation += 1;
        self.freeze_generation += 1;
        self.sudden_death_generation += 1;
        self.clock_deadline = None;
        self.clock_deadline_unix_ms = None;
        self.frozen_remaining = None;

        let mode = self.state.settings.mode;
        let board_size = self.state.settings.board_size;

        let mut stats = Vec::with_capacity(self.state.players.len());
        let players: Vec<_> = self.state.players.values().cloned().collect();
        for player in players {
            let id = player.identity.id;
            let won = winners.contains(&id);
            let perfect = player.matches > 0 && player.wrong_flips == 0;
            let final_score = calculate_score(
                mode,
                player.matches,
                player.flips,
                time_bonus,
                player.best_streak,
                player.power_ups_used,
            );

            let record = PlayerGameResult {
                user_id: id,
                won,
                score: final_score,
                flips: player.flips,
                matches: player.matches,
                wrong_flips: player.wrong_flips,
                match_streak: player.best_streak,
                power_ups_used: player.power_ups_used,
                is_perfect: perfect,
                game_mode: mode,
                board_size,
            };
            // A failed collaborator call degrades to a result without
            // achievements; it never takes the room down.
            let achievements = match self.stats.record_result(record).await {
                Ok(unlocked) => unlocked,
                Err(err) => {
                    warn!(room = %self.state.id, user = %id, error = %err, "failed to persist game result");
                    Vec::new()
                }
            };

            stats.push(FinalPlayerStats {
                player_id: id,
                name: player.identity.name.clone(),
                score: player.score,
                final_score,
                matches: player.matches,
                flips: player.flips,
                accuracy: accuracy(player.matches, player.flips),
                best_streak: player.best_streak,
                power_ups_used: player.power_ups_used,
                perfect,
                achievements,
            });
        }

        info!(room = %self.state.id, reason = ?reason, winners = winners.len(), "game over");
        self.broadcast(ServerEvent::GameOver {
            winners,
            reason,
            stats,
        });
        Ok(())
    }

    // ----- plumbing --------------------------------------------------------

    fn in_play(&self) -> bool {
        matches!(
            self.state.status,
            GameStatus::Playing | GameStatus::SuddenDeath
        )
    }

    fn require_member(&self, user_id: Uuid) -> GameResult<()> {
        if self.state.players.contains_key(&user_id) {
            Ok(())
        } else {
            Err(GameError::Validation("you are not in this room".to_string()))
        }
    }

    fn schedule(&self, delay: Duration, event: TimerEvent) {
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(RoomCommand::Timer(event));
        });
    }

    fn snapshot_for(&self, viewer: Option<Uuid>) -> RoomSnapshot {
        RoomSnapshot::of(&self.state, self.clock_view(), viewer)
    }

    /// Broadcast one event to every connected player, bumping the room seq.
    fn broadcast(&mut self, event: ServerEvent) {
        self.state.seq += 1;
        let seq = self.state.seq;
        for sink in self.sinks.values() {
            let _ = sink.send(Envelope {
                seq,
                event: event.clone(),
            });
        }
    }

    /// Broadcast a personalized event (one bump, per-viewer payloads).
    fn broadcast_snapshots<F>(&mut self, build: F)
    where
        F: Fn(&RoomState, Option<ClockView>, Uuid) -> ServerEvent,
    {
        self.state.seq += 1;
        let seq = self.state.seq;
        let clock = self.clock_view();
        for (viewer, sink) in &self.sinks {
            let _ = sink.send(Envelope {
                seq,
                event: build(&self.state, clock.clone(), *viewer),
            });
        }
    }

    /// Sender-only event; does not advance the room seq.
    fn send_to(&self, user_id: Uuid, event: ServerEvent) {
        if let Some(sink) = self.sinks.get(&user_id) {
            let _ = sink.send(Envelope {
                seq: self.state.seq,
                event,
            });
        }
    }

    fn send_inventory(&self, user_id: Uuid) {
        let Some(player) = self.state.players.get(&user_id) else {
            return;
        };
        let power_ups: Vec<PowerUpView> = player.power_ups.iter().map(PowerUpView::from).collect();
        self.send_to(user_id, ServerEvent::PowerUpUpdate { power_ups });
    }

    fn reject(&self, sink: &EventSink, err: &GameError) {
        let _ = sink.send(Envelope {
            seq: self.state.seq,
            event: ServerEvent::error(err),
        });
    }

    fn handle_sweep(&mut self, idle_after: Duration) -> Flow {
        let idle = self.last_activity.elapsed() >= idle_after;
        let reapable = self.state.status == GameStatus::Finished
            || self.state.connected_count() == 0;
        if idle && reapable {
            info!(room = %self.state.id, "reaping idle room");
            Flow::Shutdown
        } else {
            Flow::Continue
        }
    }
}

/// Wall-clock unix timestamp `delay` from now, in milliseconds.
fn unix_ms_after(delay: Duration) -> u64 {
    let now_ms = (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as u64;
    now_ms + delay.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dao::stats::MemoryStatsStore,
        engine::room::{Card, GameMode, HeldPowerUp},
    };

    /// Direct-drive harness: the engine is stepped manually and timers are
    /// pumped from the command receiver, so tests control every interleaving.
    struct Harness {
        engine: GameEngine,
        commands: mpsc::UnboundedReceiver<RoomCommand>,
    }

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.reveal_delay_ms = 20;
        config.turn_timeout_secs = 0;
        config
    }

    fn harness_with(settings: RoomSettings, config: AppConfig) -> Harness {
        let (tx, commands) = mpsc::unbounded_channel();
        let engine = GameEngine::new(
            RoomState::new("test-room".into(), settings),
            tx,
            Arc::new(config),
            Arc::new(MemoryStatsStore::new()),
        );
        Harness { engine, commands }
    }

    fn harness() -> Harness {
        harness_with(RoomSettings::default(), test_config())
    }

    impl Harness {
        async fn join(&mut self, name: &str) -> (PlayerIdentity, mpsc::UnboundedReceiver<Envelope>) {
            let identity = PlayerIdentity {
                id: Uuid::new_v4(),
                name: name.to_string(),
                avatar: None,
                guest: false,
            };
            let (sink, rx) = mpsc::unbounded_channel();
            let flow = self
                .engine
                .handle(RoomCommand::Action {
                    actor: identity.clone(),
                    action: ClientAction::Join { password: None },
                    sink,
                })
                .await;
            assert_eq!(flow, Flow::Continue);
            (identity, rx)
        }

        async fn act(&mut self, actor: &PlayerIdentity, action: ClientAction) -> Flow {
            let sink = self.engine.sinks.get(&actor.id).cloned().unwrap_or_else(|| {
                let (sink, _rx) = mpsc::unbounded_channel();
                sink
            });
            self.engine
                .handle(RoomCommand::Action {
                    actor: actor.clone(),
                    action,
                    sink,
                })
                .await
        }

        /// Wait for the next scheduled timer and feed it back to the engine.
        async fn pump_timer(&mut self) -> Flow {
            let command = tokio::time::timeout(Duration::from_secs(2), self.commands.recv())
                .await
                .expect("timer should fire")
                .expect("channel open");
            self.engine.handle(command).await
        }

        /// Replace the dealt board with a deterministic one.
        fn set_board(&mut self, values: &[&str]) {
            self.engine.state.board = values
                .iter()
                .enumerate()
                .map(|(id, value)| Card {
                    id,
                    value: value.to_string(),
                    flipped: false,
                    matched: false,
                    power_up: None,
                })
                .collect();
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            events.push(frame.event);
        }
        events
    }

    fn has_event(events: &[ServerEvent], predicate: impl Fn(&ServerEvent) -> bool) -> bool {
        events.iter().any(predicate)
    }

    async fn started_pair() -> (
        Harness,
        PlayerIdentity,
        mpsc::UnboundedReceiver<Envelope>,
        PlayerIdentity,
        mpsc::UnboundedReceiver<Envelope>,
    ) {
        let mut h = harness();
        let (alice, mut rx_a) = h.join("alice").await;
        let (bob, mut rx_b) = h.join("bob").await;
        assert_eq!(h.engine.state.status, GameStatus::Playing);
        h.set_board(&["A", "A", "B", "B"]);
        drain(&mut rx_a);
        drain(&mut rx_b);
        (h, alice, rx_a, bob, rx_b)
    }

    #[tokio::test]
    async fn second_join_deals_the_board() {
        let mut h = harness();
        let (_, mut rx_a) = h.join("alice").await;
        assert_eq!(h.engine.state.status, GameStatus::Waiting);

        let (bob, _rx_b) = h.join("bob").await;
        assert_eq!(h.engine.state.status, GameStatus::Playing);
        assert_eq!(h.engine.state.board.len(), 16);
        assert_ne!(h.engine.state.turn, Some(bob.id), "first joiner moves first");

        let events = drain(&mut rx_a);
        assert!(has_event(&events, |e| matches!(e, ServerEvent::GameStarted { .. })));
    }

    #[tokio::test]
    async fn matching_pair_scores_and_keeps_turn() {
        let (mut h, alice, mut rx_a, _bob, mut rx_b) = started_pair().await;

        h.act(&alice, ClientAction::Flip { card_id: 0 }).await;
        h.act(&alice, ClientAction::Flip { card_id: 1 }).await;

        let events = drain(&mut rx_b);
        assert!(has_event(&events, |e| matches!(
            e,
            ServerEvent::CardsMatched { player_id, card_ids: [0, 1], matches: 1, .. }
                if *player_id == alice.id
        )));
        assert!(has_event(&events, |e| matches!(
            e,
            ServerEvent::TurnContinue { reason: TurnContinueReason::Match, .. }
        )));

        let player = &h.engine.state.players[&alice.id];
        assert_eq!(player.matches, 1);
        assert_eq!(player.score, MATCH_POINTS);
        assert_eq!(h.engine.state.turn, Some(alice.id));
        assert!(h.engine.state.board[0].matched && h.engine.state.board[1].matched);
        drain(&mut rx_a);
    }

    #[tokio::test]
    async fn mismatch_flips_back_and_advances_turn() {
        let (mut h, alice, mut rx_a, bob, mut rx_b) = started_pair().await;

        h.act(&alice, ClientAction::Flip { card_id: 0 }).await;
        h.act(&alice, ClientAction::Flip { card_id: 2 }).await;
        assert!(h.engine.state.resolving);

        // The reveal-delay timer resolves the miss.
        h.pump_timer().await;
        assert!(!h.engine.state.resolving);
        assert!(!h.engine.state.board[0].flipped && !h.engine.state.board[2].flipped);
        assert_eq!(h.engine.state.turn, Some(bob.id));

        let events = drain(&mut rx_a);
        assert!(has_event(&events, |e| matches!(
            e,
            ServerEvent::CardsFlippedBack { card_ids } if card_ids == &vec![0, 2]
        )));
        assert!(has_event(&events, |e| matches!(
            e,
            ServerEvent::TurnChanged { player_id, reason: TurnChangeReason::Advance }
                if *player_id == bob.id
        )));
        assert_eq!(h.engine.state.players[&alice.id].wrong_flips, 1);
        assert_eq!(h.engine.state.players[&alice.id].streak, 0);
        drain(&mut rx_b);
    }

    #[tokio::test]
    async fn out_of_turn_flip_is_rejected_without_mutation() {
        let (mut h, _alice, mut rx_a, bob, mut rx_b) = started_pair().await;

        h.act(&bob, ClientAction::Flip { card_id: 0 }).await;

        let bob_events = drain(&mut rx_b);
        assert!(has_event(&bob_events, |e| matches!(
            e,
            ServerEvent::Error { code, .. } if code == "not_your_turn"
        )));
        // Rejections are sender-only and mutate nothing.
        assert!(drain(&mut rx_a).is_empty());
        assert!(!h.engine.state.board[0].flipped);
        assert_eq!(h.engine.state.players[&bob.id].flips, 0);
    }

    #[tokio::test]
    async fn third_flip_while_pair_pending_is_rejected() {
        let (mut h, alice, _rx_a, _bob, mut rx_b) = started_pair().await;

        h.act(&alice, ClientAction::Flip { card_id: 0 }).await;
        h.act(&alice, ClientAction::Flip { card_id: 2 }).await;
        h.act(&alice, ClientAction::Flip { card_id: 3 }).await;

        assert!(!h.engine.state.board[3].flipped);
        drain(&mut rx_b);
    }

    #[tokio::test]
    async fn invalid_card_targets_are_rejected() {
        let (mut h, alice, mut rx_a, _bob, _rx_b) = started_pair().await;

        h.act(&alice, ClientAction::Flip { card_id: 99 }).await;
        let events = drain(&mut rx_a);
        assert!(has_event(&events, |e| matches!(
            e,
            ServerEvent::Error { code, .. } if code == "invalid_card_state"
        )));

        // A matched card cannot be flipped again.
        h.act(&alice, ClientAction::Flip { card_id: 0 }).await;
        h.act(&alice, ClientAction::Flip { card_id: 1 }).await;
        drain(&mut rx_a);
        h.act(&alice, ClientAction::Flip { card_id: 0 }).await;
        let events = drain(&mut rx_a);
        assert!(has_event(&events, |e| matches!(
            e,
            ServerEvent::Error { code, .. } if code == "invalid_card_state"
        )));
    }

    #[tokio::test]
    async fn disconnect_declares_last_player_winner() {
        let (mut h, alice, mut rx_a, bob, _rx_b) = started_pair().await;

        let flow = h.engine.handle(RoomCommand::Disconnect { user_id: bob.id }).await;
        assert_eq!(flow, Flow::Continue);
        assert_eq!(h.engine.state.status, GameStatus::Finished);

        let events = drain(&mut rx_a);
        assert!(has_event(&events, |e| matches!(
            e,
            ServerEvent::GameOver { winners, reason: FinishReason::LastPlayerWinner, .. }
                if winners == &vec![alice.id]
        )));

        // Terminal state: no further flips are accepted.
        h.act(&alice, ClientAction::Flip { card_id: 0 }).await;
        let events = drain(&mut rx_a);
        assert!(has_event(&events, |e| matches!(
            e,
            ServerEvent::Error { code, .. } if code == "wrong_game_mode"
        )));
    }

    #[tokio::test]
    async fn resync_is_byte_identical_without_intervening_actions() {
        let (mut h, alice, mut rx_a, _bob, _rx_b) = started_pair().await;

        h.act(&alice, ClientAction::Resync).await;
        h.act(&alice, ClientAction::Resync).await;

        let snapshots: Vec<String> = drain(&mut rx_a)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::GameState { .. }))
            .map(|e| serde_json::to_string(&e).unwrap())
            .collect();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0], snapshots[1]);
    }

    #[tokio::test]
    async fn power_up_pickup_and_conservation() {
        let (mut h, alice, mut rx_a, _bob, _rx_b) = started_pair().await;
        h.engine.state.board[0].power_up = Some(PowerUpKind::Peek);

        h.act(&alice, ClientAction::Flip { card_id: 0 }).await;
        let events = drain(&mut rx_a);
        assert!(has_event(&events, |e| matches!(
            e,
            ServerEvent::CardFlipped { power_up: Some(PowerUpKind::Peek), .. }
        )));
        assert!(has_event(&events, |e| matches!(
            e,
            ServerEvent::PowerUpUpdate { power_ups } if power_ups.len() == 1
        )));

        h.act(
            &alice,
            ClientAction::UsePowerUp {
                kind: PowerUpKind::Peek,
                targets: vec![],
            },
        )
        .await;
        let events = drain(&mut rx_a);
        assert!(has_event(&events, |e| matches!(
            e,
            // Matched cards are excluded from the peek.
            ServerEvent::PowerupPeek { cards, .. } if cards.len() == 4
        )));
        assert!(h.engine.state.players[&alice.id].power_ups.is_empty());
        assert_eq!(h.engine.state.players[&alice.id].power_ups_used, 1);

        // Second use: no longer owned.
        h.act(
            &alice,
            ClientAction::UsePowerUp {
                kind: PowerUpKind::Peek,
                targets: vec![],
            },
        )
        .await;
        let events = drain(&mut rx_a);
        assert!(has_event(&events, |e| matches!(
            e,
            ServerEvent::Error { code, .. } if code == "power_up_not_owned"
        )));
    }

    #[tokio::test]
    async fn swap_exchanges_exactly_two_values() {
        let (mut h, alice, mut rx_a, _bob, mut rx_b) = started_pair().await;
        h.engine
            .state
            .players
            .get_mut(&alice.id)
            .unwrap()
            .power_ups
            .push(HeldPowerUp {
                kind: PowerUpKind::Swap,
                uses: 1,
            });

        h.act(
            &alice,
            ClientAction::UsePowerUp {
                kind: PowerUpKind::Swap,
                targets: vec![1, 2],
            },
        )
        .await;

        assert_eq!(h.engine.state.board[1].value, "B");
        assert_eq!(h.engine.state.board[2].value, "A");
        assert_eq!(h.engine.state.board[0].value, "A");
        assert_eq!(h.engine.state.board[3].value, "B");

        let events = drain(&mut rx_b);
        assert!(has_event(&events, |e| matches!(
            e,
            ServerEvent::PowerupSwap { cards }
                if cards[0].id == 1 && cards[0].value == "B"
                    && cards[1].id == 2 && cards[1].value == "A"
        )));
        drain(&mut rx_a);
    }

    #[tokio::test]
    async fn invalid_swap_target_leaves_uses_unchanged() {
        let (mut h, alice, mut rx_a, _bob, _rx_b) = started_pair().await;
        h.engine
            .state
            .players
            .get_mut(&alice.id)
            .unwrap()
            .power_ups
            .push(HeldPowerUp {
                kind: PowerUpKind::Swap,
                uses: 1,
            });
        h.engine.state.board[0].matched = true;

        h.act(
            &alice,
            ClientAction::UsePowerUp {
                kind: PowerUpKind::Swap,
                targets: vec![0, 2],
            },
        )
        .await;

        let events = drain(&mut rx_a);
        assert!(has_event(&events, |e| matches!(
            e,
            ServerEvent::Error { code, .. } if code == "power_up_invalid_target"
        )));
        assert_eq!(h.engine.state.players[&alice.id].power_ups[0].uses, 1);
        assert_eq!(h.engine.state.players[&alice.id].power_ups_used, 0);
    }

    #[tokio::test]
    async fn extra_turn_fires_after_a_miss() {
        let (mut h, alice, mut rx_a, _bob, _rx_b) = started_pair().await;
        h.engine
            .state
            .players
            .get_mut(&alice.id)
            .unwrap()
            .power_ups
            .push(HeldPowerUp {
                kind: PowerUpKind::ExtraTurn,
                uses: 1,
            });

        h.act(
            &alice,
            ClientAction::UsePowerUp {
                kind: PowerUpKind::ExtraTurn,
                targets: vec![],
            },
        )
        .await;
        assert_eq!(h.engine.state.players[&alice.id].extra_turns, 1);

        h.act(&alice, ClientAction::Flip { card_id: 0 }).await;
        h.act(&alice, ClientAction::Flip { card_id: 2 }).await;
        h.pump_timer().await;

        // The queued extra turn keeps the turn with alice.
        assert_eq!(h.engine.state.turn, Some(alice.id));
        assert_eq!(h.engine.state.players[&alice.id].extra_turns, 0);
        let events = drain(&mut rx_a);
        assert!(has_event(&events, |e| matches!(
            e,
            ServerEvent::TurnContinue {
                reason: TurnContinueReason::ExtraTurn,
                remaining_extra_turns: 0,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn tied_clock_triggers_sudden_death_then_first_match_wins() {
        let mut h = harness_with(
            RoomSettings {
                mode: GameMode::Blitz,
                ..RoomSettings::default()
            },
            test_config(),
        );
        let (alice, mut rx_a) = h.join("alice").await;
        let (_bob, _rx_b) = h.join("bob").await;
        assert_eq!(h.engine.state.status, GameStatus::Playing);
        drain(&mut rx_a);

        // Scores are tied (0-0); force the clock to expire now.
        let generation = h.engine.clock_generation;
        h.engine
            .handle(RoomCommand::Timer(TimerEvent::ClockExpired { generation }))
            .await;
        assert_eq!(h.engine.state.status, GameStatus::SuddenDeath);
        assert_eq!(h.engine.state.board.len(), 2);

        let events = drain(&mut rx_a);
        assert!(has_event(&events, |e| matches!(
            e,
            ServerEvent::SuddenDeathTriggered { board, .. } if board.len() == 2
        )));

        // Holder flips both cards of the shared pair and wins immediately.
        let holder = h.engine.state.turn.expect("holder set");
        let holder_identity = h.engine.state.players[&holder].identity.clone();
        h.act(&holder_identity, ClientAction::Flip { card_id: 0 }).await;
        h.act(&holder_identity, ClientAction::Flip { card_id: 1 }).await;

        assert_eq!(h.engine.state.status, GameStatus::Finished);
        let events = drain(&mut rx_a);
        assert!(has_event(&events, |e| matches!(
            e,
            ServerEvent::GameOver { reason: FinishReason::SuddenDeathWinner, winners, .. }
                if winners == &vec![alice.id] || winners.len() == 1
        )));
    }

    #[tokio::test]
    async fn sudden_death_timeout_finishes_with_no_winner() {
        let mut h = harness_with(
            RoomSettings {
                mode: GameMode::Blitz,
                ..RoomSettings::default()
            },
            test_config(),
        );
        let (_alice, mut rx_a) = h.join("alice").await;
        let (_bob, _rx_b) = h.join("bob").await;

        let generation = h.engine.clock_generation;
        h.engine
            .handle(RoomCommand::Timer(TimerEvent::ClockExpired { generation }))
            .await;
        assert_eq!(h.engine.state.status, GameStatus::SuddenDeath);
        drain(&mut rx_a);

        let generation = h.engine.sudden_death_generation;
        h.engine
            .handle(RoomCommand::Timer(TimerEvent::SuddenDeathExpired { generation }))
            .await;

        assert_eq!(h.engine.state.status, GameStatus::Finished);
        let events = drain(&mut rx_a);
        assert!(has_event(&events, |e| matches!(
            e,
            ServerEvent::GameOver { reason: FinishReason::SuddenDeathTimeout, winners, .. }
                if winners.is_empty()
        )));
    }

    #[tokio::test]
    async fn chat_is_trimmed_and_rebroadcast() {
        let (mut h, alice, _rx_a, _bob, mut rx_b) = started_pair().await;

        h.act(
            &alice,
            ClientAction::Chat {
                text: "  good luck!  ".to_string(),
            },
        )
        .await;

        let events = drain(&mut rx_b);
        assert!(has_event(&events, |e| matches!(
            e,
            ServerEvent::ChatMessage { message } if message.text == "good luck!"
        )));
        assert_eq!(h.engine.state.chat.back().unwrap().text, "good luck!");
    }

    #[tokio::test]
    async fn stale_timer_generations_are_ignored() {
        let (mut h, alice, mut rx_a, _bob, _rx_b) = started_pair().await;

        h.act(&alice, ClientAction::Flip { card_id: 0 }).await;
        h.act(&alice, ClientAction::Flip { card_id: 2 }).await;
        drain(&mut rx_a);

        // A flip-back with an outdated generation must not resolve the pair.
        h.engine
            .handle(RoomCommand::Timer(TimerEvent::FlipBack { generation: 0 }))
            .await;
        assert!(h.engine.state.resolving);
        assert!(drain(&mut rx_a).is_empty());
    }

    #[tokio::test]
    async fn broadcast_seq_is_strictly_increasing() {
        let mut h = harness();
        let (alice, _rx_a) = h.join("alice").await;
        let (_bob, mut rx_b) = h.join("bob").await;
        drain(&mut rx_b);

        h.act(&alice, ClientAction::Flip { card_id: 0 }).await;
        h.act(
            &alice,
            ClientAction::Chat {
                text: "hi".to_string(),
            },
        )
        .await;

        let mut last = 0;
        while let Ok(frame) = rx_b.try_recv() {
            assert!(frame.seq > last, "seq {} not after {last}", frame.seq);
            last = frame.seq;
        }
        assert!(last > 0);
    }

    #[tokio::test]
    async fn join_full_room_is_rejected() {
        let mut h = harness_with(
            RoomSettings {
                max_players: 2,
                ..RoomSettings::default()
            },
            test_config(),
        );
        h.join("alice").await;
        h.join("bob").await;

        let carol = PlayerIdentity {
            id: Uuid::new_v4(),
            name: "carol".to_string(),
            avatar: None,
            guest: false,
        };
        let (sink, mut rx) = mpsc::unbounded_channel();
        h.engine
            .handle(RoomCommand::Action {
                actor: carol,
                action: ClientAction::Join { password: None },
                sink,
            })
            .await;

        let events = drain(&mut rx);
        // The room started when it filled, so the late join sees in-progress.
        assert!(has_event(&events, |e| matches!(
            e,
            ServerEvent::Error { code, .. }
                if code == "game_in_progress" || code == "room_full"
        )));
        assert_eq!(h.engine.state.players.len(), 2);
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let mut h = harness_with(
            RoomSettings {
                password: Some("sesame".to_string()),
                private: true,
                ..RoomSettings::default()
            },
            test_config(),
        );

        let mallory = PlayerIdentity {
            id: Uuid::new_v4(),
            name: "mallory".to_string(),
            avatar: None,
            guest: false,
        };
        let (sink, mut rx) = mpsc::unbounded_channel();
        h.engine
            .handle(RoomCommand::Action {
                actor: mallory,
                action: ClientAction::Join {
                    password: Some("wrong".to_string()),
                },
                sink,
            })
            .await;

        let events = drain(&mut rx);
        assert!(has_event(&events, |e| matches!(
            e,
            ServerEvent::Error { code, .. } if code == "invalid_password"
        )));
        assert!(h.engine.state.players.is_empty());
    }

    #[tokio::test]
    async fn flip_back_does_not_skip_a_reassigned_turn() {
        let mut h = harness_with(
            RoomSettings {
                max_players: 3,
                ..RoomSettings::default()
            },
            test_config(),
        );
        let (alice, _rx_a) = h.join("alice").await;
        let (bob, mut rx_b) = h.join("bob").await;
        let (carol, _rx_c) = h.join("carol").await;
        assert_eq!(h.engine.state.status, GameStatus::Playing);
        h.set_board(&["A", "A", "B", "B"]);
        assert_eq!(h.engine.state.turn, Some(alice.id));

        h.act(&alice, ClientAction::Flip { card_id: 0 }).await;
        h.act(&alice, ClientAction::Flip { card_id: 2 }).await;
        assert!(h.engine.state.resolving);

        // The holder drops while the missed pair waits on its reveal delay.
        h.engine
            .handle(RoomCommand::Disconnect { user_id: alice.id })
            .await;
        assert_eq!(h.engine.state.turn, Some(bob.id));
        drain(&mut rx_b);

        // The delayed flip-back puts the cards face down without rotating
        // the turn a second time.
        h.pump_timer().await;
        assert!(!h.engine.state.board[0].flipped && !h.engine.state.board[2].flipped);
        assert_eq!(h.engine.state.turn, Some(bob.id));

        let events = drain(&mut rx_b);
        assert!(has_event(&events, |e| matches!(
            e,
            ServerEvent::CardsFlippedBack { .. }
        )));
        assert!(!has_event(&events, |e| matches!(
            e,
            ServerEvent::TurnChanged { player_id, .. } if *player_id == carol.id
        )));
    }

    #[tokio::test]
    async fn disconnected_holder_hands_off_the_turn_during_grace() {
        let mut config = test_config();
        config.disconnect_grace_ms = 60_000;
        let mut h = harness_with(RoomSettings::default(), config);
        let (alice, _rx_a) = h.join("alice").await;
        let (bob, mut rx_b) = h.join("bob").await;
        h.set_board(&["A", "A", "B", "B"]);
        assert_eq!(h.engine.state.turn, Some(alice.id));
        drain(&mut rx_b);

        h.engine
            .handle(RoomCommand::Disconnect { user_id: alice.id })
            .await;

        // The grace window defers the forfeit, not the turn.
        assert_eq!(h.engine.state.status, GameStatus::Playing);
        assert_eq!(h.engine.state.turn, Some(bob.id));
        let events = drain(&mut rx_b);
        assert!(has_event(&events, |e| matches!(
            e,
            ServerEvent::TurnChanged { player_id, reason: TurnChangeReason::HolderLeft }
                if *player_id == bob.id
        )));

        h.act(&bob, ClientAction::Flip { card_id: 0 }).await;
        assert!(h.engine.state.board[0].flipped);
    }

    #[tokio::test]
    async fn departing_holder_lone_card_goes_face_down() {
        let mut h = harness_with(
            RoomSettings {
                max_players: 3,
                ..RoomSettings::default()
            },
            test_config(),
        );
        let (alice, _rx_a) = h.join("alice").await;
        let (bob, mut rx_b) = h.join("bob").await;
        let (_carol, _rx_c) = h.join("carol").await;
        h.set_board(&["A", "A", "B", "B"]);

        h.act(&alice, ClientAction::Flip { card_id: 0 }).await;
        drain(&mut rx_b);

        h.engine
            .handle(RoomCommand::Disconnect { user_id: alice.id })
            .await;

        assert!(!h.engine.state.board[0].flipped);
        assert!(h.engine.state.pending_pair.is_empty());
        assert_eq!(h.engine.state.turn, Some(bob.id));
        let events = drain(&mut rx_b);
        assert!(has_event(&events, |e| matches!(
            e,
            ServerEvent::CardsFlippedBack { card_ids } if card_ids == &vec![0]
        )));
    }

    #[tokio::test]
    async fn freeze_pauses_the_clock_and_resume_restores_it() {
        let mut h = harness_with(
            RoomSettings {
                mode: GameMode::Blitz,
                ..RoomSettings::default()
            },
            test_config(),
        );
        let (alice, mut rx_a) = h.join("alice").await;
        let (_bob, _rx_b) = h.join("bob").await;
        assert!(h.engine.clock_deadline.is_some());
        h.engine
            .state
            .players
            .get_mut(&alice.id)
            .unwrap()
            .power_ups
            .push(HeldPowerUp {
                kind: PowerUpKind::Freeze,
                uses: 2,
            });
        drain(&mut rx_a);

        h.act(
            &alice,
            ClientAction::UsePowerUp {
                kind: PowerUpKind::Freeze,
                targets: vec![],
            },
        )
        .await;

        assert!(h.engine.clock_deadline.is_none());
        assert!(h.engine.frozen_remaining.is_some());
        let events = drain(&mut rx_a);
        assert!(has_event(&events, |e| matches!(
            e,
            ServerEvent::PowerupFreeze { player_id, .. } if *player_id == alice.id
        )));

        // Freezing an already-frozen clock is rejected before consumption.
        h.act(
            &alice,
            ClientAction::UsePowerUp {
                kind: PowerUpKind::Freeze,
                targets: vec![],
            },
        )
        .await;
        let events = drain(&mut rx_a);
        assert!(has_event(&events, |e| matches!(
            e,
            ServerEvent::Error { code, .. } if code == "power_up_invalid_target"
        )));
        assert_eq!(h.engine.state.players[&alice.id].power_ups[0].uses, 1);

        let generation = h.engine.freeze_generation;
        h.engine
            .handle(RoomCommand::Timer(TimerEvent::FreezeEnded { generation }))
            .await;
        assert!(h.engine.clock_deadline.is_some());
        assert!(h.engine.frozen_remaining.is_none());
    }

    #[tokio::test]
    async fn turn_timeout_flips_back_the_lone_card_and_forfeits_extra_turns() {
        let (mut h, alice, _rx_a, bob, mut rx_b) = started_pair().await;
        h.engine
            .state
            .players
            .get_mut(&alice.id)
            .unwrap()
            .extra_turns = 2;

        h.act(&alice, ClientAction::Flip { card_id: 0 }).await;
        drain(&mut rx_b);

        let generation = h.engine.turn_generation;
        h.engine
            .handle(RoomCommand::Timer(TimerEvent::TurnTimeout { generation }))
            .await;

        assert!(!h.engine.state.board[0].flipped);
        assert_eq!(h.engine.state.turn, Some(bob.id));
        assert_eq!(h.engine.state.players[&alice.id].extra_turns, 0);
        let events = drain(&mut rx_b);
        assert!(has_event(&events, |e| matches!(
            e,
            ServerEvent::CardsFlippedBack { card_ids } if card_ids == &vec![0]
        )));
        assert!(has_event(&events, |e| matches!(
            e,
            ServerEvent::TurnChanged { player_id, reason: TurnChangeReason::Timeout }
                if *player_id == bob.id
        )));
    }

    #[tokio::test]
    async fn revealed_card_is_flip_locked_until_the_reveal_expires() {
        let (mut h, alice, mut rx_a, _bob, _rx_b) = started_pair().await;
        h.engine
            .state
            .players
            .get_mut(&alice.id)
            .unwrap()
            .power_ups
            .push(HeldPowerUp {
                kind: PowerUpKind::RevealOne,
                uses: 1,
            });

        h.act(
            &alice,
            ClientAction::UsePowerUp {
                kind: PowerUpKind::RevealOne,
                targets: vec![2],
            },
        )
        .await;
        let events = drain(&mut rx_a);
        assert!(has_event(&events, |e| matches!(
            e,
            ServerEvent::PowerupReveal { card, .. } if card.id == 2
        )));

        // The revealed card cannot be flipped while it is on display.
        h.act(&alice, ClientAction::Flip { card_id: 2 }).await;
        assert!(!h.engine.state.board[2].flipped);
        let events = drain(&mut rx_a);
        assert!(has_event(&events, |e| matches!(
            e,
            ServerEvent::Error { code, .. } if code == "invalid_card_state"
        )));

        // Other cards stay playable, and the lock lifts once it expires.
        h.act(&alice, ClientAction::Flip { card_id: 0 }).await;
        assert!(h.engine.state.board[0].flipped);
        h.engine.reveal_locks.insert(2, Instant::now());
        h.act(&alice, ClientAction::Flip { card_id: 2 }).await;
        assert!(h.engine.state.board[2].flipped);
    }
}
