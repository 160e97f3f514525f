//! The game room: single-writer actor owning one game.
//!
//! Every action, clock tick, timeout, give-time, resignation and join is
//! delivered to the room as a message and processed one at a time, which
//! serializes all mutation of the game, its clock, and its hot-store
//! keys. Errors scoped to a submitter go back on their connection only;
//! accepted state transitions are published on the game's store channel
//! and fanned out by the session hub, so every subscriber observes them
//! in the same order.
//!
//! Lifecycle: `Active → Terminal → Archived`, one-way. The terminal →
//! archived edge is driven by the archiver's ack.

use crate::archive::{ActionRow, ArchiveDone, Archiver, GameFinished, GameSummary, RecordAction, RecordEvent};
use crate::clock::{GameClock, wall_now_ms};
use crate::notation::{Action, ActionKind, Color};
use crate::protocol::{
    ClientError, GameEvent, GameEventType, HistoryEntry, PlayerInfo, Players, ServerFrame,
    StateFrame, SyncState, TimeControl,
};
use crate::rules::{BanChess, Terminal, TerminalKind};
use crate::store::{BusEnvelope, GameRecord, SharedStore};
use actix::prelude::*;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Clock poll interval (the spec's ≥ 1 Hz timeout check).
const TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Give-time bounds in seconds.
const GIVE_TIME_DEFAULT: u64 = 15;
const GIVE_TIME_MIN: u64 = 1;
const GIVE_TIME_MAX: u64 = 300;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A serialized frame delivered to one connection.
#[derive(Message, Debug, Clone)]
#[rtype(result = "()")]
pub struct SessionText(pub String);

/// Attach a connection to this game for full-state resync.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Join {
    pub user_id: Uuid,
    pub reply: Recipient<SessionText>,
}

/// Submit one half-action.
#[derive(Message)]
#[rtype(result = "()")]
pub struct SubmitAction {
    pub user_id: Uuid,
    pub action: Action,
    pub received_at_ms: u64,
    pub reply: Recipient<SessionText>,
}

/// Credit time to the opponent.
#[derive(Message)]
#[rtype(result = "()")]
pub struct GiveTime {
    pub user_id: Uuid,
    pub seconds: Option<u64>,
    pub reply: Recipient<SessionText>,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Resign {
    pub user_id: Uuid,
    pub reply: Recipient<SessionText>,
}

/// Draw negotiation verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawVerb {
    Offer,
    Accept,
    Decline,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Draw {
    pub user_id: Uuid,
    pub verb: DrawVerb,
    pub reply: Recipient<SessionText>,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Shutdown;

/// Emitted to the session hub when the room has fully retired.
#[derive(Message, Debug, Clone, Copy)]
#[rtype(result = "()")]
pub struct RoomClosed {
    pub game_id: Uuid,
}

// ---------------------------------------------------------------------------
// Room state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Active,
    Terminal,
    Archived,
}

/// The single-writer actor for one game.
pub struct GameRoom {
    game_id: Uuid,
    white: PlayerInfo,
    black: PlayerInfo,
    is_solo: bool,
    game: BanChess,
    clock: Option<GameClock>,
    time_control: Option<TimeControl>,
    history: Vec<HistoryEntry>,
    events: Vec<GameEvent>,
    draw_offer: Option<Color>,
    phase: Phase,
    result: Option<(String, String)>,
    start_time_ms: u64,
    store: SharedStore,
    archiver: Addr<Archiver>,
    on_closed: Option<Recipient<RoomClosed>>,
    tick_handle: Option<SpawnHandle>,
}

impl GameRoom {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        game_id: Uuid,
        white: PlayerInfo,
        black: PlayerInfo,
        time_control: Option<TimeControl>,
        is_solo: bool,
        store: SharedStore,
        archiver: Addr<Archiver>,
        on_closed: Option<Recipient<RoomClosed>>,
    ) -> Self {
        Self {
            game_id,
            white,
            black,
            is_solo,
            game: BanChess::new(),
            clock: time_control.map(GameClock::new),
            time_control,
            history: Vec::new(),
            events: Vec::new(),
            draw_offer: None,
            phase: Phase::Active,
            result: None,
            start_time_ms: wall_now_ms(),
            store,
            archiver,
            on_closed,
            tick_handle: None,
        }
    }

    fn over(&self) -> bool {
        self.phase != Phase::Active
    }

    /// The seat a user occupies. In solo games the user holds both seats
    /// and acts as whichever color the FEN says acts next.
    fn seat_of(&self, user_id: Uuid) -> Option<Color> {
        if self.is_solo {
            if self.white.id == user_id {
                return Some(self.game.next_actor().0);
            }
            return None;
        }
        if self.white.id == user_id {
            Some(Color::White)
        } else if self.black.id == user_id {
            Some(Color::Black)
        } else {
            None
        }
    }

    fn player(&self, color: Color) -> &PlayerInfo {
        match color {
            Color::White => &self.white,
            Color::Black => &self.black,
        }
    }

    fn players(&self) -> Players {
        Players {
            white: Some(self.white.clone()),
            black: Some(self.black.clone()),
        }
    }

    fn reply_error(&self, reply: &Recipient<SessionText>, error: ClientError) {
        reply.do_send(SessionText(error.to_frame().to_json()));
    }

    fn publish(&self, frame: &ServerFrame) {
        if let Err(e) = self
            .store
            .publish_game(self.game_id, BusEnvelope::broadcast(frame.to_json()))
        {
            log::error!("game {}: publish failed: {}", self.game_id, e);
        }
    }

    fn record_event(&mut self, kind: GameEventType, message: String, player: Option<Color>) {
        let event = GameEvent {
            timestamp_ms: wall_now_ms(),
            kind,
            message,
            player,
            metadata: None,
        };
        self.events.push(event.clone());
        if let Err(e) = self.store.append_event(self.game_id, event.clone()) {
            log::error!("game {}: event append failed: {}", self.game_id, e);
        }
        self.archiver.do_send(RecordEvent {
            game_id: self.game_id,
            event: event.clone(),
            is_solo: self.is_solo,
        });
        self.publish(&ServerFrame::GameEvent {
            game_id: self.game_id,
            event,
        });
    }

    fn clocks_snapshot(&self) -> Option<crate::protocol::ClocksSnapshot> {
        self.clock.as_ref().map(|c| c.snapshot(Instant::now()))
    }

    fn publish_clock_update(&self) {
        if let Some(clocks) = self.clocks_snapshot() {
            self.publish(&ServerFrame::ClockUpdate {
                game_id: self.game_id,
                clocks,
            });
        }
    }

    /// Builds the state frame. Full states (join/rejoin) carry the whole
    /// history and event log; increments carry the last action only.
    fn state_frame(&self, full: bool) -> StateFrame {
        let (next_kind, legal_actions) = self.game.legal_actions();
        let last = self.game.last_action().map(Action::to_bcn);
        StateFrame {
            game_id: self.game_id,
            fen: self.game.fen(),
            players: self.players(),
            next_action: next_kind,
            legal_actions,
            in_check: self.game.in_check(),
            history: full.then(|| self.history.clone()),
            last_move: if full { None } else { last.clone() },
            action_history: self.game.action_history(),
            sync_state: SyncState {
                fen: self.game.fen(),
                last_action: last,
                move_number: self.game.move_count(),
            },
            time_control: self.time_control,
            clocks: self.clocks_snapshot(),
            start_time: Some(self.start_time_ms),
            game_over: self.over().then_some(true),
            result: self.result.as_ref().map(|(r, _)| r.clone()),
            events: full.then(|| self.events.clone()),
        }
    }

    // -----------------------------------------------------------------------
    // Action handling
    // -----------------------------------------------------------------------

    fn handle_submit(&mut self, msg: SubmitAction) {
        if self.over() {
            return self.reply_error(&msg.reply, ClientError::GameOver);
        }

        let Some(seat) = self.seat_of(msg.user_id) else {
            return self.reply_error(&msg.reply, ClientError::NotAPlayer);
        };
        let (expected_actor, _) = self.game.next_actor();
        if seat != expected_actor {
            return self.reply_error(
                &msg.reply,
                ClientError::IllegalAction("not your turn".into()),
            );
        }

        // Apply on a scratch copy: the live state only advances once the
        // rules and the store write both succeed. A panic inside rule
        // application is trapped and treated as illegal.
        let turn_number = self.game.fullmove_number();
        let mut next = self.game.clone();
        let action = msg.action.clone();
        let outcome = match catch_unwind(AssertUnwindSafe(|| next.apply(&action))) {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                return self.reply_error(&msg.reply, ClientError::IllegalAction(e.to_string()));
            }
            Err(_) => {
                log::error!(
                    "game {}: panic while applying {}",
                    self.game_id,
                    action.to_bcn()
                );
                return self.reply_error(
                    &msg.reply,
                    ClientError::IllegalAction("rule application failed".into()),
                );
            }
        };

        let now_ms = wall_now_ms();
        let bcn = action.to_bcn();
        let result_tag = "*";
        let pgn = next.pgn(&self.white.username, &self.black.username, result_tag);
        if self
            .store
            .write_action(
                self.game_id,
                &outcome.fen_after,
                &pgn,
                next.move_count(),
                now_ms,
                &bcn,
            )
            .is_err()
        {
            return self.reply_error(&msg.reply, ClientError::StoreUnavailable);
        }

        // Commit.
        self.game = next;
        let entry = HistoryEntry {
            turn_number,
            player: seat,
            kind: action.kind(),
            action: bcn.clone(),
            san: outcome.san.clone(),
            fen_after: outcome.fen_after.clone(),
            timestamp: now_ms,
        };
        self.history.push(entry);

        self.archiver.do_send(RecordAction {
            row: ActionRow {
                game_id: self.game_id,
                move_number: turn_number,
                color: seat,
                notation: bcn.clone(),
                san: outcome.san.clone(),
                fen_after: outcome.fen_after.clone(),
                is_ban: action.kind() == ActionKind::Ban,
                timestamp_ms: now_ms,
            },
            is_solo: self.is_solo,
        });

        let (event_kind, message) = match action.kind() {
            ActionKind::Move => (
                GameEventType::MoveMade,
                format!("{} played {}", seat, outcome.san.as_deref().unwrap_or(&bcn)),
            ),
            ActionKind::Ban => (
                GameEventType::BanMade,
                format!("{} banned {}", seat, action.uci()),
            ),
        };
        self.record_event(event_kind, message, Some(seat));

        if action.kind() == ActionKind::Move {
            self.draw_offer = None;
        }

        if let Some(terminal) = outcome.terminal {
            self.finish_rules_terminal(terminal);
            return;
        }

        // Hand the clock to the side to move; only a completed move
        // credits the increment.
        if let Some(clock) = self.clock.as_mut() {
            clock.switch(
                self.game.turn(),
                action.kind() == ActionKind::Move,
                Instant::now(),
            );
        }

        self.publish(&ServerFrame::State(self.state_frame(false)));
        self.publish_clock_update();
    }

    fn handle_give_time(&mut self, msg: GiveTime) {
        if self.over() {
            return self.reply_error(&msg.reply, ClientError::GameOver);
        }
        if self.is_solo {
            return self.reply_error(
                &msg.reply,
                ClientError::IllegalAction("cannot give time in a solo game".into()),
            );
        }
        let Some(seat) = self.seat_of(msg.user_id) else {
            return self.reply_error(&msg.reply, ClientError::NotAPlayer);
        };
        if self.time_control.is_none() {
            return self.reply_error(
                &msg.reply,
                ClientError::IllegalAction("game has no time control".into()),
            );
        }
        let seconds = msg.seconds.unwrap_or(GIVE_TIME_DEFAULT);
        if !(GIVE_TIME_MIN..=GIVE_TIME_MAX).contains(&seconds) {
            return self.reply_error(
                &msg.reply,
                ClientError::IllegalAction(format!(
                    "give-time amount must be between {} and {} seconds",
                    GIVE_TIME_MIN, GIVE_TIME_MAX
                )),
            );
        }

        // The recipient is always the opponent; a player can never credit
        // their own clock.
        let recipient = seat.opponent();
        if let Some(clock) = self.clock.as_mut() {
            clock.give_time(recipient, seconds);
        }
        self.record_event(
            GameEventType::TimeGiven,
            format!("{} gave {} {} seconds", seat, recipient, seconds),
            Some(seat),
        );
        self.publish_clock_update();
    }

    fn handle_resign(&mut self, msg: Resign) {
        if self.over() {
            return self.reply_error(&msg.reply, ClientError::GameOver);
        }
        let Some(seat) = self.seat_of(msg.user_id) else {
            return self.reply_error(&msg.reply, ClientError::NotAPlayer);
        };
        let winner = seat.opponent();
        self.record_event(
            GameEventType::Resignation,
            format!("{} resigned", seat),
            Some(seat),
        );
        self.finish(
            format!("{} wins by resignation", cap(winner)),
            "resignation".to_string(),
        );
    }

    fn handle_draw(&mut self, msg: Draw) {
        if self.over() {
            return self.reply_error(&msg.reply, ClientError::GameOver);
        }
        let Some(seat) = self.seat_of(msg.user_id) else {
            return self.reply_error(&msg.reply, ClientError::NotAPlayer);
        };
        match msg.verb {
            DrawVerb::Offer => {
                self.draw_offer = Some(seat);
                self.record_event(
                    GameEventType::Draw,
                    format!("{} offers a draw", seat),
                    Some(seat),
                );
            }
            DrawVerb::Accept => {
                if self.draw_offer != Some(seat.opponent()) {
                    return self.reply_error(
                        &msg.reply,
                        ClientError::IllegalAction("no draw offer to accept".into()),
                    );
                }
                self.record_event(
                    GameEventType::Draw,
                    format!("{} accepted the draw", seat),
                    Some(seat),
                );
                self.finish("Draw by agreement".to_string(), "draw agreement".to_string());
            }
            DrawVerb::Decline => {
                if self.draw_offer != Some(seat.opponent()) {
                    return self.reply_error(
                        &msg.reply,
                        ClientError::IllegalAction("no draw offer to decline".into()),
                    );
                }
                self.draw_offer = None;
                self.record_event(
                    GameEventType::Draw,
                    format!("{} declined the draw", seat),
                    Some(seat),
                );
            }
        }
    }

    fn handle_join(&mut self, msg: Join) {
        if self.seat_of(msg.user_id).is_none() {
            return self.reply_error(&msg.reply, ClientError::NotAPlayer);
        }
        let color = if self.is_solo || self.white.id == msg.user_id {
            Color::White
        } else {
            Color::Black
        };
        msg.reply.do_send(SessionText(
            ServerFrame::Joined {
                game_id: self.game_id,
                color,
                players: self.players(),
                time_control: self.time_control,
            }
            .to_json(),
        ));
        msg.reply
            .do_send(SessionText(ServerFrame::State(self.state_frame(true)).to_json()));
        self.record_event(
            GameEventType::PlayerJoined,
            format!("{} joined", self.player(color).username),
            Some(color),
        );
    }

    // -----------------------------------------------------------------------
    // Terminal transitions
    // -----------------------------------------------------------------------

    fn finish_rules_terminal(&mut self, terminal: Terminal) {
        let kind = match terminal.kind {
            TerminalKind::Checkmate => GameEventType::Checkmate,
            TerminalKind::Stalemate => GameEventType::Stalemate,
            _ => GameEventType::Draw,
        };
        let result = terminal.result_string();
        self.record_event(kind, result.clone(), terminal.loser);
        self.finish(result, terminal.kind.reason().to_string());
    }

    fn handle_timeout(&mut self, loser: Color) {
        if self.over() {
            return;
        }
        let winner = loser.opponent();
        self.record_event(
            GameEventType::Timeout,
            format!("{} ran out of time", loser),
            Some(loser),
        );
        self.publish(&ServerFrame::Timeout {
            game_id: self.game_id,
            winner,
        });
        self.finish(format!("{} wins on time", cap(winner)), "timeout".to_string());
    }

    /// One-way transition into `Terminal`: stop the clock, persist the
    /// result, publish, and hand the game to the archiver.
    fn finish(&mut self, result: String, reason: String) {
        if self.over() {
            return;
        }
        self.phase = Phase::Terminal;

        // Replay invariant check: the FEN must equal the replayed
        // history. A mismatch is fatal and the game is aborted.
        let (result, reason) = match BanChess::replay(&self.game.action_history()) {
            Ok(replayed) if replayed.fen() == self.game.fen() => (result, reason),
            _ => {
                log::error!(
                    "game {}: FEN diverged from replayed history, aborting",
                    self.game_id
                );
                ("aborted".to_string(), "invariant violation".to_string())
            }
        };
        self.result = Some((result.clone(), reason.clone()));

        if let Some(clock) = self.clock.as_mut() {
            clock.destroy();
        }
        if self.store.finish_game(self.game_id, &result).is_err() {
            log::error!("game {}: failed to persist result", self.game_id);
        }
        for user in [self.white.id, self.black.id] {
            let _ = self.store.clear_user_game(user);
        }

        self.publish(&ServerFrame::GameEnded {
            game_id: self.game_id,
            result: result.clone(),
            reason: reason.clone(),
        });
        self.publish(&ServerFrame::State(self.state_frame(false)));

        log::info!("game {} ended: {} ({})", self.game_id, result, reason);
    }

    fn summary(&self) -> GameSummary {
        let (result, reason) = self
            .result
            .clone()
            .unwrap_or_else(|| ("aborted".to_string(), "shutdown".to_string()));
        GameSummary {
            game_id: self.game_id,
            white_id: Some(self.white.id),
            black_id: Some(self.black.id),
            white_name: self.white.username.clone(),
            black_name: self.black.username.clone(),
            is_solo: self.is_solo,
            result,
            reason,
            started_at_ms: self.start_time_ms,
            completed_at_ms: wall_now_ms(),
            time_control: self.time_control,
            final_fen: self.game.fen(),
            actions: self
                .game
                .action_history()
                .iter()
                .filter_map(|bcn| Action::from_bcn(bcn).ok())
                .collect(),
            events: self.events.clone(),
        }
    }
}

fn cap(c: Color) -> &'static str {
    match c {
        Color::White => "White",
        Color::Black => "Black",
    }
}

// ---------------------------------------------------------------------------
// Actor impl
// ---------------------------------------------------------------------------

impl Actor for GameRoom {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        log::info!(
            "game {} started: {} vs {}{}",
            self.game_id,
            self.white.username,
            self.black.username,
            if self.is_solo { " (solo)" } else { "" }
        );

        let record = GameRecord {
            game_id: self.game_id,
            fen: self.game.fen(),
            pgn: String::new(),
            white_id: Some(self.white.id),
            black_id: Some(self.black.id),
            white_name: self.white.username.clone(),
            black_name: self.black.username.clone(),
            start_time_ms: self.start_time_ms,
            last_move_time_ms: self.start_time_ms,
            game_over: false,
            result: None,
            move_count: 0,
            time_control: self.time_control,
            is_solo: self.is_solo,
        };
        if self.store.put_game(record).is_err() {
            log::error!("game {}: failed to write initial state", self.game_id);
        }
        for user in [self.white.id, self.black.id] {
            let _ = self.store.pin_user_game(user, self.game_id);
        }

        self.record_event(
            GameEventType::GameStarted,
            format!("{} vs {}", self.white.username, self.black.username),
            None,
        );

        // The clock runs on the side to move from the first half-action
        // (Black's opening ban happens on White's clock).
        if let Some(clock) = self.clock.as_mut() {
            clock.start(Color::White, Instant::now());
        }

        let handle = ctx.run_interval(TICK_INTERVAL, |room, ctx| {
            if room.over() {
                return;
            }
            let flagged = room
                .clock
                .as_mut()
                .and_then(|c| c.check_timeout(Instant::now()));
            if let Some(loser) = flagged {
                room.handle_timeout(loser);
                room.archive_if_just_finished(true, ctx);
            }
        });
        self.tick_handle = Some(handle);
    }
}

impl Handler<Join> for GameRoom {
    type Result = ();
    fn handle(&mut self, msg: Join, _ctx: &mut Context<Self>) {
        self.handle_join(msg);
    }
}

impl GameRoom {
    /// Hands the finished game to the archiver exactly once, on the
    /// Active → Terminal edge.
    fn archive_if_just_finished(&mut self, was_active: bool, ctx: &mut Context<Self>) {
        if was_active && self.phase == Phase::Terminal {
            self.archiver.do_send(GameFinished {
                summary: self.summary(),
                ack: Some(ctx.address().recipient()),
            });
        }
    }
}

impl Handler<SubmitAction> for GameRoom {
    type Result = ();
    fn handle(&mut self, msg: SubmitAction, ctx: &mut Context<Self>) {
        let was_active = self.phase == Phase::Active;
        self.handle_submit(msg);
        self.archive_if_just_finished(was_active, ctx);
    }
}

impl Handler<GiveTime> for GameRoom {
    type Result = ();
    fn handle(&mut self, msg: GiveTime, _ctx: &mut Context<Self>) {
        self.handle_give_time(msg);
    }
}

impl Handler<Resign> for GameRoom {
    type Result = ();
    fn handle(&mut self, msg: Resign, ctx: &mut Context<Self>) {
        let was_active = self.phase == Phase::Active;
        self.handle_resign(msg);
        self.archive_if_just_finished(was_active, ctx);
    }
}

impl Handler<Draw> for GameRoom {
    type Result = ();
    fn handle(&mut self, msg: Draw, ctx: &mut Context<Self>) {
        let was_active = self.phase == Phase::Active;
        self.handle_draw(msg);
        self.archive_if_just_finished(was_active, ctx);
    }
}

impl Handler<ArchiveDone> for GameRoom {
    type Result = ();
    fn handle(&mut self, msg: ArchiveDone, ctx: &mut Context<Self>) {
        debug_assert_eq!(msg.game_id, self.game_id);
        if self.phase == Phase::Terminal {
            self.phase = Phase::Archived;
            // The tick is no longer needed; with it cancelled the actor
            // retires once the hub drops its address.
            if let Some(handle) = self.tick_handle.take() {
                ctx.cancel_future(handle);
            }
            if let Some(on_closed) = &self.on_closed {
                on_closed.do_send(RoomClosed {
                    game_id: self.game_id,
                });
            }
        }
    }
}

impl Handler<Shutdown> for GameRoom {
    type Result = ();
    fn handle(&mut self, _msg: Shutdown, ctx: &mut Context<Self>) {
        if !self.over() {
            self.finish("aborted".to_string(), "server shutdown".to_string());
            self.archiver.do_send(GameFinished {
                summary: self.summary(),
                ack: None,
            });
        }
        ctx.stop();
    }
}

/// Direct timeout injection. The room's own tick is the normal source;
/// this message is the contract surface for an external clock driver.
#[derive(Message)]
#[rtype(result = "()")]
pub struct ClockTimeout {
    pub loser: Color,
}

impl Handler<ClockTimeout> for GameRoom {
    type Result = ();
    fn handle(&mut self, msg: ClockTimeout, ctx: &mut Context<Self>) {
        let was_active = self.phase == Phase::Active;
        self.handle_timeout(msg.loser);
        self.archive_if_just_finished(was_active, ctx);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveStorage;
    use crate::store::HotStore;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Collects frames a room sends to "this connection".
    struct Collector {
        frames: Arc<Mutex<Vec<String>>>,
    }

    impl Actor for Collector {
        type Context = Context<Self>;
    }

    impl Handler<SessionText> for Collector {
        type Result = ();
        fn handle(&mut self, msg: SessionText, _ctx: &mut Context<Self>) {
            self.frames.lock().unwrap().push(msg.0);
        }
    }

    struct Fixture {
        room: Addr<GameRoom>,
        store: crate::store::SharedStore,
        game_id: Uuid,
        white: PlayerInfo,
        black: PlayerInfo,
        reply: Recipient<SessionText>,
        frames: Arc<Mutex<Vec<String>>>,
        data_dir: std::path::PathBuf,
    }

    impl Fixture {
        fn new(time_control: Option<TimeControl>, is_solo: bool) -> Self {
            let dir = std::env::temp_dir().join(format!("banchess_room_{}", Uuid::new_v4()));
            let storage = ArchiveStorage::new(&dir).unwrap();
            let archiver = Archiver::new(storage).start();
            let store = HotStore::new();
            let game_id = Uuid::new_v4();

            let white = PlayerInfo {
                id: Uuid::new_v4(),
                username: "alice".into(),
            };
            let black = if is_solo {
                white.clone()
            } else {
                PlayerInfo {
                    id: Uuid::new_v4(),
                    username: "bob".into(),
                }
            };

            let room = GameRoom::new(
                game_id,
                white.clone(),
                black.clone(),
                time_control,
                is_solo,
                store.clone(),
                archiver,
                None,
            )
            .start();

            let frames = Arc::new(Mutex::new(Vec::new()));
            let collector = Collector {
                frames: frames.clone(),
            }
            .start();

            Self {
                room,
                store,
                game_id,
                white,
                black,
                reply: collector.recipient(),
                frames,
                data_dir: dir,
            }
        }

        async fn submit(&self, user: Uuid, action: Action) {
            self.room
                .send(SubmitAction {
                    user_id: user,
                    action,
                    received_at_ms: wall_now_ms(),
                    reply: self.reply.clone(),
                })
                .await
                .unwrap();
        }

        async fn settle(&self) {
            // Let collector/archiver mailboxes drain.
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        fn error_frames(&self) -> Vec<serde_json::Value> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .map(|f| serde_json::from_str(f).unwrap())
                .filter(|v: &serde_json::Value| v["type"] == "error")
                .collect()
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.data_dir);
        }
    }

    fn ban(from: &str, to: &str) -> Action {
        Action::new_ban(from, to).unwrap()
    }

    fn mv(from: &str, to: &str) -> Action {
        Action::new_move(from, to, None).unwrap()
    }

    #[actix_rt::test]
    async fn test_turn_enforcement() {
        let fx = Fixture::new(None, false);
        // White tries to act during Black's opening ban.
        fx.submit(fx.white.id, ban("e2", "e4")).await;
        // A stranger tries to act.
        fx.submit(Uuid::new_v4(), ban("e2", "e4")).await;
        fx.settle().await;

        let errors = fx.error_frames();
        assert_eq!(errors.len(), 2);
        assert!(errors[0]["message"].as_str().unwrap().contains("not your turn"));
        assert!(errors[1]["message"].as_str().unwrap().contains("not a player"));

        // The store saw no action.
        assert!(fx.store.history(fx.game_id).unwrap().is_empty());
    }

    #[actix_rt::test]
    async fn test_action_flow_updates_store() {
        let fx = Fixture::new(None, false);
        let mut rx = fx.store.subscribe_game(fx.game_id).unwrap();

        fx.submit(fx.black.id, ban("e2", "e4")).await;
        fx.submit(fx.white.id, mv("d2", "d4")).await;
        fx.settle().await;

        assert!(fx.error_frames().is_empty());
        let history = fx.store.history(fx.game_id).unwrap();
        assert_eq!(history, vec!["b:e2e4".to_string(), "m:d2d4".to_string()]);

        let record = fx.store.get_game(fx.game_id).unwrap().unwrap();
        assert_eq!(record.move_count, 1);
        assert!(record.fen.ends_with("w:ban"));

        // Subscribers observe the ban state before the move state.
        let mut fens = Vec::new();
        while let Ok(Ok(env)) =
            tokio::time::timeout(Duration::from_millis(100), rx.recv()).await
        {
            let value: serde_json::Value = serde_json::from_str(&env.frame).unwrap();
            if value["type"] == "state" {
                fens.push(value["fen"].as_str().unwrap().to_string());
            }
        }
        assert_eq!(fens.len(), 2);
        assert!(fens[0].contains("b:e2e4"));
        assert!(fens[1].ends_with("w:ban"));
    }

    #[actix_rt::test]
    async fn test_give_time_restrictions() {
        // Solo game: always rejected.
        let solo = Fixture::new(
            Some(TimeControl {
                initial_sec: 300,
                increment_sec: 0,
            }),
            true,
        );
        solo.room
            .send(GiveTime {
                user_id: solo.white.id,
                seconds: None,
                reply: solo.reply.clone(),
            })
            .await
            .unwrap();
        solo.settle().await;
        assert_eq!(solo.error_frames().len(), 1);

        // Two-player game.
        let fx = Fixture::new(
            Some(TimeControl {
                initial_sec: 300,
                increment_sec: 0,
            }),
            false,
        );
        let mut rx = fx.store.subscribe_game(fx.game_id).unwrap();

        // A non-player cannot give time.
        fx.room
            .send(GiveTime {
                user_id: Uuid::new_v4(),
                seconds: None,
                reply: fx.reply.clone(),
            })
            .await
            .unwrap();
        // Out-of-range amounts are rejected.
        fx.room
            .send(GiveTime {
                user_id: fx.white.id,
                seconds: Some(301),
                reply: fx.reply.clone(),
            })
            .await
            .unwrap();
        // Valid: White credits Black 15s (the default).
        fx.room
            .send(GiveTime {
                user_id: fx.white.id,
                seconds: None,
                reply: fx.reply.clone(),
            })
            .await
            .unwrap();
        fx.settle().await;

        assert_eq!(fx.error_frames().len(), 2);

        let mut saw_event = false;
        let mut saw_clock_update = false;
        while let Ok(Ok(env)) =
            tokio::time::timeout(Duration::from_millis(100), rx.recv()).await
        {
            let value: serde_json::Value = serde_json::from_str(&env.frame).unwrap();
            if value["type"] == "game-event" && value["event"]["type"] == "time-given" {
                saw_event = true;
            }
            if value["type"] == "clock-update" {
                saw_clock_update = true;
                assert_eq!(value["clocks"]["black"]["remaining"], 315_000);
            }
        }
        assert!(saw_event);
        assert!(saw_clock_update);
    }

    #[actix_rt::test]
    async fn test_resign_ends_and_archives() {
        let fx = Fixture::new(None, false);
        let mut rx = fx.store.subscribe_game(fx.game_id).unwrap();

        fx.submit(fx.black.id, ban("e2", "e4")).await;
        fx.room
            .send(Resign {
                user_id: fx.white.id,
                reply: fx.reply.clone(),
            })
            .await
            .unwrap();
        fx.settle().await;

        let record = fx.store.get_game(fx.game_id).unwrap().unwrap();
        assert!(record.game_over);
        assert_eq!(
            record.result.as_deref(),
            Some("Black wins by resignation")
        );

        // The seat pins are cleared.
        assert!(fx.store.find_user_game(fx.white.id).unwrap().is_none());

        let mut saw_ended = false;
        while let Ok(Ok(env)) =
            tokio::time::timeout(Duration::from_millis(100), rx.recv()).await
        {
            let value: serde_json::Value = serde_json::from_str(&env.frame).unwrap();
            if value["type"] == "game-ended" {
                saw_ended = true;
                assert_eq!(value["reason"], "resignation");
            }
        }
        assert!(saw_ended);

        // Rejected after terminal.
        fx.submit(fx.black.id, mv("d7", "d5")).await;
        fx.settle().await;
        assert!(
            fx.error_frames()
                .iter()
                .any(|e| e["message"].as_str().unwrap().contains("over"))
        );
    }

    #[actix_rt::test]
    async fn test_draw_negotiation() {
        let fx = Fixture::new(None, false);

        // Accept without an offer is rejected.
        fx.room
            .send(Draw {
                user_id: fx.white.id,
                verb: DrawVerb::Accept,
                reply: fx.reply.clone(),
            })
            .await
            .unwrap();

        fx.room
            .send(Draw {
                user_id: fx.white.id,
                verb: DrawVerb::Offer,
                reply: fx.reply.clone(),
            })
            .await
            .unwrap();
        fx.room
            .send(Draw {
                user_id: fx.black.id,
                verb: DrawVerb::Accept,
                reply: fx.reply.clone(),
            })
            .await
            .unwrap();
        fx.settle().await;

        assert_eq!(fx.error_frames().len(), 1);
        let record = fx.store.get_game(fx.game_id).unwrap().unwrap();
        assert_eq!(record.result.as_deref(), Some("Draw by agreement"));
    }

    #[actix_rt::test]
    async fn test_join_returns_full_state() {
        let fx = Fixture::new(None, false);
        fx.submit(fx.black.id, ban("e2", "e4")).await;
        fx.room
            .send(Join {
                user_id: fx.white.id,
                reply: fx.reply.clone(),
            })
            .await
            .unwrap();
        fx.settle().await;

        let frames = fx.frames.lock().unwrap();
        let values: Vec<serde_json::Value> = frames
            .iter()
            .map(|f| serde_json::from_str(f).unwrap())
            .collect();
        let joined = values.iter().find(|v| v["type"] == "joined").unwrap();
        assert_eq!(joined["color"], "white");

        let state = values.iter().find(|v| v["type"] == "state").unwrap();
        // Full states carry the history and the event log.
        assert!(state["history"].is_array());
        assert!(state["events"].is_array());
        assert_eq!(state["actionHistory"][0], "b:e2e4");
        assert_eq!(state["nextAction"], "move");
    }

    #[actix_rt::test]
    async fn test_solo_game_plays_both_seats() {
        let fx = Fixture::new(None, true);
        fx.submit(fx.white.id, ban("e2", "e4")).await;
        fx.submit(fx.white.id, mv("d2", "d4")).await;
        fx.submit(fx.white.id, ban("d7", "d5")).await;
        fx.settle().await;

        assert!(fx.error_frames().is_empty());
        assert_eq!(fx.store.history(fx.game_id).unwrap().len(), 3);
    }
}
