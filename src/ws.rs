//! WebSocket layer: authenticated sessions and the session hub.
//!
//! ## Architecture
//!
//! - **`SessionHub`** — a singleton actor owning the connection registry
//!   (one live connection per user, last-writer-wins takeover), the room
//!   registry, and the bridge from store channels to local connections.
//!   Frames published by rooms land on `channel:game:{id}`; the hub
//!   subscribes once per game with local participants and fans frames
//!   out to exactly those connections, unsubscribing when the last one
//!   drops.
//!
//! - **`WsSession`** — an actor per WebSocket connection. It parses
//!   inbound frames strictly, answers `ping` directly, and forwards
//!   everything else to the hub, which routes to the game room or the
//!   matchmaker. Heartbeat: protocol ping every 30 s, peer marked
//!   inactive after 10 s without a pong, terminated after 60 s of
//!   silence.
//!
//! ## Handshake
//!
//! The upgrade request must pass the Origin allow-list (else 403) and
//! carry valid credentials (else 401); see [`crate::auth`].

use crate::archive::Archiver;
use crate::auth::{self, Identity};
use crate::matchmaker::{CreateRoom, Dequeue, Enqueue, Matchmaker};
use crate::notation::Color;
use crate::protocol::{
    self, ClientError, ClientFrame, MAX_FRAME_BYTES, PlayerInfo, ServerFrame, TimeControl,
};
use crate::room::{
    Draw, DrawVerb, GameRoom, GiveTime, Join, Resign, RoomClosed, SessionText, Shutdown,
    SubmitAction,
};
use crate::store::{BusEnvelope, SessionStatus, SharedStore};
use actix::prelude::*;
use actix_web::{HttpRequest, HttpResponse, web};
use actix_web_actors::ws;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Heartbeat constants
// ---------------------------------------------------------------------------

/// Protocol-level ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Without a pong for this long after a ping the peer is marked inactive
/// (but kept connected).
const INACTIVE_AFTER: Duration = Duration::from_secs(10);

/// Without any response for this long the socket is terminated.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Heartbeat poll cadence.
const HEARTBEAT_POLL: Duration = Duration::from_secs(5);

/// Repeated malformed frames beyond this close the connection (1008).
const MAX_BAD_FRAMES: u32 = 10;

// ---------------------------------------------------------------------------
// Hub messages
// ---------------------------------------------------------------------------

/// Register a freshly authenticated connection.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Connect {
    pub conn_id: Uuid,
    pub identity: Identity,
    pub session: Recipient<SessionText>,
    pub control: Recipient<CloseSession>,
}

/// A connection went away.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Disconnect {
    pub conn_id: Uuid,
    pub user_id: Uuid,
}

/// A parsed client frame, routed through the hub.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Inbound {
    pub conn_id: Uuid,
    pub user_id: Uuid,
    pub frame: ClientFrame,
}

/// Close order sent to a session actor (takeover, shutdown, policy).
#[derive(Message, Debug, Clone)]
#[rtype(result = "()")]
pub struct CloseSession {
    pub code: ws::CloseCode,
    pub reason: String,
}

/// Wires the matchmaker in after construction (the matchmaker needs the
/// hub's address first).
#[derive(Message)]
#[rtype(result = "()")]
pub struct SetMatchmaker(pub Addr<Matchmaker>);

/// A message arriving from a store channel via a forwarder task.
#[derive(Message)]
#[rtype(result = "()")]
struct ChannelDelivery {
    scope: DeliveryScope,
    envelope: BusEnvelope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryScope {
    Game(Uuid),
    Queue,
}

/// Health snapshot.
#[derive(Message)]
#[rtype(result = "HubStats")]
pub struct GetStats;

#[derive(MessageResponse, Debug, Clone, Copy)]
pub struct HubStats {
    pub connections: usize,
    pub active_games: usize,
}

/// Server-wide graceful shutdown: close every socket and stop rooms.
#[derive(Message)]
#[rtype(result = "()")]
pub struct ShutdownAll;

// ---------------------------------------------------------------------------
// SessionHub
// ---------------------------------------------------------------------------

struct SessionHandle {
    conn_id: Uuid,
    username: String,
    session: Recipient<SessionText>,
    control: Recipient<CloseSession>,
}

struct GameSubscription {
    members: HashSet<Uuid>,
    forwarder: JoinHandle<()>,
}

/// Connection/room registry and store-channel fan-out.
pub struct SessionHub {
    store: SharedStore,
    archiver: Addr<Archiver>,
    matchmaker: Option<Addr<Matchmaker>>,
    sessions: HashMap<Uuid, SessionHandle>,
    rooms: HashMap<Uuid, Addr<GameRoom>>,
    subscriptions: HashMap<Uuid, GameSubscription>,
}

impl SessionHub {
    pub fn new(store: SharedStore, archiver: Addr<Archiver>) -> Self {
        Self {
            store,
            archiver,
            matchmaker: None,
            sessions: HashMap::new(),
            rooms: HashMap::new(),
            subscriptions: HashMap::new(),
        }
    }

    fn send_to_user(&self, user_id: Uuid, frame: String) {
        if let Some(handle) = self.sessions.get(&user_id) {
            handle.session.do_send(SessionText(frame));
        }
    }

    fn reply_error(&self, user_id: Uuid, error: ClientError) {
        self.send_to_user(user_id, error.to_frame().to_json());
    }

    /// Subscribes the hub to a game channel (once) and adds the user to
    /// its local member set.
    fn subscribe_user(&mut self, ctx: &mut Context<Self>, game_id: Uuid, user_id: Uuid) {
        if let Some(sub) = self.subscriptions.get_mut(&game_id) {
            sub.members.insert(user_id);
            return;
        }
        let rx = match self.store.subscribe_game(game_id) {
            Ok(rx) => rx,
            Err(e) => {
                log::error!("failed to subscribe to game {}: {}", game_id, e);
                return;
            }
        };
        let hub = ctx.address();
        let forwarder = tokio::spawn(async move {
            let mut rx = rx;
            while let Ok(envelope) = rx.recv().await {
                hub.do_send(ChannelDelivery {
                    scope: DeliveryScope::Game(game_id),
                    envelope,
                });
            }
        });
        let mut members = HashSet::new();
        members.insert(user_id);
        self.subscriptions
            .insert(game_id, GameSubscription { members, forwarder });
    }

    /// Drops a user from a game's local member set; unsubscribes from the
    /// channel when the last local connection is gone.
    fn unsubscribe_user(&mut self, game_id: Uuid, user_id: Uuid) {
        let empty = match self.subscriptions.get_mut(&game_id) {
            Some(sub) => {
                sub.members.remove(&user_id);
                sub.members.is_empty()
            }
            None => false,
        };
        if empty
            && let Some(sub) = self.subscriptions.remove(&game_id)
        {
            sub.forwarder.abort();
        }
    }

    fn touch_session(&self, user_id: Uuid, username: &str, status: SessionStatus) {
        let _ = self
            .store
            .touch_session(user_id, username, status, crate::clock::wall_now_ms());
    }

    /// Creates a room actor and attaches any locally connected players.
    fn create_room(&mut self, ctx: &mut Context<Self>, msg: CreateRoom) {
        let room = GameRoom::new(
            msg.game_id,
            msg.white.clone(),
            msg.black.clone(),
            msg.time_control,
            msg.is_solo,
            self.store.clone(),
            self.archiver.clone(),
            Some(ctx.address().recipient()),
        )
        .start();
        self.rooms.insert(msg.game_id, room.clone());

        let seats = if msg.is_solo {
            vec![(msg.white.clone(), Color::White)]
        } else {
            vec![
                (msg.white.clone(), Color::White),
                (msg.black.clone(), Color::Black),
            ]
        };
        for (player, color) in seats {
            let Some(handle) = self.sessions.get(&player.id) else {
                continue;
            };
            if !msg.is_solo {
                let opponent = if color == Color::White {
                    &msg.black.username
                } else {
                    &msg.white.username
                };
                handle.session.do_send(SessionText(
                    ServerFrame::Matched {
                        game_id: msg.game_id,
                        color,
                        opponent: opponent.clone(),
                        time_control: msg
                            .time_control
                            .unwrap_or_else(TimeControl::default_pool),
                    }
                    .to_json(),
                ));
            }
            let session = handle.session.clone();
            self.subscribe_user(ctx, msg.game_id, player.id);
            self.touch_session(player.id, &player.username, SessionStatus::InGame);
            room.do_send(Join {
                user_id: player.id,
                reply: session,
            });
        }
    }

    /// Reattaches a reconnecting user to their live game and restores a
    /// pending queue ticket.
    fn restore_state(&mut self, ctx: &mut Context<Self>, user_id: Uuid) {
        if let Ok(Some(game_id)) = self.store.find_user_game(user_id)
            && let Some(room) = self.rooms.get(&game_id).cloned()
            && let Some(handle) = self.sessions.get(&user_id)
        {
            log::info!("restoring user {} into game {}", user_id, game_id);
            let session = handle.session.clone();
            self.subscribe_user(ctx, game_id, user_id);
            room.do_send(Join {
                user_id,
                reply: session,
            });
        }
        if let Ok(Some(position)) = self.store.queue_position(user_id) {
            self.send_to_user(user_id, ServerFrame::Queued { position }.to_json());
        }
    }

    fn route_draw(&mut self, user_id: Uuid, game_id: Uuid, verb: DrawVerb) {
        let Some(room) = self.rooms.get(&game_id) else {
            return self.reply_error(user_id, ClientError::GameNotFound);
        };
        let Some(handle) = self.sessions.get(&user_id) else {
            return;
        };
        room.do_send(Draw {
            user_id,
            verb,
            reply: handle.session.clone(),
        });
    }

    fn route(&mut self, ctx: &mut Context<Self>, msg: Inbound) {
        let user_id = msg.user_id;
        let username = self
            .sessions
            .get(&user_id)
            .map(|h| h.username.clone())
            .unwrap_or_default();

        match msg.frame {
            ClientFrame::Authenticate { .. } => {
                // Legacy path; identity already came from the handshake.
                self.send_to_user(
                    user_id,
                    ServerFrame::Authenticated { user_id, username }.to_json(),
                );
            }
            ClientFrame::JoinGame { game_id } => {
                let Some(room) = self.rooms.get(&game_id).cloned() else {
                    return self.reply_error(user_id, ClientError::GameNotFound);
                };
                let Some(handle) = self.sessions.get(&user_id) else {
                    return;
                };
                let session = handle.session.clone();
                self.subscribe_user(ctx, game_id, user_id);
                self.touch_session(user_id, &username, SessionStatus::InGame);
                room.do_send(Join {
                    user_id,
                    reply: session,
                });
            }
            ClientFrame::Action { game_id, action } => {
                let Some(room) = self.rooms.get(&game_id) else {
                    return self.reply_error(user_id, ClientError::GameNotFound);
                };
                let Some(handle) = self.sessions.get(&user_id) else {
                    return;
                };
                let action = match action.into_action() {
                    Ok(action) => action,
                    Err(e) => return self.reply_error(user_id, e),
                };
                room.do_send(SubmitAction {
                    user_id,
                    action,
                    received_at_ms: crate::clock::wall_now_ms(),
                    reply: handle.session.clone(),
                });
            }
            ClientFrame::GiveTime { game_id, amount } => {
                let Some(room) = self.rooms.get(&game_id) else {
                    return self.reply_error(user_id, ClientError::GameNotFound);
                };
                let Some(handle) = self.sessions.get(&user_id) else {
                    return;
                };
                room.do_send(GiveTime {
                    user_id,
                    seconds: amount,
                    reply: handle.session.clone(),
                });
            }
            ClientFrame::Resign { game_id } => {
                let Some(room) = self.rooms.get(&game_id) else {
                    return self.reply_error(user_id, ClientError::GameNotFound);
                };
                let Some(handle) = self.sessions.get(&user_id) else {
                    return;
                };
                room.do_send(Resign {
                    user_id,
                    reply: handle.session.clone(),
                });
            }
            ClientFrame::OfferDraw { game_id } => {
                self.route_draw(user_id, game_id, DrawVerb::Offer)
            }
            ClientFrame::AcceptDraw { game_id } => {
                self.route_draw(user_id, game_id, DrawVerb::Accept)
            }
            ClientFrame::DeclineDraw { game_id } => {
                self.route_draw(user_id, game_id, DrawVerb::Decline)
            }
            ClientFrame::JoinQueue { time_control } => {
                let Some(matchmaker) = &self.matchmaker else {
                    return self.reply_error(user_id, ClientError::StoreUnavailable);
                };
                let Some(handle) = self.sessions.get(&user_id) else {
                    return;
                };
                self.touch_session(user_id, &username, SessionStatus::Queued);
                matchmaker.do_send(Enqueue {
                    user_id,
                    username,
                    time_control,
                    reply: handle.session.clone(),
                });
            }
            ClientFrame::LeaveQueue => {
                if let Some(matchmaker) = &self.matchmaker {
                    matchmaker.do_send(Dequeue { user_id });
                }
                self.touch_session(user_id, &username, SessionStatus::Online);
            }
            ClientFrame::CreateSoloGame { time_control } => {
                let game_id = Uuid::new_v4();
                let player = PlayerInfo {
                    id: user_id,
                    username: username.clone(),
                };
                self.send_to_user(
                    user_id,
                    ServerFrame::GameCreated {
                        game_id,
                        time_control,
                    }
                    .to_json(),
                );
                self.create_room(
                    ctx,
                    CreateRoom {
                        game_id,
                        white: player.clone(),
                        black: player,
                        time_control,
                        is_solo: true,
                    },
                );
            }
            ClientFrame::Ping => {
                // Answered in the session actor.
            }
        }
    }
}

impl Actor for SessionHub {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        // Queue channel: one subscription for the hub's lifetime; direct
        // envelopes reach only their target user.
        if let Ok(rx) = self.store.subscribe_queue() {
            let hub = ctx.address();
            tokio::spawn(async move {
                let mut rx = rx;
                while let Ok(envelope) = rx.recv().await {
                    hub.do_send(ChannelDelivery {
                        scope: DeliveryScope::Queue,
                        envelope,
                    });
                }
            });
        }
    }
}

impl Handler<SetMatchmaker> for SessionHub {
    type Result = ();
    fn handle(&mut self, msg: SetMatchmaker, _ctx: &mut Context<Self>) {
        self.matchmaker = Some(msg.0);
    }
}

impl Handler<Connect> for SessionHub {
    type Result = ();

    fn handle(&mut self, msg: Connect, ctx: &mut Context<Self>) {
        let user_id = msg.identity.user_id;

        // Last-writer-wins: evict any existing connection for this user
        // before registering the new one.
        if let Some(old) = self.sessions.remove(&user_id) {
            log::info!(
                "session takeover for {} (conn {} replaces {})",
                msg.identity.username,
                msg.conn_id,
                old.conn_id
            );
            old.control.do_send(CloseSession {
                code: ws::CloseCode::Normal,
                reason: "session takeover".to_string(),
            });
        }

        msg.session.do_send(SessionText(
            ServerFrame::Authenticated {
                user_id,
                username: msg.identity.username.clone(),
            }
            .to_json(),
        ));

        self.sessions.insert(
            user_id,
            SessionHandle {
                conn_id: msg.conn_id,
                username: msg.identity.username.clone(),
                session: msg.session,
                control: msg.control,
            },
        );
        let _ = self.store.set_online(user_id);
        self.touch_session(user_id, &msg.identity.username, SessionStatus::Online);

        self.restore_state(ctx, user_id);
    }
}

impl Handler<Disconnect> for SessionHub {
    type Result = ();

    fn handle(&mut self, msg: Disconnect, _ctx: &mut Context<Self>) {
        // A takeover may already have replaced this user's handle; only
        // the current connection deregisters.
        let current = self
            .sessions
            .get(&msg.user_id)
            .is_some_and(|h| h.conn_id == msg.conn_id);
        if !current {
            return;
        }
        self.sessions.remove(&msg.user_id);
        let _ = self.store.set_offline(msg.user_id);
        if let Some(matchmaker) = &self.matchmaker {
            matchmaker.do_send(Dequeue {
                user_id: msg.user_id,
            });
        }
        let games: Vec<Uuid> = self
            .subscriptions
            .iter()
            .filter(|(_, sub)| sub.members.contains(&msg.user_id))
            .map(|(id, _)| *id)
            .collect();
        for game_id in games {
            self.unsubscribe_user(game_id, msg.user_id);
        }
    }
}

impl Handler<Inbound> for SessionHub {
    type Result = ();
    fn handle(&mut self, msg: Inbound, ctx: &mut Context<Self>) {
        self.route(ctx, msg);
    }
}

impl Handler<CreateRoom> for SessionHub {
    type Result = ();
    fn handle(&mut self, msg: CreateRoom, ctx: &mut Context<Self>) {
        self.create_room(ctx, msg);
    }
}

impl Handler<RoomClosed> for SessionHub {
    type Result = ();
    fn handle(&mut self, msg: RoomClosed, _ctx: &mut Context<Self>) {
        self.rooms.remove(&msg.game_id);
        if let Some(sub) = self.subscriptions.remove(&msg.game_id) {
            sub.forwarder.abort();
        }
    }
}

impl Handler<ChannelDelivery> for SessionHub {
    type Result = ();

    fn handle(&mut self, msg: ChannelDelivery, _ctx: &mut Context<Self>) {
        match (msg.scope, msg.envelope.target) {
            (DeliveryScope::Game(game_id), target) => {
                let Some(sub) = self.subscriptions.get(&game_id) else {
                    return;
                };
                match target {
                    Some(user) => {
                        if sub.members.contains(&user) {
                            self.send_to_user(user, msg.envelope.frame);
                        }
                    }
                    None => {
                        for user in &sub.members {
                            self.send_to_user(*user, msg.envelope.frame.clone());
                        }
                    }
                }
            }
            (DeliveryScope::Queue, Some(user)) => {
                self.send_to_user(user, msg.envelope.frame);
            }
            (DeliveryScope::Queue, None) => {
                for handle in self.sessions.values() {
                    handle
                        .session
                        .do_send(SessionText(msg.envelope.frame.clone()));
                }
            }
        }
    }
}

impl Handler<GetStats> for SessionHub {
    type Result = HubStats;

    fn handle(&mut self, _msg: GetStats, _ctx: &mut Context<Self>) -> HubStats {
        HubStats {
            connections: self.sessions.len(),
            active_games: self.rooms.len(),
        }
    }
}

impl Handler<ShutdownAll> for SessionHub {
    type Result = ();

    fn handle(&mut self, _msg: ShutdownAll, _ctx: &mut Context<Self>) {
        log::info!(
            "shutting down: {} connection(s), {} room(s)",
            self.sessions.len(),
            self.rooms.len()
        );
        for handle in self.sessions.values() {
            handle.control.do_send(CloseSession {
                code: ws::CloseCode::Normal,
                reason: "server shutting down".to_string(),
            });
        }
        for room in self.rooms.values() {
            room.do_send(Shutdown);
        }
    }
}

// ---------------------------------------------------------------------------
// WsSession
// ---------------------------------------------------------------------------

/// One WebSocket connection with an authenticated identity.
pub struct WsSession {
    conn_id: Uuid,
    identity: Identity,
    hub: Addr<SessionHub>,
    last_seen: Instant,
    last_ping: Instant,
    inactive: bool,
    bad_frames: u32,
}

impl WsSession {
    pub fn new(identity: Identity, hub: Addr<SessionHub>) -> Self {
        Self {
            conn_id: Uuid::new_v4(),
            identity,
            hub,
            last_seen: Instant::now(),
            last_ping: Instant::now(),
            inactive: false,
            bad_frames: 0,
        }
    }

    fn heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_POLL, |session, ctx| {
            let silent_for = Instant::now().duration_since(session.last_seen);
            if silent_for > CLIENT_TIMEOUT {
                log::warn!(
                    "conn {} ({}): no response for {:?}, terminating",
                    session.conn_id,
                    session.identity.username,
                    silent_for
                );
                ctx.stop();
                return;
            }
            if silent_for > PING_INTERVAL + INACTIVE_AFTER && !session.inactive {
                session.inactive = true;
                log::debug!(
                    "conn {} ({}) marked inactive",
                    session.conn_id,
                    session.identity.username
                );
            }
            if Instant::now().duration_since(session.last_ping) >= PING_INTERVAL {
                session.last_ping = Instant::now();
                ctx.ping(b"");
            }
        });
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        if text.len() >= MAX_FRAME_BYTES {
            ctx.close(Some(ws::CloseReason {
                code: ws::CloseCode::Size,
                description: Some("frame too large".to_string()),
            }));
            ctx.stop();
            return;
        }
        let frame = match protocol::parse_client_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                self.bad_frames += 1;
                ctx.text(e.to_frame().to_json());
                if self.bad_frames >= MAX_BAD_FRAMES {
                    ctx.close(Some(ws::CloseReason {
                        code: ws::CloseCode::Policy,
                        description: Some("too many malformed frames".to_string()),
                    }));
                    ctx.stop();
                }
                return;
            }
        };

        // Application-level keepalive is answered in place; everything
        // else goes through the hub.
        if matches!(frame, ClientFrame::Ping) {
            self.last_seen = Instant::now();
            self.inactive = false;
            ctx.text(ServerFrame::Pong.to_json());
            return;
        }

        self.hub.do_send(Inbound {
            conn_id: self.conn_id,
            user_id: self.identity.user_id,
            frame,
        });
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        log::info!(
            "conn {} opened for {} ({})",
            self.conn_id,
            self.identity.username,
            self.identity.provider
        );
        // Outbound back-pressure: a flooded connection is closed rather
        // than buffered without bound.
        ctx.set_mailbox_capacity(64);
        self.heartbeat(ctx);
        self.hub.do_send(Connect {
            conn_id: self.conn_id,
            identity: self.identity.clone(),
            session: ctx.address().recipient(),
            control: ctx.address().recipient(),
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        log::info!(
            "conn {} closed for {}",
            self.conn_id,
            self.identity.username
        );
        self.hub.do_send(Disconnect {
            conn_id: self.conn_id,
            user_id: self.identity.user_id,
        });
    }
}

impl Handler<SessionText> for WsSession {
    type Result = ();
    fn handle(&mut self, msg: SessionText, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.text(msg.0);
    }
}

impl Handler<CloseSession> for WsSession {
    type Result = ();
    fn handle(&mut self, msg: CloseSession, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.close(Some(ws::CloseReason {
            code: msg.code,
            description: Some(msg.reason),
        }));
        ctx.stop();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_seen = Instant::now();
                self.inactive = false;
                self.handle_text(&text, ctx);
            }
            Ok(ws::Message::Binary(_)) => {
                ctx.text(
                    ClientError::BadFrame("binary frames are not supported".into())
                        .to_frame()
                        .to_json(),
                );
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_seen = Instant::now();
                self.inactive = false;
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_seen = Instant::now();
                self.inactive = false;
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                // Fragments beyond the configured frame size are refused
                // by the codec; nothing to assemble here.
            }
            Ok(ws::Message::Nop) => {}
            Err(ws::ProtocolError::Overflow) => {
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Size,
                    description: Some("frame too large".to_string()),
                }));
                ctx.stop();
            }
            Err(e) => {
                log::warn!("conn {} protocol error: {}", self.conn_id, e);
                ctx.stop();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP → WebSocket upgrade
// ---------------------------------------------------------------------------

/// Upgrade handler: origin check (403), credentials (401), then the
/// session actor starts with a bounded frame size.
pub async fn ws_connect(
    req: HttpRequest,
    stream: web::Payload,
    hub: web::Data<Addr<SessionHub>>,
    config: web::Data<crate::config::ServerConfig>,
) -> Result<HttpResponse, actix_web::Error> {
    let origin = req
        .headers()
        .get(actix_web::http::header::ORIGIN)
        .and_then(|v| v.to_str().ok());
    if !auth::origin_allowed(origin, &config.allowed_origins) {
        log::warn!("rejected origin {:?}", origin);
        return Ok(HttpResponse::Forbidden().finish());
    }

    let Some(token) = auth::token_from_request(&req) else {
        return Ok(HttpResponse::Unauthorized().finish());
    };
    let identity = match auth::verify_token(&token, &config.session_secret) {
        Ok(identity) => identity,
        Err(e) => {
            log::warn!("rejected credentials: {}", e);
            return Ok(HttpResponse::Unauthorized().finish());
        }
    };

    let session = WsSession::new(identity, hub.get_ref().clone());
    ws::WsResponseBuilder::new(session, &req, stream)
        .frame_size(MAX_FRAME_BYTES)
        .start()
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

    /// Stands in for a WsSession: collects frames and close orders.
    struct StubSession {
        frames: Arc<Mutex<Vec<String>>>,
        closes: Arc<Mutex<Vec<CloseSession>>>,
    }

    impl Actor for StubSession {
        type Context = Context<Self>;
    }

    impl Handler<SessionText> for StubSession {
        type Result = ();
        fn handle(&mut self, msg: SessionText, _ctx: &mut Context<Self>) {
            self.frames.lock().unwrap().push(msg.0);
        }
    }

    impl Handler<CloseSession> for StubSession {
        type Result = ();
        fn handle(&mut self, msg: CloseSession, _ctx: &mut Context<Self>) {
            self.closes.lock().unwrap().push(msg);
        }
    }

    struct Peer {
        conn_id: Uuid,
        frames: Arc<Mutex<Vec<String>>>,
        closes: Arc<Mutex<Vec<CloseSession>>>,
        addr: Addr<StubSession>,
    }

    impl Peer {
        fn new() -> Self {
            let frames = Arc::new(Mutex::new(Vec::new()));
            let closes = Arc::new(Mutex::new(Vec::new()));
            let addr = StubSession {
                frames: frames.clone(),
                closes: closes.clone(),
            }
            .start();
            Self {
                conn_id: Uuid::new_v4(),
                frames,
                closes,
                addr,
            }
        }

        fn connect(&self, identity: &Identity) -> Connect {
            Connect {
                conn_id: self.conn_id,
                identity: identity.clone(),
                session: self.addr.clone().recipient(),
                control: self.addr.clone().recipient(),
            }
        }

        fn typed_frames(&self) -> Vec<serde_json::Value> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .map(|f| serde_json::from_str(f).unwrap())
                .collect()
        }
    }

    fn identity(name: &str) -> Identity {
        Identity {
            user_id: Uuid::new_v4(),
            username: name.to_string(),
            provider: "test".into(),
            is_guest: false,
        }
    }

    async fn hub_fixture() -> (
        Addr<SessionHub>,
        crate::store::SharedStore,
        std::path::PathBuf,
    ) {
        let dir = std::env::temp_dir().join(format!("banchess_hub_{}", Uuid::new_v4()));
        let storage = ArchiveStorage::new(&dir).unwrap();
        let archiver = Archiver::new(storage).start();
        let store = HotStore::new();
        let hub = SessionHub::new(store.clone(), archiver).start();
        let matchmaker = Matchmaker::new(store.clone(), hub.clone().recipient()).start();
        hub.send(SetMatchmaker(matchmaker)).await.unwrap();
        (hub, store, dir)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    #[actix_rt::test]
    async fn test_session_takeover() {
        let (hub, _store, dir) = hub_fixture().await;
        let user = identity("alice");

        let a = Peer::new();
        hub.send(a.connect(&user)).await.unwrap();
        let b = Peer::new();
        hub.send(b.connect(&user)).await.unwrap();
        settle().await;

        // The first connection was closed with the takeover reason.
        {
            let closes = a.closes.lock().unwrap();
            assert_eq!(closes.len(), 1);
            assert_eq!(closes[0].reason, "session takeover");
            assert_eq!(closes[0].code, ws::CloseCode::Normal);
        }
        assert!(b.closes.lock().unwrap().is_empty());

        // At most one registered connection per user: the old conn's
        // disconnect must not evict the new one.
        hub.send(Disconnect {
            conn_id: a.conn_id,
            user_id: user.user_id,
        })
        .await
        .unwrap();
        let stats = hub.send(GetStats).await.unwrap();
        assert_eq!(stats.connections, 1);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[actix_rt::test]
    async fn test_both_players_matched_and_joined() {
        let (hub, _store, dir) = hub_fixture().await;
        let alice = identity("alice");
        let bob = identity("bob");
        let a = Peer::new();
        let b = Peer::new();
        hub.send(a.connect(&alice)).await.unwrap();
        hub.send(b.connect(&bob)).await.unwrap();

        for (peer, id) in [(&a, &alice), (&b, &bob)] {
            hub.send(Inbound {
                conn_id: peer.conn_id,
                user_id: id.user_id,
                frame: ClientFrame::JoinQueue { time_control: None },
            })
            .await
            .unwrap();
        }
        settle().await;

        let a_frames = a.typed_frames();
        let matched = a_frames.iter().find(|f| f["type"] == "matched").unwrap();
        assert_eq!(matched["color"], "white");
        assert_eq!(matched["opponent"], "bob");
        assert!(a_frames.iter().any(|f| f["type"] == "joined"));
        assert!(a_frames.iter().any(|f| f["type"] == "state"));

        let b_frames = b.typed_frames();
        let matched = b_frames.iter().find(|f| f["type"] == "matched").unwrap();
        assert_eq!(matched["color"], "black");

        let stats = hub.send(GetStats).await.unwrap();
        assert_eq!(stats.active_games, 1);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[actix_rt::test]
    async fn test_reconnect_restores_game_state() {
        let (hub, _store, dir) = hub_fixture().await;
        let alice = identity("alice");
        let bob = identity("bob");
        let a = Peer::new();
        let b = Peer::new();
        hub.send(a.connect(&alice)).await.unwrap();
        hub.send(b.connect(&bob)).await.unwrap();
        for (peer, id) in [(&a, &alice), (&b, &bob)] {
            hub.send(Inbound {
                conn_id: peer.conn_id,
                user_id: id.user_id,
                frame: ClientFrame::JoinQueue { time_control: None },
            })
            .await
            .unwrap();
        }
        settle().await;

        // Alice drops and comes back on a fresh connection.
        hub.send(Disconnect {
            conn_id: a.conn_id,
            user_id: alice.user_id,
        })
        .await
        .unwrap();
        let a2 = Peer::new();
        hub.send(a2.connect(&alice)).await.unwrap();
        settle().await;

        let frames = a2.typed_frames();
        let state = frames.iter().find(|f| f["type"] == "state").unwrap();
        // Rejoin always carries a full state.
        assert!(state["history"].is_array());
        assert!(state["events"].is_array());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[actix_rt::test]
    async fn test_solo_game_creation() {
        let (hub, _store, dir) = hub_fixture().await;
        let alice = identity("alice");
        let a = Peer::new();
        hub.send(a.connect(&alice)).await.unwrap();
        hub.send(Inbound {
            conn_id: a.conn_id,
            user_id: alice.user_id,
            frame: ClientFrame::CreateSoloGame {
                time_control: Some(TimeControl {
                    initial_sec: 300,
                    increment_sec: 3,
                }),
            },
        })
        .await
        .unwrap();
        settle().await;

        let frames = a.typed_frames();
        assert!(frames.iter().any(|f| f["type"] == "game-created"));
        assert!(frames.iter().any(|f| f["type"] == "joined"));
        // No matched frame for solo play.
        assert!(!frames.iter().any(|f| f["type"] == "matched"));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[actix_rt::test]
    async fn test_action_on_unknown_game() {
        let (hub, _store, dir) = hub_fixture().await;
        let alice = identity("alice");
        let a = Peer::new();
        hub.send(a.connect(&alice)).await.unwrap();
        hub.send(Inbound {
            conn_id: a.conn_id,
            user_id: alice.user_id,
            frame: ClientFrame::Resign {
                game_id: Uuid::new_v4(),
            },
        })
        .await
        .unwrap();
        settle().await;

        let frames = a.typed_frames();
        let error = frames.iter().find(|f| f["type"] == "error").unwrap();
        assert!(error["message"].as_str().unwrap().contains("not found"));

        let _ = std::fs::remove_dir_all(dir);
    }
}
