//! Client/server message schema for the ban-chess protocol.
//!
//! All frames are JSON objects tagged on a `type` field, kebab-case tags
//! and camelCase fields in both directions. Parsing is strict: malformed
//! JSON, a missing discriminator, an unknown `type`, or a type-mismatched
//! field all fail with [`ClientError::BadFrame`]. No field silently
//! defaults; optional fields are explicitly absent.
//!
//! ## Client → server
//!
//! | type               | fields                      |
//! |--------------------|-----------------------------|
//! | `authenticate`     | `userId`, `username`        |
//! | `join-game`        | `gameId`                    |
//! | `action`           | `gameId`, `action`          |
//! | `give-time`        | `gameId`, `amount?`         |
//! | `resign`           | `gameId`                    |
//! | `offer-draw`       | `gameId`                    |
//! | `accept-draw`      | `gameId`                    |
//! | `decline-draw`     | `gameId`                    |
//! | `join-queue`       | `timeControl?`              |
//! | `leave-queue`      | —                           |
//! | `create-solo-game` | `timeControl?`              |
//! | `ping`             | —                           |
//!
//! The `action` payload is either a BCN string (`"m:e2e4"`) or an object
//! with a `move` or `ban` key.

use crate::notation::{Action, ActionKind, Color, NotationError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Hard limit on a single inbound frame; larger frames close with 1009.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Submitter-scoped failures. These are answered with an `error` (or
/// `server-error`) frame to the submitting connection only and never fan
/// out to peers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("bad frame: {0}")]
    BadFrame(String),
    #[error("not authenticated")]
    Unauthenticated,
    #[error("you are not a player in this game")]
    NotAPlayer,
    #[error("illegal action: {0}")]
    IllegalAction(String),
    #[error("game not found")]
    GameNotFound,
    #[error("game is already over")]
    GameOver,
    #[error("store unavailable, please retry")]
    StoreUnavailable,
}

impl ClientError {
    /// The frame sent back to the submitter for this error.
    pub fn to_frame(&self) -> ServerFrame {
        match self {
            ClientError::StoreUnavailable => ServerFrame::ServerError {
                message: self.to_string(),
            },
            _ => ServerFrame::Error {
                message: self.to_string(),
            },
        }
    }
}

impl From<NotationError> for ClientError {
    fn from(e: NotationError) -> Self {
        ClientError::BadFrame(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Shared wire types
// ---------------------------------------------------------------------------

/// Fischer time control in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeControl {
    pub initial_sec: u64,
    pub increment_sec: u64,
}

impl TimeControl {
    /// The default matchmaking time control (5+0).
    pub fn default_pool() -> Self {
        Self {
            initial_sec: 300,
            increment_sec: 0,
        }
    }
}

/// A seated player as shown to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub id: Uuid,
    pub username: String,
}

/// Both seats of a game. A seat may be empty while a game is forming.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Players {
    pub white: Option<PlayerInfo>,
    pub black: Option<PlayerInfo>,
}

/// One side's clock as shown to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireClock {
    /// Remaining time in milliseconds.
    pub remaining: i64,
    /// Wall-clock milliseconds of the last debit/credit.
    pub last_update: u64,
}

/// Both clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClocksSnapshot {
    pub white: WireClock,
    pub black: WireClock,
}

/// Compact resync summary carried on every state frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub fen: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_action: Option<String>,
    pub move_number: u32,
}

/// One entry of the game history: a move (with SAN) or a ban.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub turn_number: u32,
    pub player: Color,
    pub kind: ActionKind,
    /// The half-action in BCN.
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub san: Option<String>,
    pub fen_after: String,
    /// Wall-clock milliseconds when the action was accepted.
    pub timestamp: u64,
}

/// Kind tags for the append-only per-game event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GameEventType {
    TimeGiven,
    GameStarted,
    Timeout,
    Checkmate,
    Stalemate,
    Draw,
    Resignation,
    PlayerJoined,
    MoveMade,
    BanMade,
}

/// An append-only event on a game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameEvent {
    pub timestamp_ms: u64,
    #[serde(rename = "type")]
    pub kind: GameEventType,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player: Option<Color>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Client → server frames
// ---------------------------------------------------------------------------

/// A move as submitted in an `action` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct MoveSpec {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub promotion: Option<String>,
}

/// A ban as submitted in an `action` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct BanSpec {
    pub from: String,
    pub to: String,
}

/// The `action` field of an `action` frame: a BCN string or a
/// `{move: ...}` / `{ban: ...}` object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ActionPayload {
    Bcn(String),
    Move { r#move: MoveSpec },
    Ban { ban: BanSpec },
}

impl ActionPayload {
    /// Normalizes the payload into a validated half-action.
    pub fn into_action(self) -> Result<Action, ClientError> {
        match self {
            ActionPayload::Bcn(s) => Ok(Action::from_bcn(&s)?),
            ActionPayload::Move { r#move } => {
                let promo = match r#move.promotion.as_deref() {
                    None | Some("") => None,
                    Some(p) => Some(
                        p.chars()
                            .next()
                            .map(|c| c.to_ascii_lowercase())
                            .ok_or_else(|| ClientError::BadFrame("empty promotion".into()))?,
                    ),
                };
                Ok(Action::new_move(&r#move.from, &r#move.to, promo)?)
            }
            ActionPayload::Ban { ban } => Ok(Action::new_ban(&ban.from, &ban.to)?),
        }
    }
}

/// All frames a client may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    /// Legacy identity announcement; identity is otherwise derived from the
    /// connection handshake.
    #[serde(rename_all = "camelCase")]
    Authenticate { user_id: Uuid, username: String },
    #[serde(rename_all = "camelCase")]
    JoinGame { game_id: Uuid },
    #[serde(rename_all = "camelCase")]
    Action {
        game_id: Uuid,
        action: ActionPayload,
    },
    #[serde(rename_all = "camelCase")]
    GiveTime {
        game_id: Uuid,
        #[serde(default)]
        amount: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Resign { game_id: Uuid },
    #[serde(rename_all = "camelCase")]
    OfferDraw { game_id: Uuid },
    #[serde(rename_all = "camelCase")]
    AcceptDraw { game_id: Uuid },
    #[serde(rename_all = "camelCase")]
    DeclineDraw { game_id: Uuid },
    #[serde(rename_all = "camelCase")]
    JoinQueue {
        #[serde(default)]
        time_control: Option<TimeControl>,
    },
    LeaveQueue,
    #[serde(rename_all = "camelCase")]
    CreateSoloGame {
        #[serde(default)]
        time_control: Option<TimeControl>,
    },
    Ping,
}

/// Parses one inbound text frame, strictly.
pub fn parse_client_frame(text: &str) -> Result<ClientFrame, ClientError> {
    serde_json::from_str(text).map_err(|e| ClientError::BadFrame(e.to_string()))
}

// ---------------------------------------------------------------------------
// Server → client frames
// ---------------------------------------------------------------------------

/// The full or incremental game state pushed to clients.
///
/// A full state (on join/rejoin) carries `history` and `events`;
/// increments carry `last_move` instead.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateFrame {
    pub game_id: Uuid,
    pub fen: String,
    pub players: Players,
    pub next_action: ActionKind,
    pub legal_actions: Vec<String>,
    pub in_check: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<HistoryEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_move: Option<String>,
    pub action_history: Vec<String>,
    pub sync_state: SyncState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_control: Option<TimeControl>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clocks: Option<ClocksSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game_over: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<GameEvent>>,
}

/// All frames the server may send.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    Authenticated { user_id: Uuid, username: String },
    State(StateFrame),
    #[serde(rename_all = "camelCase")]
    Joined {
        game_id: Uuid,
        color: Color,
        players: Players,
        #[serde(skip_serializing_if = "Option::is_none")]
        time_control: Option<TimeControl>,
    },
    #[serde(rename_all = "camelCase")]
    Matched {
        game_id: Uuid,
        color: Color,
        opponent: String,
        time_control: TimeControl,
    },
    Queued {
        position: usize,
    },
    #[serde(rename_all = "camelCase")]
    GameCreated {
        game_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        time_control: Option<TimeControl>,
    },
    #[serde(rename_all = "camelCase")]
    ClockUpdate {
        game_id: Uuid,
        clocks: ClocksSnapshot,
    },
    #[serde(rename_all = "camelCase")]
    GameEvent {
        game_id: Uuid,
        event: GameEvent,
    },
    #[serde(rename_all = "camelCase")]
    GameEnded {
        game_id: Uuid,
        result: String,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    Timeout {
        game_id: Uuid,
        winner: Color,
    },
    Error {
        message: String,
    },
    ServerError {
        message: String,
    },
    Pong,
}

impl ServerFrame {
    /// Serializes the frame to its JSON wire form.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            log::error!("failed to serialize server frame: {}", e);
            r#"{"type":"server-error","message":"internal serialization failure"}"#.to_string()
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_frames() {
        let frame = parse_client_frame(
            r#"{"type":"action","gameId":"6a4c2b9e-0000-4000-8000-000000000001","action":"m:e2e4"}"#,
        )
        .unwrap();
        match frame {
            ClientFrame::Action { action, .. } => {
                let act = action.into_action().unwrap();
                assert_eq!(act.to_bcn(), "m:e2e4");
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        assert!(matches!(
            parse_client_frame(r#"{"type":"ping"}"#).unwrap(),
            ClientFrame::Ping
        ));
        assert!(matches!(
            parse_client_frame(r#"{"type":"leave-queue"}"#).unwrap(),
            ClientFrame::LeaveQueue
        ));
        assert!(matches!(
            parse_client_frame(r#"{"type":"join-queue","timeControl":{"initialSec":60,"incrementSec":2}}"#)
                .unwrap(),
            ClientFrame::JoinQueue {
                time_control: Some(TimeControl {
                    initial_sec: 60,
                    increment_sec: 2
                })
            }
        ));
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        assert!(parse_client_frame(r#"{"type":"teleport"}"#).is_err());
        assert!(parse_client_frame(r#"{"gameId":"x"}"#).is_err());
        assert!(parse_client_frame("not json").is_err());
    }

    #[test]
    fn test_parse_rejects_type_mismatch() {
        // gameId must be a UUID, amount must be a number
        assert!(parse_client_frame(r#"{"type":"resign","gameId":42}"#).is_err());
        assert!(
            parse_client_frame(
                r#"{"type":"give-time","gameId":"6a4c2b9e-0000-4000-8000-000000000001","amount":"lots"}"#
            )
            .is_err()
        );
    }

    #[test]
    fn test_action_payload_forms() {
        let object = parse_client_frame(
            r#"{"type":"action","gameId":"6a4c2b9e-0000-4000-8000-000000000001",
                "action":{"move":{"from":"e7","to":"e8","promotion":"Q"}}}"#,
        )
        .unwrap();
        match object {
            ClientFrame::Action { action, .. } => {
                assert_eq!(action.into_action().unwrap().to_bcn(), "m:e7e8q");
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        let ban = parse_client_frame(
            r#"{"type":"action","gameId":"6a4c2b9e-0000-4000-8000-000000000001",
                "action":{"ban":{"from":"e2","to":"e4"}}}"#,
        )
        .unwrap();
        match ban {
            ClientFrame::Action { action, .. } => {
                assert_eq!(action.into_action().unwrap().to_bcn(), "b:e2e4");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_server_frame_wire_shape() {
        let json = ServerFrame::Matched {
            game_id: Uuid::nil(),
            color: Color::White,
            opponent: "kasparov".into(),
            time_control: TimeControl::default_pool(),
        }
        .to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "matched");
        assert_eq!(value["color"], "white");
        assert_eq!(value["timeControl"]["initialSec"], 300);

        let json = ServerFrame::GameEnded {
            game_id: Uuid::nil(),
            result: "White wins by checkmate".into(),
            reason: "checkmate".into(),
        }
        .to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "game-ended");
        assert_eq!(value["gameId"], Uuid::nil().to_string());
    }

    #[test]
    fn test_game_event_wire_shape() {
        let event = GameEvent {
            timestamp_ms: 1_000,
            kind: GameEventType::TimeGiven,
            message: "white gave 15s".into(),
            player: Some(Color::White),
            metadata: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "time-given");
        assert_eq!(value["timestampMs"], 1_000);
        assert!(value.get("metadata").is_none());
    }

    #[test]
    fn test_error_frames_stay_submitter_scoped() {
        let frame = ClientError::StoreUnavailable.to_frame();
        let value: serde_json::Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(value["type"], "server-error");

        let frame = ClientError::IllegalAction("banned".into()).to_frame();
        let value: serde_json::Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(value["type"], "error");
        assert!(value["message"].as_str().unwrap().contains("banned"));
    }
}
