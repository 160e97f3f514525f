//! Hot state store and pub/sub bus for live games.
//!
//! Key surface (mirroring the deployment contract):
//!
//! - hash per game (`game:{id}`): fen, pgn, players, timestamps, result,
//!   move count, time control — TTL 4 h active / 24 h finished
//! - list per game (`game:{id}:history`): append-only BCN strings
//! - list per game (`game:{id}:events`): append-only event rows
//! - `queue` list + `queue:set` dedup set, with an atomic pair-pop
//! - `session:{userId}` records with a 1 h TTL, plus the `online` set
//! - channels `channel:game:{id}` and `channel:queue`
//!
//! This process runs in game-ownership-pinning mode: each game's room is
//! the only writer of that game's keys, so one lock scope per operation
//! is all the atomicity the contract needs. The bus is a broadcast
//! channel per game; the session hub subscribes and fans out to its local
//! connections.

use crate::protocol::{GameEvent, TimeControl};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Capacity of each fan-out channel; a receiver that lags this far is
/// treated as disconnected.
const CHANNEL_CAPACITY: usize = 64;

/// Store failures. The in-process backing can only fail by lock
/// poisoning, which callers surface as `server-error` without advancing
/// state — the same contract an external store outage would have.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable")]
    Unavailable,
}

/// Time-to-live policy; overridable in tests.
#[derive(Debug, Clone, Copy)]
pub struct StoreTtls {
    pub active_game: Duration,
    pub finished_game: Duration,
    pub session: Duration,
}

impl Default for StoreTtls {
    fn default() -> Self {
        Self {
            active_game: Duration::from_secs(4 * 3600),
            finished_game: Duration::from_secs(24 * 3600),
            session: Duration::from_secs(3600),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// The per-game hash.
#[derive(Debug, Clone)]
pub struct GameRecord {
    pub game_id: Uuid,
    pub fen: String,
    pub pgn: String,
    pub white_id: Option<Uuid>,
    pub black_id: Option<Uuid>,
    pub white_name: String,
    pub black_name: String,
    pub start_time_ms: u64,
    pub last_move_time_ms: u64,
    pub game_over: bool,
    pub result: Option<String>,
    pub move_count: u32,
    pub time_control: Option<TimeControl>,
    pub is_solo: bool,
}

/// A matchmaking queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub user_id: Uuid,
    pub username: String,
    pub joined_at_ms: u64,
    pub time_control: Option<TimeControl>,
}

/// Presence status of a session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Online,
    Queued,
    InGame,
}

/// A session record (TTL-bound, refreshed on activity).
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub user_id: Uuid,
    pub username: String,
    pub status: SessionStatus,
    pub last_seen_ms: u64,
}

/// One message on a channel. `target` scopes the frame to a single user
/// (queue position updates); `None` fans out to every subscriber.
#[derive(Debug, Clone)]
pub struct BusEnvelope {
    pub target: Option<Uuid>,
    pub frame: String,
}

impl BusEnvelope {
    pub fn broadcast(frame: String) -> Self {
        Self {
            target: None,
            frame,
        }
    }

    pub fn direct(user: Uuid, frame: String) -> Self {
        Self {
            target: Some(user),
            frame,
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

struct StoreInner {
    games: HashMap<Uuid, Expiring<GameRecord>>,
    histories: HashMap<Uuid, Vec<String>>,
    events: HashMap<Uuid, Vec<GameEvent>>,
    queue: VecDeque<QueueEntry>,
    queue_set: HashSet<Uuid>,
    sessions: HashMap<Uuid, Expiring<SessionRecord>>,
    online: HashSet<Uuid>,
    /// user → live game pin, maintained by rooms.
    user_games: HashMap<Uuid, Uuid>,
    game_channels: HashMap<Uuid, broadcast::Sender<BusEnvelope>>,
    queue_channel: broadcast::Sender<BusEnvelope>,
}

/// The process-wide hot store. Cheap to clone via [`SharedStore`].
pub struct HotStore {
    inner: Mutex<StoreInner>,
    ttls: StoreTtls,
}

pub type SharedStore = Arc<HotStore>;

impl HotStore {
    pub fn new() -> SharedStore {
        Self::with_ttls(StoreTtls::default())
    }

    pub fn with_ttls(ttls: StoreTtls) -> SharedStore {
        let (queue_channel, _) = broadcast::channel(CHANNEL_CAPACITY);
        Arc::new(Self {
            inner: Mutex::new(StoreInner {
                games: HashMap::new(),
                histories: HashMap::new(),
                events: HashMap::new(),
                queue: VecDeque::new(),
                queue_set: HashSet::new(),
                sessions: HashMap::new(),
                online: HashSet::new(),
                user_games: HashMap::new(),
                game_channels: HashMap::new(),
                queue_channel,
            }),
            ttls,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, StoreInner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Unavailable)
    }

    // -----------------------------------------------------------------------
    // Game hash + history (single-transaction writes)
    // -----------------------------------------------------------------------

    /// Creates or replaces a game hash and clears its history/events.
    pub fn put_game(&self, record: GameRecord) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let ttl = self.ttls.active_game;
        let id = record.game_id;
        inner.games.insert(
            id,
            Expiring {
                value: record,
                expires_at: Instant::now() + ttl,
            },
        );
        inner.histories.insert(id, Vec::new());
        inner.events.insert(id, Vec::new());
        Ok(())
    }

    pub fn get_game(&self, game_id: Uuid) -> Result<Option<GameRecord>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .games
            .get(&game_id)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value.clone()))
    }

    /// Applies an accepted half-action: hash update and history append in
    /// one transaction. Nothing is written if the game hash is missing.
    pub fn write_action(
        &self,
        game_id: Uuid,
        fen: &str,
        pgn: &str,
        move_count: u32,
        now_ms: u64,
        bcn: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let ttl = self.ttls.active_game;
        let Some(entry) = inner.games.get_mut(&game_id) else {
            return Ok(());
        };
        entry.value.fen = fen.to_string();
        entry.value.pgn = pgn.to_string();
        entry.value.move_count = move_count;
        entry.value.last_move_time_ms = now_ms;
        entry.expires_at = Instant::now() + ttl;
        inner.histories.entry(game_id).or_default().push(bcn.to_string());
        Ok(())
    }

    /// Marks a game finished and extends its keys to the finished TTL.
    pub fn finish_game(&self, game_id: Uuid, result: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let ttl = self.ttls.finished_game;
        if let Some(entry) = inner.games.get_mut(&game_id) {
            entry.value.game_over = true;
            entry.value.result = Some(result.to_string());
            entry.expires_at = Instant::now() + ttl;
        }
        Ok(())
    }

    pub fn history(&self, game_id: Uuid) -> Result<Vec<String>, StoreError> {
        Ok(self.lock()?.histories.get(&game_id).cloned().unwrap_or_default())
    }

    pub fn append_event(&self, game_id: Uuid, event: GameEvent) -> Result<(), StoreError> {
        self.lock()?.events.entry(game_id).or_default().push(event);
        Ok(())
    }

    pub fn events(&self, game_id: Uuid) -> Result<Vec<GameEvent>, StoreError> {
        Ok(self.lock()?.events.get(&game_id).cloned().unwrap_or_default())
    }

    pub fn active_game_count(&self) -> Result<usize, StoreError> {
        let inner = self.lock()?;
        let now = Instant::now();
        Ok(inner
            .games
            .values()
            .filter(|e| !e.value.game_over && e.expires_at > now)
            .count())
    }

    // -----------------------------------------------------------------------
    // User → game pins
    // -----------------------------------------------------------------------

    pub fn pin_user_game(&self, user_id: Uuid, game_id: Uuid) -> Result<(), StoreError> {
        self.lock()?.user_games.insert(user_id, game_id);
        Ok(())
    }

    pub fn clear_user_game(&self, user_id: Uuid) -> Result<(), StoreError> {
        self.lock()?.user_games.remove(&user_id);
        Ok(())
    }

    /// The live game a user is seated in, if any.
    pub fn find_user_game(&self, user_id: Uuid) -> Result<Option<Uuid>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.user_games.get(&user_id).copied())
    }

    // -----------------------------------------------------------------------
    // Matchmaking queue
    // -----------------------------------------------------------------------

    /// Pushes an entry unless the user is already queued; returns the
    /// 1-based queue position either way (enqueue is idempotent).
    pub fn queue_push(&self, entry: QueueEntry) -> Result<usize, StoreError> {
        let mut inner = self.lock()?;
        if inner.queue_set.contains(&entry.user_id) {
            let pos = inner
                .queue
                .iter()
                .position(|e| e.user_id == entry.user_id)
                .map(|i| i + 1)
                .unwrap_or(1);
            return Ok(pos);
        }
        inner.queue_set.insert(entry.user_id);
        inner.queue.push_back(entry);
        Ok(inner.queue.len())
    }

    pub fn queue_remove(&self, user_id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        if !inner.queue_set.remove(&user_id) {
            return Ok(false);
        }
        inner.queue.retain(|e| e.user_id != user_id);
        Ok(true)
    }

    /// Atomically pops the two queue heads. With fewer than two waiting,
    /// a popped singleton is pushed back to the head (compensating
    /// re-push) and `None` is returned.
    pub fn queue_pop_pair(&self) -> Result<Option<(QueueEntry, QueueEntry)>, StoreError> {
        let mut inner = self.lock()?;
        let first = match inner.queue.pop_front() {
            Some(e) => e,
            None => return Ok(None),
        };
        let second = match inner.queue.pop_front() {
            Some(e) => e,
            None => {
                inner.queue.push_front(first);
                return Ok(None);
            }
        };
        inner.queue_set.remove(&first.user_id);
        inner.queue_set.remove(&second.user_id);
        Ok(Some((first, second)))
    }

    pub fn queue_contains(&self, user_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.lock()?.queue_set.contains(&user_id))
    }

    pub fn queue_position(&self, user_id: Uuid) -> Result<Option<usize>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .queue
            .iter()
            .position(|e| e.user_id == user_id)
            .map(|i| i + 1))
    }

    pub fn queue_entries(&self) -> Result<Vec<QueueEntry>, StoreError> {
        Ok(self.lock()?.queue.iter().cloned().collect())
    }

    pub fn queue_len(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.queue.len())
    }

    // -----------------------------------------------------------------------
    // Sessions & presence
    // -----------------------------------------------------------------------

    /// Writes/refreshes a session record with the session TTL.
    pub fn touch_session(
        &self,
        user_id: Uuid,
        username: &str,
        status: SessionStatus,
        now_ms: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let ttl = self.ttls.session;
        inner.sessions.insert(
            user_id,
            Expiring {
                value: SessionRecord {
                    user_id,
                    username: username.to_string(),
                    status,
                    last_seen_ms: now_ms,
                },
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    pub fn session(&self, user_id: Uuid) -> Result<Option<SessionRecord>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .sessions
            .get(&user_id)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value.clone()))
    }

    pub fn set_online(&self, user_id: Uuid) -> Result<(), StoreError> {
        self.lock()?.online.insert(user_id);
        Ok(())
    }

    pub fn set_offline(&self, user_id: Uuid) -> Result<(), StoreError> {
        self.lock()?.online.remove(&user_id);
        Ok(())
    }

    pub fn online_count(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.online.len())
    }

    // -----------------------------------------------------------------------
    // Channels
    // -----------------------------------------------------------------------

    /// Subscribes to a game's fan-out channel, creating it on demand.
    pub fn subscribe_game(&self, game_id: Uuid) -> Result<broadcast::Receiver<BusEnvelope>, StoreError> {
        let mut inner = self.lock()?;
        let sender = inner
            .game_channels
            .entry(game_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        Ok(sender.subscribe())
    }

    /// Publishes on a game channel. Publishing with no subscribers is not
    /// an error.
    pub fn publish_game(&self, game_id: Uuid, envelope: BusEnvelope) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let sender = inner
            .game_channels
            .entry(game_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        let _ = sender.send(envelope);
        Ok(())
    }

    pub fn subscribe_queue(&self) -> Result<broadcast::Receiver<BusEnvelope>, StoreError> {
        Ok(self.lock()?.queue_channel.subscribe())
    }

    pub fn publish_queue(&self, envelope: BusEnvelope) -> Result<(), StoreError> {
        let _ = self.lock()?.queue_channel.send(envelope);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Expiry sweep
    // -----------------------------------------------------------------------

    /// Drops expired games (with their history, events and channel),
    /// expired sessions, and stale user pins. Run periodically.
    pub fn sweep(&self) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let now = Instant::now();

        let expired: Vec<Uuid> = inner
            .games
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            inner.games.remove(id);
            inner.histories.remove(id);
            inner.events.remove(id);
            inner.game_channels.remove(id);
        }
        if !expired.is_empty() {
            log::debug!("store sweep dropped {} expired game(s)", expired.len());
            let dead: HashSet<Uuid> = expired.into_iter().collect();
            inner.user_games.retain(|_, game| !dead.contains(game));
        }

        inner.sessions.retain(|_, e| e.expires_at > now);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
