//! Archival pipeline: buffered drain of finished games to durable storage.
//!
//! # Storage strategy
//!
//! - **Live games** stream their accepted half-actions and events into a
//!   per-game journal under `active/` (uncompressed JSON rows, appended in
//!   batches) so a crashed process loses at most one flush interval.
//! - **Finished games** are serialized into a compact binary archive,
//!   compressed with zstd and written under `archive/`; the journal is
//!   then removed. Per-player aggregates in `players.json` are updated in
//!   the same step with an atomic temp-file + rename write.
//! - **Solo games are never archived**: their buffers and journal are
//!   discarded on terminal.
//!
//! # Binary format (`.bcr`)
//!
//! ```text
//! Offset  Size   Field
//! ──────  ────   ─────
//! 0       4      Magic bytes: "BCHR"
//! 4       1      Format version (currently 1)
//! 5       16     Game UUID
//! 21      16     White UUID (zeroed if unset)
//! 37      16     Black UUID (zeroed if unset)
//! 53      1      Flags: bit 0 = solo, bit 1 = time control present
//! 54      8      Start timestamp (unix ms, big-endian u64)
//! 62      8      End timestamp (unix ms, big-endian u64)
//! 70      4      Time control initial seconds (big-endian u32)
//! 74      4      Time control increment seconds (big-endian u32)
//! 78      2      Action count (big-endian u16)
//!
//! 80..    2×N    Encoded half-actions (2 bytes each):
//!                  Bits 0–5:   from square (0–63, rank*8+file)
//!                  Bits 6–11:  to square (0–63)
//!                  Bits 12–14: promotion (0=none, 1=q, 2=r, 3=b, 4=n)
//!                  Bit  15:    1 = ban, 0 = move
//!
//! then    2+len  Final FEN (u16 length prefix)
//! then    2+len  Result string
//! then    2+len  Reason string
//! then    2+len  White username
//! then    2+len  Black username
//! then    4+len  Events (JSON array, u32 length prefix)
//! ```
//!
//! The action list is the source of truth: replaying it from the initial
//! position reproduces the stored final FEN and the PGN.

use crate::notation::{self, Action, ActionKind, Color};
use crate::protocol::{GameEvent, TimeControl};
use crate::rules::BanChess;
use actix::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Magic bytes identifying a ban-chess archive file.
const MAGIC: &[u8; 4] = b"BCHR";

/// Current binary format version.
const FORMAT_VERSION: u8 = 1;

/// zstd compression level (19 = near-maximum compression for small data).
const ZSTD_COMPRESSION_LEVEL: i32 = 19;

/// Force a flush once a game has buffered this many rows.
const FLUSH_BUFFER_ROWS: usize = 100;

/// Periodic flush interval.
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Largest number of rows written per journal append.
const MAX_BATCH_ROWS: usize = 1000;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt archive: {0}")]
    Corrupt(String),
    #[error("game {0} not found in archive")]
    NotFound(Uuid),
    #[error("{0}")]
    Encoding(String),
}

// ---------------------------------------------------------------------------
// Compact half-action encoding (2 bytes each)
// ---------------------------------------------------------------------------

/// Encodes a half-action into 2 bytes; bit 15 distinguishes bans.
pub fn encode_action(action: &Action) -> Result<u16, ArchiveError> {
    let from = notation::square_index(action.from_sq())
        .ok_or_else(|| ArchiveError::Encoding(format!("bad square {}", action.from_sq())))?;
    let to = notation::square_index(action.to_sq())
        .ok_or_else(|| ArchiveError::Encoding(format!("bad square {}", action.to_sq())))?;

    let (promo_bits, ban_bit): (u16, u16) = match action {
        Action::Move { promotion, .. } => {
            let promo = match promotion {
                None => 0,
                Some('q') => 1,
                Some('r') => 2,
                Some('b') => 3,
                Some('n') => 4,
                Some(p) => {
                    return Err(ArchiveError::Encoding(format!("bad promotion {}", p)));
                }
            };
            (promo, 0)
        }
        Action::Ban { .. } => (0, 1),
    };

    Ok(from as u16 | ((to as u16) << 6) | (promo_bits << 12) | (ban_bit << 15))
}

/// Decodes a 2-byte encoded half-action.
pub fn decode_action(encoded: u16) -> Result<Action, ArchiveError> {
    let from = notation::square_name((encoded & 0x3F) as u8);
    let to = notation::square_name(((encoded >> 6) & 0x3F) as u8);
    let is_ban = encoded & 0x8000 != 0;
    let promotion = match (encoded >> 12) & 0x07 {
        0 => None,
        1 => Some('q'),
        2 => Some('r'),
        3 => Some('b'),
        4 => Some('n'),
        other => {
            return Err(ArchiveError::Corrupt(format!("promotion bits {}", other)));
        }
    };
    let action = if is_ban {
        Action::new_ban(&from, &to)
    } else {
        Action::new_move(&from, &to, promotion)
    };
    action.map_err(|e| ArchiveError::Corrupt(e.to_string()))
}

// ---------------------------------------------------------------------------
// Durable row shapes
// ---------------------------------------------------------------------------

/// One accepted half-action, as journaled (matching the durable `moves`
/// write shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRow {
    pub game_id: Uuid,
    pub move_number: u32,
    pub color: Color,
    /// The half-action in BCN.
    pub notation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub san: Option<String>,
    pub fen_after: String,
    pub is_ban: bool,
    pub timestamp_ms: u64,
}

/// One journaled row: an action or an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "rowType", rename_all = "camelCase")]
pub enum JournalRow {
    Action(ActionRow),
    #[serde(rename_all = "camelCase")]
    Event {
        game_id: Uuid,
        event: GameEvent,
    },
}

/// The summary written when a game terminates.
#[derive(Debug, Clone)]
pub struct GameSummary {
    pub game_id: Uuid,
    pub white_id: Option<Uuid>,
    pub black_id: Option<Uuid>,
    pub white_name: String,
    pub black_name: String,
    pub is_solo: bool,
    /// Human-readable result ("White wins by checkmate", ...).
    pub result: String,
    /// Short reason tag ("checkmate", "timeout", "resignation", ...).
    pub reason: String,
    pub started_at_ms: u64,
    pub completed_at_ms: u64,
    pub time_control: Option<TimeControl>,
    pub final_fen: String,
    pub actions: Vec<Action>,
    pub events: Vec<GameEvent>,
}

impl GameSummary {
    pub fn total_moves(&self) -> u32 {
        self.actions
            .iter()
            .filter(|a| a.kind() == ActionKind::Move)
            .count() as u32
    }

    pub fn total_bans(&self) -> u32 {
        self.actions.len() as u32 - self.total_moves()
    }

    /// Every banned move, as UCI strings.
    pub fn banned_moves(&self) -> Vec<String> {
        self.actions
            .iter()
            .filter(|a| a.kind() == ActionKind::Ban)
            .map(Action::uci)
            .collect()
    }

    /// Rebuilds the PGN by replay.
    pub fn pgn(&self) -> Result<String, ArchiveError> {
        let bcn: Vec<String> = self.actions.iter().map(Action::to_bcn).collect();
        let game =
            BanChess::replay(&bcn).map_err(|e| ArchiveError::Corrupt(e.to_string()))?;
        let tag = result_tag(&self.result);
        Ok(game.pgn(&self.white_name, &self.black_name, tag))
    }
}

/// The PGN result tag for a result string.
fn result_tag(result: &str) -> &'static str {
    if result.starts_with("White wins") {
        "1-0"
    } else if result.starts_with("Black wins") {
        "0-1"
    } else if result.starts_with("Draw") {
        "1/2-1/2"
    } else {
        "*"
    }
}

// ---------------------------------------------------------------------------
// Binary serialization
// ---------------------------------------------------------------------------

fn push_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn read_str(data: &[u8], offset: &mut usize) -> Result<String, ArchiveError> {
    let len = read_u16(data, offset)? as usize;
    let end = *offset + len;
    let bytes = data
        .get(*offset..end)
        .ok_or_else(|| ArchiveError::Corrupt("truncated string".into()))?;
    *offset = end;
    String::from_utf8(bytes.to_vec()).map_err(|e| ArchiveError::Corrupt(e.to_string()))
}

fn read_u16(data: &[u8], offset: &mut usize) -> Result<u16, ArchiveError> {
    let bytes: [u8; 2] = data
        .get(*offset..*offset + 2)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| ArchiveError::Corrupt("truncated u16".into()))?;
    *offset += 2;
    Ok(u16::from_be_bytes(bytes))
}

fn read_u32(data: &[u8], offset: &mut usize) -> Result<u32, ArchiveError> {
    let bytes: [u8; 4] = data
        .get(*offset..*offset + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| ArchiveError::Corrupt("truncated u32".into()))?;
    *offset += 4;
    Ok(u32::from_be_bytes(bytes))
}

fn read_u64(data: &[u8], offset: &mut usize) -> Result<u64, ArchiveError> {
    let bytes: [u8; 8] = data
        .get(*offset..*offset + 8)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| ArchiveError::Corrupt("truncated u64".into()))?;
    *offset += 8;
    Ok(u64::from_be_bytes(bytes))
}

fn read_uuid(data: &[u8], offset: &mut usize) -> Result<Uuid, ArchiveError> {
    let bytes: [u8; 16] = data
        .get(*offset..*offset + 16)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| ArchiveError::Corrupt("truncated uuid".into()))?;
    *offset += 16;
    Ok(Uuid::from_bytes(bytes))
}

/// Serializes a finished game into the compact binary `.bcr` format.
pub fn serialize_archive(summary: &GameSummary) -> Result<Vec<u8>, ArchiveError> {
    if summary.actions.len() > u16::MAX as usize {
        return Err(ArchiveError::Encoding("too many actions".into()));
    }

    let mut buf = Vec::with_capacity(96 + summary.actions.len() * 2);
    buf.extend_from_slice(MAGIC);
    buf.push(FORMAT_VERSION);
    buf.extend_from_slice(summary.game_id.as_bytes());
    buf.extend_from_slice(summary.white_id.unwrap_or(Uuid::nil()).as_bytes());
    buf.extend_from_slice(summary.black_id.unwrap_or(Uuid::nil()).as_bytes());

    let mut flags = 0u8;
    if summary.is_solo {
        flags |= 1;
    }
    if summary.time_control.is_some() {
        flags |= 2;
    }
    buf.push(flags);

    buf.extend_from_slice(&summary.started_at_ms.to_be_bytes());
    buf.extend_from_slice(&summary.completed_at_ms.to_be_bytes());
    let tc = summary.time_control.unwrap_or(TimeControl {
        initial_sec: 0,
        increment_sec: 0,
    });
    buf.extend_from_slice(&(tc.initial_sec as u32).to_be_bytes());
    buf.extend_from_slice(&(tc.increment_sec as u32).to_be_bytes());
    buf.extend_from_slice(&(summary.actions.len() as u16).to_be_bytes());

    for action in &summary.actions {
        buf.extend_from_slice(&encode_action(action)?.to_le_bytes());
    }

    push_str(&mut buf, &summary.final_fen);
    push_str(&mut buf, &summary.result);
    push_str(&mut buf, &summary.reason);
    push_str(&mut buf, &summary.white_name);
    push_str(&mut buf, &summary.black_name);

    let events =
        serde_json::to_vec(&summary.events).map_err(|e| ArchiveError::Encoding(e.to_string()))?;
    buf.extend_from_slice(&(events.len() as u32).to_be_bytes());
    buf.extend_from_slice(&events);

    Ok(buf)
}

/// Deserializes a `.bcr` buffer back into a [`GameSummary`].
pub fn deserialize_archive(data: &[u8]) -> Result<GameSummary, ArchiveError> {
    if data.len() < 80 {
        return Err(ArchiveError::Corrupt("header too short".into()));
    }
    if &data[0..4] != MAGIC {
        return Err(ArchiveError::Corrupt("bad magic".into()));
    }
    if data[4] != FORMAT_VERSION {
        return Err(ArchiveError::Corrupt(format!(
            "unsupported version {}",
            data[4]
        )));
    }

    let mut offset = 5usize;
    let game_id = read_uuid(data, &mut offset)?;
    let white_id = Some(read_uuid(data, &mut offset)?).filter(|u| !u.is_nil());
    let black_id = Some(read_uuid(data, &mut offset)?).filter(|u| !u.is_nil());
    let flags = data[offset];
    offset += 1;
    let started_at_ms = read_u64(data, &mut offset)?;
    let completed_at_ms = read_u64(data, &mut offset)?;
    let tc_initial = read_u32(data, &mut offset)?;
    let tc_increment = read_u32(data, &mut offset)?;
    let action_count = read_u16(data, &mut offset)? as usize;

    let mut actions = Vec::with_capacity(action_count);
    for _ in 0..action_count {
        let bytes: [u8; 2] = data
            .get(offset..offset + 2)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| ArchiveError::Corrupt("truncated action list".into()))?;
        offset += 2;
        actions.push(decode_action(u16::from_le_bytes(bytes))?);
    }

    let final_fen = read_str(data, &mut offset)?;
    let result = read_str(data, &mut offset)?;
    let reason = read_str(data, &mut offset)?;
    let white_name = read_str(data, &mut offset)?;
    let black_name = read_str(data, &mut offset)?;

    let events_len = read_u32(data, &mut offset)? as usize;
    let events_bytes = data
        .get(offset..offset + events_len)
        .ok_or_else(|| ArchiveError::Corrupt("truncated events".into()))?;
    let events: Vec<GameEvent> =
        serde_json::from_slice(events_bytes).map_err(|e| ArchiveError::Corrupt(e.to_string()))?;

    Ok(GameSummary {
        game_id,
        white_id,
        black_id,
        white_name,
        black_name,
        is_solo: flags & 1 != 0,
        result,
        reason,
        started_at_ms,
        completed_at_ms,
        time_control: (flags & 2 != 0).then_some(TimeControl {
            initial_sec: tc_initial as u64,
            increment_sec: tc_increment as u64,
        }),
        final_fen,
        actions,
        events,
    })
}

// ---------------------------------------------------------------------------
// Per-player aggregates
// ---------------------------------------------------------------------------

/// Aggregate counters kept per player across archived games.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PlayerStats {
    pub played: u32,
    pub won: u32,
    pub lost: u32,
    pub drawn: u32,
}

// ---------------------------------------------------------------------------
// ArchiveStorage — file-based durable store
// ---------------------------------------------------------------------------

/// Durable storage for the archiver.
///
/// Directory layout:
/// ```text
/// <base_dir>/
///   active/        # journals of in-flight games (.jsonl)
///   archive/       # finished, zstd-compressed games (.bcr.zst)
///   players.json   # per-player aggregates
/// ```
pub struct ArchiveStorage {
    active_dir: PathBuf,
    archive_dir: PathBuf,
    players_path: PathBuf,
}

impl ArchiveStorage {
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self, ArchiveError> {
        let base_dir = base_dir.as_ref().to_path_buf();
        let active_dir = base_dir.join("active");
        let archive_dir = base_dir.join("archive");
        fs::create_dir_all(&active_dir)?;
        fs::create_dir_all(&archive_dir)?;
        log::info!("archive storage initialized at {}", base_dir.display());
        Ok(Self {
            active_dir,
            archive_dir,
            players_path: base_dir.join("players.json"),
        })
    }

    fn journal_path(&self, game_id: Uuid) -> PathBuf {
        self.active_dir.join(format!("{}.jsonl", game_id))
    }

    fn archive_path(&self, game_id: Uuid) -> PathBuf {
        self.archive_dir.join(format!("{}.bcr.zst", game_id))
    }

    /// Appends journal rows, in batches of at most [`MAX_BATCH_ROWS`].
    pub fn append_rows(&self, game_id: Uuid, rows: &[JournalRow]) -> Result<(), ArchiveError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.journal_path(game_id))?;
        for batch in rows.chunks(MAX_BATCH_ROWS) {
            let mut chunk = String::new();
            for row in batch {
                let line = serde_json::to_string(row)
                    .map_err(|e| ArchiveError::Encoding(e.to_string()))?;
                chunk.push_str(&line);
                chunk.push('\n');
            }
            file.write_all(chunk.as_bytes())?;
        }
        Ok(())
    }

    /// Writes the compressed archive for a finished game and removes its
    /// journal. Returns the compressed size in bytes.
    pub fn write_archive(&self, summary: &GameSummary) -> Result<usize, ArchiveError> {
        let raw = serialize_archive(summary)?;
        let compressed = zstd::encode_all(raw.as_slice(), ZSTD_COMPRESSION_LEVEL)
            .map_err(|e| ArchiveError::Corrupt(e.to_string()))?;

        let path = self.archive_path(summary.game_id);
        let temp = path.with_extension("zst.tmp");
        fs::write(&temp, &compressed)?;
        fs::rename(&temp, &path)?;

        let _ = fs::remove_file(self.journal_path(summary.game_id));

        log::info!(
            "archived game {}: {} -> {} bytes ({} actions)",
            summary.game_id,
            raw.len(),
            compressed.len(),
            summary.actions.len()
        );
        Ok(compressed.len())
    }

    /// Drops the journal of a game that will never be archived.
    pub fn discard_journal(&self, game_id: Uuid) {
        let _ = fs::remove_file(self.journal_path(game_id));
    }

    pub fn load_archive(&self, game_id: Uuid) -> Result<GameSummary, ArchiveError> {
        let path = self.archive_path(game_id);
        if !path.exists() {
            return Err(ArchiveError::NotFound(game_id));
        }
        let compressed = fs::read(path)?;
        let raw = zstd::decode_all(compressed.as_slice())
            .map_err(|e| ArchiveError::Corrupt(e.to_string()))?;
        deserialize_archive(&raw)
    }

    pub fn list_archived(&self) -> Result<Vec<Uuid>, ArchiveError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.archive_dir)? {
            let entry = entry?;
            let filename = entry.file_name().to_string_lossy().to_string();
            if let Some(id_str) = filename.strip_suffix(".bcr.zst")
                && let Ok(id) = Uuid::parse_str(id_str)
            {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Loads the player aggregates table.
    pub fn player_stats(&self) -> Result<HashMap<Uuid, PlayerStats>, ArchiveError> {
        if !self.players_path.exists() {
            return Ok(HashMap::new());
        }
        let data = fs::read(&self.players_path)?;
        serde_json::from_slice(&data).map_err(|e| ArchiveError::Corrupt(e.to_string()))
    }

    /// Applies the outcome of one non-solo game to both players'
    /// aggregates, atomically (temp file + rename).
    pub fn update_player_stats(&self, summary: &GameSummary) -> Result<(), ArchiveError> {
        let (Some(white), Some(black)) = (summary.white_id, summary.black_id) else {
            return Ok(());
        };
        let mut stats = self.player_stats()?;
        let tag = result_tag(&summary.result);

        for (player, won, lost) in [
            (white, tag == "1-0", tag == "0-1"),
            (black, tag == "0-1", tag == "1-0"),
        ] {
            let entry = stats.entry(player).or_default();
            entry.played += 1;
            if won {
                entry.won += 1;
            } else if lost {
                entry.lost += 1;
            } else {
                entry.drawn += 1;
            }
        }

        let data =
            serde_json::to_vec_pretty(&stats).map_err(|e| ArchiveError::Encoding(e.to_string()))?;
        let temp = self.players_path.with_extension("json.tmp");
        fs::write(&temp, &data)?;
        fs::rename(&temp, &self.players_path)?;
        Ok(())
    }

    /// Storage statistics for the health endpoint and startup log.
    pub fn stats(&self) -> Result<ArchiveStats, ArchiveError> {
        let count_dir = |dir: &Path| -> Result<(usize, u64), ArchiveError> {
            let mut count = 0;
            let mut bytes = 0;
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                if entry.path().is_file() {
                    count += 1;
                    bytes += entry.metadata()?.len();
                }
            }
            Ok((count, bytes))
        };
        let (active_count, active_bytes) = count_dir(&self.active_dir)?;
        let (archived_count, archive_bytes) = count_dir(&self.archive_dir)?;
        Ok(ArchiveStats {
            active_count,
            archived_count,
            active_bytes,
            archive_bytes,
        })
    }
}

/// Counts and sizes of the durable store.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveStats {
    pub active_count: usize,
    pub archived_count: usize,
    pub active_bytes: u64,
    pub archive_bytes: u64,
}

// ---------------------------------------------------------------------------
// Archiver actor
// ---------------------------------------------------------------------------

/// Ack sent to the owning room once its game is durably archived (or
/// intentionally discarded, for solo games).
#[derive(Message, Debug, Clone, Copy)]
#[rtype(result = "()")]
pub struct ArchiveDone {
    pub game_id: Uuid,
}

/// Buffer one accepted half-action.
#[derive(Message, Debug)]
#[rtype(result = "()")]
pub struct RecordAction {
    pub row: ActionRow,
    pub is_solo: bool,
}

/// Buffer one game event.
#[derive(Message, Debug)]
#[rtype(result = "()")]
pub struct RecordEvent {
    pub game_id: Uuid,
    pub event: GameEvent,
    pub is_solo: bool,
}

/// Terminal hand-off from a room; force-flushes and writes the summary.
#[derive(Message)]
#[rtype(result = "()")]
pub struct GameFinished {
    pub summary: GameSummary,
    pub ack: Option<Recipient<ArchiveDone>>,
}

#[derive(Default)]
struct GameBuffer {
    rows: Vec<JournalRow>,
}

/// The archiver: buffers rows per game and drains them to durable
/// storage on size, tick, or terminal.
pub struct Archiver {
    storage: ArchiveStorage,
    buffers: HashMap<Uuid, GameBuffer>,
}

impl Archiver {
    pub fn new(storage: ArchiveStorage) -> Self {
        Self {
            storage,
            buffers: HashMap::new(),
        }
    }

    fn buffer_row(&mut self, game_id: Uuid, is_solo: bool, row: JournalRow) {
        // Solo games are never persisted, so their rows are not worth
        // holding.
        if is_solo {
            return;
        }
        let buffer = self.buffers.entry(game_id).or_default();
        buffer.rows.push(row);
        if buffer.rows.len() >= FLUSH_BUFFER_ROWS {
            self.flush_game(game_id);
        }
    }

    /// Flushes one game's buffer to its journal. On failure the rows are
    /// kept for the next attempt — no durability is claimed before a
    /// successful write.
    fn flush_game(&mut self, game_id: Uuid) {
        let Some(buffer) = self.buffers.get_mut(&game_id) else {
            return;
        };
        if buffer.rows.is_empty() {
            return;
        }
        match self.storage.append_rows(game_id, &buffer.rows) {
            Ok(()) => buffer.rows.clear(),
            Err(e) => {
                log::warn!(
                    "journal flush for game {} failed ({} rows kept): {}",
                    game_id,
                    buffer.rows.len(),
                    e
                );
            }
        }
    }

    fn flush_all(&mut self) {
        let ids: Vec<Uuid> = self.buffers.keys().copied().collect();
        for id in ids {
            self.flush_game(id);
        }
    }

    /// Terminal path: archive + aggregates for real games, discard for
    /// solo games.
    fn finish(&mut self, summary: &GameSummary) {
        self.buffers.remove(&summary.game_id);

        if summary.is_solo {
            self.storage.discard_journal(summary.game_id);
            log::debug!("solo game {} finished, not archived", summary.game_id);
            return;
        }

        if let Err(e) = self.storage.write_archive(summary) {
            log::error!("failed to archive game {}: {}", summary.game_id, e);
            return;
        }
        if let Err(e) = self.storage.update_player_stats(summary) {
            log::error!(
                "failed to update player stats for game {}: {}",
                summary.game_id,
                e
            );
        }
    }
}

impl Actor for Archiver {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        ctx.run_interval(FLUSH_INTERVAL, |act, _ctx| {
            act.flush_all();
        });
    }
}

impl Handler<RecordAction> for Archiver {
    type Result = ();

    fn handle(&mut self, msg: RecordAction, _ctx: &mut Context<Self>) {
        let game_id = msg.row.game_id;
        self.buffer_row(game_id, msg.is_solo, JournalRow::Action(msg.row));
    }
}

impl Handler<RecordEvent> for Archiver {
    type Result = ();

    fn handle(&mut self, msg: RecordEvent, _ctx: &mut Context<Self>) {
        self.buffer_row(
            msg.game_id,
            msg.is_solo,
            JournalRow::Event {
                game_id: msg.game_id,
                event: msg.event,
            },
        );
    }
}

impl Handler<GameFinished> for Archiver {
    type Result = ();

    fn handle(&mut self, msg: GameFinished, _ctx: &mut Context<Self>) {
        self.finish(&msg.summary);
        if let Some(ack) = msg.ack {
            ack.do_send(ArchiveDone {
                game_id: msg.summary.game_id,
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::GameEventType;

    fn temp_storage() -> (ArchiveStorage, PathBuf) {
        let dir = std::env::temp_dir().join(format!("banchess_test_{}", Uuid::new_v4()));
        (ArchiveStorage::new(&dir).unwrap(), dir)
    }

    fn sample_actions() -> Vec<Action> {
        vec![
            Action::new_ban("e2", "e4").unwrap(),
            Action::new_move("d2", "d4", None).unwrap(),
            Action::new_ban("g8", "f6").unwrap(),
            Action::new_move("d7", "d5", None).unwrap(),
        ]
    }

    fn sample_summary(is_solo: bool) -> GameSummary {
        let bcn: Vec<String> = sample_actions().iter().map(Action::to_bcn).collect();
        let game = BanChess::replay(&bcn).unwrap();
        GameSummary {
            game_id: Uuid::new_v4(),
            white_id: Some(Uuid::new_v4()),
            black_id: Some(Uuid::new_v4()),
            white_name: "alice".into(),
            black_name: "bob".into(),
            is_solo,
            result: "White wins by resignation".into(),
            reason: "resignation".into(),
            started_at_ms: 1_000,
            completed_at_ms: 2_000,
            time_control: Some(TimeControl {
                initial_sec: 300,
                increment_sec: 0,
            }),
            final_fen: game.fen(),
            actions: sample_actions(),
            events: vec![GameEvent {
                timestamp_ms: 1_500,
                kind: GameEventType::MoveMade,
                message: "d4".into(),
                player: Some(Color::White),
                metadata: None,
            }],
        }
    }

    #[test]
    fn test_action_encode_decode_roundtrip() {
        let actions = vec![
            Action::new_move("e2", "e4", None).unwrap(),
            Action::new_move("e7", "e8", Some('q')).unwrap(),
            Action::new_move("a7", "a8", Some('n')).unwrap(),
            Action::new_ban("h8", "a1").unwrap(),
            Action::new_ban("e2", "e4").unwrap(),
        ];
        for action in &actions {
            let decoded = decode_action(encode_action(action).unwrap()).unwrap();
            assert_eq!(*action, decoded, "roundtrip mismatch for {}", action);
        }
    }

    #[test]
    fn test_archive_roundtrip_and_replay_law() {
        let summary = sample_summary(false);
        let raw = serialize_archive(&summary).unwrap();
        let restored = deserialize_archive(&raw).unwrap();

        assert_eq!(restored.game_id, summary.game_id);
        assert_eq!(restored.white_id, summary.white_id);
        assert_eq!(restored.result, summary.result);
        assert_eq!(restored.final_fen, summary.final_fen);
        assert_eq!(restored.actions, summary.actions);
        assert_eq!(restored.events.len(), 1);
        assert_eq!(restored.banned_moves(), vec!["e2e4", "g8f6"]);

        // Replaying the archived history lands exactly on the stored FEN.
        let bcn: Vec<String> = restored.actions.iter().map(Action::to_bcn).collect();
        let replayed = BanChess::replay(&bcn).unwrap();
        assert_eq!(replayed.fen(), restored.final_fen);

        // And the rebuilt PGN carries the expected result tag.
        let pgn = restored.pgn().unwrap();
        assert!(pgn.contains("1-0"));
        assert!(pgn.contains("{ban: e2e4}"));
    }

    #[test]
    fn test_storage_archive_and_journal() {
        let (storage, dir) = temp_storage();
        let summary = sample_summary(false);

        let rows: Vec<JournalRow> = summary
            .actions
            .iter()
            .enumerate()
            .map(|(i, a)| {
                JournalRow::Action(ActionRow {
                    game_id: summary.game_id,
                    move_number: i as u32 / 2 + 1,
                    color: Color::White,
                    notation: a.to_bcn(),
                    san: None,
                    fen_after: String::new(),
                    is_ban: a.kind() == ActionKind::Ban,
                    timestamp_ms: 0,
                })
            })
            .collect();
        storage.append_rows(summary.game_id, &rows).unwrap();
        assert!(storage.active_dir.join(format!("{}.jsonl", summary.game_id)).exists());

        let size = storage.write_archive(&summary).unwrap();
        assert!(size > 0);
        // Journal removed, archive present.
        assert!(!storage.active_dir.join(format!("{}.jsonl", summary.game_id)).exists());
        assert_eq!(storage.list_archived().unwrap(), vec![summary.game_id]);

        let restored = storage.load_archive(summary.game_id).unwrap();
        assert_eq!(restored.final_fen, summary.final_fen);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_player_stats_update() {
        let (storage, dir) = temp_storage();
        let summary = sample_summary(false);
        storage.update_player_stats(&summary).unwrap();

        let stats = storage.player_stats().unwrap();
        let white = stats.get(&summary.white_id.unwrap()).unwrap();
        let black = stats.get(&summary.black_id.unwrap()).unwrap();
        assert_eq!((white.played, white.won, white.lost), (1, 1, 0));
        assert_eq!((black.played, black.won, black.lost), (1, 0, 1));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_solo_games_are_never_archived() {
        let (storage, dir) = temp_storage();
        let mut archiver = Archiver::new(storage);
        let summary = sample_summary(true);

        archiver.buffer_row(
            summary.game_id,
            true,
            JournalRow::Event {
                game_id: summary.game_id,
                event: summary.events[0].clone(),
            },
        );
        archiver.finish(&summary);

        assert!(archiver.storage.list_archived().unwrap().is_empty());
        assert!(archiver.storage.player_stats().unwrap().is_empty());

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_buffer_flushes_at_threshold() {
        let (storage, dir) = temp_storage();
        let mut archiver = Archiver::new(storage);
        let game_id = Uuid::new_v4();

        for i in 0..FLUSH_BUFFER_ROWS {
            archiver.buffer_row(
                game_id,
                false,
                JournalRow::Action(ActionRow {
                    game_id,
                    move_number: i as u32,
                    color: Color::White,
                    notation: "m:d2d4".into(),
                    san: Some("d4".into()),
                    fen_after: String::new(),
                    is_ban: false,
                    timestamp_ms: 0,
                }),
            );
        }

        // The size trigger flushed the buffer to the journal.
        assert!(archiver.buffers.get(&game_id).unwrap().rows.is_empty());
        let journal = archiver.storage.journal_path(game_id);
        let contents = fs::read_to_string(journal).unwrap();
        assert_eq!(contents.lines().count(), FLUSH_BUFFER_ROWS);

        let _ = fs::remove_dir_all(dir);
    }
}
