//! Human-readable game export from archive storage.
//!
//! Converts archived ban-chess games into readable text, PGN, or JSON
//! for post-game analysis and sharing. Bans appear in the move list and
//! as `{ban: ...}` comments in PGN.

use crate::archive::{ArchiveStorage, GameSummary};
use crate::notation::{Action, ActionKind};
use serde::Serialize;
use std::str::FromStr;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Export format
// ---------------------------------------------------------------------------

/// Output format for game exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// Human-readable text with the action list.
    Text,
    /// Portable Game Notation with ban comments.
    Pgn,
    /// Full game data as pretty-printed JSON.
    Json,
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "text" | "txt" => Ok(Self::Text),
            "pgn" => Ok(Self::Pgn),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown export format '{}'. Valid: text, pgn, json",
                s
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Timestamp formatting
// ---------------------------------------------------------------------------

/// Formats unix milliseconds into a UTC datetime string ("—" for 0).
fn format_timestamp(ms: u64) -> String {
    if ms == 0 {
        return "—".to_string();
    }
    let secs = ms / 1000;
    let days = secs / 86400;
    let time_of_day = secs % 86400;
    let hours = time_of_day / 3600;
    let minutes = (time_of_day % 3600) / 60;
    let seconds = time_of_day % 60;
    let (year, month, day) = days_to_date(days);
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02} UTC",
        year, month, day, hours, minutes, seconds
    )
}

/// Converts days since Unix epoch to (year, month, day).
fn days_to_date(days: u64) -> (u64, u64, u64) {
    // Algorithm from http://howardhinnant.github.io/date_algorithms.html
    let z = days + 719468;
    let era = z / 146097;
    let doe = z - era * 146097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    (y, m, d)
}

// ---------------------------------------------------------------------------
// Text format
// ---------------------------------------------------------------------------

/// Formats an archived game as human-readable text.
pub fn format_text(summary: &GameSummary) -> String {
    let mut out = String::new();

    out.push_str("=== BAN-CHESS GAME EXPORT ===\n\n");
    out.push_str(&format!("  Game ID:    {}\n", summary.game_id));
    out.push_str(&format!(
        "  White:      {}\n  Black:      {}\n",
        summary.white_name, summary.black_name
    ));
    out.push_str(&format!(
        "  Started:    {}\n",
        format_timestamp(summary.started_at_ms)
    ));
    out.push_str(&format!(
        "  Ended:      {}\n",
        format_timestamp(summary.completed_at_ms)
    ));
    if let Some(tc) = summary.time_control {
        out.push_str(&format!(
            "  Control:    {}+{}\n",
            tc.initial_sec, tc.increment_sec
        ));
    }
    out.push_str(&format!(
        "  Actions:    {} ({} moves, {} bans)\n",
        summary.actions.len(),
        summary.total_moves(),
        summary.total_bans()
    ));
    out.push_str(&format!(
        "  Result:     {} ({})\n",
        summary.result, summary.reason
    ));

    out.push_str("\n  Action list:\n");
    for (index, action) in summary.actions.iter().enumerate() {
        let label = match action.kind() {
            ActionKind::Move => "move",
            ActionKind::Ban => "ban ",
        };
        out.push_str(&format!(
            "    {:>3}. {} {}\n",
            index + 1,
            label,
            action.uci()
        ));
    }

    out.push_str(&format!("\n  Final position: {}\n", summary.final_fen));
    out
}

// ---------------------------------------------------------------------------
// JSON format
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonExport<'a> {
    game_id: Uuid,
    white: &'a str,
    black: &'a str,
    is_solo: bool,
    result: &'a str,
    reason: &'a str,
    started_at_ms: u64,
    completed_at_ms: u64,
    final_fen: &'a str,
    total_moves: u32,
    total_bans: u32,
    banned_moves: Vec<String>,
    actions: Vec<String>,
    events: &'a [crate::protocol::GameEvent],
}

/// Formats an archived game as pretty-printed JSON.
pub fn format_json(summary: &GameSummary) -> Result<String, String> {
    let export = JsonExport {
        game_id: summary.game_id,
        white: &summary.white_name,
        black: &summary.black_name,
        is_solo: summary.is_solo,
        result: &summary.result,
        reason: &summary.reason,
        started_at_ms: summary.started_at_ms,
        completed_at_ms: summary.completed_at_ms,
        final_fen: &summary.final_fen,
        total_moves: summary.total_moves(),
        total_bans: summary.total_bans(),
        banned_moves: summary.banned_moves(),
        actions: summary.actions.iter().map(Action::to_bcn).collect(),
        events: &summary.events,
    };
    serde_json::to_string_pretty(&export).map_err(|e| e.to_string())
}

// ---------------------------------------------------------------------------
// Export runner (CLI entry)
// ---------------------------------------------------------------------------

/// Runs the export subcommand against a storage directory.
pub fn run_export(
    data_dir: &str,
    format: ExportFormat,
    game_id: Option<&str>,
    list: bool,
    all: bool,
    output: Option<&str>,
) -> Result<(), String> {
    let storage = ArchiveStorage::new(data_dir).map_err(|e| e.to_string())?;

    if list {
        let ids = storage.list_archived().map_err(|e| e.to_string())?;
        println!("{} archived game(s):", ids.len());
        for id in ids {
            match storage.load_archive(id) {
                Ok(summary) => println!(
                    "  {}  {} vs {}  {} actions  {}",
                    id,
                    summary.white_name,
                    summary.black_name,
                    summary.actions.len(),
                    summary.result
                ),
                Err(e) => println!("  {}  (unreadable: {})", id, e),
            }
        }
        return Ok(());
    }

    let ids: Vec<Uuid> = if all {
        storage.list_archived().map_err(|e| e.to_string())?
    } else {
        let id_str = game_id.ok_or("Pass --game-id, --list, or --all")?;
        vec![Uuid::parse_str(id_str).map_err(|e| e.to_string())?]
    };

    let mut rendered = String::new();
    for id in ids {
        let summary = storage.load_archive(id).map_err(|e| e.to_string())?;
        let section = match format {
            ExportFormat::Text => format_text(&summary),
            ExportFormat::Pgn => summary.pgn().map_err(|e| e.to_string())?,
            ExportFormat::Json => format_json(&summary)?,
        };
        rendered.push_str(&section);
        rendered.push('\n');
    }

    match output {
        Some(path) => {
            std::fs::write(path, rendered.as_bytes()).map_err(|e| e.to_string())?;
            println!("Export written to {}", path);
        }
        None => print!("{}", rendered),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TimeControl;
    use crate::rules::BanChess;

    fn summary() -> GameSummary {
        let actions = vec![
            Action::new_ban("e2", "e4").unwrap(),
            Action::new_move("d2", "d4", None).unwrap(),
        ];
        let bcn: Vec<String> = actions.iter().map(Action::to_bcn).collect();
        let game = BanChess::replay(&bcn).unwrap();
        GameSummary {
            game_id: Uuid::new_v4(),
            white_id: Some(Uuid::new_v4()),
            black_id: Some(Uuid::new_v4()),
            white_name: "alice".into(),
            black_name: "bob".into(),
            is_solo: false,
            result: "Black wins by resignation".into(),
            reason: "resignation".into(),
            started_at_ms: 1_700_000_000_000,
            completed_at_ms: 1_700_000_600_000,
            time_control: Some(TimeControl {
                initial_sec: 300,
                increment_sec: 0,
            }),
            final_fen: game.fen(),
            actions,
            events: Vec::new(),
        }
    }

    #[test]
    fn test_format_text() {
        let text = format_text(&summary());
        assert!(text.contains("alice"));
        assert!(text.contains("ban  e2e4"));
        assert!(text.contains("move d2d4"));
        assert!(text.contains("Black wins by resignation"));
    }

    #[test]
    fn test_format_json_roundtrips() {
        let json = format_json(&summary()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["white"], "alice");
        assert_eq!(value["totalMoves"], 1);
        assert_eq!(value["totalBans"], 1);
        assert_eq!(value["bannedMoves"][0], "e2e4");
    }

    #[test]
    fn test_timestamp_formatting() {
        assert_eq!(format_timestamp(0), "—");
        // 2023-11-14 22:13:20 UTC
        assert_eq!(
            format_timestamp(1_700_000_000_000),
            "2023-11-14 22:13:20 UTC"
        );
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("pgn".parse::<ExportFormat>(), Ok(ExportFormat::Pgn));
        assert_eq!("TXT".parse::<ExportFormat>(), Ok(ExportFormat::Text));
        assert!("yaml".parse::<ExportFormat>().is_err());
    }
}
