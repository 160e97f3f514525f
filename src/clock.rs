//! Per-game two-sided Fischer clock.
//!
//! The clock is a pure state machine over a monotonic time source; the
//! owning game room drives it (1 Hz tick, switch after each accepted
//! half-action) and turns `check_timeout` results into room messages, so
//! there are no callbacks and no shared mutable state.
//!
//! The running side is the side to move. A ban is issued on the mover's
//! clock and never credits increment; only a completed move does.

use crate::notation::Color;
use crate::protocol::{ClocksSnapshot, TimeControl, WireClock};
use std::time::Instant;

/// Milliseconds of wall clock, for client display only. All clock
/// arithmetic uses [`Instant`].
pub fn wall_now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A two-sided Fischer clock. One side runs at a time.
#[derive(Debug)]
pub struct GameClock {
    /// Remaining milliseconds, indexed white/black.
    remaining: [i64; 2],
    increment_ms: i64,
    /// The side whose clock is counting down, if any.
    running: Option<Color>,
    /// Monotonic instant of the last debit/credit.
    last_update: Instant,
    /// Wall-clock ms of the last debit/credit, for snapshots.
    last_update_wall_ms: u64,
    paused: bool,
    destroyed: bool,
}

fn idx(color: Color) -> usize {
    match color {
        Color::White => 0,
        Color::Black => 1,
    }
}

impl GameClock {
    pub fn new(control: TimeControl) -> Self {
        let initial_ms = (control.initial_sec * 1000) as i64;
        Self {
            remaining: [initial_ms, initial_ms],
            increment_ms: (control.increment_sec * 1000) as i64,
            running: None,
            last_update: Instant::now(),
            last_update_wall_ms: wall_now_ms(),
            paused: false,
            destroyed: false,
        }
    }

    /// Starts the clock running on `color` (the side to move).
    pub fn start(&mut self, color: Color, now: Instant) {
        if self.destroyed || self.running.is_some() {
            return;
        }
        self.running = Some(color);
        self.paused = false;
        self.touch(now);
    }

    /// Debits the running side for the elapsed interval.
    fn settle(&mut self, now: Instant) {
        if let Some(color) = self.running
            && !self.paused
        {
            let elapsed = now.saturating_duration_since(self.last_update).as_millis() as i64;
            self.remaining[idx(color)] -= elapsed;
        }
        self.touch(now);
    }

    fn touch(&mut self, now: Instant) {
        self.last_update = now;
        self.last_update_wall_ms = wall_now_ms();
    }

    /// Hands the clock to `next` after a completed half-action.
    ///
    /// The currently running side is debited for its elapsed time and,
    /// iff the half-action just completed was a move (`credit_increment`),
    /// credited the Fischer increment. Bans never credit.
    pub fn switch(&mut self, next: Color, credit_increment: bool, now: Instant) {
        if self.destroyed || self.running.is_none() {
            return;
        }
        self.settle(now);
        if credit_increment
            && let Some(color) = self.running
        {
            self.remaining[idx(color)] += self.increment_ms;
        }
        self.running = Some(next);
    }

    /// Credits `seconds` to `recipient`. Restrictions (opponent-only, no
    /// solo games, amount bounds) are enforced by the game room.
    pub fn give_time(&mut self, recipient: Color, seconds: u64) {
        if self.destroyed {
            return;
        }
        self.remaining[idx(recipient)] += (seconds * 1000) as i64;
    }

    /// Freezes the running side without losing whose turn it is.
    pub fn pause(&mut self, now: Instant) {
        if self.destroyed || self.paused {
            return;
        }
        self.settle(now);
        self.paused = true;
    }

    pub fn resume(&mut self, now: Instant) {
        if self.destroyed || !self.paused {
            return;
        }
        self.paused = false;
        self.touch(now);
    }

    /// Checks for a flag fall without mutating remaining time unless it
    /// crossed zero. Returns the loser at most once: the clock stops on
    /// the first flag.
    pub fn check_timeout(&mut self, now: Instant) -> Option<Color> {
        if self.destroyed || self.paused {
            return None;
        }
        let color = self.running?;
        let elapsed = now.saturating_duration_since(self.last_update).as_millis() as i64;
        if self.remaining[idx(color)] - elapsed > 0 {
            return None;
        }
        self.remaining[idx(color)] = 0;
        self.running = None;
        self.touch(now);
        Some(color)
    }

    /// A live view of both clocks. The running side's remaining reflects
    /// time elapsed since the last update; nothing is mutated.
    pub fn snapshot(&self, now: Instant) -> ClocksSnapshot {
        let live = |color: Color| {
            let mut ms = self.remaining[idx(color)];
            if self.running == Some(color) && !self.paused {
                ms -= now.saturating_duration_since(self.last_update).as_millis() as i64;
            }
            WireClock {
                remaining: ms.max(0),
                last_update: self.last_update_wall_ms,
            }
        };
        ClocksSnapshot {
            white: live(Color::White),
            black: live(Color::Black),
        }
    }

    /// Stops the clock for good. Idempotent; every later call on the
    /// clock fails silently.
    pub fn destroy(&mut self) {
        self.destroyed = true;
        self.running = None;
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
