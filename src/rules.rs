//! Rules engine adapter: ban-chess on top of the chess-rules library.
//!
//! Wraps a [`shakmaty::Chess`] position with the ban overlay: the 7th FEN
//! field, BCN action history, and ban-aware terminal detection. All
//! turn/actor derivations read the FEN state, never cached flags, so the
//! room and the rules can never drift apart.
//!
//! ## Immediate checkmate
//!
//! Terminal detection also fires when the *pending* action is a ban but
//! the side to move has no real escape: with zero legal moves the position
//! is mate (or stalemate) outright; with exactly one legal move while in
//! check, the banner would ban that escape, so the game is declared
//! checkmate before any ban is submitted. A single legal move without
//! check is not an early stalemate — the banner may prefer to leave it.

use crate::notation::{self, Action, ActionKind, BanField, Color, INITIAL_FEN};
use shakmaty::fen::Fen;
use shakmaty::san::San;
use shakmaty::uci::UciMove;
use shakmaty::{CastlingMode, Chess, EnPassantMode, Position};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors & outcomes
// ---------------------------------------------------------------------------

/// Failures surfaced by the rules adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RulesError {
    #[error("invalid position: {0}")]
    InvalidPosition(String),
    #[error("replay failed at action {index}: {reason}")]
    Replay { index: usize, reason: String },
    #[error("{0}")]
    Illegal(String),
}

/// Why a game reached a rules-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    Checkmate,
    Stalemate,
    Insufficient,
    FiftyMove,
    Repetition,
}

impl TerminalKind {
    /// Short reason tag used in events and archives.
    pub fn reason(&self) -> &'static str {
        match self {
            TerminalKind::Checkmate => "checkmate",
            TerminalKind::Stalemate => "stalemate",
            TerminalKind::Insufficient => "insufficient material",
            TerminalKind::FiftyMove => "fifty-move rule",
            TerminalKind::Repetition => "threefold repetition",
        }
    }
}

/// A rules-terminal state; `loser` is set for checkmate only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Terminal {
    pub kind: TerminalKind,
    pub loser: Option<Color>,
}

impl Terminal {
    /// Human-readable result string ("White wins by checkmate", "Draw by
    /// stalemate", ...).
    pub fn result_string(&self) -> String {
        match self.loser {
            Some(loser) => format!("{} wins by {}", cap(loser.opponent()), self.kind.reason()),
            None => format!("Draw by {}", self.kind.reason()),
        }
    }
}

fn cap(c: Color) -> &'static str {
    match c {
        Color::White => "White",
        Color::Black => "Black",
    }
}

/// The result of applying one half-action.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    /// SAN for moves; absent for bans.
    pub san: Option<String>,
    /// The extended FEN after the action.
    pub fen_after: String,
    /// Set when the action ended the game.
    pub terminal: Option<Terminal>,
}

// ---------------------------------------------------------------------------
// BanChess
// ---------------------------------------------------------------------------

/// One ban-chess game: position, ban state, and full action history.
#[derive(Debug, Clone)]
pub struct BanChess {
    pos: Chess,
    ban: BanField,
    history: Vec<Action>,
    /// SAN strings, parallel to `history` (None for bans).
    sans: Vec<Option<String>>,
    /// Position keys (first four FEN fields) seen since the start, for
    /// repetition counting.
    seen_positions: Vec<String>,
}

impl Default for BanChess {
    fn default() -> Self {
        Self::new()
    }
}

impl BanChess {
    /// A fresh game from the standard starting position, Black's opening
    /// ban pending.
    pub fn new() -> Self {
        Self::from_fen(INITIAL_FEN).expect("initial position is valid")
    }

    /// Parses an extended (or plain 6-field) FEN into a game with empty
    /// history.
    pub fn from_fen(fen: &str) -> Result<Self, RulesError> {
        let (standard, ban) =
            notation::split_fen(fen).map_err(|e| RulesError::InvalidPosition(e.to_string()))?;
        let setup = Fen::from_ascii(standard.as_bytes())
            .map_err(|e| RulesError::InvalidPosition(e.to_string()))?;
        let pos: Chess = setup
            .into_position(CastlingMode::Standard)
            .map_err(|e| RulesError::InvalidPosition(e.to_string()))?;
        let stm: Color = pos.turn().into();
        if ban.banner() == stm {
            return Err(RulesError::InvalidPosition(format!(
                "ban field owner {} cannot be the side to move",
                ban.banner()
            )));
        }
        let key = position_key(&standard);
        Ok(Self {
            pos,
            ban,
            history: Vec::new(),
            sans: Vec::new(),
            seen_positions: vec![key],
        })
    }

    /// Rebuilds a game by replaying a BCN history from the initial
    /// position.
    pub fn replay(history: &[String]) -> Result<Self, RulesError> {
        let mut game = Self::new();
        for (index, bcn) in history.iter().enumerate() {
            let action = Action::from_bcn(bcn).map_err(|e| RulesError::Replay {
                index,
                reason: e.to_string(),
            })?;
            game.apply(&action).map_err(|e| RulesError::Replay {
                index,
                reason: e.to_string(),
            })?;
        }
        Ok(game)
    }

    /// The extended FEN for the current state.
    pub fn fen(&self) -> String {
        format!("{} {}", self.standard_fen(), self.ban.encode())
    }

    fn standard_fen(&self) -> String {
        Fen::from_position(self.pos.clone(), EnPassantMode::Legal).to_string()
    }

    /// The side to move (the mover of the current ban/move pair).
    pub fn turn(&self) -> Color {
        self.pos.turn().into()
    }

    /// Whether the side to move is in check.
    pub fn in_check(&self) -> bool {
        self.pos.is_check()
    }

    /// The actor of the next half-action and its kind, derived from the
    /// ban state: the banner acts while a ban is pending, the mover once
    /// the ban is issued.
    pub fn next_actor(&self) -> (Color, ActionKind) {
        match self.ban.next_kind() {
            ActionKind::Ban => (self.ban.banner(), ActionKind::Ban),
            ActionKind::Move => (self.turn(), ActionKind::Move),
        }
    }

    /// Legal half-actions for the current state as UCI strings.
    ///
    /// During a ban phase the list is the mover's legal moves (the banner
    /// picks one to forbid); during a move phase it is the mover's legal
    /// moves minus the banned one.
    pub fn legal_actions(&self) -> (ActionKind, Vec<String>) {
        match &self.ban {
            BanField::PendingBan(_) => (ActionKind::Ban, self.legal_ucis()),
            BanField::Banned(_, banned) => (
                ActionKind::Move,
                self.legal_ucis()
                    .into_iter()
                    .filter(|uci| uci[..4] != banned[..4])
                    .collect(),
            ),
        }
    }

    fn legal_ucis(&self) -> Vec<String> {
        self.pos
            .legal_moves()
            .iter()
            .map(|m| m.to_uci(CastlingMode::Standard).to_string())
            .collect()
    }

    /// Whether the game is over in the rules sense (checkmate, stalemate,
    /// or an automatic draw). Resignation and timeout are decided above
    /// the rules layer.
    pub fn game_over(&self) -> bool {
        self.terminal_state().is_some()
    }

    /// Computes the terminal state of the current position, if any.
    pub fn terminal_state(&self) -> Option<Terminal> {
        if let Some(t) = self.mate_or_stalemate() {
            return Some(t);
        }
        if self.pos.is_insufficient_material() {
            return Some(Terminal {
                kind: TerminalKind::Insufficient,
                loser: None,
            });
        }
        if self.repetition_count() >= 3 {
            return Some(Terminal {
                kind: TerminalKind::Repetition,
                loser: None,
            });
        }
        if self.pos.halfmoves() >= 100 {
            return Some(Terminal {
                kind: TerminalKind::FiftyMove,
                loser: None,
            });
        }
        None
    }

    /// Mate/stalemate detection aware of the pending half-action.
    fn mate_or_stalemate(&self) -> Option<Terminal> {
        let mover = self.turn();
        let in_check = self.pos.is_check();
        let mate = Terminal {
            kind: TerminalKind::Checkmate,
            loser: Some(mover),
        };
        let stalemate = Terminal {
            kind: TerminalKind::Stalemate,
            loser: None,
        };
        match &self.ban {
            // Ban pending: in check with at most one escape, the coming
            // ban seals the game, so it ends before the ban is submitted.
            // A single quiet move is not early stalemate: the banner may
            // prefer to leave it.
            BanField::PendingBan(_) => {
                let n = self.pos.legal_moves().len();
                if in_check && n <= 1 {
                    Some(mate)
                } else if !in_check && n == 0 {
                    Some(stalemate)
                } else {
                    None
                }
            }
            // Ban issued: the mover is out of moves once the banned one is
            // excluded.
            BanField::Banned(_, banned) => {
                let remaining = self
                    .legal_ucis()
                    .iter()
                    .filter(|uci| uci[..4] != banned[..4])
                    .count();
                if remaining > 0 {
                    None
                } else if in_check {
                    Some(mate)
                } else {
                    Some(stalemate)
                }
            }
        }
    }

    fn repetition_count(&self) -> usize {
        match self.seen_positions.last() {
            Some(current) => self
                .seen_positions
                .iter()
                .filter(|p| *p == current)
                .count(),
            None => 0,
        }
    }

    /// Applies one half-action, enforcing the ban/move cycle, ban
    /// legality, and terminal detection.
    pub fn apply(&mut self, action: &Action) -> Result<ApplyOutcome, RulesError> {
        if self.game_over() {
            return Err(RulesError::Illegal("game is already over".into()));
        }
        let (_, expected) = self.next_actor();
        if action.kind() != expected {
            return Err(RulesError::Illegal(format!(
                "expected a {}, got a {}",
                expected,
                action.kind()
            )));
        }
        match action {
            Action::Ban { .. } => self.apply_ban(action),
            Action::Move { .. } => self.apply_move(action),
        }
    }

    fn apply_ban(&mut self, action: &Action) -> Result<ApplyOutcome, RulesError> {
        let uci = action.uci();
        let target_exists = self
            .legal_ucis()
            .iter()
            .any(|candidate| candidate[..4] == uci[..4]);
        if !target_exists {
            return Err(RulesError::Illegal(format!(
                "{} is not a legal move to ban",
                uci
            )));
        }

        self.ban = BanField::Banned(self.ban.banner(), uci);
        self.history.push(action.clone());
        self.sans.push(None);

        Ok(ApplyOutcome {
            san: None,
            fen_after: self.fen(),
            terminal: self.mate_or_stalemate(),
        })
    }

    fn apply_move(&mut self, action: &Action) -> Result<ApplyOutcome, RulesError> {
        if let BanField::Banned(_, banned) = &self.ban
            && action.uci()[..4] == banned[..4]
        {
            return Err(RulesError::Illegal(format!("{} is banned", banned)));
        }

        let uci: UciMove = action
            .uci()
            .parse()
            .map_err(|_| RulesError::Illegal(format!("unparseable move {}", action.uci())))?;
        let m = uci
            .to_move(&self.pos)
            .map_err(|_| RulesError::Illegal(format!("illegal move {}", action.uci())))?;
        let san = San::from_move(&self.pos, &m).to_string();

        self.pos = self
            .pos
            .clone()
            .play(&m)
            .map_err(|_| RulesError::Illegal(format!("illegal move {}", action.uci())))?;

        // The player who just moved becomes the next banner.
        self.ban = BanField::PendingBan(self.turn().opponent());
        self.history.push(action.clone());
        self.sans.push(Some(san.clone()));
        self.seen_positions.push(position_key(&self.standard_fen()));

        Ok(ApplyOutcome {
            san: Some(san),
            fen_after: self.fen(),
            terminal: self.terminal_state(),
        })
    }

    // -----------------------------------------------------------------------
    // History accessors
    // -----------------------------------------------------------------------

    /// The full action history in BCN order.
    pub fn action_history(&self) -> Vec<String> {
        self.history.iter().map(Action::to_bcn).collect()
    }

    pub fn last_action(&self) -> Option<&Action> {
        self.history.last()
    }

    /// Number of *moves* played (bans excluded).
    pub fn move_count(&self) -> u32 {
        self.history
            .iter()
            .filter(|a| a.kind() == ActionKind::Move)
            .count() as u32
    }

    /// Every banned move so far, as UCI strings.
    pub fn banned_moves(&self) -> Vec<String> {
        self.history
            .iter()
            .filter(|a| a.kind() == ActionKind::Ban)
            .map(Action::uci)
            .collect()
    }

    /// The current full-move number.
    pub fn fullmove_number(&self) -> u32 {
        u32::from(self.pos.fullmoves())
    }

    /// Rebuilds a PGN rendering of the game. Bans appear as comments
    /// before the move they constrained.
    pub fn pgn(&self, white: &str, black: &str, result_tag: &str) -> String {
        let mut out = String::new();
        out.push_str(&format!("[Event \"Ban chess\"]\n[White \"{}\"]\n", white));
        out.push_str(&format!("[Black \"{}\"]\n", black));
        out.push_str(&format!("[Result \"{}\"]\n\n", result_tag));

        let mut move_index = 0u32;
        for (action, san) in self.history.iter().zip(&self.sans) {
            match (action.kind(), san) {
                (ActionKind::Ban, _) => {
                    out.push_str(&format!("{{ban: {}}} ", action.uci()));
                }
                (ActionKind::Move, Some(san)) => {
                    if move_index % 2 == 0 {
                        out.push_str(&format!("{}. ", move_index / 2 + 1));
                    }
                    out.push_str(san);
                    out.push(' ');
                    move_index += 1;
                }
                (ActionKind::Move, None) => {}
            }
        }
        out.push_str(result_tag);
        out.push('\n');
        out
    }
}

/// The repetition key of a position: the first four FEN fields (board,
/// side to move, castling, en passant).
fn position_key(standard_fen: &str) -> String {
    standard_fen
        .split_whitespace()
        .take(4)
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
