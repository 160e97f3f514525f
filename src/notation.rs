//! Ban-chess notation: BCN half-actions and the extended FEN ban field.
//!
//! The canonical position encoding is a standard 6-field FEN extended with
//! a 7th field describing ban state:
//!
//! - `w:ban` / `b:ban` — that color must issue a ban next
//! - `w:<uci>` / `b:<uci>` — that color has issued this ban; the side to
//!   move must now move
//!
//! A half-action (one ban or one move) serializes to BCN:
//!
//! - `m:<from><to>[<promo>]` — a move, promotion piece in lowercase
//! - `b:<from><to>` — a ban
//!
//! An ordered sequence of BCN strings reconstructs the full game by replay
//! from the initial position.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The standard starting position with Black's opening ban pending.
pub const INITIAL_FEN: &str =
    "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1 b:ban";

// ---------------------------------------------------------------------------
// Color
// ---------------------------------------------------------------------------

/// The color (side) of a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    White,
    Black,
}

impl Color {
    /// Returns the opposite color.
    pub fn opponent(self) -> Color {
        match self {
            Color::White => Color::Black,
            Color::Black => Color::White,
        }
    }

    /// One-letter FEN-style tag ("w" or "b").
    pub fn tag(self) -> char {
        match self {
            Color::White => 'w',
            Color::Black => 'b',
        }
    }

    pub fn from_tag(c: char) -> Option<Color> {
        match c {
            'w' => Some(Color::White),
            'b' => Some(Color::Black),
            _ => None,
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Color::White => write!(f, "white"),
            Color::Black => write!(f, "black"),
        }
    }
}

impl From<shakmaty::Color> for Color {
    fn from(c: shakmaty::Color) -> Self {
        match c {
            shakmaty::Color::White => Color::White,
            shakmaty::Color::Black => Color::Black,
        }
    }
}

impl From<Color> for shakmaty::Color {
    fn from(c: Color) -> Self {
        match c {
            Color::White => shakmaty::Color::White,
            Color::Black => shakmaty::Color::Black,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures while parsing BCN or the extended FEN.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotationError {
    #[error("invalid square: {0}")]
    InvalidSquare(String),
    #[error("invalid promotion piece: {0}")]
    InvalidPromotion(char),
    #[error("malformed BCN action: {0}")]
    MalformedBcn(String),
    #[error("malformed ban field: {0}")]
    MalformedBanField(String),
    #[error("malformed FEN: {0}")]
    MalformedFen(String),
}

// ---------------------------------------------------------------------------
// Squares & UCI fragments
// ---------------------------------------------------------------------------

/// Returns `true` if `s` is a valid algebraic square name ("a1".."h8").
pub fn is_square(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() == 2 && (b'a'..=b'h').contains(&b[0]) && (b'1'..=b'8').contains(&b[1])
}

/// Flat index (0..64) of a square name, rank-major ("a1" = 0, "h8" = 63).
pub fn square_index(s: &str) -> Option<u8> {
    if !is_square(s) {
        return None;
    }
    let b = s.as_bytes();
    Some((b[1] - b'1') * 8 + (b[0] - b'a'))
}

/// Inverse of [`square_index`]. Panics if `index >= 64`.
pub fn square_name(index: u8) -> String {
    debug_assert!(index < 64, "square index out of bounds");
    let file = (b'a' + index % 8) as char;
    let rank = (b'1' + index / 8) as char;
    format!("{}{}", file, rank)
}

fn check_square(s: &str) -> Result<(), NotationError> {
    if is_square(s) {
        Ok(())
    } else {
        Err(NotationError::InvalidSquare(s.to_string()))
    }
}

fn check_promotion(c: char) -> Result<(), NotationError> {
    match c {
        'q' | 'r' | 'b' | 'n' => Ok(()),
        _ => Err(NotationError::InvalidPromotion(c)),
    }
}

// ---------------------------------------------------------------------------
// Half-actions (BCN)
// ---------------------------------------------------------------------------

/// The kind of a half-action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Move,
    Ban,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Move => write!(f, "move"),
            ActionKind::Ban => write!(f, "ban"),
        }
    }
}

/// A single half-action: one move or one ban.
///
/// Squares are stored as validated lowercase algebraic names. Bans carry no
/// promotion piece — a ban on `e7e8` covers every promotion choice of that
/// pawn move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Move {
        from: String,
        to: String,
        promotion: Option<char>,
    },
    Ban {
        from: String,
        to: String,
    },
}

impl Action {
    /// Builds a validated move action.
    pub fn new_move(from: &str, to: &str, promotion: Option<char>) -> Result<Self, NotationError> {
        check_square(from)?;
        check_square(to)?;
        if let Some(p) = promotion {
            check_promotion(p)?;
        }
        Ok(Action::Move {
            from: from.to_string(),
            to: to.to_string(),
            promotion,
        })
    }

    /// Builds a validated ban action.
    pub fn new_ban(from: &str, to: &str) -> Result<Self, NotationError> {
        check_square(from)?;
        check_square(to)?;
        Ok(Action::Ban {
            from: from.to_string(),
            to: to.to_string(),
        })
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Move { .. } => ActionKind::Move,
            Action::Ban { .. } => ActionKind::Ban,
        }
    }

    pub fn from_sq(&self) -> &str {
        match self {
            Action::Move { from, .. } | Action::Ban { from, .. } => from,
        }
    }

    pub fn to_sq(&self) -> &str {
        match self {
            Action::Move { to, .. } | Action::Ban { to, .. } => to,
        }
    }

    /// The bare UCI string (`e2e4`, `e7e8q`). Bans never carry a promotion.
    pub fn uci(&self) -> String {
        match self {
            Action::Move {
                from,
                to,
                promotion,
            } => match promotion {
                Some(p) => format!("{}{}{}", from, to, p),
                None => format!("{}{}", from, to),
            },
            Action::Ban { from, to } => format!("{}{}", from, to),
        }
    }

    /// Serializes the action to BCN (`m:e2e4`, `m:e7e8q`, `b:e2e4`).
    pub fn to_bcn(&self) -> String {
        match self.kind() {
            ActionKind::Move => format!("m:{}", self.uci()),
            ActionKind::Ban => format!("b:{}", self.uci()),
        }
    }

    /// Parses a BCN string back into an action.
    pub fn from_bcn(s: &str) -> Result<Action, NotationError> {
        let (kind, rest) = s
            .split_once(':')
            .ok_or_else(|| NotationError::MalformedBcn(s.to_string()))?;
        let (from, tail) = rest
            .split_at_checked(2)
            .ok_or_else(|| NotationError::MalformedBcn(s.to_string()))?;
        match kind {
            "m" => {
                let (to, promo) = match tail.len() {
                    2 => (tail, None),
                    3 => (&tail[..2], tail.chars().nth(2)),
                    _ => return Err(NotationError::MalformedBcn(s.to_string())),
                };
                Action::new_move(from, to, promo)
            }
            "b" => {
                if tail.len() != 2 {
                    return Err(NotationError::MalformedBcn(s.to_string()));
                }
                Action::new_ban(from, tail)
            }
            _ => Err(NotationError::MalformedBcn(s.to_string())),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_bcn())
    }
}

// ---------------------------------------------------------------------------
// Ban field (7th FEN field)
// ---------------------------------------------------------------------------

/// The ban state encoded in the 7th FEN field.
///
/// The color is the *banner* — always the opponent of the FEN side to move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BanField {
    /// That color must issue a ban next.
    PendingBan(Color),
    /// That color has banned this UCI move; the side to move must now move.
    Banned(Color, String),
}

impl BanField {
    /// Serializes to the FEN field form (`b:ban`, `w:e2e4`).
    pub fn encode(&self) -> String {
        match self {
            BanField::PendingBan(c) => format!("{}:ban", c.tag()),
            BanField::Banned(c, uci) => format!("{}:{}", c.tag(), uci),
        }
    }

    /// Parses a ban field string.
    pub fn decode(s: &str) -> Result<BanField, NotationError> {
        let (tag, rest) = s
            .split_once(':')
            .ok_or_else(|| NotationError::MalformedBanField(s.to_string()))?;
        let color = tag
            .chars()
            .next()
            .filter(|_| tag.len() == 1)
            .and_then(Color::from_tag)
            .ok_or_else(|| NotationError::MalformedBanField(s.to_string()))?;
        if rest == "ban" {
            return Ok(BanField::PendingBan(color));
        }
        if rest.len() == 4 && is_square(&rest[..2]) && is_square(&rest[2..]) {
            return Ok(BanField::Banned(color, rest.to_string()));
        }
        Err(NotationError::MalformedBanField(s.to_string()))
    }

    /// The color that owns the field (the banner).
    pub fn banner(&self) -> Color {
        match self {
            BanField::PendingBan(c) | BanField::Banned(c, _) => *c,
        }
    }

    /// What kind of half-action comes next.
    pub fn next_kind(&self) -> ActionKind {
        match self {
            BanField::PendingBan(_) => ActionKind::Ban,
            BanField::Banned(..) => ActionKind::Move,
        }
    }
}

// ---------------------------------------------------------------------------
// FEN decomposition
// ---------------------------------------------------------------------------

/// The seven fields of an extended FEN, split out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FenParts {
    pub position: String,
    pub side_to_move: Color,
    pub castling: String,
    pub ep_square: Option<String>,
    pub halfmove: u32,
    pub fullmove: u32,
    pub ban: BanField,
}

impl FenParts {
    /// The actor of the next half-action and its kind, derived purely from
    /// the FEN: the banner acts during a pending ban, the side to move acts
    /// once a ban has been issued.
    pub fn next_actor(&self) -> (Color, ActionKind) {
        match self.ban.next_kind() {
            ActionKind::Ban => (self.ban.banner(), ActionKind::Ban),
            ActionKind::Move => (self.side_to_move, ActionKind::Move),
        }
    }
}

/// Splits an extended FEN into its 6-field standard prefix and the ban
/// field. A plain 6-field FEN is accepted; the ban field then defaults to a
/// pending ban by the opponent of the side to move (every move is preceded
/// by a ban).
pub fn split_fen(fen: &str) -> Result<(String, BanField), NotationError> {
    let fields: Vec<&str> = fen.split_whitespace().collect();
    match fields.len() {
        6 => {
            let stm = side_to_move(fields[1])?;
            Ok((fields.join(" "), BanField::PendingBan(stm.opponent())))
        }
        7 => {
            let ban = BanField::decode(fields[6])?;
            Ok((fields[..6].join(" "), ban))
        }
        _ => Err(NotationError::MalformedFen(fen.to_string())),
    }
}

fn side_to_move(field: &str) -> Result<Color, NotationError> {
    field
        .chars()
        .next()
        .filter(|_| field.len() == 1)
        .and_then(Color::from_tag)
        .ok_or_else(|| NotationError::MalformedFen(field.to_string()))
}

/// Decomposes an extended (or plain 6-field) FEN into its parts.
pub fn decompose_fen(fen: &str) -> Result<FenParts, NotationError> {
    let (standard, ban) = split_fen(fen)?;
    let fields: Vec<&str> = standard.split_whitespace().collect();
    let stm = side_to_move(fields[1])?;
    let halfmove: u32 = fields[4]
        .parse()
        .map_err(|_| NotationError::MalformedFen(fen.to_string()))?;
    let fullmove: u32 = fields[5]
        .parse()
        .map_err(|_| NotationError::MalformedFen(fen.to_string()))?;
    Ok(FenParts {
        position: fields[0].to_string(),
        side_to_move: stm,
        castling: fields[2].to_string(),
        ep_square: match fields[3] {
            "-" => None,
            sq => Some(sq.to_string()),
        },
        halfmove,
        fullmove,
        ban,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bcn_roundtrip() {
        let actions = vec![
            Action::new_move("e2", "e4", None).unwrap(),
            Action::new_move("e7", "e8", Some('q')).unwrap(),
            Action::new_move("a7", "a8", Some('n')).unwrap(),
            Action::new_ban("g1", "f3").unwrap(),
            Action::new_ban("e2", "e4").unwrap(),
        ];
        for action in &actions {
            let bcn = action.to_bcn();
            let decoded = Action::from_bcn(&bcn).unwrap();
            assert_eq!(*action, decoded, "roundtrip mismatch for {}", bcn);
        }
    }

    #[test]
    fn test_bcn_rejects_malformed() {
        for bad in [
            "", "m:", "x:e2e4", "m:e2", "m:e2e9", "b:e7e8q", "me2e4", "m:e2e4qq",
        ] {
            assert!(Action::from_bcn(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_ban_promotion_rejected() {
        assert_eq!(
            Action::new_move("e7", "e8", Some('k')),
            Err(NotationError::InvalidPromotion('k'))
        );
    }

    #[test]
    fn test_ban_field_roundtrip() {
        for s in ["b:ban", "w:ban", "w:e2e4", "b:g8f6"] {
            let field = BanField::decode(s).unwrap();
            assert_eq!(field.encode(), s);
        }
        assert!(BanField::decode("w:e2e").is_err());
        assert!(BanField::decode("x:ban").is_err());
        assert!(BanField::decode("ban").is_err());
    }

    #[test]
    fn test_split_fen_seven_fields() {
        let (standard, ban) = split_fen(INITIAL_FEN).unwrap();
        assert_eq!(
            standard,
            "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1"
        );
        assert_eq!(ban, BanField::PendingBan(Color::Black));
    }

    #[test]
    fn test_split_fen_defaults_ban_field() {
        // 6-field FEN with Black to move: White is about to ban.
        let (_, ban) =
            split_fen("rnbqkbnr/pppppppp/8/8/3P4/8/PPP1PPPP/RNBQKBNR b KQkq - 0 1").unwrap();
        assert_eq!(ban, BanField::PendingBan(Color::White));
    }

    #[test]
    fn test_decompose_fen() {
        let parts =
            decompose_fen("rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq e3 12 34 b:e2e4")
                .unwrap();
        assert_eq!(parts.side_to_move, Color::White);
        assert_eq!(parts.castling, "KQkq");
        assert_eq!(parts.ep_square.as_deref(), Some("e3"));
        assert_eq!(parts.halfmove, 12);
        assert_eq!(parts.fullmove, 34);
        assert_eq!(parts.ban, BanField::Banned(Color::Black, "e2e4".into()));
    }

    #[test]
    fn test_next_actor_derivation() {
        // Opening: Black bans first.
        let parts = decompose_fen(INITIAL_FEN).unwrap();
        assert_eq!(parts.next_actor(), (Color::Black, ActionKind::Ban));

        // Black has banned; White moves.
        let parts =
            decompose_fen("rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1 b:e2e4")
                .unwrap();
        assert_eq!(parts.next_actor(), (Color::White, ActionKind::Move));

        // After White's move: White bans, Black will move.
        let parts =
            decompose_fen("rnbqkbnr/pppppppp/8/8/3P4/8/PPP1PPPP/RNBQKBNR b KQkq - 0 1 w:ban")
                .unwrap();
        assert_eq!(parts.next_actor(), (Color::White, ActionKind::Ban));
    }
}
