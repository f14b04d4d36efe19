//! Chess-data tables consumed by the tokenizer.
//!
//! The piece-designator portion of the combined pattern is built from these
//! tables rather than from hard-coded character classes, so the lexer stays in
//! sync with the board model used by downstream evaluators. Only the naming
//! tables live here; ray geometry (squares between two squares) belongs to the
//! evaluator and is never consulted while parsing.

/// Piece-designator characters in CQL order: white pieces, black pieces,
/// `A` (any white piece), `a` (any black piece), `_` (empty square),
/// `.` (any piece or empty).
pub const PIECE_CHARS: &str = "KQRBNPkqrbnpAa_.";

/// File names, queenside to kingside.
pub const FILE_NAMES: &str = "abcdefgh";

/// Rank names, white's first rank upward.
pub const RANK_NAMES: &str = "12345678";
