//! The CQL grammar table.
//!
//! Every keyword and operator the language recognizes is described by a
//! [`TokenDef`]: its surface pattern, precedence, grammar-behavior flags, and
//! the filter-type categories it produces and accepts. The definitions live in
//! an arena with stable [`DefId`] indices; a *variant* is a re-typed clone of a
//! base definition (same precedence, no pattern of its own) that the parser
//! swaps in once context resolves an overloaded construct, e.g. `=` becoming
//! the set-assignment once the right operand is known to be a set.
//!
//! The table is built once by [`Grammar::new`] together with the combined scan
//! pattern, and is immutable afterwards. Ordering of the scannable definitions
//! matters: multi-word phrases (`movenumber 5 10`, `piece x in`) are listed
//! ahead of bare keywords and identifiers so the regex engine's leftmost-first
//! alternation prefers them.

use std::collections::HashMap;
use std::fmt;

use regex::Regex;
use serde::Serialize;

use crate::board;

/// Filter-type categories a completed filter can produce or accept.
///
/// `MoveParam`, `LineParam`, `Direction` and `HeaderParam` are pseudo-types:
/// they never type a standalone filter, only restrict which parent a
/// parameter token may attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FilterType {
    Logical,
    Numeric,
    Position,
    Set,
    MoveParam,
    LineParam,
    Direction,
    HeaderParam,
}

impl FilterType {
    /// Human-readable category name for error messages.
    pub fn describe(self) -> &'static str {
        match self {
            FilterType::Logical => "logical",
            FilterType::Numeric => "numeric",
            FilterType::Position => "position",
            FilterType::Set => "set",
            FilterType::MoveParam => "move parameter",
            FilterType::LineParam => "line parameter",
            FilterType::Direction => "direction",
            FilterType::HeaderParam => "statement parameter",
        }
    }

    fn bit(self) -> u8 {
        match self {
            FilterType::Logical => 1,
            FilterType::Numeric => 1 << 1,
            FilterType::Position => 1 << 2,
            FilterType::Set => 1 << 3,
            FilterType::MoveParam => 1 << 4,
            FilterType::LineParam => 1 << 5,
            FilterType::Direction => 1 << 6,
            FilterType::HeaderParam => 1 << 7,
        }
    }
}

/// A small set of [`FilterType`] tags.
///
/// A filter's produced type is a set until context narrows it to exactly one
/// member. A required set containing `Logical` is satisfied by any category,
/// because every CQL filter may be used as a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeSet(u8);

impl TypeSet {
    pub const EMPTY: TypeSet = TypeSet(0);
    pub const LOGICAL: TypeSet = TypeSet(1);
    pub const NUMERIC: TypeSet = TypeSet(1 << 1);
    pub const POSITION: TypeSet = TypeSet(1 << 2);
    pub const SET: TypeSet = TypeSet(1 << 3);
    pub const MOVE_PARAM: TypeSet = TypeSet(1 << 4);
    pub const LINE_PARAM: TypeSet = TypeSet(1 << 5);
    pub const DIRECTION: TypeSet = TypeSet(1 << 6);
    pub const HEADER_PARAM: TypeSet = TypeSet(1 << 7);

    /// The four real filter categories.
    pub const ANY: TypeSet = TypeSet(0b1111);

    pub const fn union(self, other: TypeSet) -> TypeSet {
        TypeSet(self.0 | other.0)
    }

    pub const fn intersect(self, other: TypeSet) -> TypeSet {
        TypeSet(self.0 & other.0)
    }

    pub fn contains(self, ty: FilterType) -> bool {
        self.0 & ty.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The single member, if the set has been narrowed to exactly one.
    pub fn single(self) -> Option<FilterType> {
        let all = [
            FilterType::Logical,
            FilterType::Numeric,
            FilterType::Position,
            FilterType::Set,
            FilterType::MoveParam,
            FilterType::LineParam,
            FilterType::Direction,
            FilterType::HeaderParam,
        ];
        let mut found = None;
        for ty in all {
            if self.contains(ty) {
                if found.is_some() {
                    return None;
                }
                found = Some(ty);
            }
        }
        found
    }

    /// True if a filter of this (possibly unnarrowed) type can stand where
    /// `required` is expected. Anything satisfies a logical requirement.
    pub fn satisfies(self, required: TypeSet) -> bool {
        required.contains(FilterType::Logical) || !self.intersect(required).is_empty()
    }

    /// Names of the real categories in the set, for error messages.
    pub fn describe(self) -> String {
        let mut names = vec![];
        for ty in [
            FilterType::Logical,
            FilterType::Numeric,
            FilterType::Position,
            FilterType::Set,
        ] {
            if self.contains(ty) {
                names.push(ty.describe());
            }
        }
        names.join(" or ")
    }
}

impl std::ops::BitOr for TypeSet {
    type Output = TypeSet;
    fn bitor(self, rhs: TypeSet) -> TypeSet {
        self.union(rhs)
    }
}

impl From<FilterType> for TypeSet {
    fn from(ty: FilterType) -> TypeSet {
        TypeSet(ty.bit())
    }
}

/// Grammar-behavior switches carried by token definitions.
///
/// The parser interprets these generically instead of hard-coding one branch
/// per keyword; most of the core loop dispatches on flags and [`Kind`] alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags(u16);

impl Flags {
    pub const NONE: Flags = Flags(0);
    /// Syntactically complete with zero children; legal atop the stack when
    /// input runs out.
    pub const LEAF: Flags = Flags(1);
    /// Only completes when its paired closing bracket is seen.
    pub const PAREN_CLOSE: Flags = Flags(1 << 1);
    /// Children form a bracketed argument list rather than a single operand.
    pub const ARG_LIST: Flags = Flags(1 << 2);
    /// Parameter token that introduces an argument filter of its own.
    pub const TRAILING_ARG: Flags = Flags(1 << 3);
    /// Infix operator; precedence climbing applies.
    pub const INFIX: Flags = Flags(1 << 4);
    /// Prefix operator taking one trailing operand.
    pub const PREFIX_OP: Flags = Flags(1 << 5);
    /// Numeric construct a leading `-` may negate.
    pub const UNARY_MINUS_OK: Flags = Flags(1 << 6);
    /// Once on top of the stack no further sibling parameters collapse past it.
    pub const HALT: Flags = Flags(1 << 7);
    /// May be followed by a one- or two-number range.
    pub const RANGE: Flags = Flags(1 << 8);
    /// The `cql(…)` statement frame.
    pub const FRAME_STATEMENT: Flags = Flags(1 << 9);
    /// The `line` frame with arrow-separated constituents.
    pub const FRAME_LINE: Flags = Flags(1 << 10);
    /// The `if`/`then`/`else` frame.
    pub const FRAME_IF: Flags = Flags(1 << 11);

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;
    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

/// Structural dispatch class of a definition.
///
/// The parser's main loop matches on this tag (keyed by the definition's
/// identity, not its spelling) to decide how a token participates in the
/// stack machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Kind {
    /// `cql(` — the statement frame that roots every parse.
    Statement,
    LParen,
    RParen,
    LBrace,
    RBrace,
    If,
    Then,
    Else,
    Line,
    /// `-->` / `<--` constituent separators inside `line`.
    Arrow,
    Move,
    Pin,
    Find,
    Ray,
    /// `consecutivemoves … (v1 v2)`, scanned as one phrase.
    ConsecutiveMoves,
    /// Call-style filters such as `between(` and `makesquare(`.
    CallParen,
    /// Generic infix operator.
    Infix,
    /// `=`, which both assigns and declares variables.
    Assign,
    /// `-`, disambiguated to binary subtraction or unary negation.
    Minus,
    /// Prefix operator with one trailing operand (`not`, `rank`, `sort`, …).
    PrefixOp,
    /// Keyword leaf filter (`wtm`, `check`, `player "…"`, …).
    LeafKeyword,
    /// Numeric leaf that may carry an in-pattern range (`movenumber 5 10`).
    NumericLeaf,
    PieceDesignator,
    Number,
    StringLit,
    /// `,` between parenthesized argument-list arguments.
    Separator,
    Variable,
    /// `persistent NAME` phrase.
    Persistent,
    /// `function NAME(` definition header.
    Function,
    /// `piece x in` iteration phrase.
    PieceIn,
    /// `square x in` iteration phrase.
    SquareIn,
    /// Named parameter of a filter family (`legal`, `from`, `up`, …).
    Param,
    /// Parameter legal only inside the `cql(…)` header.
    HeaderParam,
    /// `result 1-0` — header parameter or body leaf depending on position.
    Result,
    Comment,
    Unrecognized,
    /// Synthesized unary negation (no pattern of its own).
    UnaryMinus,
    /// Synthesized function-call node (no pattern of its own).
    FunctionCall,
}

/// Stable index of a definition in the grammar arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DefId(pub u16);

/// One recognized keyword or operator.
pub struct TokenDef {
    pub name: &'static str,
    /// Variant tag when this definition is a re-typed clone of a base entry.
    pub variant: Option<&'static str>,
    pub kind: Kind,
    /// Higher binds tighter. Zero for non-operators.
    pub precedence: u8,
    pub flags: Flags,
    /// Categories the completed filter can be used as.
    pub returns: TypeSet,
    /// Categories the filter accepts as its argument(s).
    pub accepts: TypeSet,
    pub min_args: u8,
    pub max_args: Option<u8>,
    /// Surface pattern; `None` for variants and synthesized kinds.
    pattern: Option<String>,
}

impl TokenDef {
    pub fn is(&self, flag: Flags) -> bool {
        self.flags.contains(flag)
    }

    /// Display name for error messages: `eq/set` for variants.
    pub fn display_name(&self) -> String {
        match self.variant {
            Some(v) => format!("{}/{}", self.name, v),
            None => self.name.to_string(),
        }
    }
}

impl fmt::Debug for TokenDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenDef")
            .field("name", &self.name)
            .field("variant", &self.variant)
            .field("kind", &self.kind)
            .field("precedence", &self.precedence)
            .finish()
    }
}

// Precedence ladder, loosest to tightest.
pub const PREC_NONE: u8 = 0;
pub const PREC_SORT: u8 = 2;
pub const PREC_ASSIGN: u8 = 4;
pub const PREC_OR: u8 = 10;
pub const PREC_AND: u8 = 20;
pub const PREC_NOT: u8 = 30;
pub const PREC_RELATION: u8 = 40;
pub const PREC_IN: u8 = 50;
pub const PREC_UNION: u8 = 60;
pub const PREC_INTERSECT: u8 = 70;
pub const PREC_ADD: u8 = 80;
pub const PREC_MUL: u8 = 90;
pub const PREC_UNARY: u8 = 100;

const IDENT: &str = r"[a-zA-Z_][a-zA-Z0-9_]*";

/// The immutable grammar: definition arena, variant lookup, and the combined
/// scan pattern.
pub struct Grammar {
    defs: Vec<TokenDef>,
    by_name: HashMap<&'static str, DefId>,
    variants: HashMap<(u16, &'static str), DefId>,
    scan_order: Vec<DefId>,
    group_names: Vec<String>,
    pattern: Regex,
}

impl Grammar {
    /// Build the full CQL grammar table and its combined pattern.
    pub fn new() -> Grammar {
        let mut b = Builder::default();

        let l = TypeSet::LOGICAL;
        let n = TypeSet::NUMERIC;
        let p = TypeSet::POSITION;
        let s = TypeSet::SET;
        let any = TypeSet::ANY;

        // Comments are scanned and dropped before the parser sees them.
        b.def("comment", Kind::Comment)
            .pattern(";[^\n]*".to_string())
            .add();

        // The statement frame. Must be first in every statement; stays rooted
        // after its parameter list closes.
        b.def("cql", Kind::Statement)
            .pattern(r"cql\s*\(".to_string())
            .flags(Flags::FRAME_STATEMENT | Flags::PAREN_CLOSE)
            .returns(l)
            .accepts(any)
            .args(0, None)
            .add();

        // Header parameters, legal only inside `cql(…)`.
        for (name, pat) in [
            ("input", r"input\s+\S+\.pgn"),
            ("output", r"output\s+\S+\.pgn"),
            ("matchcount", r"matchcount(?:\s+\d+){1,2}\b"),
            ("sort matchcount", r"sort\s+matchcount\b"),
            ("matchstring", "matchstring\\s+\"[^\"]*\""),
        ] {
            b.def(name, Kind::HeaderParam)
                .pattern(pat.to_string())
                .returns(TypeSet::HEADER_PARAM)
                .add();
        }
        for name in ["silent", "quiet", "variations"] {
            b.def(name, Kind::HeaderParam)
                .pattern(format!(r"{name}\b"))
                .returns(TypeSet::HEADER_PARAM)
                .add();
        }
        // `result` doubles as a body filter: `cql(result 1-0)` vs `not result 1-0`.
        b.def("result", Kind::Result)
            .pattern(r"result\s+(?:1-0|0-1|1/2-1/2)".to_string())
            .flags(Flags::LEAF)
            .returns(l | TypeSet::HEADER_PARAM)
            .add();

        // Function and variable phrases; embedded names are recovered from the
        // matched text.
        b.def("function", Kind::Function)
            .pattern(format!(r"function\s+{IDENT}\s*\("))
            .add();
        b.def("persistent", Kind::Persistent)
            .pattern(format!(r"persistent\s+{IDENT}\b"))
            .flags(Flags::LEAF | Flags::UNARY_MINUS_OK)
            .returns(n)
            .add();
        b.def("piece in", Kind::PieceIn)
            .pattern(format!(r"piece\s+(?:all\s+)?{IDENT}\s+in\b"))
            .returns(l)
            .accepts(s | l)
            .args(2, Some(2))
            .add();
        b.def("square in", Kind::SquareIn)
            .pattern(format!(r"square\s+(?:all\s+)?{IDENT}\s+in\b"))
            .returns(l)
            .accepts(s | l)
            .args(2, Some(2))
            .add();
        b.def("consecutivemoves", Kind::ConsecutiveMoves)
            .pattern(format!(
                r"consecutivemoves(?:\s+\d+){{0,2}}\s*\(\s*{IDENT}\s+{IDENT}\s*\)"
            ))
            .flags(Flags::LEAF | Flags::RANGE | Flags::UNARY_MINUS_OK)
            .returns(n)
            .add();

        // Numeric leaves. The in-pattern range makes `movenumber 5 10` one
        // token; the range re-types the leaf to its logical variant.
        for name in ["movenumber", "year", "elo", "gamenumber"] {
            let id = b
                .def(name, Kind::NumericLeaf)
                .pattern(format!(r"{name}(?:\s+\d+){{0,2}}\b"))
                .flags(Flags::LEAF | Flags::RANGE | Flags::UNARY_MINUS_OK)
                .returns(n)
                .add();
            b.variant(id, "range").returns(l).add();
        }
        b.def("ply", Kind::NumericLeaf)
            .pattern(r"ply\b".to_string())
            .flags(Flags::LEAF | Flags::UNARY_MINUS_OK)
            .returns(n)
            .add();

        // Logical and position leaves.
        for name in [
            "wtm",
            "btm",
            "check",
            "mate",
            "stalemate",
            "terminal",
            "initial",
            "variation",
            "mainline",
            "true",
            "false",
        ] {
            b.def(name, Kind::LeafKeyword)
                .pattern(format!(r"{name}\b"))
                .flags(Flags::LEAF)
                .returns(l)
                .add();
        }
        for name in ["currentposition", "parent"] {
            b.def(name, Kind::LeafKeyword)
                .pattern(format!(r"{name}\b"))
                .flags(Flags::LEAF)
                .returns(p)
                .add();
        }
        // Tag leaves with an embedded quoted string.
        for name in ["player", "event", "site", "hascomment"] {
            b.def(name, Kind::LeafKeyword)
                .pattern(format!("{name}(?:\\s+(?:white|black))?\\s+\"[^\"]*\""))
                .flags(Flags::LEAF)
                .returns(l)
                .add();
        }

        // Frames.
        b.def("if", Kind::If)
            .pattern(r"if\b".to_string())
            .flags(Flags::FRAME_IF)
            .returns(any)
            .accepts(any)
            .args(2, Some(3))
            .add();
        b.def("then", Kind::Then).pattern(r"then\b".to_string()).add();
        b.def("else", Kind::Else).pattern(r"else\b".to_string()).add();

        b.def("line", Kind::Line)
            .pattern(r"line\b".to_string())
            .flags(Flags::FRAME_LINE | Flags::RANGE | Flags::HALT)
            .returns(n)
            .accepts(any)
            .args(1, None)
            .add();
        b.def("-->", Kind::Arrow)
            .pattern(r"-->".to_string())
            .returns(TypeSet::LINE_PARAM)
            .add();
        b.def("<--", Kind::Arrow)
            .pattern(r"<--".to_string())
            .returns(TypeSet::LINE_PARAM)
            .add();

        let move_id = b
            .def("move", Kind::Move)
            .pattern(r"move\b".to_string())
            .flags(Flags::LEAF | Flags::HALT)
            .returns(l)
            .add();
        b.variant(move_id, "set").returns(s).add();

        b.def("pin", Kind::Pin)
            .pattern(r"pin\b".to_string())
            .flags(Flags::LEAF | Flags::HALT)
            .returns(l)
            .add();

        let find_id = b
            .def("find", Kind::Find)
            .pattern(r"find\b".to_string())
            .flags(Flags::RANGE | Flags::HALT)
            .returns(l)
            .accepts(any)
            .args(1, Some(1))
            .add();
        b.variant(find_id, "count")
            .returns(n)
            .flags(Flags::RANGE | Flags::HALT | Flags::UNARY_MINUS_OK)
            .add();

        b.def("ray", Kind::Ray)
            .pattern(r"ray\b".to_string())
            .flags(Flags::ARG_LIST | Flags::HALT)
            .returns(s)
            .accepts(s)
            .args(2, None)
            .add();

        // Call-style filters; the opening paren is part of the token.
        b.def("between", Kind::CallParen)
            .pattern(r"between\s*\(".to_string())
            .flags(Flags::ARG_LIST | Flags::PAREN_CLOSE)
            .returns(s)
            .accepts(s)
            .args(2, Some(2))
            .add();
        b.def("makesquare", Kind::CallParen)
            .pattern(r"makesquare\s*\(".to_string())
            .flags(Flags::ARG_LIST | Flags::PAREN_CLOSE)
            .returns(s)
            .accepts(n)
            .args(2, Some(2))
            .add();

        // Prefix operators.
        b.def("not", Kind::PrefixOp)
            .pattern(r"not\b".to_string())
            .flags(Flags::PREFIX_OP)
            .prec(PREC_NOT)
            .returns(l)
            .accepts(l)
            .args(1, Some(1))
            .add();
        for name in ["rank", "file", "power"] {
            b.def(name, Kind::PrefixOp)
                .pattern(format!(r"{name}\b"))
                .flags(Flags::PREFIX_OP | Flags::UNARY_MINUS_OK)
                .prec(PREC_UNARY)
                .returns(n)
                .accepts(s)
                .args(1, Some(1))
                .add();
        }
        // `sort` binds loosest so the whole numeric expression sorts.
        b.def("sort", Kind::PrefixOp)
            .pattern("sort(?:\\s+\"[^\"]*\")?".to_string())
            .flags(Flags::PREFIX_OP)
            .prec(PREC_SORT)
            .returns(n)
            .accepts(n)
            .args(1, Some(1))
            .add();

        // Parameter families. Membership and exclusion rules live in params.rs.
        for name in ["from", "to", "capture", "promote", "enpassantsquare"] {
            b.def(name, Kind::Param)
                .pattern(format!(r"{name}\b"))
                .flags(Flags::TRAILING_ARG)
                .returns(TypeSet::MOVE_PARAM)
                .accepts(s)
                .args(1, Some(1))
                .add();
        }
        b.def("through", Kind::Param)
            .pattern(r"through\b".to_string())
            .flags(Flags::TRAILING_ARG)
            .returns(TypeSet::MOVE_PARAM)
            .accepts(s)
            .args(1, Some(1))
            .add();
        for name in ["legal", "pseudolegal", "previous", "null", "enpassant"] {
            b.def(name, Kind::Param)
                .pattern(format!(r"{name}\b"))
                .returns(TypeSet::MOVE_PARAM)
                .add();
        }
        for name in ["primary", "secondary"] {
            b.def(name, Kind::Param)
                .pattern(format!(r"{name}\b"))
                .returns(TypeSet::MOVE_PARAM | TypeSet::LINE_PARAM)
                .add();
        }
        for name in ["firstmatch", "lastposition", "singlecolor", "nestban"] {
            b.def(name, Kind::Param)
                .pattern(format!(r"{name}\b"))
                .returns(TypeSet::LINE_PARAM)
                .add();
        }
        b.def("all", Kind::Param)
            .pattern(r"all\b".to_string())
            .returns(TypeSet::MOVE_PARAM)
            .add();
        for name in [
            "northeast",
            "northwest",
            "southeast",
            "southwest",
            "anydirection",
            "orthogonal",
            "diagonal",
            "vertical",
            "horizontal",
            "up",
            "down",
            "left",
            "right",
        ] {
            b.def(name, Kind::Param)
                .pattern(format!(r"{name}\b"))
                .returns(TypeSet::DIRECTION)
                .add();
        }

        // `in` before the operator symbols so `in` the keyword wins over any
        // identifier scan; relations before their single-character prefixes.
        let in_id = b
            .def("in", Kind::Infix)
            .pattern(r"in\b".to_string())
            .flags(Flags::INFIX)
            .prec(PREC_IN)
            .returns(l)
            .accepts(s | p)
            .args(2, Some(2))
            .add();
        b.variant(in_id, "set").returns(l).accepts(s).add();
        b.variant(in_id, "position").returns(l).accepts(p).add();

        for (name, prec) in [("or", PREC_OR), ("and", PREC_AND)] {
            b.def(name, Kind::Infix)
                .pattern(format!(r"{name}\b"))
                .flags(Flags::INFIX)
                .prec(prec)
                .returns(l)
                .accepts(l)
                .args(2, Some(2))
                .add();
        }

        for (name, pat) in [("==", r"=="), ("!=", r"!=")] {
            let id = b
                .def(name, Kind::Infix)
                .pattern(pat.to_string())
                .flags(Flags::INFIX)
                .prec(PREC_RELATION)
                .returns(l)
                .accepts(n | s | p)
                .args(2, Some(2))
                .add();
            b.variant(id, "set").returns(l).accepts(s).add();
            b.variant(id, "position").returns(l).accepts(p).add();
        }
        for (name, pat) in [("<=", r"<="), (">=", r">="), ("<", r"<"), (">", r">")] {
            b.def(name, Kind::Infix)
                .pattern(pat.to_string())
                .flags(Flags::INFIX)
                .prec(PREC_RELATION)
                .returns(l)
                .accepts(n)
                .args(2, Some(2))
                .add();
        }

        let assign_id = b
            .def("=", Kind::Assign)
            .pattern(r"=".to_string())
            .flags(Flags::INFIX)
            .prec(PREC_ASSIGN)
            .returns(any)
            .accepts(any)
            .args(2, Some(2))
            .add();
        for (variant, ty) in [("numeric", n), ("set", s), ("position", p), ("piece", s)] {
            b.variant(assign_id, variant).returns(ty).accepts(ty).add();
        }

        b.def("|", Kind::Infix)
            .pattern(r"\|".to_string())
            .flags(Flags::INFIX)
            .prec(PREC_UNION)
            .returns(s)
            .accepts(s)
            .args(2, Some(2))
            .add();
        b.def("&", Kind::Infix)
            .pattern(r"&".to_string())
            .flags(Flags::INFIX)
            .prec(PREC_INTERSECT)
            .returns(s)
            .accepts(s)
            .args(2, Some(2))
            .add();

        for (name, pat, prec) in [
            ("+", r"\+", PREC_ADD),
            ("*", r"\*", PREC_MUL),
            ("/", r"/", PREC_MUL),
            ("%", r"%", PREC_MUL),
        ] {
            b.def(name, Kind::Infix)
                .pattern(pat.to_string())
                .flags(Flags::INFIX | Flags::UNARY_MINUS_OK)
                .prec(prec)
                .returns(n)
                .accepts(n)
                .args(2, Some(2))
                .add();
        }
        b.def("-", Kind::Minus)
            .pattern(r"-".to_string())
            .flags(Flags::INFIX)
            .prec(PREC_ADD)
            .returns(n)
            .accepts(n)
            .args(2, Some(2))
            .add();

        // Brackets.
        b.def("(", Kind::LParen)
            .pattern(r"\(".to_string())
            .flags(Flags::PAREN_CLOSE)
            .returns(any)
            .accepts(any)
            .args(1, Some(1))
            .add();
        b.def(")", Kind::RParen).pattern(r"\)".to_string()).add();
        b.def("{", Kind::LBrace)
            .pattern(r"\{".to_string())
            .flags(Flags::PAREN_CLOSE)
            .returns(any)
            .accepts(any)
            .args(1, None)
            .add();
        b.def("}", Kind::RBrace).pattern(r"\}".to_string()).add();
        b.def(",", Kind::Separator).pattern(",".to_string()).add();

        // Literals.
        b.def("number", Kind::Number)
            .pattern(r"\d+".to_string())
            .flags(Flags::LEAF | Flags::UNARY_MINUS_OK)
            .returns(n)
            .add();
        b.def("string", Kind::StringLit)
            .pattern("\"[^\"]*\"".to_string())
            .add();

        // Piece and square designators, built from the board tables; listed
        // after the keywords so `between(` never scans as the piece `b`, and
        // before identifiers so `b4` never scans as a variable.
        b.def("piecedesignator", Kind::PieceDesignator)
            .pattern(designator_pattern())
            .flags(Flags::LEAF)
            .returns(s)
            .add();

        // Bare identifiers: variable references and declarations. Variants
        // carry the category fixed by first assignment.
        let var_id = b
            .def("variable", Kind::Variable)
            .pattern(IDENT.to_string())
            .flags(Flags::LEAF)
            .returns(any)
            .add();
        b.variant(var_id, "numeric")
            .returns(n)
            .flags(Flags::LEAF | Flags::UNARY_MINUS_OK)
            .add();
        b.variant(var_id, "set").returns(s).add();
        b.variant(var_id, "piece").returns(s).add();
        b.variant(var_id, "position").returns(p).add();

        // Catch-all so the scan always covers the input; the parser turns
        // this into a lexical error.
        b.def("unrecognized", Kind::Unrecognized)
            .pattern(r"\S+".to_string())
            .add();

        // Synthesized kinds, never scanned.
        b.def("unary-", Kind::UnaryMinus)
            .prec(PREC_UNARY)
            .returns(n)
            .accepts(n)
            .args(1, Some(1))
            .add();
        b.def("call", Kind::FunctionCall)
            .returns(any)
            .accepts(any)
            .args(1, Some(1))
            .add();

        b.finish()
    }

    pub fn def(&self, id: DefId) -> &TokenDef {
        &self.defs[id.0 as usize]
    }

    /// Look up a base definition by name. The table is static, so a missing
    /// name is a programming error.
    pub fn id(&self, name: &str) -> DefId {
        self.by_name[name]
    }

    /// The re-typed sibling of `base` named `variant`.
    pub fn variant(&self, base: DefId, variant: &'static str) -> DefId {
        let base = self.base_of(base);
        self.variants[&(base.0, variant)]
    }

    /// Like [`Grammar::variant`], but `None` when the definition has no such
    /// sibling.
    pub fn variant_opt(&self, base: DefId, variant: &'static str) -> Option<DefId> {
        let base = self.base_of(base);
        self.variants.get(&(base.0, variant)).copied()
    }

    /// The base definition of `id` (identity for non-variants).
    pub fn base_of(&self, id: DefId) -> DefId {
        match self.def(id).variant {
            Some(_) => self.by_name[self.def(id).name],
            None => id,
        }
    }

    pub(crate) fn scan_order(&self) -> &[DefId] {
        &self.scan_order
    }

    pub(crate) fn group_name(&self, idx: usize) -> &str {
        &self.group_names[idx]
    }

    pub(crate) fn pattern(&self) -> &Regex {
        &self.pattern
    }
}

impl Default for Grammar {
    fn default() -> Grammar {
        Grammar::new()
    }
}

/// Piece-designator pattern assembled from the board tables.
///
/// Forms, in preference order: piece class plus square range (`Ra-h1-8`),
/// bracketed piece class alone (`[Kk]`), bare square range (`a4`, `a-h4`),
/// single piece character. Forms ending in a word character get a `\b` so
/// `kfoo` still scans as an identifier; the bracketed form is self-delimiting.
fn designator_pattern() -> String {
    let pieces = regex::escape(board::PIECE_CHARS);
    let files = board::FILE_NAMES;
    let ranks = board::RANK_NAMES;
    let class = format!("(?:\\[[{pieces}]+\\]|[{pieces}])");
    let square = format!("[{files}](?:-[{files}])?[{ranks}](?:-[{ranks}])?");
    let single = regex::escape(&board::PIECE_CHARS.replace('.', ""));
    format!(
        "{class}{square}\\b|\\[[{pieces}]+\\]|{square}\\b|[{single}]\\b"
    )
}

#[derive(Default)]
struct Builder {
    defs: Vec<TokenDef>,
    by_name: HashMap<&'static str, DefId>,
    variants: HashMap<(u16, &'static str), DefId>,
    scan_order: Vec<DefId>,
}

impl Builder {
    fn def(&mut self, name: &'static str, kind: Kind) -> DefBuilder<'_> {
        DefBuilder {
            table: self,
            def: TokenDef {
                name,
                variant: None,
                kind,
                precedence: PREC_NONE,
                flags: Flags::NONE,
                returns: TypeSet::EMPTY,
                accepts: TypeSet::EMPTY,
                min_args: 0,
                max_args: Some(0),
                pattern: None,
            },
            base: None,
        }
    }

    fn variant(&mut self, base: DefId, variant: &'static str) -> DefBuilder<'_> {
        let src = &self.defs[base.0 as usize];
        DefBuilder {
            def: TokenDef {
                name: src.name,
                variant: Some(variant),
                kind: src.kind,
                precedence: src.precedence,
                flags: src.flags,
                returns: src.returns,
                accepts: src.accepts,
                min_args: src.min_args,
                max_args: src.max_args,
                pattern: None,
            },
            base: Some(base),
            table: self,
        }
    }

    fn finish(self) -> Grammar {
        let mut alternation = String::new();
        let mut group_names = Vec::with_capacity(self.scan_order.len());
        for (idx, id) in self.scan_order.iter().enumerate() {
            let def = &self.defs[id.0 as usize];
            let group = format!("t{idx}");
            if idx > 0 {
                alternation.push('|');
            }
            alternation.push_str(&format!(
                "(?P<{group}>{})",
                def.pattern.as_deref().unwrap_or_default()
            ));
            group_names.push(group);
        }
        let pattern = Regex::new(&alternation).expect("combined grammar pattern");
        Grammar {
            defs: self.defs,
            by_name: self.by_name,
            variants: self.variants,
            scan_order: self.scan_order,
            group_names,
            pattern,
        }
    }
}

struct DefBuilder<'a> {
    table: &'a mut Builder,
    def: TokenDef,
    base: Option<DefId>,
}

impl DefBuilder<'_> {
    fn pattern(mut self, pattern: String) -> Self {
        self.def.pattern = Some(pattern);
        self
    }

    fn flags(mut self, flags: Flags) -> Self {
        self.def.flags = flags;
        self
    }

    fn prec(mut self, precedence: u8) -> Self {
        self.def.precedence = precedence;
        self
    }

    fn returns(mut self, returns: TypeSet) -> Self {
        self.def.returns = returns;
        self
    }

    fn accepts(mut self, accepts: TypeSet) -> Self {
        self.def.accepts = accepts;
        self
    }

    fn args(mut self, min: u8, max: Option<u8>) -> Self {
        self.def.min_args = min;
        self.def.max_args = max;
        self
    }

    fn add(self) -> DefId {
        let id = DefId(self.table.defs.len() as u16);
        let scannable = self.def.pattern.is_some();
        match self.base {
            Some(base) => {
                let variant = self.def.variant.unwrap_or_default();
                self.table.variants.insert((base.0, variant), id);
            }
            None => {
                self.table.by_name.entry(self.def.name).or_insert(id);
            }
        }
        self.table.defs.push(self.def);
        if scannable {
            self.table.scan_order.push(id);
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_builds() {
        let g = Grammar::new();
        assert_eq!(g.def(g.id("wtm")).kind, Kind::LeafKeyword);
        assert_eq!(g.def(g.id("&")).precedence, PREC_INTERSECT);
        assert!(g.def(g.id("move")).is(Flags::LEAF));
    }

    #[test]
    fn variants_share_precedence() {
        let g = Grammar::new();
        let assign = g.id("=");
        let set_assign = g.variant(assign, "set");
        assert_eq!(g.def(assign).precedence, g.def(set_assign).precedence);
        assert_eq!(g.def(set_assign).returns, TypeSet::SET);
        // Re-typing an already re-typed definition is a no-op.
        assert_eq!(g.variant(set_assign, "set"), set_assign);
    }

    #[test]
    fn base_of_roundtrip() {
        let g = Grammar::new();
        let var = g.id("variable");
        let numeric = g.variant(var, "numeric");
        assert_eq!(g.base_of(numeric), var);
        assert_eq!(g.base_of(var), var);
    }

    #[test]
    fn type_set_narrowing() {
        let both = TypeSet::SET | TypeSet::LOGICAL;
        assert_eq!(both.single(), None);
        assert_eq!(TypeSet::SET.single(), Some(FilterType::Set));
        assert!(TypeSet::SET.satisfies(TypeSet::LOGICAL));
        assert!(!TypeSet::SET.satisfies(TypeSet::NUMERIC));
    }
}
