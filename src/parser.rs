//! The statement parser.
//!
//! A stack machine over the token stream: scanning a token either places a
//! completed leaf, opens a filter that still needs arguments, or collapses
//! completed filters off the top of the stack into their parents. Precedence
//! drives the collapse for infix operators; bracket and frame filters halt it
//! until their closing token arrives. The first problem encountered halts the
//! parse, so every statement reports at most one error.

use std::collections::{HashSet, VecDeque};
use std::fmt;

use crate::ast::{Node, Param, Token};
use crate::grammar::{DefId, FilterType, Flags, Grammar, Kind, TypeSet};
use crate::lexer::Lexer;
use crate::params;
use crate::vars::{self, VarKind, VariableTable};

/// Category of a parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Input matched no known keyword or operator.
    Lexical,
    /// Unmatched bracket, wrong argument count, incomplete frame.
    Structural,
    /// Operand category does not satisfy the operator or parameter.
    Type,
    /// Duplicate, mutually exclusive, or out-of-context parameter.
    Parameter,
    /// Undeclared, re-typed, reserved, or recursively expanded name.
    Variable,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Lexical => "lexical",
            ErrorKind::Structural => "structural",
            ErrorKind::Type => "type",
            ErrorKind::Parameter => "parameter",
            ErrorKind::Variable => "variable",
        };
        write!(f, "{name}")
    }
}

/// A failed parse, with enough context to point at the offending spot.
#[derive(Debug, Clone)]
pub struct ParseError {
    pub kind: ErrorKind,
    pub message: String,
    /// The statement text as given.
    pub statement: String,
    /// Tokens not yet consumed when the parse halted.
    pub remaining: Vec<String>,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

impl std::error::Error for ParseError {}

/// Internal error carrier; the outer loop attaches statement text and the
/// unconsumed tokens before surfacing it.
struct Halt {
    kind: ErrorKind,
    message: String,
}

type Rule<T> = Result<T, Halt>;

fn halt<T>(kind: ErrorKind, message: impl Into<String>) -> Rule<T> {
    Err(Halt {
        kind,
        message: message.into(),
    })
}

/// An open (not yet collapsed) filter on the parse stack.
struct Open {
    node: Node,
    /// Bracket frames: the matching close bracket has been seen.
    closed: bool,
    /// `ray` only: its argument list has been opened.
    opened: bool,
    /// `if` only: `then` and `else` markers seen so far.
    then_seen: bool,
    else_seen: bool,
    /// `line` only: number of arrows seen, and the first arrow's identity.
    arrows: u8,
    arrow_def: Option<DefId>,
}

impl Open {
    fn new(node: Node) -> Open {
        Open {
            node,
            closed: false,
            opened: false,
            then_seen: false,
            else_seen: false,
            arrows: 0,
            arrow_def: None,
        }
    }
}

/// One pending token stream. Function calls push the expanded body as a
/// nested stream, so re-entrant expansion is ordinary parser state instead
/// of recursion.
struct Stream {
    tokens: VecDeque<Token>,
    call: Option<CallCleanup>,
}

struct CallCleanup {
    name: String,
    locals: Vec<String>,
}

/// The statement parser. One statement per parser; the variable table,
/// function table, and substitution counter all reset with it.
pub struct Parser<'g> {
    grammar: &'g Grammar,
    statement: String,
    streams: Vec<Stream>,
    stack: Vec<Open>,
    pending_range: Vec<i64>,
    table: VariableTable,
    calling: HashSet<String>,
    reserved: HashSet<String>,
    counter: u32,
}

impl<'g> Parser<'g> {
    pub fn new(mut lexer: Lexer<'g>) -> Parser<'g> {
        let statement = lexer.statement().to_string();
        let grammar = lexer.grammar();
        let tokens = lexer.tokenize();
        Parser {
            grammar,
            statement,
            streams: vec![Stream {
                tokens: tokens.into(),
                call: None,
            }],
            stack: Vec::new(),
            pending_range: Vec::new(),
            table: VariableTable::new(),
            calling: HashSet::new(),
            reserved: HashSet::new(),
            counter: 0,
        }
    }

    /// Parse the statement into its root filter node.
    ///
    /// The root is the `cql` node: header parameters in its `params`, and
    /// zero or one body child. Multiple body filters are wrapped in an
    /// implicit compound so the root shape is uniform.
    pub fn parse_statement(&mut self) -> Result<Node, ParseError> {
        match self.run() {
            Ok(root) => Ok(root),
            Err(h) => Err(ParseError {
                kind: h.kind,
                message: h.message,
                statement: self.statement.clone(),
                remaining: self
                    .streams
                    .iter()
                    .flat_map(|s| s.tokens.iter().map(|t| t.text.clone()))
                    .collect(),
            }),
        }
    }

    fn run(&mut self) -> Rule<Node> {
        let first = match self.next_token()? {
            Some(tok) => tok,
            None => return halt(ErrorKind::Structural, "empty statement"),
        };
        if self.grammar.def(first.def).kind != Kind::Statement {
            return halt(
                ErrorKind::Structural,
                format!("statement must begin with cql(), found '{}'", first.text),
            );
        }
        self.stack.push(Open::new(Node::new(first.def)));

        while let Some(tok) = self.next_token()? {
            self.dispatch(tok)?;
        }
        self.finish()
    }

    // ------------------------------------------------------------------
    // Token streams
    // ------------------------------------------------------------------

    fn next_token(&mut self) -> Rule<Option<Token>> {
        loop {
            let Some(stream) = self.streams.last_mut() else {
                return Ok(None);
            };
            if let Some(tok) = stream.tokens.pop_front() {
                return Ok(Some(tok));
            }
            let finished = self.streams.pop().and_then(|s| s.call);
            if let Some(cleanup) = finished {
                self.finish_call(cleanup)?;
            } else if self.streams.is_empty() {
                return Ok(None);
            }
        }
    }

    fn peek_token(&self) -> Option<&Token> {
        self.streams.last().and_then(|s| s.tokens.front())
    }

    /// Pull the next token of the current stream only; phrase readers never
    /// cross a stream boundary.
    fn next_in_stream(&mut self) -> Option<Token> {
        self.streams.last_mut().and_then(|s| s.tokens.pop_front())
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    fn dispatch(&mut self, tok: Token) -> Rule<()> {
        let def = self.grammar.def(tok.def);
        log::trace!("dispatch {} ({:?})", def.display_name(), def.kind);

        if def.kind != Kind::Number {
            self.flush_range()?;
        }

        if self.in_header()
            && !matches!(def.kind, Kind::HeaderParam | Kind::Result | Kind::RParen)
        {
            return halt(
                ErrorKind::Parameter,
                format!("'{}' is not a cql() parameter", tok.text),
            );
        }

        match def.kind {
            Kind::Statement => halt(
                ErrorKind::Structural,
                "cql() may only introduce the statement",
            ),
            Kind::HeaderParam => self.header_param(tok),
            Kind::Result => {
                if self.in_header() {
                    self.header_param(tok)
                } else {
                    self.place_operand(Node::leaf(tok.def, tok.text))
                }
            }
            Kind::Comment => Ok(()),
            Kind::Unrecognized => halt(
                ErrorKind::Lexical,
                format!("unknown or misplaced token '{}'", tok.text),
            ),
            Kind::StringLit => halt(
                ErrorKind::Structural,
                format!("unexpected string literal {}", tok.text),
            ),

            Kind::Number => self.number(tok),
            Kind::LeafKeyword | Kind::PieceDesignator => {
                // `mainline` is both a standalone leaf and a move parameter;
                // an exposed accepting filter claims it first.
                if def.kind == Kind::LeafKeyword && self.parameter_target_exposed(tok.def) {
                    self.parameter(tok)
                } else {
                    self.place_operand(Node::leaf(tok.def, tok.text))
                }
            }
            Kind::NumericLeaf => self.numeric_leaf(tok),
            Kind::ConsecutiveMoves => self.consecutive_moves(tok),
            Kind::Persistent => self.persistent(tok),
            Kind::Variable => self.variable(tok),
            Kind::Function => self.function_definition(&tok),

            Kind::PrefixOp => {
                self.collapse_completed()?;
                let mut node = Node::new(tok.def);
                if let Some(doc) = tok.embedded_string() {
                    node.leaf = Some(doc.to_string());
                }
                self.stack.push(Open::new(node));
                Ok(())
            }

            Kind::Infix | Kind::Assign => self.infix(tok),
            Kind::Minus => {
                if self.has_left_operand() {
                    self.infix(tok)
                } else {
                    self.collapse_completed()?;
                    let id = self.grammar.id("unary-");
                    self.stack.push(Open::new(Node::new(id)));
                    Ok(())
                }
            }

            Kind::If | Kind::Line | Kind::Move | Kind::Pin | Kind::Find | Kind::Ray => {
                self.collapse_completed()?;
                self.stack.push(Open::new(Node::new(tok.def)));
                Ok(())
            }
            Kind::Then => self.then_marker(&tok),
            Kind::Else => self.else_marker(&tok),
            Kind::Arrow => self.arrow(&tok),

            Kind::PieceIn | Kind::SquareIn => self.iteration(tok),

            Kind::CallParen => {
                self.collapse_completed()?;
                self.stack.push(Open::new(Node::new(tok.def)));
                Ok(())
            }
            Kind::LParen => self.open_paren(tok),
            Kind::LBrace => {
                self.collapse_completed()?;
                self.stack.push(Open::new(Node::new(tok.def)));
                Ok(())
            }
            Kind::RParen => self.close_bracket(Kind::RParen),
            Kind::RBrace => self.close_bracket(Kind::RBrace),
            Kind::Separator => self.separator(),

            Kind::Param => self.parameter(tok),

            // Never produced by the scanner; listed for exhaustiveness.
            Kind::UnaryMinus | Kind::FunctionCall => halt(
                ErrorKind::Structural,
                format!("unexpected token '{}'", tok.text),
            ),
        }
    }

    // ------------------------------------------------------------------
    // Stack primitives
    // ------------------------------------------------------------------

    fn top(&mut self) -> &mut Open {
        self.stack.last_mut().expect("parse stack holds the root")
    }

    fn in_header(&self) -> bool {
        match self.stack.last() {
            Some(top) => {
                self.grammar.def(top.node.def).kind == Kind::Statement && !top.closed
            }
            None => false,
        }
    }

    /// True if the entry's filter is syntactically complete and may collapse.
    fn complete(&self, entry: &Open) -> bool {
        let def = self.grammar.def(entry.node.def);
        match def.kind {
            Kind::Statement => false,
            Kind::If => {
                let needed = if entry.else_seen { 3 } else { 2 };
                entry.then_seen && entry.node.children.len() >= needed
            }
            Kind::Line => {
                entry.arrows >= 1 && entry.node.children.len() == entry.arrows as usize
            }
            Kind::Ray => entry.closed,
            _ if def.is(Flags::PAREN_CLOSE) => entry.closed,
            _ => entry.node.children.len() >= def.min_args as usize,
        }
    }

    /// True if the entry still waits for a matching close bracket.
    fn awaiting_bracket(&self, entry: &Open) -> bool {
        if entry.closed {
            return false;
        }
        let def = self.grammar.def(entry.node.def);
        def.is(Flags::PAREN_CLOSE) || (def.kind == Kind::Ray && entry.opened)
    }

    /// Pop the top entry, finalize it, and attach it to the new top: into
    /// the parent's parameter list for parameter nodes, as a child otherwise.
    fn pop_attach(&mut self) -> Rule<()> {
        let mut entry = self.stack.pop().expect("pop_attach under the root");
        self.finalize(&mut entry)?;
        let mut node = entry.node;
        let def = self.grammar.def(node.def);
        if def.kind == Kind::Param {
            let value = node.children.pop();
            let param_def = node.def;
            self.top().node.params.push(Param {
                def: param_def,
                value,
            });
            self.retype_for_param(param_def);
        } else {
            self.top().node.children.push(node);
        }
        Ok(())
    }

    /// Collapse every completed filter off the top of the stack.
    fn collapse_completed(&mut self) -> Rule<()> {
        while self.stack.len() > 1 && self.complete(self.stack.last().expect("non-empty")) {
            self.pop_attach()?;
        }
        Ok(())
    }

    /// Place a completed operand at the insertion point.
    fn place_operand(&mut self, node: Node) -> Rule<()> {
        self.collapse_completed()?;
        self.top().node.children.push(node);
        Ok(())
    }

    /// True if a `-` here is binary subtraction: the insertion point already
    /// holds a completed operand.
    fn has_left_operand(&self) -> bool {
        let Some(top) = self.stack.last() else {
            return false;
        };
        let def = self.grammar.def(top.node.def);
        if def.is(Flags::INFIX) || matches!(def.kind, Kind::PrefixOp | Kind::UnaryMinus) {
            self.complete(top)
        } else {
            !top.node.children.is_empty()
        }
    }

    // ------------------------------------------------------------------
    // Ranges and literals
    // ------------------------------------------------------------------

    fn number(&mut self, tok: Token) -> Rule<()> {
        let accumulating = !self.pending_range.is_empty() || {
            let top = self.stack.last().expect("non-empty");
            let def = self.grammar.def(top.node.def);
            def.is(Flags::RANGE) && top.node.children.is_empty() && top.node.range.is_empty()
        };
        if accumulating {
            if self.pending_range.len() == 2 {
                return halt(
                    ErrorKind::Structural,
                    format!("range takes at most two numbers, found '{}'", tok.text),
                );
            }
            let value = tok.text.parse::<i64>().map_err(|_| Halt {
                kind: ErrorKind::Lexical,
                message: format!("number '{}' is out of range", tok.text),
            })?;
            self.pending_range.push(value);
            Ok(())
        } else {
            self.place_operand(Node::leaf(tok.def, tok.text))
        }
    }

    fn flush_range(&mut self) -> Rule<()> {
        if self.pending_range.is_empty() {
            return Ok(());
        }
        let range = std::mem::take(&mut self.pending_range);
        self.top().node.range = range;
        Ok(())
    }

    fn numeric_leaf(&mut self, tok: Token) -> Rule<()> {
        let mut node = Node::leaf(tok.def, tok.text.clone());
        let numbers = tok.embedded_numbers();
        if !numbers.is_empty() {
            // `movenumber 5 10` constrains instead of counting.
            node.range = numbers;
            node.def = self.grammar.variant(tok.def, "range");
        }
        self.place_operand(node)
    }

    // ------------------------------------------------------------------
    // Operators
    // ------------------------------------------------------------------

    fn infix(&mut self, tok: Token) -> Rule<()> {
        let op = self.grammar.def(tok.def);
        let prec = op.precedence;
        let is_assign = op.kind == Kind::Assign;

        // Completed operands always collapse; completed operators only when
        // they bind at least as tightly as the incoming one.
        loop {
            let top = self.stack.last().expect("non-empty");
            if self.stack.len() == 1 || !self.complete(top) {
                break;
            }
            let top_def = self.grammar.def(top.node.def);
            let is_operator = top_def.is(Flags::INFIX)
                || matches!(top_def.kind, Kind::PrefixOp | Kind::UnaryMinus);
            if is_operator && top_def.precedence < prec {
                break;
            }
            self.pop_attach()?;
        }

        let left = match self.top().node.children.pop() {
            Some(left) => left,
            None => {
                return halt(
                    ErrorKind::Structural,
                    format!("operator '{}' has no left operand", tok.text),
                );
            }
        };

        if is_assign {
            let left_def = self.grammar.def(left.def);
            if !matches!(left_def.kind, Kind::Variable | Kind::Persistent) {
                return halt(
                    ErrorKind::Variable,
                    format!(
                        "left side of '=' must be a variable, found '{}'",
                        left_def.display_name()
                    ),
                );
            }
        } else {
            let op = self.grammar.def(tok.def);
            let left_type = self.node_type(&left);
            if !left_type.satisfies(op.accepts) {
                return halt(
                    ErrorKind::Type,
                    format!(
                        "operator '{}' expects a {} filter, found {}",
                        tok.text,
                        op.accepts.describe(),
                        left_type.describe()
                    ),
                );
            }
        }

        let mut node = Node::new(tok.def);
        node.children.push(left);
        self.stack.push(Open::new(node));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Frames: if/then/else, line arrows
    // ------------------------------------------------------------------

    fn then_marker(&mut self, tok: &Token) -> Rule<()> {
        self.collapse_completed()?;
        let top = self.stack.last().expect("non-empty");
        if self.grammar.def(top.node.def).kind != Kind::If || top.then_seen {
            return halt(
                ErrorKind::Structural,
                format!("'{}' without a matching if", tok.text),
            );
        }
        if top.node.children.len() != 1 {
            return halt(ErrorKind::Structural, "if condition missing before 'then'");
        }
        self.top().then_seen = true;
        Ok(())
    }

    /// `else` binds to the nearest completed two-branch `if`, so a dangling
    /// else attaches to the innermost frame.
    fn else_marker(&mut self, tok: &Token) -> Rule<()> {
        self.collapse_completed_to(Kind::If)?;
        let top = self.stack.last().expect("non-empty");
        if self.grammar.def(top.node.def).kind != Kind::If
            || !top.then_seen
            || top.else_seen
            || top.node.children.len() != 2
        {
            return halt(
                ErrorKind::Structural,
                format!("'{}' without a matching if/then", tok.text),
            );
        }
        self.top().else_seen = true;
        Ok(())
    }

    fn arrow(&mut self, tok: &Token) -> Rule<()> {
        self.collapse_completed_to(Kind::Line)?;
        let arrow_def = tok.def;
        {
            let top = self.stack.last().expect("non-empty");
            if self.grammar.def(top.node.def).kind != Kind::Line {
                return halt(
                    ErrorKind::Structural,
                    format!("'{}' outside a line filter", tok.text),
                );
            }
            if top.node.children.len() != top.arrows as usize {
                return halt(
                    ErrorKind::Structural,
                    format!("line constituent missing before '{}'", tok.text),
                );
            }
        }
        let top = self.top();
        match top.arrow_def {
            None => top.arrow_def = Some(arrow_def),
            Some(first) if first != arrow_def => {
                return halt(
                    ErrorKind::Structural,
                    "line cannot mix '-->' and '<--' arrows",
                );
            }
            Some(_) => {}
        }
        top.arrows += 1;
        Ok(())
    }

    /// Collapse completed tops, but stop early at a frame of `kind` so its
    /// marker token can extend it.
    fn collapse_completed_to(&mut self, kind: Kind) -> Rule<()> {
        loop {
            let top = self.stack.last().expect("non-empty");
            if self.grammar.def(top.node.def).kind == kind {
                return Ok(());
            }
            if self.stack.len() == 1 || !self.complete(top) {
                return Ok(());
            }
            self.pop_attach()?;
        }
    }

    // ------------------------------------------------------------------
    // Brackets
    // ------------------------------------------------------------------

    fn open_paren(&mut self, tok: Token) -> Rule<()> {
        // `ray … (` opens ray's own argument list rather than a grouping.
        let ray_args = {
            let top = self.stack.last().expect("non-empty");
            self.grammar.def(top.node.def).kind == Kind::Ray && !top.opened
        };
        if ray_args {
            self.top().opened = true;
            return Ok(());
        }
        self.collapse_completed()?;
        self.stack.push(Open::new(Node::new(tok.def)));
        Ok(())
    }

    fn close_bracket(&mut self, closer: Kind) -> Rule<()> {
        let symbol = if closer == Kind::RParen { ")" } else { "}" };

        // Completed arguments collapse into the bracket filter.
        loop {
            let top = self.stack.last().expect("non-empty");
            if self.awaiting_bracket(top) {
                break;
            }
            if self.grammar.def(top.node.def).kind == Kind::Statement {
                return halt(ErrorKind::Structural, format!("unmatched '{symbol}'"));
            }
            if !self.complete(top) {
                let name = self.grammar.def(top.node.def).display_name();
                return halt(
                    ErrorKind::Structural,
                    format!("'{name}' is incomplete at '{symbol}'"),
                );
            }
            self.pop_attach()?;
        }

        let kind = {
            let top = self.stack.last().expect("non-empty");
            self.grammar.def(top.node.def).kind
        };
        let brace = closer == Kind::RBrace;
        match kind {
            Kind::Statement if !brace => {
                // cql()'s parameter list is done; the root stays rooted.
                self.top().closed = true;
                Ok(())
            }
            Kind::LBrace if brace => self.close_compound(),
            Kind::LParen | Kind::CallParen | Kind::Ray if !brace => self.close_paren_filter(),
            _ => halt(
                ErrorKind::Structural,
                format!(
                    "mismatched '{symbol}' closing '{}'",
                    self.grammar
                        .def(self.stack.last().expect("non-empty").node.def)
                        .name
                ),
            ),
        }
    }

    /// An optional `,` between argument-list arguments; anywhere else it is
    /// a structural error.
    fn separator(&mut self) -> Rule<()> {
        self.collapse_completed()?;
        let top = self.stack.last().expect("non-empty");
        let def = self.grammar.def(top.node.def);
        if self.awaiting_bracket(top) && def.is(Flags::ARG_LIST) && !top.node.children.is_empty() {
            Ok(())
        } else {
            halt(ErrorKind::Structural, "',' outside an argument list")
        }
    }

    fn close_compound(&mut self) -> Rule<()> {
        let top = self.top();
        if top.node.children.is_empty() {
            return halt(ErrorKind::Structural, "empty compound filter '{}'");
        }
        top.closed = true;
        self.pop_attach()
    }

    fn close_paren_filter(&mut self) -> Rule<()> {
        let (def_id, count) = {
            let top = self.top();
            (top.node.def, top.node.children.len())
        };
        let def = self.grammar.def(def_id);
        let min = def.min_args as usize;
        if count < min {
            return halt(
                ErrorKind::Structural,
                format!(
                    "'{}' takes at least {min} argument{}, found {count}",
                    def.name,
                    if min == 1 { "" } else { "s" }
                ),
            );
        }
        if let Some(max) = def.max_args {
            if count > max as usize {
                return halt(
                    ErrorKind::Structural,
                    format!("'{}' takes at most {max} arguments, found {count}", def.name),
                );
            }
        }
        // Argument-list filters check every argument against their accepted
        // category; plain grouping adopts its child's category instead.
        if def.is(Flags::ARG_LIST) {
            let accepts = def.accepts;
            let name = def.name;
            let types: Vec<TypeSet> = {
                let top = self.stack.last().expect("non-empty");
                top.node.children.iter().map(|c| self.node_type(c)).collect()
            };
            for ty in types {
                if !ty.satisfies(accepts) {
                    return halt(
                        ErrorKind::Type,
                        format!(
                            "'{name}' expects {} arguments, found {}",
                            accepts.describe(),
                            ty.describe()
                        ),
                    );
                }
            }
        }
        self.top().closed = true;
        // The closed filter is a finished operand of its parent.
        self.pop_attach()
    }

    // ------------------------------------------------------------------
    // Parameters
    // ------------------------------------------------------------------

    /// True if some filter on the stack accepts this token as a parameter,
    /// following the same search [`parameter`] runs: completed non-halting
    /// tops are looked through, anything else ends the search.
    fn parameter_target_exposed(&self, param: DefId) -> bool {
        for entry in self.stack.iter().rev() {
            if params::allowed_in(self.grammar, entry.node.def, param) {
                return true;
            }
            if !self.complete(entry) || self.grammar.def(entry.node.def).is(Flags::HALT) {
                return false;
            }
        }
        false
    }

    fn parameter(&mut self, tok: Token) -> Rule<()> {
        // Collapse completed tops until a filter that accepts this parameter
        // is exposed. An incomplete filter ends the search, and so does a
        // halting one: parameters never collapse past `move`, `find`, etc.
        // to reach an outer filter.
        loop {
            let top = self.stack.last().expect("non-empty");
            if params::allowed_in(self.grammar, top.node.def, tok.def) {
                break;
            }
            if self.stack.len() == 1
                || !self.complete(top)
                || self.grammar.def(top.node.def).is(Flags::HALT)
            {
                return halt(
                    ErrorKind::Parameter,
                    format!(
                        "parameter '{}' is not allowed after '{}'",
                        tok.text,
                        self.grammar.def(top.node.def).name
                    ),
                );
            }
            self.pop_attach()?;
        }

        {
            let top = self.stack.last().expect("non-empty");
            params::check(self.grammar, &top.node, tok.def).map_err(|message| Halt {
                kind: ErrorKind::Parameter,
                message,
            })?;
        }

        let def = self.grammar.def(tok.def);
        if def.is(Flags::TRAILING_ARG) {
            // The parameter's own argument filter follows; pop_attach folds
            // the finished pair into the parent's parameter list.
            self.stack.push(Open::new(Node::new(tok.def)));
        } else {
            self.top().node.params.push(Param {
                def: tok.def,
                value: None,
            });
            self.retype_for_param(tok.def);
        }
        Ok(())
    }

    /// `from`, `to`, and `capture` turn `move` from a logical filter into a
    /// set filter over the named squares.
    fn retype_for_param(&mut self, param: DefId) {
        if !params::retypes_move_to_set(self.grammar, param) {
            return;
        }
        let retyped = {
            let def_id = self.stack.last().expect("non-empty").node.def;
            let def = self.grammar.def(def_id);
            if def.kind == Kind::Move && def.variant.is_none() {
                Some(self.grammar.variant(def_id, "set"))
            } else {
                None
            }
        };
        if let Some(id) = retyped {
            self.top().node.def = id;
        }
    }

    // ------------------------------------------------------------------
    // Header parameters
    // ------------------------------------------------------------------

    fn header_param(&mut self, tok: Token) -> Rule<()> {
        if !self.in_header() {
            return halt(
                ErrorKind::Parameter,
                format!("'{}' is only allowed inside cql()", tok.text),
            );
        }
        let root = self.top();
        if root.node.has_param(tok.def) {
            return halt(
                ErrorKind::Parameter,
                format!("duplicate cql() parameter '{}'", tok.text),
            );
        }
        let def_name = self.grammar.def(tok.def).name;
        let value = if tok.text.trim() == def_name {
            None
        } else {
            let mut leaf = Node::leaf(tok.def, tok.text.clone());
            leaf.range = tok.embedded_numbers();
            Some(leaf)
        };
        self.top().node.params.push(Param {
            def: tok.def,
            value,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Variables, iteration phrases, persistent
    // ------------------------------------------------------------------

    fn check_user_name(&self, name: &str) -> Rule<()> {
        if vars::is_reserved(name) && !self.reserved.contains(name) {
            return halt(
                ErrorKind::Variable,
                format!(
                    "names beginning with '{}' are reserved",
                    vars::RESERVED_PREFIX
                ),
            );
        }
        Ok(())
    }

    fn variable(&mut self, tok: Token) -> Rule<()> {
        // Collapse first so an assignment just finished is already in the
        // table when the name is looked up.
        self.collapse_completed()?;
        let name = tok.text.clone();

        if self.table.function(&name).is_some() {
            let next_is_paren = self
                .peek_token()
                .is_some_and(|t| self.grammar.def(t.def).kind == Kind::LParen);
            if !next_is_paren {
                return halt(
                    ErrorKind::Variable,
                    format!("function '{name}' must be called with arguments"),
                );
            }
            self.next_in_stream();
            return self.expand_call(&name);
        }

        self.check_user_name(&name)?;

        if let Some(var) = self.table.get(&name) {
            let typed = self.grammar.variant(tok.def, var.kind.variant_name());
            return self.place_operand(Node::leaf(typed, name));
        }

        let next_is_assign = self
            .peek_token()
            .is_some_and(|t| self.grammar.def(t.def).kind == Kind::Assign);
        if !next_is_assign {
            return halt(
                ErrorKind::Variable,
                format!("variable '{name}' used before assignment"),
            );
        }
        // Category fixed when the assignment collapses.
        self.place_operand(Node::leaf(tok.def, name))
    }

    fn persistent(&mut self, tok: Token) -> Rule<()> {
        self.collapse_completed()?;
        let name = tok
            .embedded_names(&["persistent"])
            .next()
            .unwrap_or_default()
            .to_string();
        self.check_user_name(&name)?;
        let known = self.table.get(&name).is_some();
        self.table
            .declare(&name, VarKind::Numeric, true)
            .map_err(|message| Halt {
                kind: ErrorKind::Variable,
                message,
            })?;
        if !known {
            let next_is_assign = self
                .peek_token()
                .is_some_and(|t| self.grammar.def(t.def).kind == Kind::Assign);
            if !next_is_assign {
                return halt(
                    ErrorKind::Variable,
                    format!("persistent variable '{name}' must be assigned"),
                );
            }
        }
        self.place_operand(Node::leaf(tok.def, name))
    }

    fn consecutive_moves(&mut self, tok: Token) -> Rule<()> {
        self.collapse_completed()?;
        let mut node = Node::leaf(tok.def, tok.text.clone());
        node.range = tok.embedded_numbers();
        let names: Vec<String> = tok
            .embedded_names(&["consecutivemoves"])
            .map(str::to_string)
            .collect();
        let typed = self
            .grammar
            .variant(self.grammar.id("variable"), VarKind::Position.variant_name());
        for name in &names {
            self.check_user_name(name)?;
            match self.table.get(name) {
                Some(var) if var.kind != VarKind::Position => {
                    return halt(
                        ErrorKind::Variable,
                        format!(
                            "consecutivemoves requires position variables, but '{name}' is {}",
                            var.kind.describe()
                        ),
                    );
                }
                Some(_) => {}
                // Bare names in the argument list implicitly declare
                // position variables.
                None => {
                    self.table
                        .declare(name, VarKind::Position, false)
                        .map_err(|message| Halt {
                            kind: ErrorKind::Variable,
                            message,
                        })?;
                }
            }
            node.children.push(Node::leaf(typed, name.clone()));
        }
        self.place_operand(node)
    }

    fn iteration(&mut self, tok: Token) -> Rule<()> {
        let def = self.grammar.def(tok.def);
        let (keyword, kind) = if def.kind == Kind::PieceIn {
            ("piece", VarKind::Piece)
        } else {
            ("square", VarKind::Set)
        };
        let name = tok
            .embedded_names(&[keyword, "all", "in"])
            .next()
            .unwrap_or_default()
            .to_string();
        self.check_user_name(&name)?;
        self.table
            .declare(&name, kind, false)
            .map_err(|message| Halt {
                kind: ErrorKind::Variable,
                message,
            })?;
        self.collapse_completed()?;
        let mut node = Node::new(tok.def);
        node.leaf = Some(name);
        self.stack.push(Open::new(node));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Functions
    // ------------------------------------------------------------------

    fn function_definition(&mut self, tok: &Token) -> Rule<()> {
        let name = tok
            .embedded_names(&["function"])
            .next()
            .unwrap_or_default()
            .to_string();
        self.check_user_name(&name)?;

        let mut formals = Vec::new();
        loop {
            let Some(next) = self.next_in_stream() else {
                return halt(
                    ErrorKind::Structural,
                    format!("unterminated parameter list of function '{name}'"),
                );
            };
            match self.grammar.def(next.def).kind {
                Kind::RParen => break,
                Kind::Separator => {}
                Kind::Variable => formals.push(next.text),
                _ => {
                    return halt(
                        ErrorKind::Variable,
                        format!("function parameter must be a name, found '{}'", next.text),
                    );
                }
            }
        }

        match self.next_in_stream() {
            Some(t) if self.grammar.def(t.def).kind == Kind::LBrace => {}
            _ => {
                return halt(
                    ErrorKind::Structural,
                    format!("function '{name}' body must open with '{{'"),
                );
            }
        }

        // Capture the body verbatim up to the matching brace; it is only
        // tokenized again when the function is called.
        let mut depth = 1usize;
        let mut body = String::new();
        loop {
            let Some(t) = self.next_in_stream() else {
                return halt(
                    ErrorKind::Structural,
                    format!("unterminated body of function '{name}'"),
                );
            };
            match self.grammar.def(t.def).kind {
                Kind::LBrace => depth += 1,
                Kind::RBrace => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                _ => {}
            }
            if !body.is_empty() {
                body.push(' ');
            }
            body.push_str(&t.text);
        }

        self.table
            .define_function(&name, formals, body)
            .map_err(|message| Halt {
                kind: ErrorKind::Variable,
                message,
            })
    }

    fn expand_call(&mut self, name: &str) -> Rule<()> {
        if self.calling.contains(name) {
            return halt(
                ErrorKind::Variable,
                format!("recursive call of function '{name}'"),
            );
        }
        let func = self
            .table
            .function(name)
            .cloned()
            .expect("caller checked the function exists");

        // Argument groups: a single token, or one balanced bracketed run.
        let mut groups: Vec<Vec<Token>> = Vec::new();
        let mut depth = 0usize;
        loop {
            let Some(t) = self.next_in_stream() else {
                return halt(
                    ErrorKind::Structural,
                    format!("unterminated call of function '{name}'"),
                );
            };
            let kind = self.grammar.def(t.def).kind;
            if depth == 0 {
                match kind {
                    Kind::RParen => break,
                    // Groups are one per token; a comma is already a boundary.
                    Kind::Separator => {}
                    Kind::LParen | Kind::LBrace | Kind::CallParen | Kind::Statement => {
                        depth += 1;
                        groups.push(vec![t]);
                    }
                    _ => groups.push(vec![t]),
                }
            } else {
                match kind {
                    Kind::LParen | Kind::LBrace | Kind::CallParen | Kind::Statement => depth += 1,
                    Kind::RParen | Kind::RBrace => depth -= 1,
                    _ => {}
                }
                groups.last_mut().expect("depth implies a group").push(t);
            }
        }

        if groups.len() != func.formals.len() {
            return halt(
                ErrorKind::Variable,
                format!(
                    "function '{name}' takes {} argument{}, found {}",
                    func.formals.len(),
                    if func.formals.len() == 1 { "" } else { "s" },
                    groups.len()
                ),
            );
        }

        let lparen = self.grammar.id("(");
        let rparen = self.grammar.id(")");
        let lbrace = self.grammar.id("{");
        let rbrace = self.grammar.id("}");
        let assign = self.grammar.id("=");
        let variable = self.grammar.id("variable");

        let mut map: Vec<(String, String)> = Vec::new();
        let mut locals: Vec<String> = Vec::new();
        let mut prologue: Vec<Token> = Vec::new();
        for (formal, group) in func.formals.iter().zip(groups) {
            let lone_variable = group.len() == 1
                && self.grammar.def(group[0].def).kind == Kind::Variable
                && self.table.get(&group[0].text).is_some();
            if lone_variable {
                map.push((formal.clone(), group[0].text.clone()));
                continue;
            }
            // Bind the argument expression to a fresh reserved name ahead of
            // the expanded body; the counter keeps names distinct across
            // separate calls.
            let minted = vars::reserved_name(self.counter);
            self.counter += 1;
            self.reserved.insert(minted.clone());
            locals.push(minted.clone());
            map.push((formal.clone(), minted.clone()));
            prologue.push(Token::new(variable, minted));
            prologue.push(Token::new(assign, "="));
            prologue.push(Token::new(lparen, "("));
            prologue.extend(group);
            prologue.push(Token::new(rparen, ")"));
        }

        let substituted = vars::substitute(&func.body, &map);
        let body_tokens = Lexer::new(self.grammar, &substituted).tokenize();

        let mut tokens = VecDeque::new();
        tokens.push_back(Token::new(lbrace, "{"));
        tokens.extend(prologue);
        tokens.extend(body_tokens);
        tokens.push_back(Token::new(rbrace, "}"));

        self.collapse_completed()?;
        self.stack
            .push(Open::new(Node::new(self.grammar.id("call"))));
        self.calling.insert(name.to_string());
        self.streams.push(Stream {
            tokens,
            call: Some(CallCleanup {
                name: name.to_string(),
                locals,
            }),
        });
        log::debug!("expanding function '{name}'");
        Ok(())
    }

    /// Expansion stream exhausted: the call node must hold its single child,
    /// and the guard plus the local reserved names go out of scope.
    fn finish_call(&mut self, cleanup: CallCleanup) -> Rule<()> {
        self.calling.remove(&cleanup.name);
        for local in &cleanup.locals {
            self.table.remove(local);
            self.reserved.remove(local);
        }
        let top = self.stack.last().expect("non-empty");
        let ok = self.grammar.def(top.node.def).kind == Kind::FunctionCall
            && top.node.children.len() == 1;
        if !ok {
            return halt(
                ErrorKind::Structural,
                format!(
                    "body of function '{}' did not produce a filter",
                    cleanup.name
                ),
            );
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Collapse-time finalization
    // ------------------------------------------------------------------

    /// Per-kind completion of a popped filter: argument type validation and
    /// variant re-typing.
    fn finalize(&mut self, entry: &mut Open) -> Rule<()> {
        let def_id = entry.node.def;
        let def = self.grammar.def(def_id);
        match def.kind {
            Kind::Infix | Kind::Minus => {
                let right = self.node_type(&entry.node.children[1]);
                if !right.satisfies(def.accepts) {
                    return halt(
                        ErrorKind::Type,
                        format!(
                            "operator '{}' expects a {} filter, found {}",
                            def.name,
                            def.accepts.describe(),
                            right.describe()
                        ),
                    );
                }
                // Equality and membership re-type from the left operand's
                // resolved category; both operands must land in the same one.
                if def.variant.is_none() {
                    let left = self.node_type(&entry.node.children[0]);
                    let variant = match left.single() {
                        Some(FilterType::Set) => Some("set"),
                        Some(FilterType::Position) => Some("position"),
                        _ => None,
                    };
                    if let Some(variant) = variant {
                        if let Some(v) = self.grammar.variant_opt(def_id, variant) {
                            let narrowed = self.grammar.def(v);
                            if !right.satisfies(narrowed.accepts) {
                                return halt(
                                    ErrorKind::Type,
                                    format!(
                                        "operator '{}' compares {} filters, found {}",
                                        def.name,
                                        narrowed.accepts.describe(),
                                        right.describe()
                                    ),
                                );
                            }
                            entry.node.def = v;
                        }
                    } else if left.single() == Some(FilterType::Numeric)
                        && self.grammar.variant_opt(def_id, "set").is_some()
                        && !right.satisfies(TypeSet::NUMERIC)
                    {
                        // A numeric left operand holds the comparison family
                        // to numbers; the base accepted set is wider.
                        return halt(
                            ErrorKind::Type,
                            format!(
                                "operator '{}' compares {} filters, found {}",
                                def.name,
                                TypeSet::NUMERIC.describe(),
                                right.describe()
                            ),
                        );
                    }
                }
                Ok(())
            }
            Kind::Assign => self.finalize_assign(entry),
            Kind::UnaryMinus | Kind::PrefixOp => {
                let child = self.node_type(&entry.node.children[0]);
                if !child.satisfies(def.accepts) {
                    return halt(
                        ErrorKind::Type,
                        format!(
                            "'{}' expects a {} filter, found {}",
                            def.display_name(),
                            def.accepts.describe(),
                            child.describe()
                        ),
                    );
                }
                Ok(())
            }
            Kind::Param => {
                let child = self.node_type(&entry.node.children[0]);
                if !child.satisfies(def.accepts) {
                    return halt(
                        ErrorKind::Type,
                        format!(
                            "parameter '{}' expects a {} filter, found {}",
                            def.name,
                            def.accepts.describe(),
                            child.describe()
                        ),
                    );
                }
                Ok(())
            }
            Kind::Find => {
                let has_all = entry.node.has_param(self.grammar.id("all"));
                if (has_all || !entry.node.range.is_empty()) && def.variant.is_none() {
                    entry.node.def = self.grammar.variant(def_id, "count");
                }
                Ok(())
            }
            Kind::PieceIn | Kind::SquareIn => {
                let domain = self.node_type(&entry.node.children[0]);
                if domain.intersect(TypeSet::SET).is_empty() {
                    return halt(
                        ErrorKind::Type,
                        format!(
                            "'{}' iterates over a set filter, found {}",
                            def.name,
                            domain.describe()
                        ),
                    );
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn finalize_assign(&mut self, entry: &mut Open) -> Rule<()> {
        let right = self.node_type(&entry.node.children[1]);
        let kind = match right.single() {
            Some(FilterType::Numeric) => VarKind::Numeric,
            Some(FilterType::Set) => VarKind::Set,
            Some(FilterType::Position) => VarKind::Position,
            _ => {
                return halt(
                    ErrorKind::Type,
                    format!("cannot assign a {} filter to a variable", right.describe()),
                );
            }
        };

        let (name, persistent) = {
            let left = &entry.node.children[0];
            let persistent = self.grammar.def(left.def).kind == Kind::Persistent;
            (left.leaf.clone().unwrap_or_default(), persistent)
        };
        if persistent && kind != VarKind::Numeric {
            return halt(
                ErrorKind::Type,
                format!(
                    "persistent variable '{name}' is numeric, cannot assign a {} filter",
                    right.describe()
                ),
            );
        }
        self.table
            .declare(&name, kind, persistent)
            .map_err(|message| Halt {
                kind: ErrorKind::Type,
                message,
            })?;

        // Fix the variable leaf and the assignment itself to the resolved
        // category's variants.
        if !persistent {
            let base = self.grammar.base_of(entry.node.children[0].def);
            entry.node.children[0].def = self.grammar.variant(base, kind.variant_name());
        }
        let assign_base = self.grammar.base_of(entry.node.def);
        entry.node.def = self.grammar.variant(assign_base, kind.variant_name());
        Ok(())
    }

    /// The resolved produced-type set of a finished node. Grouping and call
    /// nodes adopt their child's category; `if` intersects its branches and
    /// falls back to logical when they disagree or the `else` is missing.
    fn node_type(&self, node: &Node) -> TypeSet {
        let mut cur = node;
        loop {
            let def = self.grammar.def(cur.def);
            match def.kind {
                Kind::LParen | Kind::FunctionCall => match cur.children.first() {
                    Some(child) => cur = child,
                    None => return def.returns,
                },
                Kind::LBrace => match cur.children.last() {
                    Some(child) => cur = child,
                    None => return def.returns,
                },
                Kind::If => {
                    if cur.children.len() == 3 {
                        let then_type = self.node_type(&cur.children[1]);
                        let else_type = self.node_type(&cur.children[2]);
                        let common = then_type.intersect(else_type);
                        return if common.single().is_some() {
                            common
                        } else {
                            TypeSet::LOGICAL
                        };
                    }
                    return TypeSet::LOGICAL;
                }
                _ => return def.returns,
            }
        }
    }

    // ------------------------------------------------------------------
    // End of input
    // ------------------------------------------------------------------

    fn finish(&mut self) -> Rule<Node> {
        self.flush_range()?;

        while self.stack.len() > 1 {
            let top = self.stack.last().expect("non-empty");
            if self.complete(top) {
                self.pop_attach()?;
                continue;
            }
            let def = self.grammar.def(top.node.def);
            let message = if self.awaiting_bracket(top) {
                format!("unmatched '{}' at end of statement", def.name)
            } else if def.kind == Kind::If {
                if top.else_seen {
                    "if is missing its else branch".to_string()
                } else if top.then_seen {
                    "if is missing its then branch".to_string()
                } else {
                    "if is missing 'then'".to_string()
                }
            } else if def.kind == Kind::Line {
                "line is missing its constituents".to_string()
            } else if def.is(Flags::INFIX) {
                format!("statement ends with operator '{}'", def.name)
            } else {
                format!("'{}' is incomplete at end of statement", def.display_name())
            };
            return halt(ErrorKind::Structural, message);
        }

        let root = self.stack.pop().expect("root remains");
        if !root.closed {
            return halt(ErrorKind::Structural, "unmatched '(' in cql()");
        }
        let mut node = root.node;
        if node.children.len() > 1 {
            // Keep the root at a single body child.
            let mut body = Node::new(self.grammar.id("{"));
            body.children = std::mem::take(&mut node.children);
            node.children.push(body);
        }
        log::debug!(
            "parsed statement with {} body filter(s)",
            node.children.len()
        );
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Result<Node, ParseError> {
        let grammar = Grammar::new();
        let mut parser = Parser::new(Lexer::new(&grammar, input));
        parser.parse_statement()
    }

    #[test]
    fn leaf_body() {
        let grammar = Grammar::new();
        let root = {
            let mut parser = Parser::new(Lexer::new(&grammar, "cql() wtm"));
            parser.parse_statement().unwrap()
        };
        assert_eq!(root.children.len(), 1);
        assert_eq!(grammar.def(root.children[0].def).name, "wtm");
    }

    #[test]
    fn unterminated_header() {
        let err = parse("cql( wtm").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Parameter);
    }

    #[test]
    fn one_error_per_statement() {
        // Both the unmatched paren and the operand would be wrong; only the
        // first problem is reported.
        let err = parse("cql() (k").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Structural);
        assert!(err.remaining.is_empty());
    }
}
