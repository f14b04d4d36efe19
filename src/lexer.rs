use crate::ast::Token;
use crate::grammar::{Grammar, Kind};

/// Scans a statement with the grammar's combined pattern.
///
/// One regex alternation covers every token definition, each alternative
/// tagged with its definition; a scan therefore yields an ordered stream of
/// typed tokens directly. Whitespace falls between matches and comments are
/// dropped here; anything else is guaranteed to match at least the catch-all
/// `unrecognized` alternative, so the stream always covers the input.
pub struct Lexer<'g> {
    grammar: &'g Grammar,
    input: String,
    position: usize,
}

impl<'g> Lexer<'g> {
    pub fn new(grammar: &'g Grammar, input: &str) -> Lexer<'g> {
        Lexer {
            grammar,
            input: input.to_string(),
            position: 0,
        }
    }

    /// The full statement text, for error reporting.
    pub fn statement(&self) -> &str {
        &self.input
    }

    pub fn grammar(&self) -> &'g Grammar {
        self.grammar
    }

    /// The next token, or `None` at end of input.
    pub fn next_token(&mut self) -> Option<Token> {
        loop {
            if self.position >= self.input.len() {
                return None;
            }
            let caps = self
                .grammar
                .pattern()
                .captures_at(&self.input, self.position)?;
            let whole = caps.get(0)?;
            self.position = whole.end();

            let mut matched = None;
            for (idx, id) in self.grammar.scan_order().iter().enumerate() {
                if caps.name(self.grammar.group_name(idx)).is_some() {
                    matched = Some(*id);
                    break;
                }
            }
            let def = matched?;
            if self.grammar.def(def).kind == Kind::Comment {
                continue;
            }
            log::trace!(
                "token {} {:?}",
                self.grammar.def(def).name,
                whole.as_str()
            );
            return Some(Token::new(def, whole.as_str()));
        }
    }

    /// Scan the remaining input into a vector.
    pub fn tokenize(&mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        while let Some(token) = self.next_token() {
            tokens.push(token);
        }
        tokens
    }
}

#[test]
fn test_keywords() {
    let grammar = Grammar::new();
    let mut lexer = Lexer::new(&grammar, "wtm btm check not and or");
    let names: Vec<&str> = std::iter::from_fn(|| lexer.next_token())
        .map(|t| grammar.def(t.def).name)
        .collect();
    assert_eq!(names, vec!["wtm", "btm", "check", "not", "and", "or"]);
}

#[test]
fn test_designator_before_identifier() {
    let grammar = Grammar::new();
    let mut lexer = Lexer::new(&grammar, "k kings b4");
    let first = lexer.next_token().unwrap();
    assert_eq!(grammar.def(first.def).kind, Kind::PieceDesignator);
    let second = lexer.next_token().unwrap();
    assert_eq!(grammar.def(second.def).kind, Kind::Variable);
    let third = lexer.next_token().unwrap();
    assert_eq!(grammar.def(third.def).kind, Kind::PieceDesignator);
}
