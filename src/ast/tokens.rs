use serde::Serialize;

use crate::grammar::DefId;

/// A tagged lexeme: which grammar-table entry matched, and the matched text.
///
/// Phrase tokens embed their values in the text (`movenumber 5 10`,
/// `piece x in`, `input games.pgn`); the parser recovers them with the
/// helpers below rather than carrying separate capture fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Token {
    pub def: DefId,
    pub text: String,
}

impl Token {
    pub fn new(def: DefId, text: impl Into<String>) -> Token {
        Token {
            def,
            text: text.into(),
        }
    }

    /// Whitespace-separated words of the matched text.
    pub fn words(&self) -> impl Iterator<Item = &str> {
        self.text.split_whitespace()
    }

    /// Every decimal number embedded in the text, in order.
    ///
    /// # Examples
    /// ```text
    /// "movenumber 5 10"  ->  [5, 10]
    /// "consecutivemoves 2 (x y)"  ->  [2]
    /// ```
    pub fn embedded_numbers(&self) -> Vec<i64> {
        self.words().filter_map(|w| w.parse::<i64>().ok()).collect()
    }

    /// The quoted string embedded in the text, without its quotes.
    pub fn embedded_string(&self) -> Option<&str> {
        let start = self.text.find('"')?;
        let end = self.text.rfind('"')?;
        if end > start {
            Some(&self.text[start + 1..end])
        } else {
            None
        }
    }

    /// Identifier-shaped words of the text that are not in `keywords`,
    /// with bracket punctuation stripped. Used for phrases that embed
    /// variable names, e.g. `consecutivemoves 2 (x y)` yields `x`, `y`.
    pub fn embedded_names<'a>(&'a self, keywords: &'a [&str]) -> impl Iterator<Item = &'a str> {
        self.text
            .split(|c: char| c.is_whitespace() || c == '(' || c == ')')
            .filter(|w| !w.is_empty())
            .filter(move |w| {
                !keywords.contains(w)
                    && w.chars()
                        .next()
                        .is_some_and(|c| c.is_alphabetic() || c == '_')
            })
    }
}
