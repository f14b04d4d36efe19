//! Per-parse variable and function state.
//!
//! A variable's category is fixed by its first assignment and never changes
//! for the rest of the statement. Function definitions store their formal
//! parameter names and the unparsed body text; calls are macro-expanded by
//! textual substitution and re-tokenization (see the parser), so the table
//! also supplies the reserved-name scheme those expansions mint from.

use std::collections::HashMap;

/// Prefix of synthesized substitution variables; user names may not start
/// with it.
pub const RESERVED_PREFIX: &str = "__cql";

/// Category a variable is fixed to on first assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    Numeric,
    Set,
    Piece,
    Position,
}

impl VarKind {
    /// Variant tag of the `variable` grammar entry for this category.
    pub fn variant_name(self) -> &'static str {
        match self {
            VarKind::Numeric => "numeric",
            VarKind::Set => "set",
            VarKind::Piece => "piece",
            VarKind::Position => "position",
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            VarKind::Numeric => "numeric",
            VarKind::Set => "set",
            VarKind::Piece => "piece",
            VarKind::Position => "position",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Variable {
    pub kind: VarKind,
    pub persistent: bool,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub formals: Vec<String>,
    /// Verbatim body token text, braces excluded.
    pub body: String,
}

/// Declared variables and defined functions for one statement.
#[derive(Default)]
pub struct VariableTable {
    vars: HashMap<String, Variable>,
    funcs: HashMap<String, Function>,
}

impl VariableTable {
    pub fn new() -> VariableTable {
        VariableTable::default()
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.vars.get(name)
    }

    /// Fix `name` to `kind`. An existing entry must agree.
    pub fn declare(&mut self, name: &str, kind: VarKind, persistent: bool) -> Result<(), String> {
        if self.funcs.contains_key(name) {
            return Err(format!("'{name}' is already a function name"));
        }
        match self.vars.get(name) {
            Some(existing) if existing.kind != kind => Err(format!(
                "variable '{name}' is {} but is used as {}",
                existing.kind.describe(),
                kind.describe()
            )),
            Some(_) => Ok(()),
            None => {
                self.vars
                    .insert(name.to_string(), Variable { kind, persistent });
                Ok(())
            }
        }
    }

    /// Drop a locally-introduced variable (reserved names after a call
    /// expansion finishes).
    pub fn remove(&mut self, name: &str) {
        self.vars.remove(name);
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.funcs.get(name)
    }

    pub fn define_function(
        &mut self,
        name: &str,
        formals: Vec<String>,
        body: String,
    ) -> Result<(), String> {
        if self.vars.contains_key(name) {
            return Err(format!("'{name}' is already a variable name"));
        }
        if self.funcs.contains_key(name) {
            return Err(format!("function '{name}' is already defined"));
        }
        self.funcs
            .insert(name.to_string(), Function { formals, body });
        Ok(())
    }
}

/// True if a user-chosen name collides with the reserved substitution prefix.
pub fn is_reserved(name: &str) -> bool {
    name.starts_with(RESERVED_PREFIX)
}

/// Mint the `counter`-th collision-free substitution name.
pub fn reserved_name(counter: u32) -> String {
    format!("{RESERVED_PREFIX}_{counter}")
}

/// Replace whole-identifier occurrences of formal parameter names in a
/// function body with their substituted names. Quoted strings are left
/// untouched, and replacement never applies inside a longer identifier.
pub fn substitute(body: &str, map: &[(String, String)]) -> String {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.char_indices().peekable();
    while let Some((start, ch)) = chars.next() {
        if ch == '"' {
            // Copy the string literal through verbatim.
            out.push(ch);
            for (_, c) in chars.by_ref() {
                out.push(c);
                if c == '"' {
                    break;
                }
            }
        } else if ch.is_alphabetic() || ch == '_' {
            let mut end = start + ch.len_utf8();
            while let Some(&(idx, c)) = chars.peek() {
                if c.is_alphanumeric() || c == '_' {
                    end = idx + c.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            let word = &body[start..end];
            match map.iter().find(|(formal, _)| formal == word) {
                Some((_, actual)) => out.push_str(actual),
                None => out.push_str(word),
            }
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declare_fixes_kind() {
        let mut table = VariableTable::new();
        table.declare("w", VarKind::Numeric, false).unwrap();
        assert!(table.declare("w", VarKind::Numeric, false).is_ok());
        assert!(table.declare("w", VarKind::Set, false).is_err());
    }

    #[test]
    fn substitute_whole_words_only() {
        let map = vec![("x".to_string(), "__cql_0".to_string())];
        assert_eq!(substitute("x + x2 + x", &map), "__cql_0 + x2 + __cql_0");
        assert_eq!(substitute("\"x marks\" x", &map), "\"x marks\" __cql_0");
    }

    #[test]
    fn reserved_names() {
        assert!(is_reserved(&reserved_name(3)));
        assert!(!is_reserved("wanderer"));
    }
}
