//! Parameter legality for the filter families that take named parameters
//! (`move`, `line`, `pin`, `find`, `ray`).
//!
//! Every rule is a pure predicate over the incoming parameter and the
//! parameters already applied to the enclosing filter; nothing is mutated
//! until every check for the token has passed. Membership is keyed on the
//! definition's base name, so re-typed variants (e.g. `move/set`) accept the
//! same parameters as their base.

use crate::ast::Node;
use crate::grammar::{DefId, Grammar};

/// Which filters accept a parameter, by name.
const ALLOWED_IN: &[(&str, &[&str])] = &[
    ("from", &["move", "pin"]),
    ("to", &["move", "pin"]),
    ("through", &["pin"]),
    ("capture", &["move"]),
    ("promote", &["move"]),
    ("enpassant", &["move"]),
    ("enpassantsquare", &["move"]),
    ("legal", &["move"]),
    ("pseudolegal", &["move"]),
    ("previous", &["move"]),
    ("null", &["move"]),
    ("primary", &["move", "line"]),
    ("secondary", &["move", "line"]),
    ("mainline", &["move"]),
    ("all", &["find"]),
    ("firstmatch", &["line"]),
    ("lastposition", &["line"]),
    ("singlecolor", &["line"]),
    ("nestban", &["line"]),
    ("up", &["ray"]),
    ("down", &["ray"]),
    ("left", &["ray"]),
    ("right", &["ray"]),
    ("northeast", &["ray"]),
    ("northwest", &["ray"]),
    ("southeast", &["ray"]),
    ("southwest", &["ray"]),
    ("diagonal", &["ray"]),
    ("orthogonal", &["ray"]),
    ("vertical", &["ray"]),
    ("horizontal", &["ray"]),
    ("anydirection", &["ray"]),
];

/// Pairs that may not both be applied to the same filter, either order.
const MUTUALLY_EXCLUSIVE: &[(&str, &str)] = &[
    ("legal", "pseudolegal"),
    ("legal", "previous"),
    ("pseudolegal", "previous"),
    ("capture", "legal"),
    ("capture", "pseudolegal"),
    ("null", "legal"),
    ("null", "pseudolegal"),
    ("promote", "legal"),
    ("promote", "pseudolegal"),
    ("primary", "legal"),
    ("primary", "pseudolegal"),
    ("secondary", "legal"),
    ("secondary", "pseudolegal"),
];

/// Parameters that re-type `move` from logical to set on first occurrence.
const MOVE_SET_PARAMS: &[&str] = &["from", "to", "capture"];

/// True if `param` may attach to a filter with definition `parent`.
pub fn allowed_in(grammar: &Grammar, parent: DefId, param: DefId) -> bool {
    let parent_name = grammar.def(parent).name;
    let param_name = grammar.def(param).name;
    ALLOWED_IN
        .iter()
        .find(|(name, _)| *name == param_name)
        .is_some_and(|(_, parents)| parents.contains(&parent_name))
}

/// Validate `param` against the parameters already applied to `parent`.
///
/// Returns the error message on rejection; the caller owns the error kind
/// and position bookkeeping.
pub fn check(grammar: &Grammar, parent: &Node, param: DefId) -> Result<(), String> {
    let parent_name = grammar.def(parent.def).name;
    let param_name = grammar.def(param).name;

    if !allowed_in(grammar, parent.def, param) {
        return Err(format!(
            "parameter '{param_name}' is not accepted by '{parent_name}'"
        ));
    }
    if parent.has_param(param) {
        return Err(format!(
            "duplicate parameter '{param_name}' on '{parent_name}'"
        ));
    }
    for (a, b) in MUTUALLY_EXCLUSIVE {
        let other = if param_name == *a {
            b
        } else if param_name == *b {
            a
        } else {
            continue;
        };
        if parent.has_param(grammar.id(other)) {
            return Err(format!(
                "'{param_name}' cannot be combined with '{other}' on '{parent_name}'"
            ));
        }
    }
    Ok(())
}

/// True if applying `param` forces a `move` filter to its set variant.
pub fn retypes_move_to_set(grammar: &Grammar, param: DefId) -> bool {
    MOVE_SET_PARAMS.contains(&grammar.def(param).name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::Grammar;

    #[test]
    fn membership() {
        let g = Grammar::new();
        assert!(allowed_in(&g, g.id("move"), g.id("legal")));
        assert!(allowed_in(&g, g.id("pin"), g.id("through")));
        assert!(!allowed_in(&g, g.id("pin"), g.id("legal")));
        assert!(!allowed_in(&g, g.id("move"), g.id("up")));
    }

    #[test]
    fn exclusion_is_order_independent() {
        let g = Grammar::new();
        let mut mv = Node::new(g.id("move"));
        mv.params.push(crate::ast::Param {
            def: g.id("legal"),
            value: None,
        });
        assert!(check(&g, &mv, g.id("capture")).is_err());

        let mut mv = Node::new(g.id("move"));
        mv.params.push(crate::ast::Param {
            def: g.id("capture"),
            value: None,
        });
        assert!(check(&g, &mv, g.id("legal")).is_err());
    }

    #[test]
    fn duplicates_rejected() {
        let g = Grammar::new();
        let mut mv = Node::new(g.id("move"));
        mv.params.push(crate::ast::Param {
            def: g.id("legal"),
            value: None,
        });
        assert!(check(&g, &mv, g.id("legal")).is_err());
    }

    #[test]
    fn set_retype_params() {
        let g = Grammar::new();
        assert!(retypes_move_to_set(&g, g.id("from")));
        assert!(retypes_move_to_set(&g, g.id("capture")));
        assert!(!retypes_move_to_set(&g, g.id("legal")));
    }
}
