use serde::Serialize;

use crate::grammar::DefId;

/// A parameter applied to a filter, e.g. move's `legal` or `from k`.
///
/// Bare parameters carry no value; trailing-argument parameters carry the
/// filter they introduced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Param {
    pub def: DefId,
    pub value: Option<Node>,
}

/// One node of the filter tree.
///
/// A node references its grammar-table entry by [`DefId`]; re-typing a node
/// during collapse swaps that index for a same-precedence variant (the table
/// itself is never mutated). A node owns its children and parameters; the
/// parse result's root is the only node handed to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    pub def: DefId,
    pub children: Vec<Node>,
    /// Terminal value for leaf filters: identifier text, literal number
    /// text, quoted string, piece designator.
    pub leaf: Option<String>,
    pub params: Vec<Param>,
    /// Range argument (one or two numbers) for range-accepting filters.
    pub range: Vec<i64>,
}

impl Node {
    pub fn new(def: DefId) -> Node {
        Node {
            def,
            children: Vec::new(),
            leaf: None,
            params: Vec::new(),
            range: Vec::new(),
        }
    }

    pub fn leaf(def: DefId, text: impl Into<String>) -> Node {
        Node {
            def,
            children: Vec::new(),
            leaf: Some(text.into()),
            params: Vec::new(),
            range: Vec::new(),
        }
    }

    /// True if a parameter with this definition has already been applied.
    pub fn has_param(&self, def: DefId) -> bool {
        self.params.iter().any(|p| p.def == def)
    }

    /// The applied parameter's value, if any.
    pub fn param_value(&self, def: DefId) -> Option<&Node> {
        self.params
            .iter()
            .find(|p| p.def == def)
            .and_then(|p| p.value.as_ref())
    }
}
