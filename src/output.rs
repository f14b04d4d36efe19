//! Text rendering of parsed filter trees.
//!
//! One node per line, children indented two spaces below their parent.
//! Parameters print on the node's own line so `move from k to Q legal`
//! stays a single line. The output is deterministic and line-oriented,
//! which keeps expected-tree assertions in tests readable.
//!
//! # Examples
//!
//! ```
//! use cql_lang::{Grammar, Lexer, Parser};
//! use cql_lang::output::to_tree;
//!
//! let grammar = Grammar::new();
//! let root = Parser::new(Lexer::new(&grammar, "cql() k & Q"))
//!     .parse_statement()
//!     .unwrap();
//! let tree = to_tree(&grammar, &root);
//! assert!(tree.contains("&"));
//! ```

use crate::ast::Node;
use crate::grammar::Grammar;

pub struct TreePrinter<'g> {
    grammar: &'g Grammar,
}

impl<'g> TreePrinter<'g> {
    pub fn new(grammar: &'g Grammar) -> TreePrinter<'g> {
        TreePrinter { grammar }
    }

    pub fn print(&self, node: &Node) -> String {
        let mut out = String::new();
        self.print_node(node, 0, &mut out);
        out
    }

    fn print_node(&self, node: &Node, indent: usize, out: &mut String) {
        out.push_str(&self.indent(indent));
        out.push_str(&self.describe(node));
        out.push('\n');
        for child in &node.children {
            self.print_node(child, indent + 1, out);
        }
    }

    /// The node's own line: name, variant tag, leaf text when it differs
    /// from the name, range numbers, then parameters in source order.
    fn describe(&self, node: &Node) -> String {
        let def = self.grammar.def(node.def);
        let mut line = def.display_name();

        if let Some(leaf) = &node.leaf {
            if leaf != def.name {
                line.push_str(" \"");
                line.push_str(leaf);
                line.push('"');
            }
        }
        for n in &node.range {
            line.push(' ');
            line.push_str(&n.to_string());
        }
        for param in &node.params {
            line.push_str(" [");
            line.push_str(&self.grammar.def(param.def).display_name());
            if let Some(value) = &param.value {
                line.push(' ');
                line.push_str(&self.describe_inline(value));
            }
            line.push(']');
        }
        line
    }

    /// One-line rendering for parameter values, children parenthesized.
    fn describe_inline(&self, node: &Node) -> String {
        let mut line = self.describe(node);
        if !node.children.is_empty() {
            line.push_str(" (");
            let children: Vec<String> = node
                .children
                .iter()
                .map(|c| self.describe_inline(c))
                .collect();
            line.push_str(&children.join(" "));
            line.push(')');
        }
        line
    }

    fn indent(&self, level: usize) -> String {
        "  ".repeat(level)
    }
}

/// Renders a parsed filter tree as indented text.
pub fn to_tree(grammar: &Grammar, node: &Node) -> String {
    TreePrinter::new(grammar).print(node)
}
