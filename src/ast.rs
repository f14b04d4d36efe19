//! # CQL Abstract Syntax Tree
//!
//! This module defines the AST for the Chess Query Language, a typed filter
//! language for querying chess game data.
//!
//! ## Architecture Overview
//!
//! The AST module is organized into focused submodules:
//!
//! - **[tokens]** - Tagged lexemes produced by the combined-pattern scan
//! - **[node]** - Filter tree nodes and their applied parameters
//!
//! The grammar table the nodes reference lives in [`crate::grammar`]; a node
//! carries a stable index into it rather than its own copy of the definition.
//!
//! ## Core Concepts
//!
//! ### Filters
//!
//! Every CQL construct is a *filter* — the language's expression unit. A
//! filter produces one of four categories once parsing narrows it: logical,
//! numeric, position, or set.
//!
//! ```text
//! cql() wtm                   a logical leaf filter
//! cql() k & Q                 a set intersection of two piece designators
//! cql() move from k legal     a move filter with applied parameters
//! ```
//!
//! ### Statement shape
//!
//! Every statement opens with the `cql( … )` header clause; its parameters
//! (`input`, `matchcount`, `silent`, …) attach to the root node, and the
//! statement body becomes the root's single child (multiple body filters are
//! wrapped in an implicit compound).
pub mod node;
pub mod tokens;

pub use node::{Node, Param};
pub use tokens::Token;
