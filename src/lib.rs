pub mod ast;
pub mod board;
pub mod grammar;
pub mod lexer;
pub mod output;
pub mod params;
pub mod parser;
pub mod vars;

pub use ast::{Node, Param, Token};
pub use grammar::{FilterType, Grammar, Kind, TypeSet};
pub use lexer::Lexer;
pub use output::{to_tree, TreePrinter};
pub use parser::{ErrorKind, ParseError, Parser};
pub use vars::{VarKind, VariableTable};
