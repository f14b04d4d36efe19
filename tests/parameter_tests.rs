// tests/parameter_tests.rs

use cql_lang::ast::Node;
use cql_lang::grammar::Grammar;
use cql_lang::lexer::Lexer;
use cql_lang::parser::{ErrorKind, ParseError, Parser};

fn parse(grammar: &Grammar, input: &str) -> Result<Node, ParseError> {
    Parser::new(Lexer::new(grammar, input)).parse_statement()
}

fn body(grammar: &Grammar, input: &str) -> Node {
    let mut root = parse(grammar, input).unwrap();
    root.children.remove(0)
}

// ============================================================================
// Move Parameters
// ============================================================================

#[test]
fn test_move_with_parameters() {
    let grammar = Grammar::new();
    let node = body(&grammar, "cql() move from k to Q legal");
    assert!(node.has_param(grammar.id("from")));
    assert!(node.has_param(grammar.id("to")));
    assert!(node.has_param(grammar.id("legal")));
}

#[test]
fn test_trailing_parameter_carries_its_value() {
    let grammar = Grammar::new();
    let node = body(&grammar, "cql() move from k");
    let value = node.param_value(grammar.id("from")).unwrap();
    assert_eq!(value.leaf.as_deref(), Some("k"));
}

#[test]
fn test_from_retypes_move_to_set() {
    let grammar = Grammar::new();
    let node = body(&grammar, "cql() move from k");
    assert_eq!(grammar.def(node.def).display_name(), "move/set");
    // A plain move stays logical.
    let plain = body(&grammar, "cql() move legal");
    assert_eq!(grammar.def(plain.def).display_name(), "move");
}

#[test]
fn test_legal_and_capture_are_mutually_exclusive() {
    let grammar = Grammar::new();
    let err = parse(&grammar, "cql() move legal capture k").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Parameter);
}

#[test]
fn test_legal_and_pseudolegal_are_mutually_exclusive() {
    let grammar = Grammar::new();
    let err = parse(&grammar, "cql() move legal pseudolegal").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Parameter);
}

#[test]
fn test_mainline_is_claimed_by_an_open_move() {
    let grammar = Grammar::new();
    let node = body(&grammar, "cql() move mainline");
    assert_eq!(grammar.def(node.def).display_name(), "move");
    assert!(node.has_param(grammar.id("mainline")));
    // Standalone, it stays an ordinary logical leaf.
    let root = parse(&grammar, "cql() mainline k").unwrap();
    let wrapper = &root.children[0];
    assert_eq!(grammar.def(wrapper.children[0].def).name, "mainline");
}

#[test]
fn test_exclusion_holds_in_either_order() {
    let grammar = Grammar::new();
    let err = parse(&grammar, "cql() move capture k legal").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Parameter);
    assert!(err.message.contains("legal") && err.message.contains("capture"));
}

#[test]
fn test_duplicate_parameter() {
    let grammar = Grammar::new();
    let err = parse(&grammar, "cql() move legal legal").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Parameter);
}

#[test]
fn test_parameter_value_must_be_a_set() {
    let grammar = Grammar::new();
    let err = parse(&grammar, "cql() move from wtm").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Type);
}

// ============================================================================
// Membership: which filter takes which parameter
// ============================================================================

#[test]
fn test_through_belongs_to_pin_only() {
    let grammar = Grammar::new();
    assert!(parse(&grammar, "cql() pin through Q").is_ok());
    let err = parse(&grammar, "cql() move through Q").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Parameter);
}

#[test]
fn test_from_belongs_to_move_and_pin() {
    let grammar = Grammar::new();
    assert!(parse(&grammar, "cql() pin from R").is_ok());
    let err = parse(&grammar, "cql() find from R check").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Parameter);
}

#[test]
fn test_line_parameters() {
    let grammar = Grammar::new();
    let node = body(&grammar, "cql() line firstmatch --> check");
    assert!(node.has_param(grammar.id("firstmatch")));
}

#[test]
fn test_primary_is_shared_by_move_and_line() {
    let grammar = Grammar::new();
    assert!(parse(&grammar, "cql() move primary").is_ok());
    assert!(parse(&grammar, "cql() line primary --> check").is_ok());
}

#[test]
fn test_parameter_without_a_filter() {
    let grammar = Grammar::new();
    let err = parse(&grammar, "cql() legal").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Parameter);
}

#[test]
fn test_parameter_does_not_cross_a_halting_filter() {
    // The inner `find` halts the search for a parameter-accepting parent,
    // so `legal` cannot reach the outer `move`.
    let grammar = Grammar::new();
    let err = parse(&grammar, "cql() move to find legal check").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Parameter);
}

// ============================================================================
// Statement Header Parameters
// ============================================================================

#[test]
fn test_header_parameters() {
    let grammar = Grammar::new();
    let root = parse(
        &grammar,
        "cql(input games.pgn output matches.pgn silent) wtm",
    )
    .unwrap();
    assert!(root.has_param(grammar.id("input")));
    assert!(root.has_param(grammar.id("output")));
    assert!(root.has_param(grammar.id("silent")));
}

#[test]
fn test_matchcount_carries_its_range() {
    let grammar = Grammar::new();
    let root = parse(&grammar, "cql(matchcount 2 10) wtm").unwrap();
    let value = root.param_value(grammar.id("matchcount")).unwrap();
    assert_eq!(value.range, vec![2, 10]);
}

#[test]
fn test_body_filter_inside_header() {
    let grammar = Grammar::new();
    let err = parse(&grammar, "cql(wtm) k").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Parameter);
}

#[test]
fn test_header_parameter_in_body() {
    let grammar = Grammar::new();
    let err = parse(&grammar, "cql() silent wtm").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Parameter);
}

#[test]
fn test_duplicate_header_parameter() {
    let grammar = Grammar::new();
    let err = parse(&grammar, "cql(silent silent) wtm").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Parameter);
}

#[test]
fn test_unterminated_header() {
    let grammar = Grammar::new();
    let err = parse(&grammar, "cql( wtm").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Parameter);
}

#[test]
fn test_result_in_header_and_body() {
    // `result` is a header parameter inside cql() and a leaf filter outside.
    let grammar = Grammar::new();
    let root = parse(&grammar, "cql(result 1-0) wtm").unwrap();
    assert!(root.has_param(grammar.id("result")));

    let root = parse(&grammar, "cql() not result 0-1").unwrap();
    let not = &root.children[0];
    assert_eq!(grammar.def(not.children[0].def).name, "result");
}
