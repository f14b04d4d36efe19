// tests/parser_tests.rs

use cql_lang::ast::Node;
use cql_lang::grammar::Grammar;
use cql_lang::lexer::Lexer;
use cql_lang::parser::{ErrorKind, ParseError, Parser};

fn parse(grammar: &Grammar, input: &str) -> Result<Node, ParseError> {
    let _ = env_logger::builder().is_test(true).try_init();
    Parser::new(Lexer::new(grammar, input)).parse_statement()
}

fn body(grammar: &Grammar, input: &str) -> Node {
    let mut root = parse(grammar, input).unwrap();
    assert_eq!(root.children.len(), 1, "statement has one body filter");
    root.children.remove(0)
}

fn name(grammar: &Grammar, node: &Node) -> String {
    grammar.def(node.def).display_name()
}

// ============================================================================
// Statement Frame
// ============================================================================

#[test]
fn test_minimal_statement() {
    let grammar = Grammar::new();
    let root = parse(&grammar, "cql() wtm").unwrap();
    assert_eq!(name(&grammar, &root), "cql");
    assert_eq!(name(&grammar, &root.children[0]), "wtm");
}

#[test]
fn test_empty_body_is_legal() {
    let grammar = Grammar::new();
    let root = parse(&grammar, "cql()").unwrap();
    assert!(root.children.is_empty());
}

#[test]
fn test_statement_must_open_with_cql() {
    let grammar = Grammar::new();
    let err = parse(&grammar, "wtm").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Structural);
}

#[test]
fn test_multiple_body_filters_become_a_compound() {
    let grammar = Grammar::new();
    let root = parse(&grammar, "cql() wtm btm check").unwrap();
    assert_eq!(root.children.len(), 1);
    let compound = &root.children[0];
    assert_eq!(name(&grammar, compound), "{");
    assert_eq!(compound.children.len(), 3);
}

// ============================================================================
// Operators and Precedence
// ============================================================================

#[test]
fn test_designator_body() {
    let grammar = Grammar::new();
    let node = body(&grammar, "cql() k");
    assert_eq!(name(&grammar, &node), "piecedesignator");
    assert_eq!(node.leaf.as_deref(), Some("k"));
}

#[test]
fn test_intersection() {
    let grammar = Grammar::new();
    let node = body(&grammar, "cql() k & Q");
    assert_eq!(name(&grammar, &node), "&");
    assert_eq!(node.children[0].leaf.as_deref(), Some("k"));
    assert_eq!(node.children[1].leaf.as_deref(), Some("Q"));
}

#[test]
fn test_multiplication_binds_tighter_than_addition() {
    let grammar = Grammar::new();
    let node = body(&grammar, "cql() 2 + 3 * movenumber");
    assert_eq!(name(&grammar, &node), "+");
    assert_eq!(name(&grammar, &node.children[1]), "*");
}

#[test]
fn test_left_associativity() {
    let grammar = Grammar::new();
    let node = body(&grammar, "cql() 8 - 3 - 2");
    // ((8 - 3) - 2), not (8 - (3 - 2)).
    assert_eq!(name(&grammar, &node), "-");
    assert_eq!(name(&grammar, &node.children[0]), "-");
    assert_eq!(node.children[1].leaf.as_deref(), Some("2"));
}

#[test]
fn test_parentheses_override_precedence() {
    let grammar = Grammar::new();
    let node = body(&grammar, "cql() (k | Q) & R");
    assert_eq!(name(&grammar, &node), "&");
    assert_eq!(name(&grammar, &node.children[0]), "(");
    assert_eq!(name(&grammar, &node.children[0].children[0]), "|");
}

#[test]
fn test_not_binds_tighter_than_or() {
    let grammar = Grammar::new();
    let node = body(&grammar, "cql() not wtm or btm");
    assert_eq!(name(&grammar, &node), "or");
    assert_eq!(name(&grammar, &node.children[0]), "not");
}

#[test]
fn test_unary_minus() {
    let grammar = Grammar::new();
    let node = body(&grammar, "cql() movenumber == -3");
    assert_eq!(name(&grammar, &node), "==");
    assert_eq!(name(&grammar, &node.children[1]), "unary-");
}

#[test]
fn test_binary_minus_after_operand() {
    let grammar = Grammar::new();
    let node = body(&grammar, "cql() movenumber - 3");
    assert_eq!(name(&grammar, &node), "-");
    assert_eq!(node.children.len(), 2);
}

// ============================================================================
// Type Checking and Re-Typing
// ============================================================================

#[test]
fn test_equality_retypes_from_left_operand() {
    let grammar = Grammar::new();
    let node = body(&grammar, "cql() parent == currentposition");
    assert_eq!(name(&grammar, &node), "==/position");
}

#[test]
fn test_membership_retypes_to_set() {
    let grammar = Grammar::new();
    let node = body(&grammar, "cql() k in Q");
    assert_eq!(name(&grammar, &node), "in/set");
}

#[test]
fn test_equality_checks_both_sides() {
    // A numeric left operand holds `==` to numbers, same as the mirror.
    let grammar = Grammar::new();
    let err = parse(&grammar, "cql() 1 == k").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Type);
    let err = parse(&grammar, "cql() k == 1").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Type);
    assert!(parse(&grammar, "cql() 1 == movenumber").is_ok());
}

#[test]
fn test_relation_rejects_set_operand() {
    let grammar = Grammar::new();
    let err = parse(&grammar, "cql() k < Q").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Type);
}

#[test]
fn test_union_rejects_logical_operand() {
    let grammar = Grammar::new();
    let err = parse(&grammar, "cql() wtm | k").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Type);
}

#[test]
fn test_compound_adopts_last_child_type() {
    // `{ wtm k }` is a set filter because its last constituent is.
    let grammar = Grammar::new();
    let node = body(&grammar, "cql() { wtm k } & Q");
    assert_eq!(name(&grammar, &node), "&");
    assert_eq!(name(&grammar, &node.children[0]), "{");
}

#[test]
fn test_rank_of_set() {
    let grammar = Grammar::new();
    let node = body(&grammar, "cql() rank k == 8");
    assert_eq!(name(&grammar, &node), "==");
    assert_eq!(name(&grammar, &node.children[0]), "rank");
}

// ============================================================================
// Brackets
// ============================================================================

#[test]
fn test_unmatched_open_paren() {
    let grammar = Grammar::new();
    let err = parse(&grammar, "cql() (k").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Structural);
    assert!(err.remaining.is_empty());
}

#[test]
fn test_unmatched_close_paren() {
    let grammar = Grammar::new();
    let err = parse(&grammar, "cql() k )").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Structural);
}

#[test]
fn test_mismatched_brackets() {
    let grammar = Grammar::new();
    let err = parse(&grammar, "cql() ( k }").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Structural);
}

#[test]
fn test_empty_compound_is_structural() {
    let grammar = Grammar::new();
    let err = parse(&grammar, "cql() { }").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Structural);
}

#[test]
fn test_statement_ending_in_operator() {
    let grammar = Grammar::new();
    let err = parse(&grammar, "cql() k &").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Structural);
}

#[test]
fn test_only_first_error_is_reported() {
    // The dangling operator comes first; the unmatched brace never gets a
    // chance to complain.
    let grammar = Grammar::new();
    let err = parse(&grammar, "cql() { k & } wtm").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Structural);
    assert_eq!(err.remaining, vec!["wtm"]);
}

// ============================================================================
// Frames
// ============================================================================

#[test]
fn test_if_then_else() {
    let grammar = Grammar::new();
    let node = body(&grammar, "cql() if check then k else Q");
    assert_eq!(name(&grammar, &node), "if");
    assert_eq!(node.children.len(), 3);
}

#[test]
fn test_if_without_else() {
    let grammar = Grammar::new();
    let node = body(&grammar, "cql() if check then mate");
    assert_eq!(node.children.len(), 2);
}

#[test]
fn test_dangling_else_binds_to_inner_if() {
    let grammar = Grammar::new();
    let node = body(&grammar, "cql() if check then if mate then k else Q");
    assert_eq!(node.children.len(), 2);
    let inner = &node.children[1];
    assert_eq!(name(&grammar, inner), "if");
    assert_eq!(inner.children.len(), 3);
}

#[test]
fn test_then_without_if() {
    let grammar = Grammar::new();
    let err = parse(&grammar, "cql() then k").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Structural);
}

#[test]
fn test_line_with_arrows() {
    let grammar = Grammar::new();
    let node = body(&grammar, "cql() line --> check --> mate");
    assert_eq!(name(&grammar, &node), "line");
    assert_eq!(node.children.len(), 2);
}

#[test]
fn test_line_rejects_mixed_arrows() {
    let grammar = Grammar::new();
    let err = parse(&grammar, "cql() line --> check <-- mate").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Structural);
}

#[test]
fn test_line_with_range() {
    let grammar = Grammar::new();
    let node = body(&grammar, "cql() line 2 5 --> check --> mate");
    assert_eq!(node.range, vec![2, 5]);
    assert_eq!(node.children.len(), 2);
}

#[test]
fn test_arrow_outside_line() {
    let grammar = Grammar::new();
    let err = parse(&grammar, "cql() --> check").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Structural);
}

// ============================================================================
// Ranges, find, ray, call filters
// ============================================================================

#[test]
fn test_find_with_range_becomes_count() {
    let grammar = Grammar::new();
    let node = body(&grammar, "cql() find 2 5 check");
    assert_eq!(name(&grammar, &node), "find/count");
    assert_eq!(node.range, vec![2, 5]);
}

#[test]
fn test_find_all_becomes_count() {
    let grammar = Grammar::new();
    let node = body(&grammar, "cql() find all check");
    assert_eq!(name(&grammar, &node), "find/count");
    assert!(node.has_param(grammar.id("all")));
}

#[test]
fn test_plain_find_stays_logical() {
    let grammar = Grammar::new();
    let node = body(&grammar, "cql() find check");
    assert_eq!(name(&grammar, &node), "find");
}

#[test]
fn test_numeric_leaf_range_variant() {
    let grammar = Grammar::new();
    let node = body(&grammar, "cql() movenumber 5 10");
    assert_eq!(name(&grammar, &node), "movenumber/range");
    assert_eq!(node.range, vec![5, 10]);
}

#[test]
fn test_ray_argument_list() {
    let grammar = Grammar::new();
    let node = body(&grammar, "cql() ray up (k Q)");
    assert_eq!(name(&grammar, &node), "ray");
    assert_eq!(node.children.len(), 2);
    assert!(node.has_param(grammar.id("up")));
}

#[test]
fn test_ray_needs_two_arguments() {
    let grammar = Grammar::new();
    let err = parse(&grammar, "cql() ray up (k)").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Structural);
}

#[test]
fn test_between_arity() {
    let grammar = Grammar::new();
    assert!(parse(&grammar, "cql() between(k Q)").is_ok());
    let err = parse(&grammar, "cql() between(k Q R)").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Structural);
}

#[test]
fn test_commas_separate_arguments() {
    let grammar = Grammar::new();
    let node = body(&grammar, "cql() between(a1,b2)");
    assert_eq!(name(&grammar, &node), "between");
    assert_eq!(node.children.len(), 2);
    assert!(parse(&grammar, "cql() ray up (k, Q)").is_ok());
}

#[test]
fn test_comma_outside_an_argument_list() {
    let grammar = Grammar::new();
    let err = parse(&grammar, "cql() wtm , k").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Structural);
}

#[test]
fn test_makesquare_wants_numbers() {
    let grammar = Grammar::new();
    assert!(parse(&grammar, "cql() makesquare(2 3)").is_ok());
    let err = parse(&grammar, "cql() makesquare(k Q)").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Type);
}

// ============================================================================
// Lexical Errors and Serialization
// ============================================================================

#[test]
fn test_unknown_token_is_lexical() {
    let grammar = Grammar::new();
    let err = parse(&grammar, "cql() #foo").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Lexical);
}

#[test]
fn test_error_display_names_the_kind() {
    let grammar = Grammar::new();
    let err = parse(&grammar, "cql() (k").unwrap_err();
    assert!(err.to_string().starts_with("structural error:"));
}

#[test]
fn test_tree_serializes_to_json() {
    let grammar = Grammar::new();
    let root = parse(&grammar, "cql() k & Q").unwrap();
    let json = serde_json::to_value(&root).unwrap();
    assert!(json["children"].is_array());
}
