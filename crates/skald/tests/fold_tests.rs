//! Constant folding semantics and the determinism/round-trip guarantees.

mod common;

use common::{all_exprs, compile, compile_err, compile_with, parse};
use pretty_assertions::assert_eq;
use skald::{CompilerContext, Dec, ErrorKind, Parser, SourceId, Value};

fn const_values(source: &str) -> Vec<Value> {
    let unit = compile(source);
    all_exprs(&unit.tree)
        .into_iter()
        .filter(|e| e.is_const)
        .filter_map(|e| e.const_value.clone())
        .collect()
}

fn has_const(source: &str, expected: &Value) -> bool {
    const_values(source).iter().any(|v| v == expected)
}

#[test]
fn arithmetic_respects_precedence() {
    assert!(has_const("1 + 2 * 3", &Value::Int(7)));
    assert!(has_const("(1 + 2) * 3", &Value::Int(9)));
}

#[test]
fn modulo_is_floor_mod() {
    assert!(has_const("-7 % 3", &Value::Int(2)));
}

#[test]
fn double_percent_is_truncating_remainder() {
    assert!(has_const("-7 %% 3", &Value::Int(-1)));
}

#[test]
fn integer_division_truncates() {
    assert!(has_const("7 / 2", &Value::Int(3)));
}

#[test]
fn numeric_promotion_follows_the_ladder() {
    assert!(has_const("1 + 2L", &Value::Long(3)));
    assert!(has_const("1 + 0.5D", &Value::Double(1.5)));
}

#[test]
fn decimal_division_honors_min_scale() {
    let expected = Value::Decimal("0.3333333333".parse::<Dec>().unwrap());
    assert!(has_const("1.0 / 3", &expected));
}

#[test]
fn configured_min_scale_is_used() {
    let ctx = CompilerContext::new().with_min_scale(4);
    let unit = compile_with(&ctx, "1.0 / 3");
    let expected = Value::Decimal("0.3333".parse::<Dec>().unwrap());
    let found = all_exprs(&unit.tree)
        .into_iter()
        .filter_map(|e| e.const_value.clone())
        .any(|v| v == expected);
    assert!(found);
}

#[test]
fn string_concat_and_repeat() {
    assert!(has_const("'ab' + 1", &Value::String("ab1".into())));
    assert!(has_const("'ab' * 3", &Value::String("ababab".into())));
}

#[test]
fn comparison_and_spaceship_fold() {
    assert!(has_const("1 < 2", &Value::Bool(true)));
    assert!(has_const("2 <=> 1", &Value::Int(1)));
    assert!(has_const("'a' == 'a'", &Value::Bool(true)));
}

#[test]
fn logical_and_ternary_fold() {
    assert!(has_const("true and false", &Value::Bool(false)));
    assert!(has_const("true ? 10 : 20", &Value::Int(10)));
    assert!(has_const("null ?: 5", &Value::Int(5)));
}

#[test]
fn bitwise_and_shifts_fold() {
    assert!(has_const("6 & 3", &Value::Int(2)));
    assert!(has_const("1 << 4", &Value::Int(16)));
    assert!(has_const("-1 >>> 28", &Value::Int(15)));
}

#[test]
fn unary_fold() {
    assert!(has_const("-(3)", &Value::Int(-3)));
    assert!(has_const("!false", &Value::Bool(true)));
    assert!(has_const("~0", &Value::Int(-1)));
}

#[test]
fn divide_by_zero_is_a_fold_error() {
    let errors = compile_err("1 / 0");
    assert!(
        errors
            .errors()
            .iter()
            .any(|e| e.kind == ErrorKind::Special && e.message.contains("divide by zero")),
        "got: {errors}"
    );
}

#[test]
fn negative_string_repeat_is_a_fold_error() {
    let errors = compile_err("'x' * -1");
    assert!(errors.errors().iter().any(|e| e.kind == ErrorKind::Special));
}

#[test]
fn null_plus_is_a_fold_error() {
    let errors = compile_err("null + 1");
    assert!(errors.errors().iter().any(|e| e.kind == ErrorKind::Special));
}

#[test]
fn bitwise_on_floating_types_is_rejected() {
    let errors = compile_err("1.5D | 2");
    assert!(!errors.is_empty());
}

#[test]
fn folding_can_be_disabled() {
    let ctx = CompilerContext::new().with_const_folding(false);
    let unit = compile_with(&ctx, "1 + 2");
    let folded = all_exprs(&unit.tree)
        .into_iter()
        .any(|e| e.const_value == Some(Value::Int(3)));
    assert!(!folded, "no folding when the switch is off");
}

#[test]
fn folding_is_deterministic_across_compilations() {
    let source = "def f(x, y = 3) { x + y * 2 }\nf(1)\n'a' + 'b'\n1.5 * 4";
    let ctx = CompilerContext::new();
    let first = skald::resolve(
        &ctx,
        Parser::new(&ctx, source, SourceId::new(0)).parse_script("Script").unwrap(),
    )
    .unwrap();
    let second = skald::resolve(
        &ctx,
        Parser::new(&ctx, source, SourceId::new(0)).parse_script("Script").unwrap(),
    )
    .unwrap();
    assert_eq!(first.tree, second.tree);
}

#[test]
fn parsed_ast_round_trips_through_serialization() {
    let source = "class A { int i = 2; def f() { i } }\nA a = [:]\na.f()\ndef g(x, y = 1) { x + y }\ng(1, 2)";
    let ctx = CompilerContext::new();
    let outcome = Parser::new(&ctx, source, SourceId::new(0)).parse_script("Script").unwrap();
    let bytes = postcard::to_allocvec(&outcome).expect("serializes");
    let restored: skald::ParseOutcome = postcard::from_bytes(&bytes).expect("deserializes");

    let direct = skald::resolve(&ctx, Parser::new(&ctx, source, SourceId::new(0)).parse_script("Script").unwrap())
        .expect("direct resolution");
    let round_tripped = skald::resolve(&ctx, restored).expect("round-tripped resolution");
    assert_eq!(direct.tree, round_tripped.tree);
}

#[test]
fn json_serialization_also_round_trips() {
    let source = "def x = [a: 1, b: 2]\nx.a + x.b";
    let outcome = parse(source);
    let json = serde_json::to_string(&outcome.tree).expect("serializes");
    let restored: skald::Stmt = serde_json::from_str(&json).expect("deserializes");
    assert_eq!(outcome.tree, restored);
}
