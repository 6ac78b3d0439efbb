//! Parser behavior: disambiguation, lookahead, lvalue rewriting and error
//! recovery.

mod common;

use common::{all_exprs, all_stmts, parse, parse_err};
use skald::{
    CompilerContext, ErrorKind, ExprKind, Parser, SourceId, StmtKind, TokenKind, Value,
};

#[test]
fn empty_map_literals_in_both_bracket_styles() {
    let outcome = parse("def x = [:]\ndef y = {:}");
    let maps: Vec<_> = all_exprs(&outcome.tree)
        .into_iter()
        .filter(|e| matches!(e.kind, ExprKind::MapLiteral { .. }))
        .collect();
    assert_eq!(maps.len(), 2, "both [:] and {{:}} should be map literals");
}

#[test]
fn square_bracket_map_vs_list() {
    let outcome = parse("def a = [1, 2]\ndef b = [x: 1, y: 2]");
    let exprs = all_exprs(&outcome.tree);
    assert!(exprs.iter().any(|e| matches!(e.kind, ExprKind::ListLiteral { .. })));
    assert!(exprs
        .iter()
        .any(|e| matches!(&e.kind, ExprKind::MapLiteral { entries, .. } if entries.len() == 2)));
}

#[test]
fn brace_block_is_closure_not_map() {
    let outcome = parse("def c = { it + 1 }");
    assert!(all_exprs(&outcome.tree)
        .iter()
        .any(|e| matches!(e.kind, ExprKind::Closure { .. })));
}

#[test]
fn closure_with_declared_parameters() {
    let outcome = parse("def c = { int x, y -> x + y }");
    let closure = all_exprs(&outcome.tree)
        .into_iter()
        .find_map(|e| match &e.kind {
            ExprKind::Closure { fun_decl } => match &fun_decl.kind {
                ExprKind::FunDecl(f) => Some(f.params.len()),
                _ => None,
            },
            _ => None,
        })
        .expect("closure parsed");
    assert_eq!(closure, 2);
}

#[test]
fn trailing_closure_becomes_call_argument() {
    let outcome = parse("def f(g) { 1 }\nf { 42 }");
    let found = all_exprs(&outcome.tree).into_iter().any(|e| match &e.kind {
        ExprKind::Call { args, .. } => args.len() == 1 && matches!(args[0].kind, ExprKind::Closure { .. }),
        _ => false,
    });
    assert!(found, "trailing closure should be appended to the call arguments");
}

#[test]
fn trailing_closures_chain() {
    let outcome = parse("def f(a, b) { 1 }\nf { 1 } { 2 }");
    let found = all_exprs(&outcome.tree).into_iter().any(|e| match &e.kind {
        ExprKind::Call { args, .. } => args.len() == 2,
        _ => false,
    });
    assert!(found);
}

#[test]
fn named_arguments_collapse_into_marker_map() {
    let outcome = parse("def f(x, y = 2) { x }\nf(x: 1, y: 2)");
    let found = all_exprs(&outcome.tree).into_iter().any(|e| match &e.kind {
        ExprKind::Call { args, .. } => {
            args.len() == 1
                && matches!(&args[0].kind, ExprKind::MapLiteral { named_args: true, entries } if entries.len() == 2)
        }
        _ => false,
    });
    assert!(found, "named arguments should become a single named-args map");
}

#[test]
fn compound_assignment_flags_intermediate_path_links() {
    let outcome = parse("a.b.c += 5");
    let field_op = all_exprs(&outcome.tree)
        .into_iter()
        .find(|e| matches!(e.kind, ExprKind::FieldOpAssign { .. }))
        .expect("field op-assign parsed");
    let ExprKind::FieldOpAssign { parent, value, .. } = &field_op.kind else {
        unreachable!()
    };
    // a.b gets create-if-missing; the last link is held by the node itself
    let ExprKind::Binary {
        create_if_missing,
        left,
        ..
    } = &parent.kind
    else {
        panic!("parent should be the a.b field access");
    };
    assert!(*create_if_missing, "intermediate link a.b must autovivify");
    assert!(
        matches!(left.kind, ExprKind::Identifier { .. }),
        "path root is a plain identifier"
    );
    // The rhs carries the old value as a noop placeholder
    let ExprKind::Binary { left: noop, .. } = &value.kind else {
        panic!("op-assign value should be a binary expression");
    };
    assert!(matches!(noop.kind, ExprKind::Noop));
}

#[test]
fn plain_regex_without_modifiers_is_a_string() {
    let outcome = parse("def x = /foo/");
    let exprs = all_exprs(&outcome.tree);
    assert!(!exprs.iter().any(|e| matches!(e.kind, ExprKind::RegexMatch { .. })));
    assert!(exprs
        .iter()
        .any(|e| e.token.value == Some(Value::String("foo".into()))));
}

#[test]
fn regex_with_modifiers_matches_against_it() {
    let outcome = parse("def c = { /foo/i }");
    let found = all_exprs(&outcome.tree).into_iter().any(|e| match &e.kind {
        ExprKind::RegexMatch {
            implicit_it, modifiers, ..
        } => *implicit_it && modifiers == "i",
        _ => false,
    });
    assert!(found, "modified regex should rewrite to an implicit-it match");
}

#[test]
fn substitution_writes_back_to_lvalue() {
    let outcome = parse("def s1 = 'abc'\ns1 =~ s/a/b/");
    let exprs = all_exprs(&outcome.tree);
    let assigned = exprs.iter().any(|e| match &e.kind {
        ExprKind::VarAssign { value, .. } => matches!(value.kind, ExprKind::RegexSubst { .. }),
        _ => false,
    });
    assert!(assigned, "substitution without 'r' assigns back to the target");
}

#[test]
fn substitution_with_r_modifier_returns_result() {
    let outcome = parse("def s1 = 'abc'\ndef s2 = s1 =~ s/a/b/r");
    let exprs = all_exprs(&outcome.tree);
    let plain = exprs
        .iter()
        .any(|e| matches!(e.kind, ExprKind::RegexSubst { .. }));
    let assigned_back = exprs.iter().any(|e| match &e.kind {
        ExprKind::VarAssign { target, value, .. } => {
            matches!(value.kind, ExprKind::RegexSubst { .. })
                && matches!(&target.kind, ExprKind::Identifier { name, .. } if name == "s1")
        }
        _ => false,
    });
    assert!(plain && !assigned_back);
}

#[test]
fn labeled_loop_overrides_map_reading() {
    let outcome = parse("outer: while (true) { break outer }");
    let labeled = all_stmts(&outcome.tree).into_iter().any(|s| match &s.kind {
        StmtKind::While(w) => w.label.as_deref() == Some("outer"),
        _ => false,
    });
    assert!(labeled);
}

#[test]
fn label_inside_closure_body() {
    // `{ foo: while ... }` must read as a closure with a labeled loop, not a
    // map literal
    let outcome = parse("def c = { foo: while (true) { break foo } }");
    assert!(all_exprs(&outcome.tree)
        .iter()
        .any(|e| matches!(e.kind, ExprKind::Closure { .. })));
}

#[test]
fn multi_assignment_destructures_by_index() {
    let outcome = parse("def a = 1\ndef b = 2\n(a, b) = [3, 4]");
    let found = all_exprs(&outcome.tree).into_iter().any(|e| match &e.kind {
        ExprKind::MultiAssign { targets, value } => {
            targets.len() == 2 && matches!(value.kind, ExprKind::ListLiteral { .. })
        }
        _ => false,
    });
    assert!(found);
}

#[test]
fn if_and_unless_statement_suffixes() {
    let outcome = parse("def x = 1\nx = 2 if true\nx = 3 unless false");
    let ifs = all_stmts(&outcome.tree)
        .into_iter()
        .filter(|s| matches!(s.kind, StmtKind::If(_)))
        .count();
    assert_eq!(ifs, 2);
}

#[test]
fn cast_vs_grouping() {
    let outcome = parse("def x = (int)5\ndef y = (5)");
    let casts = all_exprs(&outcome.tree)
        .into_iter()
        .filter(|e| matches!(e.kind, ExprKind::Cast { .. }))
        .count();
    assert_eq!(casts, 1, "only (int)5 is a cast; (5) is grouping");
}

#[test]
fn do_until_loop() {
    let outcome = parse("do { def x = 1 } until (false)");
    let found = all_stmts(&outcome.tree).into_iter().any(|s| match &s.kind {
        StmtKind::While(w) => w.is_do_until,
        _ => false,
    });
    assert!(found);
}

#[test]
fn for_loop_lowers_to_while_with_update() {
    let outcome = parse("for (int i = 0; i < 10; i++) { }");
    let found = all_stmts(&outcome.tree).into_iter().any(|s| match &s.kind {
        StmtKind::While(w) => w.update.len() == 1 && !w.is_do_until,
        _ => false,
    });
    assert!(found);
}

#[test]
fn postfix_increment_keeps_old_value() {
    let outcome = parse("def i = 0\ni++");
    let found = all_exprs(&outcome.tree).into_iter().any(|e| match &e.kind {
        ExprKind::VarOpAssign {
            return_old_value, op, ..
        } => *return_old_value && *op == TokenKind::Plus,
        _ => false,
    });
    assert!(found, "postfix ++ becomes an op-assign returning the old value");
}

#[test]
fn prefix_increment_returns_new_value() {
    let outcome = parse("def i = 0\n++i");
    let found = all_exprs(&outcome.tree).into_iter().any(|e| match &e.kind {
        ExprKind::VarOpAssign { return_old_value, .. } => !return_old_value,
        _ => false,
    });
    assert!(found);
}

#[test]
fn keyword_logical_operators() {
    let outcome = parse("def a = true and false or not true");
    let kinds: Vec<TokenKind> = all_exprs(&outcome.tree)
        .into_iter()
        .filter_map(|e| match &e.kind {
            ExprKind::Binary { op, .. } => Some(op.kind),
            _ => None,
        })
        .collect();
    assert!(kinds.contains(&TokenKind::AmpersandAmpersand));
    assert!(kinds.contains(&TokenKind::PipePipe));
}

#[test]
fn switch_with_multi_literal_cases_and_default() {
    let outcome = parse("def x = 2\nswitch (x) { 1 -> 'one'; 2,3 -> 'small'; _ -> 'other' }");
    let found = all_exprs(&outcome.tree).into_iter().any(|e| match &e.kind {
        ExprKind::Switch {
            cases, default_case, ..
        } => cases.len() == 2 && cases[1].patterns.len() == 2 && default_case.is_some(),
        _ => false,
    });
    assert!(found);
}

#[test]
fn script_body_wraps_into_script_main() {
    let outcome = parse("def x = 1");
    let main = all_exprs(&outcome.tree).into_iter().find_map(|e| match &e.kind {
        ExprKind::FunDecl(f) if f.is_script_main => Some(f),
        _ => None,
    });
    let main = main.expect("script main synthesized");
    assert_eq!(main.params.len(), 1, "script main takes the globals map");
}

#[test]
fn syntax_errors_are_collected_with_recovery() {
    let errors = parse_err("def x = )\ndef y = )");
    assert!(errors.len() >= 2, "recovery should surface both errors, got {errors}");
    assert!(errors.errors().iter().all(|e| e.kind == ErrorKind::Syntax));
}

#[test]
fn failed_lookahead_produces_no_errors() {
    // Plenty of speculation happens here (casts, maps, labels); a clean
    // source must stay error free
    parse("def x = (1 + 2) * 3\ndef m = [a: 1]\ndef c = { it }");
}

#[test]
fn unterminated_string_is_fatal_eof_error() {
    let errors = parse_err("def s = 'abc");
    assert!(errors.errors().iter().any(|e| e.kind == ErrorKind::Eof && e.fatal));
}

#[test]
fn script_or_class_chooses_class_for_single_class_source() {
    let ctx = CompilerContext::new();
    let outcome = Parser::new(&ctx, "class Foo { int x = 1 }", SourceId::new(0))
        .parse_script_or_class("Script")
        .expect("parses as class");
    assert!(outcome.classes.lookup("Foo").is_some());
    assert!(
        outcome.classes.lookup("Script").is_none(),
        "no script class should be synthesized for a class unit"
    );
}

#[test]
fn script_or_class_chooses_script_for_statements() {
    let ctx = CompilerContext::new();
    let outcome = Parser::new(&ctx, "def x = 1\nx + 2", SourceId::new(0))
        .parse_script_or_class("Script")
        .expect("parses as script");
    assert!(outcome.classes.lookup("Script").is_some());
}

#[test]
fn packaged_class_path_requires_known_package() {
    let ctx = CompilerContext::new().with_package("util.text");
    let outcome = Parser::new(&ctx, "def t = util.text.Formatter", SourceId::new(0))
        .parse_script("Script")
        .expect("class path parses");
    let found = all_exprs(&outcome.tree)
        .into_iter()
        .any(|e| matches!(&e.kind, ExprKind::TypeExpr { .. }));
    assert!(found, "lowercase.dotted.UpperCase with a known package is a class path");
}

#[test]
fn dotted_access_without_package_stays_field_access() {
    let outcome = parse("def m = [:]\nm.a.B");
    let found = all_exprs(&outcome.tree)
        .into_iter()
        .any(|e| matches!(&e.kind, ExprKind::TypeExpr { .. }));
    assert!(!found, "unknown package prefixes read as field access");
}
