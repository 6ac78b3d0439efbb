//! Resolver behavior: scope resolution, closure capture, async propagation,
//! implicit returns and the semantic error checks.

mod common;

use common::{all_exprs, all_stmts, compile, compile_err, compile_with};
use skald::{CompilerContext, ErrorKind, ExprKind, StmtKind, Type, Value};

// ── Universal properties ─────────────────────────────────────────────────

#[test]
fn every_node_is_resolved_with_a_type() {
    let unit = compile("def f(x, y = 3) { x + y }\nf(4)\nclass A { int i = 2 }\nnew A()");
    for stmt in all_stmts(&unit.tree) {
        assert!(stmt.resolved, "unresolved statement at {}", stmt.token.offset);
    }
    for expr in all_exprs(&unit.tree) {
        assert!(expr.resolved, "unresolved expression at {}", expr.token.offset);
        let ty = expr.ty.as_ref().expect("expression type set");
        assert!(
            !matches!(ty, Type::Unknown | Type::Named(_)),
            "placeholder type at {}",
            expr.token.offset
        );
    }
}

#[test]
fn every_identifier_links_to_a_declaration() {
    let unit = compile("def x = 1\ndef f(a) { a + x }\nf(2)");
    for expr in all_exprs(&unit.tree) {
        if let ExprKind::Identifier { var_decl, name, .. } = &expr.kind {
            assert!(var_decl.is_some(), "identifier '{name}' not linked");
        }
    }
}

#[test]
fn inferred_declarations_adopt_initialiser_type() {
    let unit = compile("var v = 123\nvar s = 'abc'");
    let int_var = unit.vars.iter().find(|(_, d)| d.name == "v").expect("v declared");
    assert_eq!(int_var.1.ty, Type::Int);
    let str_var = unit.vars.iter().find(|(_, d)| d.name == "s").expect("s declared");
    assert_eq!(str_var.1.ty, Type::String);
}

// ── Closure capture / heap locals ────────────────────────────────────────

#[test]
fn captured_local_promotes_to_heap_local() {
    let unit = compile("int x = 1\ndef g() { x }\ng()");
    let (_, x) = unit
        .vars
        .iter()
        .find(|(_, d)| d.name == "x" && d.owner.is_some() && !d.is_param)
        .expect("x declared");
    assert!(x.is_heap_local, "x is referenced from a nested function");
    // The capturing function carries a pass-through entry for x
    let capturer = unit
        .funs
        .iter()
        .find(|(_, d)| d.name == "g")
        .expect("g declared");
    assert!(capturer.1.heap_locals.contains_key("x"));
}

#[test]
fn capture_chain_threads_through_intermediate_functions() {
    let unit = compile("int x = 1\ndef outer() { def inner() { x }; inner() }\nouter()");
    for name in ["outer", "inner"] {
        let (_, desc) = unit.funs.iter().find(|(_, d)| d.name == name).expect("declared");
        assert!(
            desc.heap_locals.contains_key("x"),
            "{name} must pass the heap local through"
        );
    }
    // The chain links back to the original declaration
    let (inner_id, _) = unit.funs.iter().find(|(_, d)| d.name == "inner").unwrap();
    let inner_copy = unit.funs.get(inner_id).heap_locals["x"];
    let copy = unit.vars.get(inner_copy);
    assert!(copy.parent_var_decl.is_some());
    let original = copy.original_var_decl.expect("chain records the original");
    assert!(unit.vars.get(original).is_heap_local);
    assert!(!unit.vars.get(original).is_param);
}

#[test]
fn parameter_captured_by_default_initialiser_is_pre_promoted() {
    // x is captured by the closure in y's default initialiser, so the
    // wrapper must promote x before the body runs
    let unit = compile("def f(x, y = { x++ }) { y(); x }\nf(5)");
    let (_, x) = unit
        .vars
        .iter()
        .find(|(_, d)| d.name == "x" && d.is_explicit_param)
        .expect("parameter x");
    assert!(x.is_heap_local);
    assert!(x.is_passed_as_heap_local, "wrapper pre-promotion required");
}

#[test]
fn direct_call_to_outer_function_does_not_capture() {
    let unit = compile("def helper() { 1 }\ndef f() { helper() }\nf()");
    let (_, f) = unit.funs.iter().find(|(_, d)| d.name == "f").expect("f declared");
    assert!(
        f.heap_locals.is_empty(),
        "calling a named function directly captures nothing"
    );
}

#[test]
fn forward_reference_closing_over_undeclared_variable_is_rejected() {
    let errors = compile_err("def f(x) { g(x) }\ndef v = 1\ndef g(x) { v + x }\nf(10)");
    assert!(
        errors
            .errors()
            .iter()
            .any(|e| e.kind == ErrorKind::Structural && e.message.contains("forward reference")),
        "got: {errors}"
    );
}

#[test]
fn capture_of_already_declared_variable_is_legal() {
    // Snapshot-style programs resolve fine even when the capture happens
    // before later declarations
    compile("int x = 1\ndef g() { x }\ndef x2 = x\ng()");
}

#[test]
fn sibling_forward_calls_are_legal() {
    compile("def f() { g() }\ndef g() { 2 }\nf()");
}

// ── Async propagation ────────────────────────────────────────────────────

#[test]
fn async_propagates_through_call_graph() {
    let unit = compile("def g() { sleep(1) }\ndef h() { g() }\ndef p() { 1 }\nh()");
    let by_name = |name: &str| {
        unit.funs
            .iter()
            .find(|(_, d)| d.name == name)
            .unwrap_or_else(|| panic!("{name} declared"))
            .1
    };
    assert!(by_name("g").is_async(), "g calls the async sleep builtin");
    assert!(by_name("h").is_async(), "h calls g transitively");
    assert!(!by_name("p").is_async(), "p calls nothing async");
}

#[test]
fn async_fixed_point_handles_forward_calls() {
    let unit = compile("def h() { g() }\ndef g() { sleep(1) }\nh()");
    let (_, h) = unit.funs.iter().find(|(_, d)| d.name == "h").expect("h declared");
    assert!(h.is_async(), "the fixed point revisits callers of later-marked functions");
}

#[test]
fn closure_taking_iteration_methods_are_async_sources() {
    let unit = compile("def g() { [1, 2].each { it } }\ng()");
    let (_, g) = unit.funs.iter().find(|(_, d)| d.name == "g").expect("g declared");
    assert!(g.is_async());
}

#[test]
fn non_final_instance_methods_are_async() {
    let unit = compile("class A { def m() { 1 } }\nnew A()");
    let (_, m) = unit.funs.iter().find(|(_, d)| d.name == "m").expect("m declared");
    assert!(m.is_async(), "an override may suspend, so the slot must exist");
}

#[test]
fn test_async_switch_marks_everything() {
    let ctx = CompilerContext::new().with_test_async(true);
    let unit = compile_with(&ctx, "def p() { 1 }\np()");
    let (_, p) = unit.funs.iter().find(|(_, d)| d.name == "p").expect("p declared");
    assert!(p.is_async());
}

#[test]
fn eval_is_an_async_source() {
    let unit = compile("def g() { eval('1 + 2') }\ng()");
    let (_, g) = unit.funs.iter().find(|(_, d)| d.name == "g").expect("g declared");
    assert!(g.is_async());
}

#[test]
fn async_flags_are_final_after_resolution() {
    let unit = compile("def g() { 1 }\ng()");
    for (_, desc) in unit.funs.iter() {
        assert!(desc.async_known(), "'{}' has an undetermined async flag", desc.name);
    }
}

// ── Implicit returns ─────────────────────────────────────────────────────

#[test]
fn last_expression_becomes_explicit_return() {
    let unit = compile("def f() { 3 }\nf()");
    let found = all_stmts(&unit.tree).into_iter().any(|s| match &s.kind {
        StmtKind::Return(expr) => match &expr.kind {
            ExprKind::Return { expr: Some(v), .. } => v.const_value == Some(Value::Int(3)),
            _ => false,
        },
        _ => false,
    });
    assert!(found, "the trailing expression must be rewritten into a return");
}

#[test]
fn both_if_branches_are_rewritten() {
    let unit = compile("def f(x) { if (x) { 1 } else { 2 } }\nf(true)");
    let returns = all_exprs(&unit.tree)
        .into_iter()
        .filter(|e| matches!(e.kind, ExprKind::Return { .. }))
        .count();
    assert!(returns >= 2, "each branch ends in its own return");
}

#[test]
fn missing_else_fills_null_for_reference_types() {
    compile("def f(x) { if (x) { 1 } }\nf(true)");
}

#[test]
fn missing_return_for_primitive_type_is_an_error() {
    let errors = compile_err("int f(x) { while (x) { } }\nf(false)");
    assert!(errors.errors().iter().any(|e| e.kind == ErrorKind::Context));
}

#[test]
fn trailing_declaration_value_is_returned() {
    compile("def f() { def y = 42 }\nf()");
}

// ── Implicit it ──────────────────────────────────────────────────────────

#[test]
fn statement_closure_with_implicit_it_becomes_plain_block() {
    let unit = compile("{ def t = 1 + 2; t }\n3");
    assert!(
        !all_exprs(&unit.tree)
            .iter()
            .any(|e| matches!(e.kind, ExprKind::Closure { .. })),
        "a never-invocable closure statement degrades to a block"
    );
}

#[test]
fn closure_bound_to_variable_keeps_implicit_it() {
    let unit = compile("def c = { it }\nc(1)");
    assert!(all_exprs(&unit.tree)
        .iter()
        .any(|e| matches!(e.kind, ExprKind::Closure { .. })));
}

// ── Classes ──────────────────────────────────────────────────────────────

#[test]
fn class_with_field_defaults_supports_map_coercion() {
    let unit = compile("class A { int i = 2; def f() { i } }\nA a = [:]\na.f()");
    let class = unit.classes.lookup("Script.A").expect("class registered");
    let desc = unit.classes.get(class);
    assert!(desc.init_method.is_some());
    let info = &desc.fields["i"];
    assert!(!info.mandatory, "a field with an initialiser is optional");
}

#[test]
fn mandatory_fields_become_init_parameters() {
    let unit = compile("class P { int x; int y; int z = 0 }\nnew P(1, 2)");
    let class = unit.classes.lookup("Script.P").expect("class registered");
    let init = unit.classes.get(class).init_method.expect("init synthesized");
    let desc = unit.funs.get(init);
    assert!(desc.is_init_method);
    assert_eq!(desc.mandatory_count, 2);
    assert_eq!(desc.param_names, vec!["x", "y", "z"]);
}

#[test]
fn base_class_mandatory_fields_come_first() {
    let unit = compile("class B { int b }\nclass D extends B { int d }\nnew D(1, 2)");
    let class = unit.classes.lookup("Script.D").expect("class registered");
    let init = unit.classes.get(class).init_method.expect("init synthesized");
    assert_eq!(unit.funs.get(init).param_names, vec!["b", "d"]);
}

#[test]
fn circular_extends_is_rejected() {
    let errors = compile_err("class A extends B { }\nclass B extends A { }");
    assert!(
        errors
            .errors()
            .iter()
            .any(|e| e.kind == ErrorKind::Structural && e.message.contains("circular")),
        "got: {errors}"
    );
}

#[test]
fn field_colliding_with_builtin_method_is_rejected() {
    let errors = compile_err("class C { int toString }");
    assert!(errors.errors().iter().any(|e| e.kind == ErrorKind::Structural));
}

#[test]
fn method_colliding_with_field_is_rejected() {
    let errors = compile_err("class C { int x; def x() { 1 } }");
    assert!(errors.errors().iter().any(|e| e.kind == ErrorKind::Structural));
}

#[test]
fn override_with_different_signature_is_rejected() {
    let errors = compile_err("class A { def m(int x) { x } }\nclass B extends A { def m(String s) { s } }");
    assert!(
        errors
            .errors()
            .iter()
            .any(|e| e.kind == ErrorKind::Structural && e.message.contains("signature")),
        "got: {errors}"
    );
}

#[test]
fn override_with_matching_signature_is_legal() {
    compile("class A { def m(int x) { x } }\nclass B extends A { def m(int x) { x + 1 } }");
}

#[test]
fn overriding_final_method_is_rejected() {
    let errors = compile_err("class A { final def m() { 1 } }\nclass B extends A { def m() { 2 } }");
    assert!(errors.errors().iter().any(|e| e.message.contains("final")));
}

#[test]
fn this_outside_class_method_context_is_rejected() {
    let errors = compile_err("class S { static def s() { this } }");
    assert!(errors.errors().iter().any(|e| e.kind == ErrorKind::Context));
}

#[test]
fn instance_field_from_static_context_is_rejected() {
    let errors = compile_err("class S { int i = 1; static def s() { i } }");
    assert!(errors.errors().iter().any(|e| e.kind == ErrorKind::Context));
}

#[test]
fn unknown_base_class_is_rejected() {
    let errors = compile_err("class C extends Missing { }");
    assert!(errors.errors().iter().any(|e| e.kind == ErrorKind::Type));
}

#[test]
fn class_methods_do_not_capture_script_locals() {
    let errors = compile_err("int x = 1\nclass C { def m() { x } }");
    assert!(
        errors
            .errors()
            .iter()
            .any(|e| e.kind == ErrorKind::Structural && e.message.contains("unknown variable")),
        "got: {errors}"
    );
}

// ── Context errors ───────────────────────────────────────────────────────

#[test]
fn break_outside_loop_is_rejected() {
    let errors = compile_err("break");
    assert!(errors.errors().iter().any(|e| e.kind == ErrorKind::Context));
}

#[test]
fn continue_with_unknown_label_is_rejected() {
    let errors = compile_err("while (true) { continue missing }");
    assert!(errors.errors().iter().any(|e| e.kind == ErrorKind::Context));
}

#[test]
fn labeled_break_resolves_to_enclosing_loop() {
    compile("outer: while (true) { while (true) { break outer } }");
}

#[test]
fn self_referencing_initialiser_is_rejected() {
    let errors = compile_err("int x = x + 1");
    assert!(
        errors
            .errors()
            .iter()
            .any(|e| e.kind == ErrorKind::Structural && e.message.contains("itself")),
        "got: {errors}"
    );
}

#[test]
fn duplicate_declaration_in_scope_is_rejected() {
    let errors = compile_err("int x = 1\nint x = 2");
    assert!(errors.errors().iter().any(|e| e.kind == ErrorKind::Structural));
}

#[test]
fn assignment_to_function_binding_is_rejected() {
    let errors = compile_err("def f() { 1 }\nf = 2");
    assert!(errors.errors().iter().any(|e| e.kind == ErrorKind::Context));
}

#[test]
fn assignment_to_regex_capture_is_rejected() {
    let errors = compile_err("def c = { it =~ /a(b)/ ; $1 = 'x' }");
    assert!(errors.errors().iter().any(|e| e.kind == ErrorKind::Context));
}

#[test]
fn unknown_variable_is_rejected() {
    let errors = compile_err("missingVar + 1");
    assert!(errors.errors().iter().any(|e| e.message.contains("unknown variable")));
}

#[test]
fn final_variable_cannot_be_modified() {
    let errors = compile_err("final int x = 1\nx = 2");
    assert!(errors.errors().iter().any(|e| e.kind == ErrorKind::Context));
}

#[test]
fn return_type_mismatch_is_rejected() {
    let errors = compile_err("int f() { return [:] }\nf()");
    assert!(errors.errors().iter().any(|e| e.kind == ErrorKind::Context));
}

// ── Globals ──────────────────────────────────────────────────────────────

#[test]
fn known_global_resolves_in_script() {
    let ctx = CompilerContext::new();
    ctx.define_global("answer", Value::Int(42));
    let unit = compile_with(&ctx, "answer + 1");
    let global = unit.vars.iter().find(|(_, d)| d.name == "answer").expect("global linked");
    assert!(global.1.is_global);
}

#[test]
fn repl_mode_creates_globals_on_demand() {
    let ctx = CompilerContext::new().with_repl_mode(true);
    let unit = compile_with(&ctx, "fresh = 3");
    let global = unit.vars.iter().find(|(_, d)| d.name == "fresh").expect("global created");
    assert!(global.1.is_global);
}

// ── Regex rules ──────────────────────────────────────────────────────────

#[test]
fn regex_capture_refs_share_the_capture_array() {
    let unit = compile("def c = { it =~ /a(b)(c)/ ; $1 + $2 }");
    let mut capture_vars = Vec::new();
    for expr in all_exprs(&unit.tree) {
        if let ExprKind::Identifier {
            capture_num: Some(_),
            var_decl,
            ..
        } = &expr.kind
        {
            capture_vars.push(var_decl.expect("capture ref linked"));
        }
    }
    assert_eq!(capture_vars.len(), 2);
    assert_eq!(capture_vars[0], capture_vars[1], "$1 and $2 share $@");
    assert_eq!(unit.vars.get(capture_vars[0]).ty, Type::Matcher);
}

#[test]
fn global_regex_modifier_outside_loop_condition_is_rejected() {
    let errors = compile_err("def c = { it =~ /a/g }");
    assert!(errors.errors().iter().any(|e| e.kind == ErrorKind::Special));
}

#[test]
fn global_regex_modifier_in_loop_condition_is_legal() {
    compile("def c = { while (it =~ /a/g) { } }");
}

#[test]
fn two_global_matches_in_one_condition_are_rejected() {
    let errors = compile_err("def c = { while (it =~ /a/g && it =~ /b/g) { } }");
    assert!(errors.errors().iter().any(|e| e.kind == ErrorKind::Special));
}

// ── Switch ───────────────────────────────────────────────────────────────

#[test]
fn switch_case_literals_must_be_unique() {
    let errors = compile_err("def x = 1\nswitch (x) { 1 -> 'a'; 1 -> 'b' }");
    assert!(
        errors
            .errors()
            .iter()
            .any(|e| e.kind == ErrorKind::Structural && e.message.contains("duplicate")),
        "got: {errors}"
    );
}

#[test]
fn switch_without_default_may_be_null() {
    let unit = compile("def x = 2\nswitch (x) { 1 -> 'one'; 2,3 -> 'small' }");
    let switch = all_exprs(&unit.tree)
        .into_iter()
        .find(|e| matches!(e.kind, ExprKind::Switch { .. }))
        .expect("switch resolved");
    assert!(switch.could_be_null);
}

#[test]
fn switch_with_default_resolves_common_type() {
    let unit = compile("def x = 2\nswitch (x) { 1 -> 'one'; 2,3 -> 'small'; _ -> 'other' }");
    let switch = all_exprs(&unit.tree)
        .into_iter()
        .find(|e| matches!(e.kind, ExprKind::Switch { .. }))
        .expect("switch resolved");
    assert_eq!(switch.ty, Some(Type::String));
    assert!(!switch.could_be_null);
}

#[test]
fn constructor_pattern_links_its_class() {
    let unit = compile("class P { int x; int y }\ndef v = new P(1, 2)\nswitch (v) { P(1, _) -> 'origin-ish'; _ -> 'no' }");
    let found = all_exprs(&unit.tree)
        .into_iter()
        .any(|e| matches!(&e.kind, ExprKind::ConstructorPattern { ty: Type::Instance(_), .. }));
    assert!(found);
}

// ── Calls ────────────────────────────────────────────────────────────────

#[test]
fn too_many_arguments_is_rejected() {
    let errors = compile_err("def f(x) { x }\nf(1, 2)");
    assert!(errors.errors().iter().any(|e| e.kind == ErrorKind::Type));
}

#[test]
fn missing_mandatory_argument_is_rejected() {
    let errors = compile_err("def f(x, y) { x }\nf(1)");
    assert!(errors.errors().iter().any(|e| e.kind == ErrorKind::Type));
}

#[test]
fn named_argument_for_unknown_parameter_is_rejected() {
    let errors = compile_err("def f(x) { x }\nf(z: 1)");
    assert!(errors.errors().iter().any(|e| e.message.contains("no such parameter")));
}

#[test]
fn missing_mandatory_named_argument_is_rejected() {
    let errors = compile_err("def f(x, y) { x }\nf(x: 1)");
    assert!(errors.errors().iter().any(|e| e.message.contains("mandatory")));
}

#[test]
fn single_list_argument_may_expand_positionally() {
    compile("def f(x, y) { x }\ndef args = [1, 2]\nf(args)");
}

#[test]
fn compound_field_assignment_autovivifies_intermediates_only() {
    let unit = compile("Map a = [:]\na.b.c += 5");
    let field_op = all_exprs(&unit.tree)
        .into_iter()
        .find(|e| matches!(e.kind, ExprKind::FieldOpAssign { .. }))
        .expect("field op-assign resolved");
    let ExprKind::FieldOpAssign { parent, .. } = &field_op.kind else {
        unreachable!()
    };
    // Every field-access binary along the parent spine must autovivify
    let mut link = &**parent;
    let mut flagged = 0;
    while let ExprKind::Binary {
        left, create_if_missing, ..
    } = &link.kind
    {
        assert!(*create_if_missing, "intermediate path link must autovivify");
        flagged += 1;
        link = left;
    }
    assert_eq!(flagged, 1, "a.b is the only intermediate link");
    assert!(matches!(link.kind, ExprKind::Identifier { .. }));
}

#[test]
fn method_call_on_instance_links_descriptor() {
    let unit = compile("class A { def m() { 1 } }\nnew A().m()");
    let found = all_exprs(&unit.tree).into_iter().any(|e| match &e.kind {
        ExprKind::MethodCall { fun, method_name, .. } => fun.is_some() && method_name == "m",
        _ => false,
    });
    assert!(found);
}

#[test]
fn unknown_method_on_known_class_is_rejected() {
    let errors = compile_err("class A { }\nnew A().missing()");
    assert!(errors.errors().iter().any(|e| e.kind == ErrorKind::Type));
}
