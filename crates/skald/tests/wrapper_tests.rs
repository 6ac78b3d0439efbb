//! Wrapper synthesis: every user function gets exactly one paired wrapper
//! that handles named arguments, list expansion, defaults and conversions.

mod common;

use common::{all_exprs, all_stmts, compile};
use skald::{wrapper_name, ExprKind, StmtKind, UtilityFn};

#[test]
fn every_function_in_the_tree_has_a_wrapper() {
    let unit = compile("def f(x, y = 3) { x + y }\ndef g() { f(1) }\ng()");
    for expr in all_exprs(&unit.tree) {
        if let ExprKind::FunDecl(f) = &expr.kind {
            assert!(
                f.is_wrapper || f.wrapper.is_some(),
                "function without a paired wrapper"
            );
        }
    }
}

#[test]
fn wrapper_descriptor_carries_the_decorated_name() {
    let unit = compile("def f(x) { x }\nf(1)");
    for (_, desc) in unit.funs.iter() {
        if let Some(wrapper) = desc.wrapper {
            let wrapper_desc = unit.funs.get(wrapper);
            assert!(wrapper_desc.is_wrapper);
            assert_eq!(
                wrapper_desc.wrapper_method,
                wrapper_name(&desc.implementing_method),
                "wrapper name must be the deterministic decoration of the inner method"
            );
        }
    }
    // And the function under test actually has one
    let (_, f) = unit.funs.iter().find(|(_, d)| d.name == "f").expect("f declared");
    assert!(f.wrapper.is_some());
}

#[test]
fn wrappers_take_source_offset_and_args() {
    let unit = compile("def f(x) { x }\nf(1)");
    let (_, f) = unit.funs.iter().find(|(_, d)| d.name == "f").expect("f declared");
    let wrapper = unit.funs.get(f.wrapper.expect("wrapper paired"));
    assert_eq!(wrapper.param_count(), 3);
    assert!(wrapper.needs_location);
}

#[test]
fn wrapper_body_detects_named_arguments() {
    let unit = compile("def f(x, y = 3) { x + y }\nf(1)");
    let utilities: Vec<UtilityFn> = all_exprs(&unit.tree)
        .into_iter()
        .filter_map(|e| match &e.kind {
            ExprKind::InvokeUtility { utility, .. } => Some(*utility),
            _ => None,
        })
        .collect();
    assert!(utilities.contains(&UtilityFn::IsNamedArgs));
    assert!(utilities.contains(&UtilityFn::CopyNamedArgs), "the named-args map is copied before keys are consumed");
    assert!(utilities.contains(&UtilityFn::RemoveNamedArg));
    assert!(utilities.contains(&UtilityFn::NamedArgsSize), "leftover named args must be detected");
}

#[test]
fn wrapper_body_expands_single_list_argument() {
    let unit = compile("def f(x, y) { x + y }\nf(1, 2)");
    let utilities: Vec<UtilityFn> = all_exprs(&unit.tree)
        .into_iter()
        .filter_map(|e| match &e.kind {
            ExprKind::InvokeUtility { utility, .. } => Some(*utility),
            _ => None,
        })
        .collect();
    assert!(
        utilities.contains(&UtilityFn::IsList),
        "a single list argument spreads over multiple parameters"
    );
}

#[test]
fn wrapper_loads_positional_values_and_defaults() {
    let unit = compile("def f(x, y = 3) { x + y }\nf(1)");
    let exprs = all_exprs(&unit.tree);
    let loads: Vec<_> = exprs
        .iter()
        .filter_map(|e| match &e.kind {
            ExprKind::LoadParamValue { name, param, .. } => Some((name.clone(), param.is_some())),
            _ => None,
        })
        .collect();
    // Positional loads for both params, plus a default-initialiser load for y
    assert!(loads.iter().any(|(n, _)| n == "x"));
    assert!(
        loads.iter().any(|(n, has_default)| n == "y" && *has_default),
        "the optional parameter falls back to its declared default"
    );
}

#[test]
fn wrapper_rejects_bad_argument_counts_at_runtime() {
    let unit = compile("def f(x) { x }\nf(1)");
    let throws = all_stmts(&unit.tree)
        .into_iter()
        .filter_map(|s| match &s.kind {
            StmtKind::ThrowError(t) => Some(t.message.clone()),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert!(throws.iter().any(|m| m.contains("mandatory")));
    assert!(throws.iter().any(|m| m.contains("too many")));
}

#[test]
fn wrapper_converts_arguments_with_call_site_location() {
    let unit = compile("def f(int x) { x }\nf(1)");
    let found = all_exprs(&unit.tree).into_iter().any(|e| match &e.kind {
        ExprKind::ConvertTo { source, offset, .. } => source.is_some() && offset.is_some(),
        _ => false,
    });
    assert!(found, "conversions in wrappers carry the caller's location");
}

#[test]
fn wrapper_tail_invokes_the_real_function() {
    let unit = compile("def f(x) { x }\nf(1)");
    let (f_id, _) = unit.funs.iter().find(|(_, d)| d.name == "f").expect("f declared");
    let tail_call = all_exprs(&unit.tree).into_iter().any(|e| match &e.kind {
        ExprKind::Call { fun: Some(id), .. } => *id == f_id,
        _ => false,
    });
    assert!(tail_call);
}

#[test]
fn wrappers_are_not_wrapped_again() {
    let unit = compile("def f(x) { x }\nf(1)");
    for (_, desc) in unit.funs.iter() {
        if desc.is_wrapper {
            assert!(desc.wrapper.is_none(), "wrappers must not have their own wrappers");
        }
    }
}

#[test]
fn closures_get_wrappers_too() {
    let unit = compile("def c = { int x -> x * 2 }\nc(3)");
    let closure_fun = all_exprs(&unit.tree).into_iter().find_map(|e| match &e.kind {
        ExprKind::Closure { fun_decl } => match &fun_decl.kind {
            ExprKind::FunDecl(f) => Some(f.fun),
            _ => None,
        },
        _ => None,
    });
    let closure_fun = closure_fun.expect("closure in tree");
    assert!(unit.funs.get(closure_fun).wrapper.is_some());
}

#[test]
fn init_method_and_wrapper_are_synthesized_per_class() {
    let unit = compile("class A { int i = 2 }\nnew A()");
    let class = unit.classes.lookup("Script.A").expect("class registered");
    let init = unit.classes.get(class).init_method.expect("init method");
    let init_desc = unit.funs.get(init);
    assert!(init_desc.is_init_method);
    assert!(init_desc.wrapper.is_some(), "the init wrapper backs named-args construction");
}

#[test]
fn init_wrapper_tail_invokes_the_initialiser() {
    let unit = compile("class A { int i = 2 }\nnew A()");
    let class = unit.classes.lookup("Script.A").expect("class registered");
    let found = all_exprs(&unit.tree).into_iter().any(|e| match &e.kind {
        ExprKind::InvokeInit { class_id, .. } => *class_id == class,
        _ => false,
    });
    assert!(found);
}

#[test]
fn init_assigns_every_field_and_returns_this() {
    let unit = compile("class P { int x; int y = 7 }\nnew P(1)");
    let assigns = all_exprs(&unit.tree)
        .into_iter()
        .filter(|e| matches!(&e.kind, ExprKind::FieldAssign { .. }))
        .count();
    assert!(assigns >= 2, "one assignment per declared field");
}

#[test]
fn subclass_init_chains_to_base_init() {
    let unit = compile("class B { int b }\nclass D extends B { int d }\nnew D(1, 2)");
    let base = unit.classes.lookup("Script.B").expect("base registered");
    let chained = all_exprs(&unit.tree).into_iter().any(|e| match &e.kind {
        ExprKind::InvokeInit { class_id, args } => *class_id == base && args.len() == 1,
        _ => false,
    });
    assert!(chained, "the subclass initialiser calls the base initialiser first");
}

#[test]
fn script_main_gets_a_wrapper() {
    let unit = compile("def x = 1");
    let (_, main) = unit
        .funs
        .iter()
        .find(|(_, d)| d.name == skald::SCRIPT_MAIN)
        .expect("script main");
    assert!(main.wrapper.is_some());
}
