//! Shared helpers for the integration tests: one-call compilation and tree
//! walkers that flatten the AST for assertions.
#![allow(dead_code)]

use skald::{
    CompileErrors, CompilerContext, Expr, ExprKind, ParseOutcome, Parser, ResolvedUnit, SourceId, Stmt, StmtKind,
};

pub fn parse(source: &str) -> ParseOutcome {
    let ctx = CompilerContext::new();
    Parser::new(&ctx, source, SourceId::new(0))
        .parse_script("Script")
        .unwrap_or_else(|e| panic!("parse failed:\n{}", e.display_against(source)))
}

pub fn parse_err(source: &str) -> CompileErrors {
    let ctx = CompilerContext::new();
    Parser::new(&ctx, source, SourceId::new(0))
        .parse_script("Script")
        .err()
        .expect("expected parse errors")
}

pub fn compile(source: &str) -> ResolvedUnit {
    compile_with(&CompilerContext::new(), source)
}

pub fn compile_with(ctx: &CompilerContext, source: &str) -> ResolvedUnit {
    let outcome = Parser::new(ctx, source, SourceId::new(0))
        .parse_script("Script")
        .unwrap_or_else(|e| panic!("parse failed:\n{}", e.display_against(source)));
    skald::resolve(ctx, outcome).unwrap_or_else(|e| panic!("resolve failed:\n{}", e.display_against(source)))
}

pub fn compile_err(source: &str) -> CompileErrors {
    compile_err_with(&CompilerContext::new(), source)
}

pub fn compile_err_with(ctx: &CompilerContext, source: &str) -> CompileErrors {
    match Parser::new(ctx, source, SourceId::new(0)).parse_script("Script") {
        Err(errors) => errors,
        Ok(outcome) => skald::resolve(ctx, outcome)
            .err()
            .expect("expected compile errors"),
    }
}

/// Flattens every statement in the tree, depth first.
pub fn all_stmts(stmt: &Stmt) -> Vec<&Stmt> {
    let mut out = Vec::new();
    walk_stmt(stmt, &mut out, &mut Vec::new());
    out
}

/// Flattens every expression in the tree, depth first.
pub fn all_exprs(stmt: &Stmt) -> Vec<&Expr> {
    let mut stmts = Vec::new();
    let mut exprs = Vec::new();
    walk_stmt(stmt, &mut stmts, &mut exprs);
    exprs
}

fn walk_stmt<'a>(stmt: &'a Stmt, stmts: &mut Vec<&'a Stmt>, exprs: &mut Vec<&'a Expr>) {
    stmts.push(stmt);
    match &stmt.kind {
        StmtKind::Stmts(list) => list.iter().for_each(|s| walk_stmt(s, stmts, exprs)),
        StmtKind::Block(block) => block.stmts.iter().for_each(|s| walk_stmt(s, stmts, exprs)),
        StmtKind::VarDecl(decl) => {
            if let Some(init) = &decl.init {
                walk_expr(init, stmts, exprs);
            }
        }
        StmtKind::ExprStmt(e) | StmtKind::Return(e) | StmtKind::FunDecl(e) => walk_expr(e, stmts, exprs),
        StmtKind::If(if_stmt) => {
            walk_expr(&if_stmt.condition, stmts, exprs);
            walk_stmt(&if_stmt.then_stmt, stmts, exprs);
            if let Some(e) = &if_stmt.else_stmt {
                walk_stmt(e, stmts, exprs);
            }
        }
        StmtKind::While(while_stmt) => {
            walk_expr(&while_stmt.condition, stmts, exprs);
            walk_stmt(&while_stmt.body, stmts, exprs);
            while_stmt.update.iter().for_each(|u| walk_expr(u, stmts, exprs));
        }
        StmtKind::ClassDecl(class_decl) => {
            class_decl.fields.iter().for_each(|f| walk_stmt(f, stmts, exprs));
            class_decl.methods.iter().for_each(|m| walk_stmt(m, stmts, exprs));
            class_decl.inner_classes.iter().for_each(|c| walk_stmt(c, stmts, exprs));
        }
        StmtKind::Import(_) | StmtKind::ThrowError(_) => {}
    }
}

fn walk_expr<'a>(expr: &'a Expr, stmts: &mut Vec<&'a Stmt>, exprs: &mut Vec<&'a Expr>) {
    exprs.push(expr);
    match &expr.kind {
        ExprKind::ListLiteral { items } => items.iter().for_each(|e| walk_expr(e, stmts, exprs)),
        ExprKind::MapLiteral { entries, .. } => entries.iter().for_each(|(_, v)| walk_expr(v, stmts, exprs)),
        ExprKind::VarAssign { target, value, .. } => {
            walk_expr(target, stmts, exprs);
            walk_expr(value, stmts, exprs);
        }
        ExprKind::VarOpAssign { target, value, .. } => {
            walk_expr(target, stmts, exprs);
            walk_expr(value, stmts, exprs);
        }
        ExprKind::FieldAssign {
            parent, field, value, ..
        } => {
            walk_expr(parent, stmts, exprs);
            walk_expr(field, stmts, exprs);
            walk_expr(value, stmts, exprs);
        }
        ExprKind::FieldOpAssign {
            parent, field, value, ..
        } => {
            walk_expr(parent, stmts, exprs);
            walk_expr(field, stmts, exprs);
            walk_expr(value, stmts, exprs);
        }
        ExprKind::Binary { left, right, .. } => {
            walk_expr(left, stmts, exprs);
            walk_expr(right, stmts, exprs);
        }
        ExprKind::Ternary {
            condition,
            true_expr,
            false_expr,
        } => {
            walk_expr(condition, stmts, exprs);
            walk_expr(true_expr, stmts, exprs);
            walk_expr(false_expr, stmts, exprs);
        }
        ExprKind::PrefixUnary { expr: e, .. } | ExprKind::PostfixUnary { expr: e, .. } => walk_expr(e, stmts, exprs),
        ExprKind::Cast { expr: e, .. } | ExprKind::CheckCast { expr: e, .. } => walk_expr(e, stmts, exprs),
        ExprKind::ConvertTo {
            expr: e,
            source,
            offset,
            ..
        } => {
            walk_expr(e, stmts, exprs);
            if let Some(s) = source {
                walk_expr(s, stmts, exprs);
            }
            if let Some(o) = offset {
                walk_expr(o, stmts, exprs);
            }
        }
        ExprKind::RegexMatch { target, pattern, .. } => {
            walk_expr(target, stmts, exprs);
            walk_expr(pattern, stmts, exprs);
        }
        ExprKind::RegexSubst {
            target,
            pattern,
            replacement,
            ..
        } => {
            walk_expr(target, stmts, exprs);
            walk_expr(pattern, stmts, exprs);
            walk_expr(replacement, stmts, exprs);
        }
        ExprKind::Call { callee, args, .. } => {
            walk_expr(callee, stmts, exprs);
            args.iter().for_each(|a| walk_expr(a, stmts, exprs));
        }
        ExprKind::MethodCall { parent, args, .. } => {
            walk_expr(parent, stmts, exprs);
            args.iter().for_each(|a| walk_expr(a, stmts, exprs));
        }
        ExprKind::Closure { fun_decl } => walk_expr(fun_decl, stmts, exprs),
        ExprKind::FunDecl(f) => {
            f.params.iter().for_each(|p| walk_stmt(p, stmts, exprs));
            walk_stmt(&f.body, stmts, exprs);
            if let Some(w) = &f.wrapper {
                walk_expr(w, stmts, exprs);
            }
        }
        ExprKind::NewInstance { args, .. } => args.iter().for_each(|a| walk_expr(a, stmts, exprs)),
        ExprKind::BlockExpr { block } => walk_stmt(block, stmts, exprs),
        ExprKind::Return { expr: e, .. } => {
            if let Some(e) = e {
                walk_expr(e, stmts, exprs);
            }
        }
        ExprKind::Print { expr: e, .. } | ExprKind::Die { expr: e } => {
            if let Some(e) = e {
                walk_expr(e, stmts, exprs);
            }
        }
        ExprKind::Eval { script, globals } => {
            walk_expr(script, stmts, exprs);
            if let Some(g) = globals {
                walk_expr(g, stmts, exprs);
            }
        }
        ExprKind::Switch {
            subject,
            cases,
            default_case,
        } => {
            walk_expr(subject, stmts, exprs);
            for case in cases {
                case.patterns.iter().for_each(|p| walk_expr(p, stmts, exprs));
                walk_expr(&case.result, stmts, exprs);
            }
            if let Some(d) = default_case {
                walk_expr(d, stmts, exprs);
            }
        }
        ExprKind::ConstructorPattern { args, .. } => args.iter().for_each(|a| walk_expr(a, stmts, exprs)),
        ExprKind::MultiAssign { targets, value } => {
            targets.iter().for_each(|t| walk_expr(t, stmts, exprs));
            walk_expr(value, stmts, exprs);
        }
        ExprKind::InvokeUtility { args, .. } | ExprKind::InvokeInit { args, .. } => {
            args.iter().for_each(|a| walk_expr(a, stmts, exprs));
        }
        ExprKind::Literal
        | ExprKind::Identifier { .. }
        | ExprKind::TypeExpr { .. }
        | ExprKind::Break { .. }
        | ExprKind::Continue { .. }
        | ExprKind::SpecialVar { .. }
        | ExprKind::LoadParamValue { .. }
        | ExprKind::Noop => {}
    }
}
