#![doc = include_str!("../README.md")]

mod ast;
mod builtins;
mod classes;
mod context;
mod decimal;
mod error;
mod function;
mod parser;
mod resolver;
mod token;
mod tokenizer;
mod types;
mod value;

pub use crate::{
    ast::{
        BlockStmt, ClassDeclStmt, Expr, ExprKind, FunDeclExpr, IfStmt, ImportStmt, SpecialVarKind, Stmt, StmtKind,
        SwitchCase, ThrowErrorStmt, UtilityFn, VarDecl, VarDeclId, VarDeclStmt, VarMap, WhileStmt,
    },
    builtins::Builtins,
    classes::{ClassDescriptor, ClassId, ClassMap, FieldInfo},
    context::CompilerContext,
    decimal::Dec,
    error::{CompileError, CompileErrors, ErrorKind},
    function::{wrapper_name, FunId, FunMap, FunctionDescriptor, INIT_METHOD},
    parser::{ParseOutcome, Parser, GLOBALS_PARAM, SCRIPT_MAIN},
    resolver::{resolve, ResolvedUnit},
    token::{SourceId, Token, TokenKind},
    tokenizer::{Mark, Tokenizer},
    types::Type,
    value::Value,
};

/// Parses and resolves a script in one step.
///
/// The script body becomes the body of a synthesized script-main function on
/// a script class named `class_name`.
pub fn compile_script(
    context: &CompilerContext,
    source: &str,
    source_id: SourceId,
    class_name: &str,
) -> Result<ResolvedUnit, CompileErrors> {
    let outcome = Parser::new(context, source, source_id).parse_script(class_name)?;
    resolve(context, outcome)
}

/// Parses and resolves a compilation unit containing a single class
/// declaration.
pub fn compile_class(
    context: &CompilerContext,
    source: &str,
    source_id: SourceId,
) -> Result<ResolvedUnit, CompileErrors> {
    let outcome = Parser::new(context, source, source_id).parse_class()?;
    resolve(context, outcome)
}

/// Parses as a script unless the source consists of exactly one class
/// declaration, then resolves.
pub fn compile_script_or_class(
    context: &CompilerContext,
    source: &str,
    source_id: SourceId,
    name: &str,
) -> Result<ResolvedUnit, CompileErrors> {
    let outcome = Parser::new(context, source, source_id).parse_script_or_class(name)?;
    resolve(context, outcome)
}
