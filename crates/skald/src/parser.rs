//! Recursive-descent parser with transactional lookahead.
//!
//! The parser produces a well-formed AST from the token stream, accepting
//! partial input and accumulating structured compile errors. Ambiguity is
//! resolved by speculative parsing: [`Parser::speculate`] snapshots the
//! tokenizer, the error list and the symbol arenas, attempts a production,
//! and rolls everything back on failure. Failed speculation never surfaces
//! errors to the user and can nest arbitrarily.
//!
//! Expressions are parsed by a precedence climb driven by [`OPERATOR_TABLE`];
//! the keyword forms (`or`/`and`/`not`, `return`, `print`, `die`, `break`,
//! `continue`) are handled before the climb. Newlines terminate statements:
//! operator matching looks at the raw token stream, and the parser explicitly
//! skips newlines only where an expression cannot end (after an operator,
//! a comma, an opening delimiter).

use crate::{
    ast::{
        BlockStmt, ClassDeclStmt, Expr, ExprKind, FunDeclExpr, IfStmt, ImportStmt, Stmt, StmtKind, SwitchCase,
        VarDecl, VarDeclId, VarDeclStmt, VarMap, WhileStmt,
    },
    classes::{ClassDescriptor, ClassId, ClassMap},
    context::CompilerContext,
    error::{CompileError, CompileErrors},
    function::{FunId, FunMap, FunctionDescriptor},
    token::{SourceId, Token, TokenKind},
    tokenizer::Tokenizer,
    types::Type,
    value::Value,
};

/// Name of the synthesized script-main method on a script class.
pub const SCRIPT_MAIN: &str = "$main";
/// Name of the globals parameter every script-main takes.
pub const GLOBALS_PARAM: &str = "$globals";
/// The implicit closure parameter.
pub const IT_PARAM: &str = "it";

/// One row of the operator table: a precedence level with its operators and
/// associativity.
struct OpRow {
    right_assoc: bool,
    ops: &'static [TokenKind],
}

use TokenKind as K;

/// Binary operator precedence, lowest first. Unary and postfix levels sit
/// past the end of this table and are handled structurally.
static OPERATOR_TABLE: &[OpRow] = &[
    OpRow {
        right_assoc: true,
        ops: &[
            K::Equal,
            K::QuestionEqual,
            K::PlusEqual,
            K::MinusEqual,
            K::StarEqual,
            K::SlashEqual,
            K::PercentEqual,
            K::PercentPercentEqual,
            K::AmpersandEqual,
            K::PipeEqual,
            K::CaretEqual,
            K::ShiftLeftEqual,
            K::ShiftRightEqual,
            K::ShiftRightUnsignedEqual,
        ],
    },
    OpRow {
        right_assoc: true,
        ops: &[K::Question, K::QuestionColon],
    },
    OpRow {
        right_assoc: false,
        ops: &[K::PipePipe],
    },
    OpRow {
        right_assoc: false,
        ops: &[K::AmpersandAmpersand],
    },
    OpRow {
        right_assoc: false,
        ops: &[K::Pipe],
    },
    OpRow {
        right_assoc: false,
        ops: &[K::Caret],
    },
    OpRow {
        right_assoc: false,
        ops: &[K::Ampersand],
    },
    OpRow {
        right_assoc: false,
        ops: &[
            K::EqualEqual,
            K::BangEqual,
            K::TripleEqual,
            K::BangEqualEqual,
            K::EqualTilde,
            K::BangTilde,
            K::Spaceship,
        ],
    },
    OpRow {
        right_assoc: false,
        ops: &[
            K::Less,
            K::LessEqual,
            K::Greater,
            K::GreaterEqual,
            K::Instanceof,
            K::BangInstanceof,
            K::As,
            K::In,
            K::BangIn,
        ],
    },
    OpRow {
        right_assoc: false,
        ops: &[K::ShiftLeft, K::ShiftRight, K::ShiftRightUnsigned],
    },
    OpRow {
        right_assoc: false,
        ops: &[K::Plus, K::Minus],
    },
    OpRow {
        right_assoc: false,
        ops: &[K::Star, K::Slash, K::Percent, K::PercentPercent],
    },
];

/// Statement-recovery anchors: after a syntax error the parser skips forward
/// to one of these before continuing.
static RECOVERY_ANCHORS: &[TokenKind] = &[
    K::Eol,
    K::Semicolon,
    K::RightBrace,
    K::RightParen,
    K::RightSquare,
    K::Eof,
];

/// Everything the parser produced for one compilation unit: the tree plus the
/// symbol arenas the tree's ids point into.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ParseOutcome {
    /// The top-level class declaration (script classes wrap the script body).
    pub tree: Stmt,
    pub vars: VarMap,
    pub funs: FunMap,
    pub classes: ClassMap,
}

type PResult<T> = Result<T, CompileError>;

pub struct Parser<'src, 'ctx> {
    source: &'src str,
    source_id: SourceId,
    tokenizer: Tokenizer<'src>,
    context: &'ctx CompilerContext,
    pub vars: VarMap,
    pub funs: FunMap,
    pub classes: ClassMap,
    errors: Vec<CompileError>,
    /// Nesting depth of active speculations. Errors raised while > 0 never
    /// reach the user.
    lookahead_depth: u32,
    synthetic_counter: u32,
    package_name: String,
    /// Simple names of enclosing classes, innermost last.
    class_stack: Vec<String>,
    /// Functions being parsed, innermost last. Owner for new variables.
    fun_stack: Vec<FunId>,
    /// Remaining recursion budget, so pathological nesting fails cleanly.
    depth_remaining: u16,
}

const MAX_NESTING_DEPTH: u16 = 200;

impl<'src, 'ctx> Parser<'src, 'ctx> {
    pub fn new(context: &'ctx CompilerContext, source: &'src str, source_id: SourceId) -> Self {
        Self {
            source,
            source_id,
            tokenizer: Tokenizer::new(source, source_id),
            context,
            vars: VarMap::new(),
            funs: FunMap::new(),
            classes: context.classes.clone(),
            errors: Vec::new(),
            lookahead_depth: 0,
            synthetic_counter: 0,
            package_name: String::new(),
            class_stack: Vec::new(),
            fun_stack: Vec::new(),
            depth_remaining: MAX_NESTING_DEPTH,
        }
    }

    // ── Entry points ─────────────────────────────────────────────────────

    /// Parses a script: optional package declaration, imports, then the
    /// script body. The body becomes the block of a synthesized script-main
    /// function taking a single `Map` globals parameter, hosted on a script
    /// class named `class_name`.
    pub fn parse_script(mut self, class_name: &str) -> Result<ParseOutcome, CompileErrors> {
        let tree = self.script_unit(class_name);
        self.finish(tree)
    }

    /// Parses a compilation unit containing a single top-level class
    /// declaration.
    pub fn parse_class(mut self) -> Result<ParseOutcome, CompileErrors> {
        let tree = self.class_unit();
        self.finish(tree)
    }

    /// Parses as a script unless the source consists of exactly one class
    /// declaration, in which case it re-parses as a class.
    pub fn parse_script_or_class(mut self, name: &str) -> Result<ParseOutcome, CompileErrors> {
        let mark = self.tokenizer.mark();
        self.lookahead_depth += 1;
        let tree = self.script_unit(name);
        self.lookahead_depth -= 1;
        let looks_like_class = matches!(&tree, Ok(t) if self.errors.is_empty() && script_is_single_class(t));

        // Restart cleanly and parse for real
        self.tokenizer.rollback(mark);
        self.vars = VarMap::new();
        self.funs = FunMap::new();
        self.classes = self.context.classes.clone();
        self.errors.clear();
        self.package_name.clear();
        self.class_stack.clear();
        self.fun_stack.clear();
        if looks_like_class {
            self.parse_class()
        } else {
            self.parse_script(name)
        }
    }

    fn finish(mut self, tree: Result<Stmt, CompileError>) -> Result<ParseOutcome, CompileErrors> {
        match tree {
            Ok(tree) if self.errors.is_empty() => Ok(ParseOutcome {
                tree,
                vars: self.vars,
                funs: self.funs,
                classes: self.classes,
            }),
            Ok(_) => Err(CompileErrors::new(self.errors)),
            Err(err) => {
                self.errors.push(err);
                Err(CompileErrors::new(self.errors))
            }
        }
    }

    fn script_unit(&mut self, class_name: &str) -> PResult<Stmt> {
        self.skip_eols()?;
        self.package_decl()?;
        let imports = self.import_decls()?;

        let packaged_name = self.packaged_name(class_name);
        let mut descriptor = ClassDescriptor::new(class_name, self.package_name.clone(), &packaged_name);
        descriptor.is_script_class = true;
        let at = self.peek()?;
        let class_id = self.declare_class(descriptor, &at)?;
        self.class_stack.push(class_name.to_string());

        // Script-main: def $main(Map $globals) { <script body> }
        let start = self.peek()?;
        let mut desc = FunctionDescriptor::new(SCRIPT_MAIN, Type::Any);
        desc.param_names = vec![GLOBALS_PARAM.to_string()];
        desc.param_types = vec![Type::Map];
        desc.mandatory_count = 1;
        desc.mandatory_params.insert(GLOBALS_PARAM.to_string());
        desc.implementing_class = Some(packaged_name);
        let fun_id = self.funs.add(desc);
        self.fun_stack.push(fun_id);

        let globals_param = self.param_decl_synthetic(GLOBALS_PARAM, Type::Map, &start, 0);
        let mut stmts = self.statements_until(K::Eof)?;
        self.fun_stack.pop();
        self.class_stack.pop();

        // BEGIN blocks run first and END blocks last, wherever they appear
        hoist_begin_end(&mut stmts);

        let body = Stmt::new(start.clone(), StmtKind::Block(Box::new(BlockStmt { stmts })));
        let main = fun_decl_expr(fun_id, Some(start.clone()), vec![globals_param], body, |f| {
            f.is_script_main = true;
        });
        let main_stmt = Stmt::new(start.clone(), StmtKind::FunDecl(Box::new(main)));

        let class_stmt = ClassDeclStmt {
            class: class_id,
            name_token: start.clone().with_kind(K::Identifier),
            base_name: None,
            base_token: None,
            interface_names: Vec::new(),
            fields: Vec::new(),
            methods: vec![main_stmt],
            inner_classes: Vec::new(),
            is_interface: false,
        };
        let mut tree = Stmt::new(start, StmtKind::ClassDecl(Box::new(class_stmt)));
        if !imports.is_empty() {
            let token = tree.token.clone();
            let mut all = imports;
            all.push(tree);
            tree = Stmt::new(token, StmtKind::Stmts(all));
        }
        Ok(tree)
    }

    fn class_unit(&mut self) -> PResult<Stmt> {
        self.skip_eols()?;
        self.package_decl()?;
        let imports = self.import_decls()?;
        self.skip_eols()?;
        let class_tok = self.peek()?;
        if !class_tok.is(K::Class) && !class_tok.is(K::Interface) {
            return Err(CompileError::syntax("expected class declaration", &class_tok));
        }
        let mut tree = self.class_decl()?;
        self.skip_eols()?;
        let trailing = self.peek()?;
        if !trailing.is(K::Eof) {
            self.error(CompileError::syntax(
                format!("unexpected input after class declaration: {trailing}"),
                &trailing,
            ));
        }
        if !imports.is_empty() {
            let token = tree.token.clone();
            let mut all = imports;
            all.push(tree);
            tree = Stmt::new(token, StmtKind::Stmts(all));
        }
        Ok(tree)
    }

    fn package_decl(&mut self) -> PResult<()> {
        if self.peek()?.is(K::Package) {
            self.advance()?;
            let mut parts = vec![self.expect(K::Identifier, "expected package name")?.lexeme];
            while self.peek()?.is(K::Dot) {
                self.advance()?;
                parts.push(self.expect(K::Identifier, "expected package name component")?.lexeme);
            }
            self.package_name = parts.join(".");
            self.expect_statement_end()?;
            self.skip_eols()?;
        }
        Ok(())
    }

    fn import_decls(&mut self) -> PResult<Vec<Stmt>> {
        let mut imports = Vec::new();
        loop {
            self.skip_eols()?;
            if !self.peek()?.is(K::Import) {
                break;
            }
            let tok = self.advance()?;
            let mut parts = vec![self.expect(K::Identifier, "expected class name to import")?.lexeme];
            while self.peek()?.is(K::Dot) {
                self.advance()?;
                parts.push(self.expect(K::Identifier, "expected import path component")?.lexeme);
            }
            let alias = if self.peek()?.is(K::As) {
                self.advance()?;
                Some(self.expect(K::Identifier, "expected import alias")?.lexeme)
            } else {
                None
            };
            self.expect_statement_end()?;
            imports.push(Stmt::new(
                tok,
                StmtKind::Import(Box::new(ImportStmt {
                    path: parts.join("."),
                    alias,
                })),
            ));
        }
        Ok(imports)
    }

    // ── Statements ───────────────────────────────────────────────────────

    fn statements_until(&mut self, end: TokenKind) -> PResult<Vec<Stmt>> {
        let mut stmts = Vec::new();
        loop {
            self.skip_separators()?;
            let tok = self.peek()?;
            if tok.is(end) || tok.is(K::Eof) {
                break;
            }
            match self.statement() {
                Ok(stmt) => stmts.push(stmt),
                Err(err) if err.fatal || self.lookahead_depth > 0 => return Err(err),
                Err(err) => {
                    self.error(err);
                    self.skip_to_anchor()?;
                    // Anchors like ')' are not consumed by recovery; force
                    // progress so a stray closer cannot loop forever.
                    if self.peek()?.offset == tok.offset && !tok.is(K::Eof) {
                        self.advance()?;
                    }
                }
            }
        }
        Ok(stmts)
    }

    fn statement(&mut self) -> PResult<Stmt> {
        let tok = self.peek()?;
        match tok.kind {
            K::Class | K::Interface => {
                if !self.fun_stack.is_empty() && self.fun_in_function() {
                    return Err(CompileError::structural(
                        "class declarations are not allowed inside functions",
                        &tok,
                    ));
                }
                self.class_decl()
            }
            K::If => self.if_stmt(),
            K::While => self.while_stmt(None),
            K::For => self.for_stmt(None),
            K::Do => self.do_until_stmt(None),
            K::BeginBlock | K::EndBlock => self.begin_end_block(),
            K::Return => {
                let expr = self.expression()?;
                let stmt = Stmt::new(expr.token.clone(), StmtKind::Return(Box::new(expr)));
                self.statement_suffix(stmt)
            }
            K::Static | K::Final | K::Def | K::Var => self.declaration(),
            _ if tok.kind.is_type_keyword() => self.declaration(),
            K::Identifier => {
                // Labeled loop?
                if let Some(stmt) = self.try_labeled_loop()? {
                    return Ok(stmt);
                }
                // Class-typed declaration: `Foo x = ...`
                if self.looks_like_named_decl() {
                    return self.declaration();
                }
                self.expr_stmt()
            }
            _ => self.expr_stmt(),
        }
    }

    /// Whether the parser is inside a real function body (method, closure or
    /// nested function). The script-main function itself hosts top-level
    /// class declarations and does not count.
    fn fun_in_function(&self) -> bool {
        match self.fun_stack.last() {
            None => false,
            Some(id) => self.funs.get(*id).name != SCRIPT_MAIN,
        }
    }

    fn try_labeled_loop(&mut self) -> PResult<Option<Stmt>> {
        let label = self.speculate(|p| {
            let label = p.expect(K::Identifier, "expected label")?;
            if !p.peek()?.is(K::Colon) {
                return Err(CompileError::syntax("not a label", &label));
            }
            p.advance()?;
            let next = p.peek()?;
            if matches!(next.kind, K::While | K::For | K::Do) {
                Ok(label)
            } else {
                Err(CompileError::syntax("label not followed by a loop", &next))
            }
        });
        let Some(label) = label else { return Ok(None) };
        let next = self.peek()?;
        let stmt = match next.kind {
            K::While => self.while_stmt(Some(label.lexeme))?,
            K::For => self.for_stmt(Some(label.lexeme))?,
            _ => self.do_until_stmt(Some(label.lexeme))?,
        };
        Ok(Some(stmt))
    }

    fn looks_like_named_decl(&mut self) -> bool {
        self.lookahead_matches(|p| {
            let ty = p.type_ref()?;
            if !matches!(ty, Type::Named(_) | Type::Array(_)) {
                let tok = p.peek()?;
                return Err(CompileError::syntax("not a class type", &tok));
            }
            let name = p.expect(K::Identifier, "expected variable name")?;
            let next = p.peek()?;
            if matches!(next.kind, K::Equal | K::Eol | K::Semicolon | K::Eof | K::Comma) {
                Ok(())
            } else if next.is(K::LeftParen) {
                // Function declaration with a class return type
                Ok(())
            } else {
                Err(CompileError::syntax("not a declaration", &name))
            }
        })
    }

    /// Parses a variable or function declaration, disambiguating via
    /// speculation on `type ident '('`.
    fn declaration(&mut self) -> PResult<Stmt> {
        let mut is_static = false;
        let mut is_final = false;
        loop {
            let tok = self.peek()?;
            match tok.kind {
                K::Static => {
                    if self.class_stack.is_empty() || self.fun_in_function() {
                        return Err(CompileError::context("'static' only allowed on class members", &tok));
                    }
                    self.advance()?;
                    is_static = true;
                }
                K::Final => {
                    self.advance()?;
                    is_final = true;
                }
                _ => break,
            }
        }

        let is_fun = self.lookahead_matches(|p| {
            p.type_ref()?;
            p.expect(K::Identifier, "expected name")?;
            p.expect(K::LeftParen, "expected '('")?;
            Ok(())
        });
        if is_fun {
            self.fun_decl_stmt(is_static, is_final)
        } else {
            let stmt = self.var_decl_stmt(is_final)?;
            self.expect_statement_end()?;
            Ok(stmt)
        }
    }

    /// Parses a type as written: builtin keyword, `def`, dotted class name,
    /// with `[]` array suffixes.
    fn type_ref(&mut self) -> PResult<Type> {
        let tok = self.peek()?;
        let mut ty = match tok.kind {
            K::Def => {
                self.advance()?;
                Type::Any
            }
            K::BooleanType => {
                self.advance()?;
                Type::Bool
            }
            K::ByteType => {
                self.advance()?;
                Type::Byte
            }
            K::IntType => {
                self.advance()?;
                Type::Int
            }
            K::LongType => {
                self.advance()?;
                Type::Long
            }
            K::DoubleType => {
                self.advance()?;
                Type::Double
            }
            K::DecimalType => {
                self.advance()?;
                Type::Decimal
            }
            K::StringType => {
                self.advance()?;
                Type::String
            }
            K::MapType => {
                self.advance()?;
                Type::Map
            }
            K::ListType => {
                self.advance()?;
                Type::List
            }
            K::ObjectType => {
                self.advance()?;
                Type::Any
            }
            K::VoidType => {
                self.advance()?;
                Type::Any
            }
            K::Identifier => {
                let mut parts = vec![self.advance()?.lexeme];
                while self.lookahead_matches(|p| {
                    p.expect(K::Dot, "expected '.'")?;
                    p.expect(K::Identifier, "expected name")?;
                    Ok(())
                }) {
                    self.advance()?; // .
                    parts.push(self.advance()?.lexeme);
                }
                let last = parts.last().expect("at least one part");
                if !last.starts_with(char::is_uppercase) {
                    return Err(CompileError::syntax("expected type name", &tok));
                }
                Type::Named(parts.join("."))
            }
            _ => return Err(CompileError::syntax(format!("expected type but found {tok}"), &tok)),
        };
        while self.lookahead_matches(|p| {
            p.expect(K::LeftSquare, "expected '['")?;
            p.expect(K::RightSquare, "expected ']'")?;
            Ok(())
        }) {
            self.advance()?;
            self.advance()?;
            ty = Type::Array(Box::new(ty));
        }
        Ok(ty)
    }

    /// One or more comma-separated variable declarations sharing a type.
    fn var_decl_stmt(&mut self, is_final: bool) -> PResult<Stmt> {
        let type_tok = self.peek()?;
        let is_var = type_tok.is(K::Var);
        let ty = if is_var {
            self.advance()?;
            Type::Unknown
        } else {
            self.type_ref()?
        };
        let mut decls = Vec::new();
        loop {
            let name = self.expect(K::Identifier, "expected variable name")?;
            let init = if self.peek()?.is(K::Equal) {
                self.advance()?;
                self.skip_eols()?;
                Some(self.expression()?)
            } else {
                if is_var {
                    return Err(CompileError::syntax(
                        "'var' declaration requires an initialiser to infer the type",
                        &name,
                    ));
                }
                None
            };
            let mut decl = VarDecl::new(name.lexeme.clone(), name.clone(), ty.clone());
            decl.is_final = is_final;
            decl.owner = self.fun_stack.last().copied();
            decl.nesting_level = u32::try_from(self.fun_stack.len()).unwrap_or(0);
            let var = self.vars.add(decl);
            decls.push(Stmt::new(
                name,
                StmtKind::VarDecl(Box::new(VarDeclStmt { var, init })),
            ));
            if self.peek()?.is(K::Comma) {
                self.advance()?;
                self.skip_eols()?;
            } else {
                break;
            }
        }
        if decls.len() == 1 {
            Ok(decls.pop().expect("one declaration"))
        } else {
            Ok(Stmt::new(type_tok, StmtKind::Stmts(decls)))
        }
    }

    fn fun_decl_stmt(&mut self, is_static: bool, is_final: bool) -> PResult<Stmt> {
        let return_type = self.type_ref()?;
        let name = self.expect(K::Identifier, "expected function name")?;

        let mut desc = FunctionDescriptor::new(name.lexeme.clone(), return_type);
        desc.is_static = is_static;
        desc.is_final = is_final || self.class_stack.is_empty();
        if let Some(class) = self.class_stack.last() {
            desc.implementing_class = Some(self.packaged_name(class));
        }
        let fun_id = self.funs.add(desc);

        self.fun_stack.push(fun_id);
        let result = self.fun_decl_tail(fun_id, name.clone());
        self.fun_stack.pop();
        let (params, body) = result?;

        let fun = fun_decl_expr(fun_id, Some(name.clone()), params, body, |_| {});
        Ok(Stmt::new(name, StmtKind::FunDecl(Box::new(fun))))
    }

    /// Parses `(params) { body }` for the function whose descriptor is
    /// already on the stack, filling in parameter metadata.
    fn fun_decl_tail(&mut self, fun_id: FunId, _name: Token) -> PResult<(Vec<Stmt>, Stmt)> {
        self.expect(K::LeftParen, "expected '(' after function name")?;
        self.skip_eols()?;
        let mut params = Vec::new();
        let mut slot = 0i32;
        if !self.peek()?.is(K::RightParen) {
            loop {
                self.skip_eols()?;
                let param = self.param_decl(fun_id, slot)?;
                params.push(param);
                slot += 1;
                self.skip_eols()?;
                if self.peek()?.is(K::Comma) {
                    self.advance()?;
                } else {
                    break;
                }
            }
        }
        self.skip_eols()?;
        self.expect(K::RightParen, "expected ')' after parameters")?;
        self.skip_eols()?;
        let body = self.block()?;
        Ok((params, body))
    }

    fn param_decl(&mut self, fun_id: FunId, slot: i32) -> PResult<Stmt> {
        let ty = if self.peek()?.kind.is_type_keyword()
            || self.peek()?.is(K::Def)
            || self.lookahead_matches(|p| {
                p.type_ref()?;
                p.expect(K::Identifier, "expected parameter name")?;
                Ok(())
            }) {
            self.type_ref()?
        } else {
            Type::Any
        };
        let name = self.expect(K::Identifier, "expected parameter name")?;
        let init = if self.peek()?.is(K::Equal) {
            self.advance()?;
            self.skip_eols()?;
            Some(self.expression()?)
        } else {
            None
        };

        let mut decl = VarDecl::new(name.lexeme.clone(), name.clone(), ty.clone());
        decl.is_param = true;
        decl.is_explicit_param = true;
        decl.slot = slot;
        decl.owner = Some(fun_id);
        decl.nesting_level = u32::try_from(self.fun_stack.len()).unwrap_or(0);
        let var = self.vars.add(decl);

        let desc = self.funs.get_mut(fun_id);
        desc.param_names.push(name.lexeme.clone());
        desc.param_types.push(ty);
        if init.is_none() {
            desc.mandatory_count += 1;
            desc.mandatory_params.insert(name.lexeme.clone());
        }
        Ok(Stmt::new(name, StmtKind::VarDecl(Box::new(VarDeclStmt { var, init }))))
    }

    /// Synthesizes a parameter declaration not present in source (the
    /// globals parameter of script-main).
    fn param_decl_synthetic(&mut self, name: &str, ty: Type, at: &Token, slot: i32) -> Stmt {
        let token = Token::new(K::Identifier, at.source, at.offset, name);
        let mut decl = VarDecl::new(name, token.clone(), ty);
        decl.is_param = true;
        decl.slot = slot;
        decl.owner = self.fun_stack.last().copied();
        decl.nesting_level = u32::try_from(self.fun_stack.len()).unwrap_or(0);
        let var = self.vars.add(decl);
        Stmt::new(token, StmtKind::VarDecl(Box::new(VarDeclStmt { var, init: None })))
    }

    fn class_decl(&mut self) -> PResult<Stmt> {
        let class_tok = self.advance()?;
        let is_interface = class_tok.is(K::Interface);
        let name = self.expect(K::Identifier, "expected class name")?;
        if !name.lexeme.starts_with(char::is_uppercase) {
            self.error(CompileError::structural(
                "class names must start with an uppercase letter",
                &name,
            ));
        }

        let mut base_name = None;
        let mut base_token = None;
        if self.peek()?.is(K::Extends) {
            self.advance()?;
            let tok = self.peek()?;
            match self.type_ref()? {
                Type::Named(path) => {
                    base_name = Some(path);
                    base_token = Some(tok);
                }
                other => {
                    return Err(CompileError::type_error(
                        format!("cannot extend non-class type {other}"),
                        &tok,
                    ));
                }
            }
        }
        let mut interface_names = Vec::new();
        if self.peek()?.is(K::Implements) {
            self.advance()?;
            loop {
                let tok = self.peek()?;
                match self.type_ref()? {
                    Type::Named(path) => interface_names.push(path),
                    other => {
                        return Err(CompileError::type_error(
                            format!("cannot implement non-interface type {other}"),
                            &tok,
                        ));
                    }
                }
                if self.peek()?.is(K::Comma) {
                    self.advance()?;
                } else {
                    break;
                }
            }
        }

        let packaged = self.packaged_name(&name.lexeme);
        let mut descriptor = ClassDescriptor::new(name.lexeme.clone(), self.package_name.clone(), &packaged);
        descriptor.is_interface = is_interface;
        let class_id = self.declare_class(descriptor, &name)?;

        self.skip_eols()?;
        self.expect(K::LeftBrace, "expected '{' to start class body")?;
        self.class_stack.push(name.lexeme.clone());

        let mut fields = Vec::new();
        let mut methods = Vec::new();
        let mut inner_classes = Vec::new();
        let body = (|p: &mut Self| -> PResult<()> {
            loop {
                p.skip_separators()?;
                let tok = p.peek()?;
                match tok.kind {
                    K::RightBrace => break,
                    K::Eof => return Err(CompileError::eof("unterminated class body", &tok)),
                    K::Class | K::Interface => inner_classes.push(p.class_decl()?),
                    K::Static | K::Final | K::Def | K::Var => {
                        let member = p.declaration()?;
                        push_member(member, &mut fields, &mut methods, &mut p.vars);
                    }
                    _ if tok.kind.is_type_keyword() => {
                        let member = p.declaration()?;
                        push_member(member, &mut fields, &mut methods, &mut p.vars);
                    }
                    K::Identifier => {
                        let member = p.declaration()?;
                        push_member(member, &mut fields, &mut methods, &mut p.vars);
                    }
                    _ => {
                        return Err(CompileError::syntax(
                            format!("unexpected {tok} in class body"),
                            &tok,
                        ));
                    }
                }
            }
            Ok(())
        })(self);
        self.class_stack.pop();
        body?;
        self.expect(K::RightBrace, "expected '}' to close class body")?;

        Ok(Stmt::new(
            class_tok,
            StmtKind::ClassDecl(Box::new(ClassDeclStmt {
                class: class_id,
                name_token: name,
                base_name,
                base_token,
                interface_names,
                fields,
                methods,
                inner_classes,
                is_interface,
            })),
        ))
    }

    fn declare_class(&mut self, descriptor: ClassDescriptor, at: &Token) -> PResult<ClassId> {
        let packaged = descriptor.packaged_name.clone();
        match self.classes.add(descriptor) {
            Some(id) => {
                if let Some(outer) = self.enclosing_class_id() {
                    self.classes.get_mut(outer).inner_classes.push(id);
                }
                Ok(id)
            }
            None => Err(CompileError::structural(
                format!("class '{packaged}' is already declared"),
                at,
            )),
        }
    }

    fn enclosing_class_id(&self) -> Option<ClassId> {
        if self.class_stack.is_empty() {
            return None;
        }
        let packaged = self
            .package_prefix()
            .into_iter()
            .chain(self.class_stack.iter().cloned())
            .collect::<Vec<_>>()
            .join(".");
        self.classes.lookup(&packaged)
    }

    fn package_prefix(&self) -> Option<String> {
        if self.package_name.is_empty() {
            None
        } else {
            Some(self.package_name.clone())
        }
    }

    fn packaged_name(&self, simple: &str) -> String {
        self.package_prefix()
            .into_iter()
            .chain(self.class_stack.iter().cloned())
            .chain(std::iter::once(simple.to_string()))
            .collect::<Vec<_>>()
            .join(".")
    }

    fn if_stmt(&mut self) -> PResult<Stmt> {
        let if_tok = self.advance()?;
        self.expect(K::LeftParen, "expected '(' after 'if'")?;
        self.skip_eols()?;
        let condition = self.expression()?;
        self.skip_eols()?;
        self.expect(K::RightParen, "expected ')' after condition")?;
        self.skip_eols()?;
        let then_stmt = self.block_or_statement()?;
        let else_stmt = if self.lookahead_matches(|p| {
            p.skip_eols()?;
            p.expect(K::Else, "expected 'else'")?;
            Ok(())
        }) {
            self.skip_eols()?;
            self.advance()?; // else
            self.skip_eols()?;
            Some(Box::new(self.block_or_statement()?))
        } else {
            None
        };
        Ok(Stmt::new(
            if_tok,
            StmtKind::If(Box::new(IfStmt {
                condition,
                then_stmt: Box::new(then_stmt),
                else_stmt,
            })),
        ))
    }

    fn while_stmt(&mut self, label: Option<String>) -> PResult<Stmt> {
        let while_tok = self.advance()?;
        self.expect(K::LeftParen, "expected '(' after 'while'")?;
        self.skip_eols()?;
        let condition = self.expression()?;
        self.skip_eols()?;
        self.expect(K::RightParen, "expected ')' after condition")?;
        self.skip_eols()?;
        let body = self.block_or_statement()?;
        Ok(Stmt::new(
            while_tok,
            StmtKind::While(Box::new(WhileStmt {
                condition,
                body: Box::new(body),
                update: Vec::new(),
                label,
                is_do_until: false,
            })),
        ))
    }

    /// `for (init; cond; update) body` hosted on a While statement, with the
    /// init wrapped into an enclosing block so its declarations scope to the
    /// loop.
    fn for_stmt(&mut self, label: Option<String>) -> PResult<Stmt> {
        let for_tok = self.advance()?;
        self.expect(K::LeftParen, "expected '(' after 'for'")?;
        self.skip_eols()?;

        let init = if self.peek()?.is(K::Semicolon) {
            None
        } else if self.peek()?.is(K::Var)
            || self.peek()?.is(K::Def)
            || self.peek()?.kind.is_type_keyword()
        {
            Some(self.var_decl_stmt(false)?)
        } else {
            let expr = self.expression()?;
            Some(Stmt::new(expr.token.clone(), StmtKind::ExprStmt(Box::new(expr))))
        };
        self.expect(K::Semicolon, "expected ';' after for-loop initialiser")?;
        self.skip_eols()?;

        let condition = if self.peek()?.is(K::Semicolon) {
            constant_true(&for_tok)
        } else {
            self.expression()?
        };
        self.expect(K::Semicolon, "expected ';' after for-loop condition")?;
        self.skip_eols()?;

        let mut update = Vec::new();
        if !self.peek()?.is(K::RightParen) {
            loop {
                update.push(self.expression()?);
                if self.peek()?.is(K::Comma) {
                    self.advance()?;
                    self.skip_eols()?;
                } else {
                    break;
                }
            }
        }
        self.expect(K::RightParen, "expected ')' after for-loop clauses")?;
        self.skip_eols()?;
        let body = self.block_or_statement()?;

        let while_stmt = Stmt::new(
            for_tok.clone(),
            StmtKind::While(Box::new(WhileStmt {
                condition,
                body: Box::new(body),
                update,
                label,
                is_do_until: false,
            })),
        );
        Ok(match init {
            Some(init) => Stmt::new(
                for_tok,
                StmtKind::Block(Box::new(BlockStmt {
                    stmts: vec![init, while_stmt],
                })),
            ),
            None => while_stmt,
        })
    }

    fn do_until_stmt(&mut self, label: Option<String>) -> PResult<Stmt> {
        let do_tok = self.advance()?;
        self.skip_eols()?;
        let body = self.block()?;
        self.skip_eols()?;
        self.expect(K::Until, "expected 'until' after 'do' block")?;
        self.expect(K::LeftParen, "expected '(' after 'until'")?;
        self.skip_eols()?;
        let condition = self.expression()?;
        self.skip_eols()?;
        self.expect(K::RightParen, "expected ')' after condition")?;
        Ok(Stmt::new(
            do_tok,
            StmtKind::While(Box::new(WhileStmt {
                condition,
                body: Box::new(body),
                update: Vec::new(),
                label,
                is_do_until: true,
            })),
        ))
    }

    fn begin_end_block(&mut self) -> PResult<Stmt> {
        let tok = self.advance()?;
        if self.fun_in_function() || self.fun_stack.is_empty() {
            self.error(CompileError::context(
                format!("'{}' blocks are only allowed at the top level of a script", tok.lexeme),
                &tok,
            ));
        }
        self.skip_eols()?;
        let block = self.block()?;
        // Keep the BEGIN/END token so the blocks can be ordered afterwards
        Ok(Stmt::new(tok, block.kind))
    }

    fn block(&mut self) -> PResult<Stmt> {
        let open = self.expect(K::LeftBrace, "expected '{'")?;
        let stmts = self.statements_until(K::RightBrace)?;
        self.expect(K::RightBrace, "expected '}' to close block")?;
        Ok(Stmt::new(open, StmtKind::Block(Box::new(BlockStmt { stmts }))))
    }

    fn block_or_statement(&mut self) -> PResult<Stmt> {
        if self.peek()?.is(K::LeftBrace) {
            self.block()
        } else {
            self.statement()
        }
    }

    fn expr_stmt(&mut self) -> PResult<Stmt> {
        let expr = self.expression()?;
        let stmt = Stmt::new(expr.token.clone(), StmtKind::ExprStmt(Box::new(expr)));
        self.statement_suffix(stmt)
    }

    /// Applies a trailing `if cond` / `unless cond` and enforces statement
    /// termination.
    fn statement_suffix(&mut self, stmt: Stmt) -> PResult<Stmt> {
        let tok = self.peek()?;
        let stmt = match tok.kind {
            K::If => {
                self.advance()?;
                self.skip_eols()?;
                let condition = self.expression()?;
                Stmt::new(
                    tok,
                    StmtKind::If(Box::new(IfStmt {
                        condition,
                        then_stmt: Box::new(stmt),
                        else_stmt: None,
                    })),
                )
            }
            K::Unless => {
                self.advance()?;
                self.skip_eols()?;
                let condition = self.expression()?;
                let negated = Expr::new(
                    tok.clone().with_kind(K::Bang),
                    ExprKind::PrefixUnary {
                        op: tok.clone().with_kind(K::Bang),
                        expr: Box::new(condition),
                    },
                );
                Stmt::new(
                    tok,
                    StmtKind::If(Box::new(IfStmt {
                        condition: negated,
                        then_stmt: Box::new(stmt),
                        else_stmt: None,
                    })),
                )
            }
            _ => stmt,
        };
        self.expect_statement_end()?;
        Ok(stmt)
    }

    // ── Expressions ──────────────────────────────────────────────────────

    fn expression(&mut self) -> PResult<Expr> {
        self.with_depth(|p| {
            let tok = p.peek()?;
            match tok.kind {
                K::Return => {
                    p.advance()?;
                    let value = if p.at_expression_end()? {
                        None
                    } else {
                        Some(Box::new(p.expression()?))
                    };
                    Ok(Expr::new(
                        tok,
                        ExprKind::Return {
                            expr: value,
                            return_type: None,
                            fun: None,
                        },
                    ))
                }
                K::Print | K::Println => {
                    p.advance()?;
                    let value = if p.at_expression_end()? {
                        None
                    } else {
                        Some(Box::new(p.expression()?))
                    };
                    Ok(Expr::new(
                        tok.clone(),
                        ExprKind::Print {
                            expr: value,
                            newline: tok.is(K::Println),
                        },
                    ))
                }
                K::Die => {
                    p.advance()?;
                    let value = if p.at_expression_end()? {
                        None
                    } else {
                        Some(Box::new(p.expression()?))
                    };
                    Ok(Expr::new(tok, ExprKind::Die { expr: value }))
                }
                K::Break | K::Continue => {
                    p.advance()?;
                    let label = if p.peek_raw()?.is(K::Identifier) {
                        Some(p.advance()?.lexeme)
                    } else {
                        None
                    };
                    let kind = if tok.is(K::Break) {
                        ExprKind::Break { label }
                    } else {
                        ExprKind::Continue { label }
                    };
                    Ok(Expr::new(tok, kind))
                }
                _ => p.or_expr(),
            }
        })
    }

    fn or_expr(&mut self) -> PResult<Expr> {
        let mut left = self.and_expr()?;
        while self.peek_raw()?.is(K::Or) {
            let op = self.advance()?.with_kind(K::PipePipe);
            self.skip_eols()?;
            let right = self.and_expr()?;
            left = binary(left, op, right);
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> PResult<Expr> {
        let mut left = self.not_expr()?;
        while self.peek_raw()?.is(K::And) {
            let op = self.advance()?.with_kind(K::AmpersandAmpersand);
            self.skip_eols()?;
            let right = self.not_expr()?;
            left = binary(left, op, right);
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> PResult<Expr> {
        if self.peek()?.is(K::Not) {
            let op = self.advance()?.with_kind(K::Bang);
            self.skip_eols()?;
            let expr = self.not_expr()?;
            return Ok(Expr::new(
                op.clone(),
                ExprKind::PrefixUnary {
                    op,
                    expr: Box::new(expr),
                },
            ));
        }
        self.binary_expr(0)
    }

    fn binary_expr(&mut self, level: usize) -> PResult<Expr> {
        if level >= OPERATOR_TABLE.len() {
            return self.unary_expr();
        }
        let row = &OPERATOR_TABLE[level];
        let mut left = self.binary_expr(level + 1)?;
        loop {
            let tok = self.peek_raw()?;
            if !row.ops.contains(&tok.kind) {
                return Ok(left);
            }
            let op = self.advance()?;
            self.skip_eols()?;
            left = match op.kind {
                _ if op.kind.is_assignment_op() => self.assignment(left, op)?,
                K::Question => {
                    let true_expr = self.expression()?;
                    self.skip_eols()?;
                    self.expect(K::Colon, "expected ':' in ternary expression")?;
                    self.skip_eols()?;
                    let false_expr = self.binary_expr(level)?;
                    Expr::new(
                        op,
                        ExprKind::Ternary {
                            condition: Box::new(left),
                            true_expr: Box::new(true_expr),
                            false_expr: Box::new(false_expr),
                        },
                    )
                }
                K::EqualTilde | K::BangTilde => self.regex_rhs(left, op)?,
                K::Instanceof | K::BangInstanceof | K::As => {
                    let ty_tok = self.peek()?;
                    let ty = self.type_ref()?;
                    if op.is(K::As) {
                        let mut expr = Expr::new(
                            op,
                            ExprKind::ConvertTo {
                                target: ty,
                                expr: Box::new(left),
                                source: None,
                                offset: None,
                            },
                        );
                        expr.token = ty_tok;
                        expr
                    } else {
                        let rhs = Expr::new(ty_tok, ExprKind::TypeExpr { ty });
                        binary(left, op, rhs)
                    }
                }
                _ => {
                    let next_level = if row.right_assoc { level } else { level + 1 };
                    let right = self.binary_expr(next_level)?;
                    binary(left, op, right)
                }
            };
            if row.right_assoc {
                return Ok(left);
            }
        }
    }

    /// Builds an assignment expression, rewriting compound operators into
    /// op-assign nodes carrying the old value as a Noop placeholder and
    /// flagging intermediate field accesses for autovivification.
    fn assignment(&mut self, target: Expr, op: Token) -> PResult<Expr> {
        let value = self.binary_expr(0)?; // right-assoc: full assignment level
        match op.kind {
            K::Equal | K::QuestionEqual => self.build_assign(target, &op, value, op.is(K::QuestionEqual)),
            _ => {
                let base_op = op
                    .kind
                    .compound_base_op()
                    .expect("assignment operator with no base op");
                self.build_op_assign(target, &op, base_op, value, false)
            }
        }
    }

    fn build_assign(&mut self, target: Expr, op: &Token, value: Expr, conditional: bool) -> PResult<Expr> {
        match target.kind {
            ExprKind::Identifier { ref name, .. } => {
                if name == "super" {
                    return Err(CompileError::context("cannot assign to 'super'", &target.token));
                }
                Ok(Expr::new(
                    op.clone(),
                    ExprKind::VarAssign {
                        target: Box::new(target),
                        value: Box::new(value),
                        conditional,
                    },
                ))
            }
            _ if target.kind.is_field_access() => {
                let (mut parent, access_op, field) = split_field_access(target);
                mark_create_if_missing(&mut parent);
                Ok(Expr::new(
                    op.clone(),
                    ExprKind::FieldAssign {
                        parent: Box::new(parent),
                        access_op,
                        field: Box::new(field),
                        value: Box::new(value),
                        conditional,
                    },
                ))
            }
            ExprKind::MultiAssign { .. } => {
                let ExprKind::MultiAssign { targets, .. } = target.kind else {
                    unreachable!()
                };
                for t in &targets {
                    if !matches!(t.kind, ExprKind::Identifier { .. }) && !t.kind.is_field_access() {
                        return Err(CompileError::context("invalid target in multi-assignment", &t.token));
                    }
                }
                Ok(Expr::new(
                    op.clone(),
                    ExprKind::MultiAssign {
                        targets,
                        value: Box::new(value),
                    },
                ))
            }
            _ => Err(CompileError::context(
                "invalid assignment target",
                &target.token,
            )),
        }
    }

    fn build_op_assign(
        &mut self,
        target: Expr,
        op: &Token,
        base_op: TokenKind,
        rhs: Expr,
        return_old_value: bool,
    ) -> PResult<Expr> {
        // The old value of the target appears as a Noop placeholder on the
        // left of the binary, so the lvalue path is only traversed once.
        let noop = Expr::new(op.clone(), ExprKind::Noop);
        let bin = binary(noop, op.clone().with_kind(base_op), rhs);
        match target.kind {
            ExprKind::Identifier { .. } => Ok(Expr::new(
                op.clone(),
                ExprKind::VarOpAssign {
                    target: Box::new(target),
                    op: base_op,
                    value: Box::new(bin),
                    return_old_value,
                },
            )),
            _ if target.kind.is_field_access() => {
                let (mut parent, access_op, field) = split_field_access(target);
                mark_create_if_missing(&mut parent);
                Ok(Expr::new(
                    op.clone(),
                    ExprKind::FieldOpAssign {
                        parent: Box::new(parent),
                        access_op,
                        field: Box::new(field),
                        op: base_op,
                        value: Box::new(bin),
                        return_old_value,
                    },
                ))
            }
            _ => Err(CompileError::context(
                "invalid target for compound assignment",
                &target.token,
            )),
        }
    }

    /// Parses the right-hand side of `=~` / `!~`: a regex literal or an
    /// `s/pattern/replacement/` substitution.
    fn regex_rhs(&mut self, target: Expr, op: Token) -> PResult<Expr> {
        let negated = op.is(K::BangTilde);
        let next = self.peek()?;
        if next.is(K::Identifier) && next.lexeme == "s" && self.adjacent_slash(&next) {
            if negated {
                return Err(CompileError::syntax("'!~' cannot be used with a substitution", &op));
            }
            self.advance()?; // s
            let (pattern, replacement, modifiers) = self.substitution_parts()?;
            return self.build_substitution(target, &op, pattern, replacement, modifiers, false);
        }
        if next.is(K::Slash) {
            let (pattern, modifiers) = self.regex_literal()?;
            return Ok(Expr::new(
                op,
                ExprKind::RegexMatch {
                    target: Box::new(target),
                    pattern: Box::new(pattern),
                    modifiers,
                    implicit_it: false,
                    negated,
                    capture_arr_var: None,
                },
            ));
        }
        // `x =~ expr` where the pattern is a general string expression
        let pattern = self.binary_expr(8)?;
        Ok(Expr::new(
            op,
            ExprKind::RegexMatch {
                target: Box::new(target),
                pattern: Box::new(pattern),
                modifiers: String::new(),
                implicit_it: false,
                negated,
                capture_arr_var: None,
            },
        ))
    }

    /// Lexes `/pattern/mods` from the current position (sitting on the `/`).
    fn regex_literal(&mut self) -> PResult<(Expr, String)> {
        self.tokenizer.start_regex();
        let pattern_tok = self.advance()?;
        debug_assert!(pattern_tok.is(K::RegexLiteral), "start_regex must yield a regex token");
        let modifiers = self.regex_modifiers(&pattern_tok)?;
        let pattern = Expr::new(pattern_tok, ExprKind::Literal);
        Ok((pattern, modifiers))
    }

    /// Consumes an identifier immediately adjacent to the closing `/` as the
    /// regex modifier letters.
    fn regex_modifiers(&mut self, prev: &Token) -> PResult<String> {
        let next = self.peek_raw()?;
        if next.is(K::Identifier) && next.offset == prev.end_offset() {
            let mods = self.advance()?.lexeme;
            for c in mods.chars() {
                if !matches!(c, 'i' | 'm' | 's' | 'g' | 'r' | 'n') {
                    return Err(CompileError::special(
                        format!("unknown regex modifier '{c}'"),
                        prev,
                    ));
                }
            }
            Ok(mods)
        } else {
            Ok(String::new())
        }
    }

    fn substitution_parts(&mut self) -> PResult<(Expr, Expr, String)> {
        self.tokenizer.start_regex();
        let pattern_tok = self.advance()?;
        self.tokenizer.start_regex();
        let replacement_tok = self.advance()?;
        let modifiers = self.regex_modifiers(&replacement_tok)?;
        Ok((
            Expr::new(pattern_tok, ExprKind::Literal),
            Expr::new(replacement_tok, ExprKind::Literal),
            modifiers,
        ))
    }

    /// Builds a substitution. Without the `r` modifier the result is written
    /// back to the target, so the target must be an lvalue; the assignment
    /// wraps the substitution node.
    fn build_substitution(
        &mut self,
        target: Expr,
        op: &Token,
        pattern: Expr,
        replacement: Expr,
        modifiers: String,
        implicit_it: bool,
    ) -> PResult<Expr> {
        let returns_result = modifiers.contains('r');
        let subst = |target: Expr| {
            Expr::new(
                op.clone(),
                ExprKind::RegexSubst {
                    target: Box::new(target),
                    pattern: Box::new(pattern),
                    replacement: Box::new(replacement),
                    modifiers: modifiers.clone(),
                    implicit_it,
                    capture_arr_var: None,
                },
            )
        };
        if returns_result {
            return Ok(subst(target));
        }
        match target.kind {
            ExprKind::Identifier { .. } => {
                let value = subst(target.clone());
                Ok(Expr::new(
                    op.clone(),
                    ExprKind::VarAssign {
                        target: Box::new(target),
                        value: Box::new(value),
                        conditional: false,
                    },
                ))
            }
            _ if target.kind.is_field_access() => {
                let value = subst(target.clone());
                let (mut parent, access_op, field) = split_field_access(target);
                mark_create_if_missing(&mut parent);
                Ok(Expr::new(
                    op.clone(),
                    ExprKind::FieldAssign {
                        parent: Box::new(parent),
                        access_op,
                        field: Box::new(field),
                        value: Box::new(value),
                        conditional: false,
                    },
                ))
            }
            _ => Err(CompileError::context(
                "substitution target must be a variable or field (or use the 'r' modifier)",
                &target.token,
            )),
        }
    }

    fn unary_expr(&mut self) -> PResult<Expr> {
        let tok = self.peek()?;
        match tok.kind {
            K::Bang | K::Tilde | K::Minus | K::Plus => {
                // `-1` etc: negative literals fold into the literal token
                let op = self.advance()?;
                self.skip_eols()?;
                let expr = self.unary_expr()?;
                Ok(Expr::new(
                    op.clone(),
                    ExprKind::PrefixUnary {
                        op,
                        expr: Box::new(expr),
                    },
                ))
            }
            K::PlusPlus | K::MinusMinus => {
                let op = self.advance()?;
                self.skip_eols()?;
                let operand = self.unary_expr()?;
                let base_op = if op.is(K::PlusPlus) { K::Plus } else { K::Minus };
                self.build_op_assign(operand, &op, base_op, constant_one(&op), false)
            }
            K::LeftParen => {
                // Type cast?
                if let Some(cast) = self.try_cast()? {
                    return Ok(cast);
                }
                self.postfix_expr()
            }
            _ => self.postfix_expr(),
        }
    }

    fn try_cast(&mut self) -> PResult<Option<Expr>> {
        let result = self.speculate(|p| {
            let open = p.expect(K::LeftParen, "expected '('")?;
            let ty = p.type_ref()?;
            p.expect(K::RightParen, "expected ')' in cast")?;
            // Must be followed by something castable, otherwise `(x)` grouping
            let next = p.peek()?;
            let starts_operand = matches!(
                next.kind,
                K::Identifier
                    | K::IntLiteral
                    | K::LongLiteral
                    | K::DoubleLiteral
                    | K::DecimalLiteral
                    | K::StringLiteral
                    | K::LeftParen
                    | K::LeftSquare
                    | K::LeftBrace
                    | K::This
                    | K::Super
                    | K::New
                    | K::Minus
                    | K::Bang
                    | K::Tilde
                    | K::True
                    | K::False
                    | K::Null
            );
            if !starts_operand {
                return Err(CompileError::syntax("not a cast", &next));
            }
            let expr = p.unary_expr()?;
            Ok(Expr::new(
                open,
                ExprKind::Cast {
                    target: ty,
                    expr: Box::new(expr),
                },
            ))
        });
        Ok(result)
    }

    fn postfix_expr(&mut self) -> PResult<Expr> {
        let mut expr = self.primary()?;
        loop {
            let tok = self.peek_raw()?;
            expr = match tok.kind {
                K::Dot | K::QuestionDot => {
                    let op = self.advance()?;
                    self.skip_eols()?;
                    let field_tok = self.peek()?;
                    // Keywords are legal as field/method names
                    if !field_tok.is(K::Identifier) && !field_tok.keyword && !field_tok.is(K::StringLiteral) {
                        return Err(CompileError::syntax(
                            format!("expected field or method name after '{}'", op.lexeme),
                            &field_tok,
                        ));
                    }
                    self.advance()?;
                    let name = match &field_tok.value {
                        Some(Value::String(s)) => s.clone(),
                        _ => field_tok.lexeme.clone(),
                    };
                    let field = Expr::new(
                        field_tok.clone().with_kind(K::StringLiteral),
                        ExprKind::Literal,
                    );
                    let field = with_string_value(field, &name);
                    binary(expr, op, field)
                }
                K::LeftSquare | K::QuestionSquare => {
                    let op = self.advance()?;
                    self.skip_eols()?;
                    let index = self.expression()?;
                    self.skip_eols()?;
                    self.expect(K::RightSquare, "expected ']' after index")?;
                    binary(expr, op, index)
                }
                K::LeftParen => {
                    let open = self.advance()?;
                    let args = self.call_args()?;
                    let mut callee = expr;
                    callee.is_callee = true;
                    Expr::new(
                        open,
                        ExprKind::Call {
                            callee: Box::new(callee),
                            args,
                            fun: None,
                        },
                    )
                }
                K::LeftBrace => {
                    // Trailing closure argument; may chain
                    let closure = self.closure_or_map()?;
                    if !matches!(closure.kind, ExprKind::Closure { .. }) {
                        return Err(CompileError::syntax(
                            "expected closure after call",
                            &closure.token,
                        ));
                    }
                    match expr.kind {
                        ExprKind::Call {
                            callee,
                            mut args,
                            fun,
                        } => {
                            args.push(closure);
                            Expr::new(expr.token, ExprKind::Call { callee, args, fun })
                        }
                        _ => {
                            let mut callee = expr;
                            callee.is_callee = true;
                            Expr::new(
                                tok,
                                ExprKind::Call {
                                    callee: Box::new(callee),
                                    args: vec![closure],
                                    fun: None,
                                },
                            )
                        }
                    }
                }
                K::PlusPlus | K::MinusMinus => {
                    let op = self.advance()?;
                    let base_op = if op.is(K::PlusPlus) { K::Plus } else { K::Minus };
                    self.build_op_assign(expr, &op, base_op, constant_one(&op), true)?
                }
                _ => return Ok(expr),
            };
        }
    }

    fn call_args(&mut self) -> PResult<Vec<Expr>> {
        self.skip_eols()?;
        if self.peek()?.is(K::RightParen) {
            self.advance()?;
            return Ok(Vec::new());
        }
        // Named arguments: every argument is `name: expr`
        if self.lookahead_matches(|p| {
            let name = p.advance()?;
            if !name.is(K::Identifier) && !name.keyword {
                return Err(CompileError::syntax("not a named argument", &name));
            }
            p.expect(K::Colon, "expected ':'")?;
            Ok(())
        }) {
            return self.named_args();
        }
        let mut args = Vec::new();
        loop {
            args.push(self.expression()?);
            self.skip_eols()?;
            if self.peek()?.is(K::Comma) {
                self.advance()?;
                self.skip_eols()?;
            } else {
                break;
            }
        }
        self.expect(K::RightParen, "expected ')' after arguments")?;
        Ok(args)
    }

    /// Parses `name: expr, ...` arguments into a single named-args map.
    fn named_args(&mut self) -> PResult<Vec<Expr>> {
        let start = self.peek()?;
        let mut entries = Vec::new();
        loop {
            let name = self.advance()?;
            if !name.is(K::Identifier) && !name.keyword {
                return Err(CompileError::syntax("expected argument name", &name));
            }
            self.expect(K::Colon, "expected ':' after argument name")?;
            self.skip_eols()?;
            let value = self.expression()?;
            if entries.iter().any(|(n, _): &(Token, Expr)| n.lexeme == name.lexeme) {
                return Err(CompileError::structural(
                    format!("duplicate named argument '{}'", name.lexeme),
                    &name,
                ));
            }
            entries.push((name, value));
            self.skip_eols()?;
            if self.peek()?.is(K::Comma) {
                self.advance()?;
                self.skip_eols()?;
            } else {
                break;
            }
        }
        self.expect(K::RightParen, "expected ')' after named arguments")?;
        Ok(vec![Expr::new(
            start,
            ExprKind::MapLiteral {
                entries,
                named_args: true,
            },
        )])
    }

    fn primary(&mut self) -> PResult<Expr> {
        self.with_depth(|p| p.primary_inner())
    }

    fn primary_inner(&mut self) -> PResult<Expr> {
        let tok = self.peek()?;
        match tok.kind {
            K::IntLiteral | K::LongLiteral | K::DoubleLiteral | K::DecimalLiteral | K::StringLiteral => {
                self.advance()?;
                Ok(Expr::new(tok, ExprKind::Literal))
            }
            K::True | K::False => {
                self.advance()?;
                let value = Value::Bool(tok.is(K::True));
                Ok(Expr::new(tok.with_value(value), ExprKind::Literal))
            }
            K::Null => {
                self.advance()?;
                Ok(Expr::new(tok.with_value(Value::Null), ExprKind::Literal))
            }
            K::Slash => self.standalone_regex(),
            K::Identifier if tok.lexeme == "s" && self.adjacent_slash(&tok) => {
                // Substitution on the implicit `it`
                self.advance()?;
                let op = tok.clone().with_kind(K::EqualTilde);
                let (pattern, replacement, modifiers) = self.substitution_parts()?;
                let target = implicit_it(&tok);
                self.build_substitution(target, &op, pattern, replacement, modifiers, true)
            }
            K::Identifier => {
                if let Some(class_path) = self.try_class_path()? {
                    return Ok(class_path);
                }
                self.advance()?;
                Ok(identifier(&tok))
            }
            K::This | K::Super => {
                self.advance()?;
                Ok(identifier(&tok))
            }
            K::Underscore => {
                self.advance()?;
                Ok(identifier(&tok))
            }
            K::LeftParen => {
                if let Some(multi) = self.try_multi_assign_targets()? {
                    return Ok(multi);
                }
                self.advance()?;
                self.skip_eols()?;
                let expr = self.expression()?;
                self.skip_eols()?;
                self.expect(K::RightParen, "expected ')' after expression")?;
                Ok(expr)
            }
            K::LeftSquare => self.list_or_map_literal(),
            K::LeftBrace => self.closure_or_map(),
            K::New => self.new_instance(),
            K::Switch => self.switch_expr(),
            K::Eval => self.eval_expr(),
            K::Eof => Err(CompileError::eof("unexpected end of input", &tok)),
            _ => Err(CompileError::syntax(format!("unexpected {tok}"), &tok)),
        }
    }

    /// A `/regex/` in primary position. With no modifiers it degrades to a
    /// plain string literal; with modifiers it is an implicit match against
    /// `it`.
    fn standalone_regex(&mut self) -> PResult<Expr> {
        let slash = self.peek()?;
        let (pattern, modifiers) = self.regex_literal()?;
        if modifiers.is_empty() {
            return Ok(pattern);
        }
        Ok(Expr::new(
            slash.with_kind(K::EqualTilde),
            ExprKind::RegexMatch {
                target: Box::new(implicit_it(&pattern.token.clone())),
                pattern: Box::new(pattern),
                modifiers,
                implicit_it: true,
                negated: false,
                capture_arr_var: None,
            },
        ))
    }

    /// Tries to read a packaged class path: `pkg.sub.ClassName`, where the
    /// lowercase prefix names a known package.
    fn try_class_path(&mut self) -> PResult<Option<Expr>> {
        let result = self.speculate(|p| {
            let first = p.expect(K::Identifier, "expected identifier")?;
            if first.lexeme.starts_with(char::is_uppercase) {
                return Err(CompileError::syntax("not a package prefix", &first));
            }
            let mut prefix = vec![first.lexeme.clone()];
            loop {
                p.expect(K::Dot, "expected '.'")?;
                let part = p.expect(K::Identifier, "expected path component")?;
                if part.lexeme.starts_with(char::is_uppercase) {
                    // Found the class; the lowercase prefix must be a package
                    let pkg = prefix.join(".");
                    if !p.context.package_exists(&pkg) {
                        return Err(CompileError::syntax(format!("unknown package '{pkg}'"), &first));
                    }
                    let mut path = prefix;
                    path.push(part.lexeme.clone());
                    return Ok(Expr::new(
                        first,
                        ExprKind::TypeExpr {
                            ty: Type::Named(path.join(".")),
                        },
                    ));
                }
                prefix.push(part.lexeme.clone());
            }
        });
        Ok(result)
    }

    /// Tries `( expr, expr, ... ) =`: the lvalue of a multi-assignment.
    fn try_multi_assign_targets(&mut self) -> PResult<Option<Expr>> {
        let result = self.speculate(|p| {
            let open = p.expect(K::LeftParen, "expected '('")?;
            p.skip_eols()?;
            let mut targets = vec![p.binary_expr(1)?];
            if !p.peek()?.is(K::Comma) {
                return Err(CompileError::syntax("not a multi-assignment", &open));
            }
            while p.peek()?.is(K::Comma) {
                p.advance()?;
                p.skip_eols()?;
                targets.push(p.binary_expr(1)?);
            }
            p.expect(K::RightParen, "expected ')'")?;
            if !p.peek()?.is(K::Equal) {
                return Err(CompileError::syntax("not a multi-assignment", &open));
            }
            Ok(Expr::new(
                open,
                ExprKind::MultiAssign {
                    targets,
                    value: Box::new(Expr::new(
                        Token::new(K::Null, p.source_id, 0, ""),
                        ExprKind::Noop,
                    )),
                },
            ))
        });
        Ok(result)
    }

    /// `[...]`: a list literal, a map literal (`[k: v]`), or the empty map
    /// `[:]`.
    fn list_or_map_literal(&mut self) -> PResult<Expr> {
        let open = self.advance()?;
        self.skip_eols()?;
        if self.peek()?.is(K::Colon) {
            self.advance()?;
            self.expect(K::RightSquare, "expected ']' after empty map literal")?;
            return Ok(Expr::new(
                open,
                ExprKind::MapLiteral {
                    entries: Vec::new(),
                    named_args: false,
                },
            ));
        }
        let is_map = self.lookahead_matches(|p| {
            let key = p.advance()?;
            if !key.is(K::Identifier) && !key.is(K::StringLiteral) && !key.keyword {
                return Err(CompileError::syntax("not a map key", &key));
            }
            p.expect(K::Colon, "expected ':'")?;
            Ok(())
        });
        if is_map {
            let entries = self.map_entries(K::RightSquare)?;
            return Ok(Expr::new(
                open,
                ExprKind::MapLiteral {
                    entries,
                    named_args: false,
                },
            ));
        }
        let mut items = Vec::new();
        if !self.peek()?.is(K::RightSquare) {
            loop {
                items.push(self.expression()?);
                self.skip_eols()?;
                if self.peek()?.is(K::Comma) {
                    self.advance()?;
                    self.skip_eols()?;
                } else {
                    break;
                }
            }
        }
        self.expect(K::RightSquare, "expected ']' after list literal")?;
        Ok(Expr::new(open, ExprKind::ListLiteral { items }))
    }

    fn map_entries(&mut self, end: TokenKind) -> PResult<Vec<(Token, Expr)>> {
        let mut entries: Vec<(Token, Expr)> = Vec::new();
        loop {
            self.skip_eols()?;
            let key = self.advance()?;
            if !key.is(K::Identifier) && !key.is(K::StringLiteral) && !key.keyword {
                return Err(CompileError::syntax("expected map key", &key));
            }
            self.expect(K::Colon, "expected ':' after map key")?;
            self.skip_eols()?;
            let value = self.expression()?;
            if entries.iter().any(|(k, _)| k.lexeme == key.lexeme) {
                self.error(CompileError::structural(
                    format!("duplicate map key '{}'", key.lexeme),
                    &key,
                ));
            }
            entries.push((key, value));
            self.skip_eols()?;
            if self.peek()?.is(K::Comma) {
                self.advance()?;
                self.skip_eols()?;
            } else {
                break;
            }
        }
        self.skip_eols()?;
        self.expect(end, "expected end of map literal")?;
        Ok(entries)
    }

    /// `{...}`: a map literal (`{k: v}`, `{:}`), or a closure (with declared
    /// parameters or the implicit `it`). A leading `label:` before a loop
    /// keyword reads as a closure body, not a map.
    fn closure_or_map(&mut self) -> PResult<Expr> {
        let open = self.peek()?;
        // Empty map {:}
        if self.lookahead_matches(|p| {
            p.expect(K::LeftBrace, "expected '{'")?;
            p.expect(K::Colon, "expected ':'")?;
            p.expect(K::RightBrace, "expected '}'")?;
            Ok(())
        }) {
            self.advance()?;
            self.advance()?;
            self.advance()?;
            return Ok(Expr::new(
                open,
                ExprKind::MapLiteral {
                    entries: Vec::new(),
                    named_args: false,
                },
            ));
        }
        // Map literal { key: value, ... } — unless the "key" is a loop label
        let is_map = self.lookahead_matches(|p| {
            p.expect(K::LeftBrace, "expected '{'")?;
            p.skip_eols()?;
            let key = p.advance()?;
            if !key.is(K::Identifier) && !key.is(K::StringLiteral) && !key.keyword {
                return Err(CompileError::syntax("not a map key", &key));
            }
            p.expect(K::Colon, "expected ':'")?;
            let next = p.peek()?;
            if matches!(next.kind, K::While | K::For | K::Do) {
                return Err(CompileError::syntax("labeled loop, not a map", &next));
            }
            Ok(())
        });
        if is_map {
            let open = self.advance()?;
            let entries = self.map_entries(K::RightBrace)?;
            return Ok(Expr::new(
                open,
                ExprKind::MapLiteral {
                    entries,
                    named_args: false,
                },
            ));
        }
        self.closure()
    }

    /// Parses `{ params -> body }` or `{ body }` (implicit `it` parameter
    /// defaulting to null).
    fn closure(&mut self) -> PResult<Expr> {
        let open = self.expect(K::LeftBrace, "expected '{' to start closure")?;
        let name = self.next_synthetic_name("$closure");
        let mut desc = FunctionDescriptor::new(name, Type::Any);
        desc.is_final = true;
        let fun_id = self.funs.add(desc);
        self.fun_stack.push(fun_id);
        let result = self.closure_tail(fun_id, &open);
        self.fun_stack.pop();
        let (params, body, implicit_it) = result?;

        let fun = fun_decl_expr(fun_id, None, params, body, |f| {
            f.is_closure = true;
            f.implicit_it = implicit_it;
        });
        Ok(Expr::new(
            open,
            ExprKind::Closure {
                fun_decl: Box::new(fun),
            },
        ))
    }

    fn closure_tail(&mut self, fun_id: FunId, open: &Token) -> PResult<(Vec<Stmt>, Stmt, bool)> {
        self.skip_eols()?;
        let has_params = self.lookahead_matches(|p| {
            loop {
                if p.peek()?.is(K::Arrow) {
                    return Ok(()); // zero-parameter closure: `{ -> ... }`
                }
                if p.peek()?.kind.is_type_keyword()
                    || p.peek()?.is(K::Def)
                    || p.lookahead_matches(|q| {
                        q.type_ref()?;
                        q.expect(K::Identifier, "expected parameter name")?;
                        Ok(())
                    })
                {
                    p.type_ref()?;
                }
                p.expect(K::Identifier, "expected parameter name")?;
                if p.peek()?.is(K::Equal) {
                    p.advance()?;
                    p.expression()?;
                }
                match p.peek()?.kind {
                    K::Comma => {
                        p.advance()?;
                        p.skip_eols()?;
                    }
                    K::Arrow => return Ok(()),
                    _ => {
                        let tok = p.peek()?;
                        return Err(CompileError::syntax("not a parameter list", &tok));
                    }
                }
            }
        });

        let mut params = Vec::new();
        let mut implicit_it = false;
        if has_params {
            let mut slot = 0i32;
            while !self.peek()?.is(K::Arrow) {
                params.push(self.param_decl(fun_id, slot)?);
                slot += 1;
                if self.peek()?.is(K::Comma) {
                    self.advance()?;
                    self.skip_eols()?;
                }
            }
            self.advance()?; // ->
            self.skip_eols()?;
        } else {
            // Implicit `it` parameter defaulting to null
            implicit_it = true;
            let it_tok = Token::new(K::Identifier, open.source, open.offset, IT_PARAM);
            let mut decl = VarDecl::new(IT_PARAM, it_tok.clone(), Type::Any);
            decl.is_param = true;
            decl.slot = 0;
            decl.owner = Some(fun_id);
            decl.nesting_level = u32::try_from(self.fun_stack.len()).unwrap_or(0);
            let var = self.vars.add(decl);
            let init = Expr::new(it_tok.clone().with_kind(K::Null).with_value(Value::Null), ExprKind::Literal);
            params.push(Stmt::new(
                it_tok,
                StmtKind::VarDecl(Box::new(VarDeclStmt {
                    var,
                    init: Some(init),
                })),
            ));
            let desc = self.funs.get_mut(fun_id);
            desc.param_names.push(IT_PARAM.to_string());
            desc.param_types.push(Type::Any);
        }

        let stmts = self.statements_until(K::RightBrace)?;
        self.expect(K::RightBrace, "expected '}' to close closure")?;
        let body = Stmt::new(open.clone(), StmtKind::Block(Box::new(BlockStmt { stmts })));
        Ok((params, body, implicit_it))
    }

    fn new_instance(&mut self) -> PResult<Expr> {
        let new_tok = self.advance()?;
        let tok = self.peek()?;
        let ty = self.type_ref()?;
        let Type::Named(class_name) = ty else {
            return Err(CompileError::type_error(
                format!("'new' requires a class type, not {ty}"),
                &tok,
            ));
        };
        self.expect(K::LeftParen, "expected '(' after class name")?;
        let args = self.call_args()?;
        Ok(Expr::new(
            new_tok,
            ExprKind::NewInstance {
                class_name,
                args,
                class_id: None,
            },
        ))
    }

    fn switch_expr(&mut self) -> PResult<Expr> {
        let switch_tok = self.advance()?;
        self.expect(K::LeftParen, "expected '(' after 'switch'")?;
        self.skip_eols()?;
        let subject = self.expression()?;
        self.skip_eols()?;
        self.expect(K::RightParen, "expected ')' after switch subject")?;
        self.skip_eols()?;
        self.expect(K::LeftBrace, "expected '{' to start switch body")?;

        let mut cases = Vec::new();
        let mut default_case: Option<Box<Expr>> = None;
        loop {
            self.skip_separators()?;
            let tok = self.peek()?;
            if tok.is(K::RightBrace) {
                break;
            }
            if tok.is(K::Eof) {
                return Err(CompileError::eof("unterminated switch", &tok));
            }
            if tok.is(K::Underscore) {
                self.advance()?;
                self.expect(K::Arrow, "expected '->' after '_'")?;
                self.skip_eols()?;
                let result = self.case_result()?;
                if default_case.is_some() {
                    self.error(CompileError::structural("switch already has a default case", &tok));
                }
                default_case = Some(Box::new(result));
                continue;
            }
            let mut patterns = vec![self.case_pattern()?];
            while self.peek()?.is(K::Comma) {
                self.advance()?;
                self.skip_eols()?;
                patterns.push(self.case_pattern()?);
            }
            self.expect(K::Arrow, "expected '->' after case pattern")?;
            self.skip_eols()?;
            let result = self.case_result()?;
            cases.push(SwitchCase { patterns, result });
        }
        self.expect(K::RightBrace, "expected '}' to close switch")?;
        Ok(Expr::new(
            switch_tok,
            ExprKind::Switch {
                subject: Box::new(subject),
                cases,
                default_case,
            },
        ))
    }

    /// A case pattern: a literal, or a constructor pattern `Type(p, ...)`.
    fn case_pattern(&mut self) -> PResult<Expr> {
        let tok = self.peek()?;
        if tok.is(K::Identifier) && tok.lexeme.starts_with(char::is_uppercase) {
            let ctor = self.speculate(|p| {
                let ty_tok = p.peek()?;
                let ty = p.type_ref()?;
                p.expect(K::LeftParen, "expected '(' in constructor pattern")?;
                p.skip_eols()?;
                let mut args = Vec::new();
                if !p.peek()?.is(K::RightParen) {
                    loop {
                        if p.peek()?.is(K::Underscore) {
                            let u = p.advance()?;
                            args.push(identifier(&u));
                        } else {
                            args.push(p.case_pattern()?);
                        }
                        if p.peek()?.is(K::Comma) {
                            p.advance()?;
                            p.skip_eols()?;
                        } else {
                            break;
                        }
                    }
                }
                p.expect(K::RightParen, "expected ')' in constructor pattern")?;
                Ok(Expr::new(ty_tok, ExprKind::ConstructorPattern { ty, args }))
            });
            if let Some(ctor) = ctor {
                return Ok(ctor);
            }
        }
        // Literal pattern (allowing unary minus)
        self.unary_expr()
    }

    /// A case result: an expression, or a brace block with no parameters,
    /// which reads as a block expression producing its last statement.
    fn case_result(&mut self) -> PResult<Expr> {
        if self.peek()?.is(K::LeftBrace) {
            let expr = self.closure_or_map()?;
            let no_params = match &expr.kind {
                ExprKind::Closure { fun_decl } => {
                    matches!(&fun_decl.kind, ExprKind::FunDecl(f) if f.implicit_it)
                }
                _ => false,
            };
            if no_params {
                let ExprKind::Closure { fun_decl } = expr.kind else { unreachable!() };
                let ExprKind::FunDecl(f) = fun_decl.kind else { unreachable!() };
                return Ok(Expr::new(expr.token, ExprKind::BlockExpr { block: f.body }));
            }
            return Ok(expr);
        }
        self.expression()
    }

    fn eval_expr(&mut self) -> PResult<Expr> {
        let eval_tok = self.advance()?;
        self.expect(K::LeftParen, "expected '(' after 'eval'")?;
        self.skip_eols()?;
        let script = self.expression()?;
        self.skip_eols()?;
        let globals = if self.peek()?.is(K::Comma) {
            self.advance()?;
            self.skip_eols()?;
            Some(Box::new(self.expression()?))
        } else {
            None
        };
        self.skip_eols()?;
        self.expect(K::RightParen, "expected ')' after eval arguments")?;
        Ok(Expr::new(
            eval_tok,
            ExprKind::Eval {
                script: Box::new(script),
                globals,
            },
        ))
    }

    // ── Token helpers ────────────────────────────────────────────────────

    fn peek(&mut self) -> PResult<Token> {
        self.tokenizer.peek()
    }

    /// Raw peek: identical to [`Self::peek`], named for sites where the
    /// newline-sensitivity is the point (operator matching, labels).
    fn peek_raw(&mut self) -> PResult<Token> {
        self.tokenizer.peek()
    }

    fn advance(&mut self) -> PResult<Token> {
        self.tokenizer.advance()
    }

    fn expect(&mut self, kind: TokenKind, msg: &'static str) -> PResult<Token> {
        let tok = self.peek()?;
        if tok.is(kind) {
            return self.advance();
        }
        if tok.is(K::Eof) {
            return Err(CompileError::eof(format!("{msg} but reached end of input"), &tok));
        }
        Err(CompileError::syntax(format!("{msg} but found {tok}"), &tok))
    }

    fn skip_eols(&mut self) -> PResult<()> {
        while self.peek()?.is(K::Eol) {
            self.advance()?;
        }
        Ok(())
    }

    fn skip_separators(&mut self) -> PResult<()> {
        while matches!(self.peek()?.kind, K::Eol | K::Semicolon) {
            self.advance()?;
        }
        Ok(())
    }

    fn at_expression_end(&mut self) -> PResult<bool> {
        let tok = self.peek_raw()?;
        Ok(matches!(
            tok.kind,
            K::Eol | K::Semicolon | K::RightBrace | K::RightParen | K::RightSquare | K::Eof | K::If | K::Unless
        ))
    }

    fn expect_statement_end(&mut self) -> PResult<()> {
        let tok = self.peek_raw()?;
        match tok.kind {
            K::Eol | K::Semicolon => {
                self.advance()?;
                Ok(())
            }
            K::RightBrace | K::Eof => Ok(()),
            _ => Err(CompileError::syntax(
                format!("unexpected {tok} after statement"),
                &tok,
            )),
        }
    }

    /// True when the character immediately after `tok` is a `/` (used for
    /// `s/.../.../` detection, where no whitespace is allowed).
    fn adjacent_slash(&self, tok: &Token) -> bool {
        self.source[tok.end_offset() as usize..].starts_with('/')
    }

    fn next_synthetic_name(&mut self, prefix: &str) -> String {
        self.synthetic_counter += 1;
        format!("{prefix}${}", self.synthetic_counter)
    }

    fn with_depth<T>(&mut self, f: impl FnOnce(&mut Self) -> PResult<T>) -> PResult<T> {
        if self.depth_remaining == 0 {
            let tok = self.peek()?;
            return Err(CompileError::syntax("expression nesting too deep", &tok).into_fatal());
        }
        self.depth_remaining -= 1;
        let result = f(self);
        self.depth_remaining += 1;
        result
    }

    // ── Speculation ──────────────────────────────────────────────────────

    /// Attempts a production. On failure, the tokenizer position, the error
    /// list and the symbol arenas are restored and `None` is returned;
    /// failures never surface to the user. On success the consumed input is
    /// kept.
    fn speculate<T>(&mut self, f: impl FnOnce(&mut Self) -> PResult<T>) -> Option<T> {
        let mark = self.tokenizer.mark();
        let errors_len = self.errors.len();
        let vars_len = self.vars.len();
        let funs_len = self.funs.len();
        let classes_len = self.classes.len();
        let depth = self.depth_remaining;
        self.lookahead_depth += 1;
        let result = f(self);
        self.lookahead_depth -= 1;
        match result {
            Ok(value) => Some(value),
            Err(_) => {
                self.tokenizer.rollback(mark);
                self.errors.truncate(errors_len);
                self.vars.truncate(vars_len);
                self.funs.truncate(funs_len);
                self.classes.truncate(classes_len);
                self.depth_remaining = depth;
                None
            }
        }
    }

    /// Pure lookahead: attempts a production and rolls back regardless of the
    /// outcome, reporting only whether it succeeded.
    fn lookahead_matches(&mut self, f: impl FnOnce(&mut Self) -> PResult<()>) -> bool {
        let mark = self.tokenizer.mark();
        let vars_len = self.vars.len();
        let funs_len = self.funs.len();
        let classes_len = self.classes.len();
        let matched = self.speculate(f).is_some();
        if matched {
            self.tokenizer.rollback(mark);
            self.vars.truncate(vars_len);
            self.funs.truncate(funs_len);
            self.classes.truncate(classes_len);
        }
        matched
    }

    fn error(&mut self, err: CompileError) {
        if self.lookahead_depth == 0 {
            self.errors.push(err);
        }
    }

    /// Skips forward to a recovery anchor after a syntax error, consuming
    /// statement separators so parsing resumes at the next statement.
    fn skip_to_anchor(&mut self) -> PResult<()> {
        loop {
            let tok = self.peek()?;
            if RECOVERY_ANCHORS.contains(&tok.kind) {
                if matches!(tok.kind, K::Eol | K::Semicolon) {
                    self.advance()?;
                }
                return Ok(());
            }
            self.advance()?;
        }
    }
}

// ── Free helpers ─────────────────────────────────────────────────────────

fn fun_decl_expr(
    fun: FunId,
    name_token: Option<Token>,
    params: Vec<Stmt>,
    body: Stmt,
    customize: impl FnOnce(&mut FunDeclExpr),
) -> Expr {
    let token = name_token.clone().unwrap_or_else(|| body.token.clone());
    let mut fun_decl = FunDeclExpr {
        fun,
        name_token,
        params,
        body: Box::new(body),
        wrapper: None,
        var_decl: None,
        is_closure: false,
        is_script_main: false,
        is_wrapper: false,
        implicit_it: false,
    };
    customize(&mut fun_decl);
    Expr::new(token, ExprKind::FunDecl(Box::new(fun_decl)))
}

fn binary(left: Expr, op: Token, right: Expr) -> Expr {
    Expr::new(
        op.clone(),
        ExprKind::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
            create_if_missing: false,
        },
    )
}

fn identifier(tok: &Token) -> Expr {
    let capture_num = tok
        .lexeme
        .strip_prefix('$')
        .and_then(|digits| digits.parse::<u32>().ok());
    Expr::new(
        tok.clone(),
        ExprKind::Identifier {
            name: tok.lexeme.clone(),
            var_decl: None,
            capture_num,
        },
    )
}

fn implicit_it(tok: &Token) -> Expr {
    let it = Token::new(K::Identifier, tok.source, tok.offset, IT_PARAM);
    Expr::new(
        it.clone(),
        ExprKind::Identifier {
            name: IT_PARAM.to_string(),
            var_decl: None,
            capture_num: None,
        },
    )
}

fn with_string_value(mut expr: Expr, s: &str) -> Expr {
    expr.token.value = Some(Value::String(s.to_string()));
    expr
}

fn constant_one(tok: &Token) -> Expr {
    let one = Token::new(K::IntLiteral, tok.source, tok.offset, "1").with_value(Value::Int(1));
    Expr::new(one, ExprKind::Literal)
}

fn constant_true(tok: &Token) -> Expr {
    let t = Token::new(K::True, tok.source, tok.offset, "true").with_value(Value::Bool(true));
    Expr::new(t, ExprKind::Literal)
}

/// Splits the outermost link of a field-access chain into
/// `(parent, access_op, field)`.
fn split_field_access(expr: Expr) -> (Expr, TokenKind, Expr) {
    let ExprKind::Binary { left, op, right, .. } = expr.kind else {
        panic!("split_field_access on non-binary expression");
    };
    (*left, op.kind, *right)
}

/// Flags every field-access binary in an lvalue parent chain for
/// autovivification. The final link was already split off into the
/// assignment node itself, so everything here is an intermediate access.
fn mark_create_if_missing(expr: &mut Expr) {
    if let ExprKind::Binary {
        left,
        op,
        create_if_missing,
        ..
    } = &mut expr.kind
    {
        if matches!(
            op.kind,
            K::Dot | K::QuestionDot | K::LeftSquare | K::QuestionSquare
        ) {
            *create_if_missing = true;
            mark_create_if_missing(left);
        }
    }
}

/// Routes a parsed class member into the field or method list.
fn push_member(member: Stmt, fields: &mut Vec<Stmt>, methods: &mut Vec<Stmt>, vars: &mut VarMap) {
    match &member.kind {
        StmtKind::FunDecl(_) => methods.push(member),
        _ => {
            mark_fields(&member, vars);
            fields.push(member);
        }
    }
}

fn mark_fields(stmt: &Stmt, vars: &mut VarMap) {
    match &stmt.kind {
        StmtKind::VarDecl(decl) => {
            let var = vars.get_mut(decl.var);
            var.is_field = true;
        }
        StmtKind::Stmts(stmts) => {
            for s in stmts {
                mark_fields(s, vars);
            }
        }
        _ => {}
    }
}

/// Whether a parsed script consists of exactly one class declaration.
fn script_is_single_class(tree: &Stmt) -> bool {
    fn body_stmts(tree: &Stmt) -> Option<&[Stmt]> {
        let class = match &tree.kind {
            StmtKind::ClassDecl(c) => c,
            StmtKind::Stmts(stmts) => match &stmts.last()?.kind {
                StmtKind::ClassDecl(c) => c,
                _ => return None,
            },
            _ => return None,
        };
        let StmtKind::FunDecl(main) = &class.methods.first()?.kind else {
            return None;
        };
        let ExprKind::FunDecl(fun) = &main.kind else {
            return None;
        };
        let StmtKind::Block(block) = &fun.body.kind else {
            return None;
        };
        Some(&block.stmts)
    }
    body_stmts(tree).is_some_and(|stmts| stmts.len() == 1 && matches!(stmts[0].kind, StmtKind::ClassDecl(_)))
}

/// Reorders script statements so BEGIN blocks run first and END blocks run
/// last, wherever they were written.
fn hoist_begin_end(stmts: &mut Vec<Stmt>) {
    if !stmts
        .iter()
        .any(|s| matches!(s.token.kind, K::BeginBlock | K::EndBlock))
    {
        return;
    }
    let mut begins = Vec::new();
    let mut ends = Vec::new();
    let mut rest = Vec::new();
    for stmt in stmts.drain(..) {
        match stmt.token.kind {
            K::BeginBlock => begins.push(stmt),
            K::EndBlock => ends.push(stmt),
            _ => rest.push(stmt),
        }
    }
    begins.extend(rest);
    begins.extend(ends);
    *stmts = begins;
}
