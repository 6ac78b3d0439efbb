//! The resolver: turns a parsed AST into a fully-annotated one.
//!
//! Responsibilities, in the order they bite: link every identifier to its
//! declaration (local, parameter, field, method, built-in, class or global),
//! fill in every expression's type, promote closed-over variables to heap
//! locals with pass-through chains, pair every function with its
//! argument-dispatch wrapper, synthesize class initialisers, rewrite implicit
//! returns into explicit ones, fold constants, and finish the whole-program
//! async propagation to a fixed point.
//!
//! The resolver consumes each node and returns the annotated replacement;
//! symbol data lives in the arenas ([`VarMap`], [`FunMap`], [`ClassMap`])
//! which the resolver mutates in place. User errors accumulate; internal
//! invariant violations panic.

use ahash::{AHashMap, AHashSet};

use crate::{
    ast::{
        BlockStmt, ClassDeclStmt, Expr, ExprKind, FunDeclExpr, IfStmt, SpecialVarKind, Stmt, StmtKind, SwitchCase,
        ThrowErrorStmt, UtilityFn, VarDecl, VarDeclId, VarDeclStmt, VarMap, WhileStmt,
    },
    builtins::Builtins,
    classes::{ClassId, ClassMap, FieldInfo},
    context::CompilerContext,
    error::{CompileError, CompileErrors},
    function::{FunId, FunMap, FunctionDescriptor, INIT_METHOD},
    parser::ParseOutcome,
    token::{Token, TokenKind},
    types::Type,
    value::{self, Value},
};

/// Name of the per-function regex capture array backing `$1`..`$n`.
const CAPTURE_ARR: &str = "$@";
/// Wrapper parameter names.
const SOURCE_PARAM: &str = "$source";
const OFFSET_PARAM: &str = "$offset";
const ARGS_PARAM: &str = "$args";

/// A fully resolved compilation unit: the annotated tree plus the symbol
/// graph its ids point into.
#[derive(Debug)]
pub struct ResolvedUnit {
    pub tree: Stmt,
    pub vars: VarMap,
    pub funs: FunMap,
    pub classes: ClassMap,
}

/// One binding in a block's symbol table. A name is *declared* (sentinel)
/// before its initialiser resolves and *defined* afterwards, so
/// `int x = x + 1` is caught as a self-reference.
#[derive(Debug, Clone, Copy)]
struct Binding {
    var: VarDeclId,
    defined: bool,
}

#[derive(Debug, Default)]
struct BlockState {
    bindings: AHashMap<String, Binding>,
}

/// Per-function resolve state, innermost last on the stack.
struct FunState {
    fun: FunId,
    blocks: Vec<BlockState>,
    /// Set while parameter declarations (and their default initialisers) are
    /// being resolved; captures discovered now force pre-body promotion.
    resolving_params: bool,
    /// The `$@` capture-array declaration, created on first regex use.
    capture_arr: Option<VarDeclId>,
    /// Synthesized `this`/`super` bindings for methods.
    this_var: Option<VarDeclId>,
    super_var: Option<VarDeclId>,
    /// Labels of enclosing loops, innermost last. `None` entries are
    /// unlabeled loops.
    loops: Vec<Option<String>>,
    /// Global regex matches seen in the condition currently being resolved.
    condition_global_matches: u32,
    /// Whether a loop condition is currently being resolved (for the regex
    /// `g` modifier rule).
    in_loop_condition: bool,
}

impl FunState {
    fn new(fun: FunId) -> Self {
        Self {
            fun,
            blocks: Vec::new(),
            resolving_params: false,
            capture_arr: None,
            this_var: None,
            super_var: None,
            loops: Vec::new(),
            condition_global_matches: 0,
            in_loop_condition: false,
        }
    }
}

/// Per-class resolve state.
struct ClassState {
    class: ClassId,
    /// Arena declarations for this class's fields, by name.
    field_vars: AHashMap<String, VarDeclId>,
    /// Whether the member currently being resolved is static.
    in_static: bool,
}

/// What a name resolved to.
enum Symbol {
    Var(VarDeclId),
    Field(ClassId, VarDeclId),
    Method(ClassId, FunId),
    BuiltinFn(FunId),
    Class(ClassId),
    Global(VarDeclId),
}

pub struct Resolver<'ctx> {
    context: &'ctx CompilerContext,
    vars: VarMap,
    funs: FunMap,
    classes: ClassMap,
    builtins: Builtins,
    errors: Vec<CompileError>,
    fun_states: Vec<FunState>,
    class_states: Vec<ClassState>,
    /// Imported classes visible by simple name.
    imports: AHashMap<String, ClassId>,
    /// Lazily created global variable declarations.
    global_vars: AHashMap<String, VarDeclId>,
    /// Monotone counter for definition order (forward-reference checks).
    declare_seq: u32,
    /// Call graph edges for async propagation.
    call_edges: Vec<(FunId, FunId)>,
    /// Functions whose declarations have been fully resolved.
    resolved_funs: AHashSet<FunId>,
    /// Earliest forward reference to each not-yet-resolved function, as a
    /// definition-order sequence number.
    earliest_forward_ref: AHashMap<FunId, u32>,
}

/// Resolves a parsed compilation unit.
pub fn resolve(context: &CompilerContext, outcome: ParseOutcome) -> Result<ResolvedUnit, CompileErrors> {
    let ParseOutcome {
        tree,
        vars,
        mut funs,
        classes,
    } = outcome;
    let builtins = Builtins::register(&mut funs);
    let mut resolver = Resolver {
        context,
        vars,
        funs,
        classes,
        builtins,
        errors: Vec::new(),
        fun_states: Vec::new(),
        class_states: Vec::new(),
        imports: AHashMap::new(),
        global_vars: AHashMap::new(),
        declare_seq: 0,
        call_edges: Vec::new(),
        resolved_funs: AHashSet::new(),
        earliest_forward_ref: AHashMap::new(),
    };
    resolver.prepare_classes(&tree);
    let tree = resolver.resolve_stmt(tree);
    resolver.propagate_async();
    if resolver.errors.is_empty() {
        resolver.check_invariants(&tree);
        Ok(ResolvedUnit {
            tree,
            vars: resolver.vars,
            funs: resolver.funs,
            classes: resolver.classes,
        })
    } else {
        Err(CompileErrors::new(resolver.errors))
    }
}

impl Resolver<'_> {
    // ── Statements ───────────────────────────────────────────────────────

    fn resolve_stmt(&mut self, mut stmt: Stmt) -> Stmt {
        stmt.kind = match stmt.kind {
            StmtKind::Stmts(stmts) => StmtKind::Stmts(stmts.into_iter().map(|s| self.resolve_stmt(s)).collect()),
            StmtKind::Block(block) => StmtKind::Block(Box::new(self.resolve_block(*block))),
            StmtKind::VarDecl(decl) => StmtKind::VarDecl(Box::new(self.resolve_var_decl_stmt(*decl, &stmt.token))),
            StmtKind::ExprStmt(expr) => {
                let mut expr = *expr;
                expr.is_result_used = false;
                // A brace block used directly as a statement is a closure
                // that can never be invoked: strip the implicit `it` and
                // treat it as a plain lexical scope.
                let strip_it = match &expr.kind {
                    ExprKind::Closure { fun_decl } => {
                        matches!(&fun_decl.kind, ExprKind::FunDecl(f) if f.implicit_it)
                    }
                    _ => false,
                };
                if strip_it {
                    let ExprKind::Closure { fun_decl } = expr.kind else { unreachable!() };
                    let ExprKind::FunDecl(f) = fun_decl.kind else {
                        panic!("closure without function declaration")
                    };
                    let block = self.resolve_stmt(*f.body);
                    return Stmt {
                        token: stmt.token,
                        resolved: true,
                        kind: block.kind,
                    };
                }
                StmtKind::ExprStmt(Box::new(self.resolve_expr(expr)))
            }
            StmtKind::Return(expr) => StmtKind::Return(Box::new(self.resolve_expr(*expr))),
            StmtKind::If(if_stmt) => {
                let IfStmt {
                    condition,
                    then_stmt,
                    else_stmt,
                } = *if_stmt;
                let condition = self.resolve_condition(condition);
                let then_stmt = Box::new(self.resolve_stmt(*then_stmt));
                let else_stmt = else_stmt.map(|s| Box::new(self.resolve_stmt(*s)));
                StmtKind::If(Box::new(IfStmt {
                    condition,
                    then_stmt,
                    else_stmt,
                }))
            }
            StmtKind::While(while_stmt) => {
                let WhileStmt {
                    condition,
                    body,
                    update,
                    label,
                    is_do_until,
                } = *while_stmt;
                let state = self.fun_state();
                state.loops.push(label.clone());
                state.in_loop_condition = true;
                state.condition_global_matches = 0;
                let condition = self.resolve_condition(condition);
                let state = self.fun_state();
                state.in_loop_condition = false;
                state.condition_global_matches = 0;
                let body = Box::new(self.resolve_stmt(*body));
                let update = update
                    .into_iter()
                    .map(|mut u| {
                        u.is_result_used = false;
                        self.resolve_expr(u)
                    })
                    .collect();
                self.fun_state().loops.pop();
                StmtKind::While(Box::new(WhileStmt {
                    condition,
                    body,
                    update,
                    label,
                    is_do_until,
                }))
            }
            StmtKind::ClassDecl(class_decl) => StmtKind::ClassDecl(Box::new(self.resolve_class_decl(*class_decl))),
            StmtKind::Import(import) => {
                match self.classes.lookup(&import.path).or_else(|| {
                    // Allow importing by simple name from the default package
                    let simple = import.path.rsplit('.').next().unwrap_or(&import.path);
                    self.classes.lookup(simple)
                }) {
                    Some(id) => {
                        let name = import
                            .alias
                            .clone()
                            .unwrap_or_else(|| import.path.rsplit('.').next().unwrap_or(&import.path).to_string());
                        self.imports.insert(name, id);
                    }
                    None => self.error(CompileError::structural(
                        format!("unknown class '{}'", import.path),
                        &stmt.token,
                    )),
                }
                StmtKind::Import(import)
            }
            StmtKind::FunDecl(expr) => {
                let resolved = self.resolve_expr(*expr);
                StmtKind::FunDecl(Box::new(resolved))
            }
            StmtKind::ThrowError(err) => StmtKind::ThrowError(err),
        };
        stmt.resolved = true;
        stmt
    }

    /// Resolves a block: opens a scope, pre-declares the block's function
    /// declarations so forward references among siblings are legal, then
    /// resolves the statements in order.
    fn resolve_block(&mut self, block: BlockStmt) -> BlockStmt {
        self.fun_state().blocks.push(BlockState::default());
        self.predeclare_functions(&block.stmts);
        let stmts = block.stmts.into_iter().map(|s| self.resolve_stmt(s)).collect();
        self.fun_state().blocks.pop();
        BlockStmt { stmts }
    }

    /// Declares a binding for every function declared directly in this block
    /// before any statement resolves.
    fn predeclare_functions(&mut self, stmts: &[Stmt]) {
        let mut to_declare = Vec::new();
        for stmt in stmts {
            if let StmtKind::FunDecl(expr) = &stmt.kind {
                if let ExprKind::FunDecl(fun_decl) = &expr.kind {
                    if let Some(name_tok) = &fun_decl.name_token {
                        to_declare.push((name_tok.clone(), fun_decl.fun));
                    }
                }
            }
        }
        for (name_tok, fun) in to_declare {
            let name = name_tok.lexeme.clone();
            if self.current_block_has(&name) {
                self.error(CompileError::structural(
                    format!("function '{name}' is already declared in this scope"),
                    &name_tok,
                ));
                continue;
            }
            let mut decl = VarDecl::new(name.clone(), name_tok, Type::Function);
            decl.is_final = true;
            decl.owner = Some(self.fun_state_ref().fun);
            decl.nesting_level = u32::try_from(self.fun_states.len()).unwrap_or(0);
            decl.fun_decl = Some(fun);
            decl.declare_seq = self.next_seq();
            let id = self.vars.add(decl);
            self.current_block().bindings.insert(name, Binding { var: id, defined: true });
        }
    }

    fn resolve_var_decl_stmt(&mut self, decl: VarDeclStmt, token: &Token) -> VarDeclStmt {
        let VarDeclStmt { var, init } = decl;

        // Resolve the declared type (class names link to their descriptors)
        let declared = self.vars.get(var).ty.clone();
        let declared = match declared {
            Type::Unknown => Type::Unknown,
            other => self.resolve_type(other, token),
        };
        self.vars.get_mut(var).ty = declared.clone();

        let name = self.vars.get(var).name.clone();
        let is_field = self.vars.get(var).is_field;

        if !is_field {
            // Declare with the undefined sentinel so a self-referencing
            // initialiser is caught
            if self.current_block_has(&name) {
                self.error(CompileError::structural(
                    format!("variable '{name}' is already declared in this scope"),
                    token,
                ));
            }
            self.current_block()
                .bindings
                .insert(name.clone(), Binding { var, defined: false });
        }

        let init = init.map(|e| {
            let resolved = self.resolve_expr(e);
            let init_ty = resolved.ty.clone().unwrap_or(Type::Any);
            let var_ty = self.vars.get(var).ty.clone();
            if var_ty.is_unknown() {
                // Inferred declaration: adopt the initialiser's type
                let inferred = if init_ty == Type::Unknown { Type::Any } else { init_ty };
                self.vars.get_mut(var).ty = inferred;
            } else if !init_ty.is_castable_to(&var_ty, &self.classes) {
                self.error(CompileError::type_error(
                    format!(
                        "cannot convert initialiser of type {} to {}",
                        init_ty.describe(&self.classes),
                        var_ty.describe(&self.classes)
                    ),
                    &resolved.token,
                ));
            }
            resolved
        });

        if self.vars.get(var).ty.is_unknown() {
            // No initialiser to infer from: this is an internal invariant for
            // params (parser demands initialisers on `var`), treat as error
            self.error(CompileError::type_error(
                "cannot infer type for declaration without initialiser",
                token,
            ));
            self.vars.get_mut(var).ty = Type::Any;
        }

        // Define the binding, replacing the sentinel
        let seq = self.next_seq();
        self.vars.get_mut(var).declare_seq = seq;
        if !is_field {
            self.current_block()
                .bindings
                .insert(name, Binding { var, defined: true });
        }
        VarDeclStmt { var, init }
    }

    /// Resolves a loop/if condition; truthiness conversion is implied, so
    /// any type is acceptable.
    fn resolve_condition(&mut self, condition: Expr) -> Expr {
        self.resolve_expr(condition)
    }

    // ── Scope helpers ────────────────────────────────────────────────────

    fn fun_state(&mut self) -> &mut FunState {
        self.fun_states.last_mut().expect("no function scope active")
    }

    fn fun_state_ref(&self) -> &FunState {
        self.fun_states.last().expect("no function scope active")
    }

    fn current_block(&mut self) -> &mut BlockState {
        self.fun_state().blocks.last_mut().expect("no block scope active")
    }

    fn current_block_has(&self, name: &str) -> bool {
        self.fun_state_ref()
            .blocks
            .last()
            .is_some_and(|b| b.bindings.contains_key(name))
    }

    fn next_seq(&mut self) -> u32 {
        self.declare_seq += 1;
        self.declare_seq
    }

    fn current_fun(&self) -> FunId {
        self.fun_state_ref().fun
    }

    fn current_class(&self) -> Option<&ClassState> {
        self.class_states.last()
    }

    fn in_static_context(&self) -> bool {
        self.current_class().is_some_and(|c| c.in_static)
    }

    fn error(&mut self, err: CompileError) {
        self.errors.push(err);
    }

    /// Marks the current function async because of a direct source (an async
    /// callee that is already known async, a dynamic call, `eval`).
    fn mark_current_async(&mut self) {
        let fun = self.current_fun();
        self.funs.get_mut(fun).mark_async();
    }

    /// Records a call edge for the async fixed point.
    fn record_call(&mut self, callee: FunId) {
        let caller = self.current_fun();
        self.call_edges.push((caller, callee));
        if self.funs.get(callee).is_async() {
            self.funs.get_mut(caller).mark_async();
        }
        // Forward reference to a not-yet-resolved sibling: remember the
        // earliest reference point for the capture check
        if !self.resolved_funs.contains(&callee) && !self.funs.get(callee).is_builtin {
            let seq = self.declare_seq;
            self.earliest_forward_ref.entry(callee).or_insert(seq);
        }
    }

    // ── Name lookup ──────────────────────────────────────────────────────

    /// Resolves a name at the current lexical position: blocks innermost to
    /// outermost in the current function, then enclosing functions (with
    /// heap-local promotion), then class members with inheritance, then
    /// imported and local classes, then built-ins, then globals (scripts
    /// only).
    fn lookup(&mut self, name: &str, token: &Token, for_callee: bool) -> Option<Symbol> {
        // Current function's blocks
        let state_idx = self.fun_states.len().checked_sub(1)?;
        if let Some(binding) = self.find_in_function(state_idx, name) {
            if !binding.defined {
                self.error(CompileError::structural(
                    format!("variable '{name}' refers to itself in its own initialiser"),
                    token,
                ));
            }
            return Some(Symbol::Var(binding.var));
        }

        // Enclosing functions: crossing a function boundary promotes the
        // found declaration to a heap local. Direct calls to functions bound
        // in enclosing scopes are an exception: they invoke the function's
        // implementation, so nothing is captured.
        for idx in (0..state_idx).rev() {
            if let Some(binding) = self.find_in_function(idx, name) {
                if !binding.defined {
                    self.error(CompileError::structural(
                        format!("variable '{name}' refers to itself in its own initialiser"),
                        token,
                    ));
                    return Some(Symbol::Var(binding.var));
                }
                if for_callee && self.vars.get(binding.var).fun_decl.is_some() {
                    return Some(Symbol::Var(binding.var));
                }
                let promoted = self.promote_heap_local(idx, binding.var, name, token);
                return Some(Symbol::Var(promoted));
            }
        }

        // Class members, walking the inheritance chain
        if let Some(class_state) = self.class_states.last() {
            let class = class_state.class;
            if let Some(var) = class_state.field_vars.get(name).copied() {
                if self.in_static_context() {
                    self.error(CompileError::context(
                        format!("cannot access instance field '{name}' from a static context"),
                        token,
                    ));
                }
                return Some(Symbol::Field(class, var));
            }
            if let Some((owner, _info)) = self.classes.field_lookup(class, name) {
                if owner != class {
                    if self.in_static_context() {
                        self.error(CompileError::context(
                            format!("cannot access instance field '{name}' from a static context"),
                            token,
                        ));
                    }
                    let var = self.inherited_field_var(owner, name, token);
                    return Some(Symbol::Field(owner, var));
                }
            }
            if let Some(fun) = self.classes.method_lookup(class, name) {
                if self.in_static_context() && !self.funs.get(fun).is_static {
                    self.error(CompileError::context(
                        format!("cannot call instance method '{name}' from a static context"),
                        token,
                    ));
                }
                return Some(Symbol::Method(class, fun));
            }
        }

        // Imported classes by simple name
        if let Some(id) = self.imports.get(name).copied() {
            return Some(Symbol::Class(id));
        }
        // Local classes: enclosing classes, current package, default package
        if let Some(id) = self.lookup_class_name(name) {
            return Some(Symbol::Class(id));
        }
        // Built-in global functions
        if let Some(fun) = self.builtins.global_lookup(name) {
            return Some(Symbol::BuiltinFn(fun));
        }
        // Globals: scripts only, never class code
        if self.in_script_scope() && (self.context.global_exists(name) || self.context.repl_mode) {
            let var = self.global_var(name, token);
            return Some(Symbol::Global(var));
        }
        None
    }

    /// Searches a function state's block stack, innermost block first.
    fn find_in_function(&self, state_idx: usize, name: &str) -> Option<Binding> {
        self.fun_states[state_idx]
            .blocks
            .iter()
            .rev()
            .find_map(|b| b.bindings.get(name).copied())
    }

    /// Whether the innermost class is a script class (globals are visible).
    fn in_script_scope(&self) -> bool {
        self.class_states
            .last()
            .is_some_and(|c| self.classes.get(c.class).is_script_class)
    }

    fn global_var(&mut self, name: &str, token: &Token) -> VarDeclId {
        if let Some(id) = self.global_vars.get(name) {
            return *id;
        }
        let mut decl = VarDecl::new(name, token.clone(), Type::Any);
        decl.is_global = true;
        decl.declare_seq = 0; // globals predate every local declaration
        let id = self.vars.add(decl);
        self.global_vars.insert(name.to_string(), id);
        id
    }

    /// Synthesizes a field declaration for a field inherited from a class
    /// compiled elsewhere.
    fn inherited_field_var(&mut self, owner: ClassId, name: &str, token: &Token) -> VarDeclId {
        let info = self
            .classes
            .get(owner)
            .fields
            .get(name)
            .cloned()
            .expect("field_lookup reported a missing field");
        let mut decl = VarDecl::new(name, token.clone(), info.ty);
        decl.is_field = true;
        decl.is_final = info.is_final;
        self.vars.add(decl)
    }

    /// Promotes a declaration found in an enclosing function to a heap local
    /// and threads pass-through copies through every intermediate function.
    ///
    /// Returns the copy owned by the current (innermost) function.
    fn promote_heap_local(&mut self, owner_idx: usize, orig: VarDeclId, name: &str, token: &Token) -> VarDeclId {
        let orig_seq = {
            let decl = self.vars.get_mut(orig);
            decl.is_heap_local = true;
            decl.declare_seq
        };
        // Parameter captured while its function's parameter list is still
        // being resolved (a later default initialiser closes over it): the
        // wrapper must promote it before the body runs
        if self.fun_states[owner_idx].resolving_params && self.vars.get(orig).is_param {
            self.vars.get_mut(orig).is_passed_as_heap_local = true;
        }

        let mut parent = orig;
        let mut result = orig;
        for idx in owner_idx + 1..self.fun_states.len() {
            let fun = self.fun_states[idx].fun;
            // Forward-reference check: this function was called before the
            // captured variable was declared
            if let Some(&ref_seq) = self.earliest_forward_ref.get(&fun) {
                if orig_seq > ref_seq {
                    self.error(CompileError::structural(
                        format!(
                            "forward reference to function that closes over variable '{name}' not yet declared at the reference point"
                        ),
                        token,
                    ));
                }
            }
            if let Some(existing) = self.funs.get(fun).heap_locals.get(name).copied() {
                parent = existing;
                result = existing;
                continue;
            }
            let ty = self.vars.get(orig).ty.clone();
            let mut decl = VarDecl::new(name, token.clone(), ty);
            decl.owner = Some(fun);
            decl.is_param = true; // implicit pass-through parameter
            decl.is_heap_local = true;
            decl.parent_var_decl = Some(parent);
            decl.original_var_decl = Some(orig);
            decl.nesting_level = u32::try_from(idx + 1).unwrap_or(0);
            decl.declare_seq = orig_seq;
            let id = self.vars.add(decl);
            self.funs.get_mut(fun).heap_locals.insert(name.to_string(), id);
            parent = id;
            result = id;
        }
        result
    }

    /// Resolves a simple class name against enclosing classes, the current
    /// package and the default package.
    fn lookup_class_name(&mut self, name: &str) -> Option<ClassId> {
        // Inner classes of enclosing classes, innermost first
        for class_state in self.class_states.iter().rev() {
            let packaged = format!("{}.{name}", self.classes.get(class_state.class).packaged_name);
            if let Some(id) = self.classes.lookup(&packaged) {
                return Some(id);
            }
        }
        if let Some(class_state) = self.class_states.last() {
            let pkg = &self.classes.get(class_state.class).package_name;
            if !pkg.is_empty() {
                if let Some(id) = self.classes.lookup(&format!("{pkg}.{name}")) {
                    return Some(id);
                }
            }
        }
        self.classes.lookup(name)
    }

    /// Resolves `Type::Named` (and array element types) to linked class
    /// types. Reports an error and degrades to `Any` for unknown classes.
    fn resolve_type(&mut self, ty: Type, token: &Token) -> Type {
        match ty {
            Type::Named(name) => {
                let id = self
                    .imports
                    .get(name.as_str())
                    .copied()
                    .or_else(|| self.classes.lookup(&name))
                    .or_else(|| self.lookup_class_name(&name));
                match id {
                    Some(id) => Type::Instance(id),
                    None => {
                        self.error(CompileError::type_error(format!("unknown class '{name}'"), token));
                        Type::Any
                    }
                }
            }
            Type::Array(elem) => Type::Array(Box::new(self.resolve_type(*elem, token))),
            other => other,
        }
    }

    /// The `$@` capture array for the current function, created on demand.
    fn capture_arr_var(&mut self, token: &Token) -> VarDeclId {
        if let Some(id) = self.fun_state_ref().capture_arr {
            return id;
        }
        let mut decl = VarDecl::new(CAPTURE_ARR, token.clone(), Type::Matcher);
        decl.owner = Some(self.current_fun());
        decl.nesting_level = u32::try_from(self.fun_states.len()).unwrap_or(0);
        decl.declare_seq = self.next_seq();
        let id = self.vars.add(decl);
        self.fun_state().capture_arr = Some(id);
        id
    }

    // ── Expressions ──────────────────────────────────────────────────────

    fn resolve_expr(&mut self, mut expr: Expr) -> Expr {
        let kind = std::mem::replace(&mut expr.kind, ExprKind::Noop);
        let kind = match kind {
            ExprKind::Literal => {
                let (ty, could_be_null) = match &expr.token.value {
                    Some(Value::Null) => (Type::Any, true),
                    Some(Value::Bool(_)) => (Type::Bool, false),
                    Some(Value::Byte(_)) => (Type::Byte, false),
                    Some(Value::Int(_)) => (Type::Int, false),
                    Some(Value::Long(_)) => (Type::Long, false),
                    Some(Value::Double(_)) => (Type::Double, false),
                    Some(Value::Decimal(_)) => (Type::Decimal, false),
                    Some(Value::String(_)) => (Type::String, false),
                    Some(Value::List(_)) => (Type::List, false),
                    Some(Value::Map(_)) => (Type::Map, false),
                    None => panic!("literal token without a value: {}", expr.token),
                };
                expr.ty = Some(ty);
                expr.could_be_null = could_be_null;
                expr.const_value = expr.token.value.clone();
                expr.is_const = true;
                ExprKind::Literal
            }
            ExprKind::ListLiteral { items } => {
                let items: Vec<Expr> = items.into_iter().map(|e| self.resolve_expr(e)).collect();
                expr.ty = Some(Type::List);
                expr.could_be_null = false;
                ExprKind::ListLiteral { items }
            }
            ExprKind::MapLiteral { entries, named_args } => {
                let entries = entries
                    .into_iter()
                    .map(|(k, v)| (k, self.resolve_expr(v)))
                    .collect();
                expr.ty = Some(Type::Map);
                expr.could_be_null = false;
                ExprKind::MapLiteral { entries, named_args }
            }
            ExprKind::Identifier {
                name,
                var_decl,
                capture_num,
            } => return self.resolve_identifier(expr, name, var_decl, capture_num),
            ExprKind::VarAssign {
                target,
                value,
                conditional,
            } => {
                let target = self.resolve_expr(*target);
                self.check_lvalue_identifier(&target);
                let value = self.resolve_expr(*value);
                let target_ty = target.ty.clone().unwrap_or(Type::Any);
                let value_ty = value.ty.clone().unwrap_or(Type::Any);
                if !value_ty.is_castable_to(&target_ty, &self.classes) {
                    self.error(CompileError::type_error(
                        format!(
                            "cannot assign value of type {} to {}",
                            value_ty.describe(&self.classes),
                            target_ty.describe(&self.classes)
                        ),
                        &value.token,
                    ));
                }
                expr.could_be_null = target_ty.is_ref();
                expr.ty = Some(target_ty);
                ExprKind::VarAssign {
                    target: Box::new(target),
                    value: Box::new(value),
                    conditional,
                }
            }
            ExprKind::VarOpAssign {
                target,
                op,
                value,
                return_old_value,
            } => {
                let target = self.resolve_expr(*target);
                self.check_lvalue_identifier(&target);
                let target_ty = target.ty.clone().unwrap_or(Type::Any);
                let value = self.resolve_op_assign_value(*value, &target_ty);
                expr.could_be_null = target_ty.is_ref();
                expr.ty = Some(target_ty);
                ExprKind::VarOpAssign {
                    target: Box::new(target),
                    op,
                    value: Box::new(value),
                    return_old_value,
                }
            }
            ExprKind::FieldAssign {
                parent,
                access_op,
                field,
                value,
                conditional,
            } => {
                let parent = self.resolve_expr(*parent);
                let field = self.resolve_expr(*field);
                let value = self.resolve_expr(*value);
                let field_ty = self.field_access_type(&parent, access_op, &field, &expr.token);
                let value_ty = value.ty.clone().unwrap_or(Type::Any);
                if !value_ty.is_castable_to(&field_ty, &self.classes) {
                    self.error(CompileError::type_error(
                        format!(
                            "cannot assign value of type {} to field of type {}",
                            value_ty.describe(&self.classes),
                            field_ty.describe(&self.classes)
                        ),
                        &value.token,
                    ));
                }
                expr.could_be_null = field_ty.is_ref();
                expr.ty = Some(field_ty);
                ExprKind::FieldAssign {
                    parent: Box::new(parent),
                    access_op,
                    field: Box::new(field),
                    value: Box::new(value),
                    conditional,
                }
            }
            ExprKind::FieldOpAssign {
                parent,
                access_op,
                field,
                op,
                value,
                return_old_value,
            } => {
                let parent = self.resolve_expr(*parent);
                let field = self.resolve_expr(*field);
                let field_ty = self.field_access_type(&parent, access_op, &field, &expr.token);
                let value = self.resolve_op_assign_value(*value, &field_ty);
                expr.could_be_null = field_ty.is_ref();
                expr.ty = Some(field_ty);
                ExprKind::FieldOpAssign {
                    parent: Box::new(parent),
                    access_op,
                    field: Box::new(field),
                    op,
                    value: Box::new(value),
                    return_old_value,
                }
            }
            ExprKind::Binary {
                left,
                op,
                right,
                create_if_missing,
            } => return self.resolve_binary(expr, *left, op, *right, create_if_missing),
            ExprKind::Ternary {
                condition,
                true_expr,
                false_expr,
            } => {
                let condition = self.resolve_expr(*condition);
                let true_expr = self.resolve_expr(*true_expr);
                let false_expr = self.resolve_expr(*false_expr);
                let ty = common_type(
                    true_expr.ty.as_ref().unwrap_or(&Type::Any),
                    false_expr.ty.as_ref().unwrap_or(&Type::Any),
                );
                if self.context.const_folding && condition.is_const {
                    let branch = if condition.const_value.as_ref().is_some_and(Value::truthy) {
                        &true_expr
                    } else {
                        &false_expr
                    };
                    if branch.is_const {
                        expr.is_const = true;
                        expr.const_value = branch.const_value.clone();
                    }
                }
                expr.could_be_null = true_expr.could_be_null || false_expr.could_be_null;
                expr.ty = Some(ty);
                ExprKind::Ternary {
                    condition: Box::new(condition),
                    true_expr: Box::new(true_expr),
                    false_expr: Box::new(false_expr),
                }
            }
            ExprKind::PrefixUnary { op, expr: operand } => {
                let operand = self.resolve_expr(*operand);
                let operand_ty = operand.ty.clone().unwrap_or(Type::Any);
                let ty = match op.kind {
                    TokenKind::Bang => Type::Bool,
                    TokenKind::Tilde => match operand_ty {
                        Type::Byte | Type::Int | Type::Long | Type::Any => operand_ty.clone(),
                        other => {
                            self.error(CompileError::type_error(
                                format!("operator '~' requires int or long, not {other}"),
                                &op,
                            ));
                            Type::Int
                        }
                    },
                    TokenKind::Minus | TokenKind::Plus => {
                        if operand_ty.is_numeric() || operand_ty == Type::Any {
                            operand_ty.clone()
                        } else {
                            self.error(CompileError::type_error(
                                format!("non-numeric operand for unary '{}': {operand_ty}", op.lexeme),
                                &op,
                            ));
                            Type::Int
                        }
                    }
                    other => panic!("unexpected prefix operator {other}"),
                };
                if self.context.const_folding && operand.is_const {
                    if let Some(v) = &operand.const_value {
                        match value::fold_unary(op.kind, v) {
                            Ok(folded) => {
                                expr.const_value = Some(folded);
                                expr.is_const = true;
                            }
                            Err(msg) => self.error(CompileError::special(msg, &op)),
                        }
                    }
                }
                expr.could_be_null = false;
                expr.ty = Some(ty);
                ExprKind::PrefixUnary {
                    op,
                    expr: Box::new(operand),
                }
            }
            ExprKind::PostfixUnary { op, expr: operand } => {
                self.error(CompileError::context(
                    format!("operator '{}' requires a variable or field operand", op.lexeme),
                    &op,
                ));
                let operand = self.resolve_expr(*operand);
                expr.ty = Some(operand.ty.clone().unwrap_or(Type::Any));
                ExprKind::PostfixUnary {
                    op,
                    expr: Box::new(operand),
                }
            }
            ExprKind::Cast { target, expr: inner } => {
                let inner = self.resolve_expr(*inner);
                let target = self.resolve_type(target, &expr.token);
                let inner_ty = inner.ty.clone().unwrap_or(Type::Any);
                if !inner_ty.is_castable_to(&target, &self.classes) {
                    self.error(CompileError::type_error(
                        format!(
                            "cannot cast {} to {}",
                            inner_ty.describe(&self.classes),
                            target.describe(&self.classes)
                        ),
                        &expr.token,
                    ));
                }
                expr.could_be_null = target.is_ref();
                expr.ty = Some(target.clone());
                ExprKind::Cast {
                    target,
                    expr: Box::new(inner),
                }
            }
            ExprKind::ConvertTo {
                target,
                expr: inner,
                source,
                offset,
            } => {
                let inner = self.resolve_expr(*inner);
                let target = self.resolve_type(target, &expr.token);
                let source = source.map(|e| Box::new(self.resolve_expr(*e)));
                let offset = offset.map(|e| Box::new(self.resolve_expr(*e)));
                if let Type::Instance(class_id) = &target {
                    // Coercing to an instance may invoke the class initialiser
                    if let Some(init) = self.classes.get(*class_id).init_method {
                        self.record_call(init);
                    }
                }
                expr.could_be_null = target.is_ref();
                expr.ty = Some(target.clone());
                ExprKind::ConvertTo {
                    target,
                    expr: Box::new(inner),
                    source,
                    offset,
                }
            }
            ExprKind::CheckCast { target, expr: inner } => {
                let inner = self.resolve_expr(*inner);
                let target = self.resolve_type(target, &expr.token);
                expr.could_be_null = target.is_ref();
                expr.ty = Some(target.clone());
                ExprKind::CheckCast {
                    target,
                    expr: Box::new(inner),
                }
            }
            ExprKind::RegexMatch {
                target,
                pattern,
                modifiers,
                implicit_it,
                negated,
                capture_arr_var: _,
            } => {
                let target = self.resolve_expr(*target);
                let pattern = self.resolve_expr(*pattern);
                self.check_regex_modifiers(&modifiers, false, &expr.token);
                let capture_arr_var = Some(self.capture_arr_var(&expr.token));
                expr.could_be_null = false;
                expr.ty = Some(Type::Bool);
                ExprKind::RegexMatch {
                    target: Box::new(target),
                    pattern: Box::new(pattern),
                    modifiers,
                    implicit_it,
                    negated,
                    capture_arr_var,
                }
            }
            ExprKind::RegexSubst {
                target,
                pattern,
                replacement,
                modifiers,
                implicit_it,
                capture_arr_var: _,
            } => {
                let target = self.resolve_expr(*target);
                let pattern = self.resolve_expr(*pattern);
                let replacement = self.resolve_expr(*replacement);
                self.check_regex_modifiers(&modifiers, true, &expr.token);
                let capture_arr_var = Some(self.capture_arr_var(&expr.token));
                expr.could_be_null = false;
                expr.ty = Some(Type::String);
                ExprKind::RegexSubst {
                    target: Box::new(target),
                    pattern: Box::new(pattern),
                    replacement: Box::new(replacement),
                    modifiers,
                    implicit_it,
                    capture_arr_var,
                }
            }
            ExprKind::Call { callee, args, .. } => return self.resolve_call(expr, *callee, args),
            ExprKind::MethodCall {
                parent,
                access_op,
                method_name,
                method_token,
                args,
                ..
            } => {
                let parent = self.resolve_expr(*parent);
                let args: Vec<Expr> = args.into_iter().map(|a| self.resolve_expr(a)).collect();
                let (fun, ty) = self.link_method(&parent, &method_name, &args, &method_token);
                expr.ty = Some(ty);
                ExprKind::MethodCall {
                    parent: Box::new(parent),
                    access_op,
                    method_name,
                    method_token,
                    args,
                    fun,
                }
            }
            ExprKind::Closure { fun_decl } => {
                let fun_decl = self.resolve_expr(*fun_decl);
                expr.could_be_null = false;
                expr.ty = Some(Type::Function);
                ExprKind::Closure {
                    fun_decl: Box::new(fun_decl),
                }
            }
            ExprKind::FunDecl(fun_decl) => {
                let token = expr.token.clone();
                let fun_decl = self.resolve_fun_decl(*fun_decl, &token);
                expr.could_be_null = false;
                expr.ty = Some(Type::Function);
                ExprKind::FunDecl(Box::new(fun_decl))
            }
            ExprKind::NewInstance {
                class_name, args, ..
            } => {
                let ty = self.resolve_type(Type::Named(class_name.clone()), &expr.token);
                let args: Vec<Expr> = args.into_iter().map(|a| self.resolve_expr(a)).collect();
                let class_id = match ty {
                    Type::Instance(id) => {
                        if let Some(init) = self.classes.get(id).init_method {
                            self.record_call(init);
                            self.check_call_args(init, &args, &expr.token);
                        }
                        expr.ty = Some(Type::Instance(id));
                        Some(id)
                    }
                    _ => {
                        expr.ty = Some(Type::Any);
                        None
                    }
                };
                expr.could_be_null = false;
                ExprKind::NewInstance {
                    class_name,
                    args,
                    class_id,
                }
            }
            ExprKind::TypeExpr { ty } => {
                let ty = self.resolve_type(ty, &expr.token);
                expr.could_be_null = false;
                expr.ty = Some(ty.clone());
                ExprKind::TypeExpr { ty }
            }
            ExprKind::BlockExpr { block } => {
                let mut block = self.resolve_stmt(*block);
                let ty = mark_last_result_used(&mut block).unwrap_or(Type::Any);
                expr.ty = Some(ty);
                ExprKind::BlockExpr {
                    block: Box::new(block),
                }
            }
            ExprKind::Break { label } => {
                self.check_loop_target(label.as_deref(), &expr.token, "break");
                expr.ty = Some(Type::Any);
                expr.could_be_null = false;
                ExprKind::Break { label }
            }
            ExprKind::Continue { label } => {
                self.check_loop_target(label.as_deref(), &expr.token, "continue");
                expr.ty = Some(Type::Any);
                expr.could_be_null = false;
                ExprKind::Continue { label }
            }
            ExprKind::Return {
                expr: value,
                ..
            } => {
                let fun = self.current_fun();
                let return_type = self.funs.get(fun).return_type.clone();
                let value = value.map(|e| Box::new(self.resolve_expr(*e)));
                let value_ty = value
                    .as_ref()
                    .and_then(|v| v.ty.clone())
                    .unwrap_or(Type::Any);
                if value.is_none() && return_type.is_primitive() {
                    self.error(CompileError::context(
                        format!("missing return value for function returning {return_type}"),
                        &expr.token,
                    ));
                } else if !value_ty.is_castable_to(&return_type, &self.classes) {
                    self.error(CompileError::context(
                        format!(
                            "return value of type {} does not match function return type {}",
                            value_ty.describe(&self.classes),
                            return_type.describe(&self.classes)
                        ),
                        &expr.token,
                    ));
                }
                expr.ty = Some(return_type.clone());
                ExprKind::Return {
                    expr: value,
                    return_type: Some(return_type),
                    fun: Some(fun),
                }
            }
            ExprKind::Print { expr: value, newline } => {
                let value = value.map(|e| Box::new(self.resolve_expr(*e)));
                expr.ty = Some(Type::Any);
                expr.could_be_null = true;
                ExprKind::Print { expr: value, newline }
            }
            ExprKind::Die { expr: value } => {
                let value = value.map(|e| Box::new(self.resolve_expr(*e)));
                expr.ty = Some(Type::Any);
                ExprKind::Die { expr: value }
            }
            ExprKind::Eval { script, globals } => {
                let script = Box::new(self.resolve_expr(*script));
                let globals = globals.map(|e| Box::new(self.resolve_expr(*e)));
                // Compiling and running arbitrary code can suspend
                self.mark_current_async();
                expr.ty = Some(Type::Any);
                ExprKind::Eval { script, globals }
            }
            ExprKind::Switch {
                subject,
                cases,
                default_case,
            } => return self.resolve_switch(expr, *subject, cases, default_case),
            ExprKind::ConstructorPattern { ty, args } => {
                let ty = self.resolve_type(ty, &expr.token);
                if let Type::Instance(id) = &ty {
                    let field_count = self.classes.all_fields(*id).len();
                    if args.len() > field_count {
                        self.error(CompileError::type_error(
                            format!(
                                "constructor pattern has {} arguments but class has {field_count} fields",
                                args.len()
                            ),
                            &expr.token,
                        ));
                    }
                } else {
                    self.error(CompileError::type_error(
                        "constructor pattern requires a class type",
                        &expr.token,
                    ));
                }
                let args = args.into_iter().map(|a| self.resolve_expr(a)).collect();
                expr.ty = Some(Type::Bool);
                ExprKind::ConstructorPattern { ty, args }
            }
            ExprKind::MultiAssign { targets, value } => {
                let targets: Vec<Expr> = targets.into_iter().map(|t| self.resolve_expr(t)).collect();
                for t in &targets {
                    if matches!(t.kind, ExprKind::Identifier { .. }) {
                        self.check_lvalue_identifier(t);
                    }
                }
                let value = self.resolve_expr(*value);
                expr.ty = Some(value.ty.clone().unwrap_or(Type::Any));
                ExprKind::MultiAssign {
                    targets,
                    value: Box::new(value),
                }
            }
            ExprKind::SpecialVar { kind } => {
                expr.ty = Some(Type::Long);
                expr.could_be_null = false;
                ExprKind::SpecialVar { kind }
            }
            ExprKind::LoadParamValue { name, index, param } => {
                expr.ty = Some(Type::Any);
                ExprKind::LoadParamValue { name, index, param }
            }
            ExprKind::InvokeUtility { utility, args } => {
                let args = args.into_iter().map(|a| self.resolve_expr(a)).collect();
                expr.ty = Some(utility_return_type(utility));
                expr.could_be_null = matches!(utility, UtilityFn::RemoveNamedArg | UtilityFn::ArgAt | UtilityFn::ListAt);
                ExprKind::InvokeUtility { utility, args }
            }
            ExprKind::InvokeInit { class_id, args } => {
                let args: Vec<Expr> = args.into_iter().map(|a| self.resolve_expr(a)).collect();
                if let Some(init) = self.classes.get(class_id).init_method {
                    self.record_call(init);
                }
                expr.ty = Some(Type::Instance(class_id));
                expr.could_be_null = false;
                ExprKind::InvokeInit { class_id, args }
            }
            ExprKind::Noop => {
                if expr.ty.is_none() {
                    expr.ty = Some(Type::Any);
                }
                ExprKind::Noop
            }
        };
        expr.kind = kind;
        expr.resolved = true;
        expr
    }

    fn resolve_identifier(
        &mut self,
        mut expr: Expr,
        name: String,
        var_decl: Option<VarDeclId>,
        capture_num: Option<u32>,
    ) -> Expr {
        let token = expr.token.clone();

        // Already linked (synthesized wrapper/init code, or a re-resolve of
        // an annotated tree): keep the link
        if let Some(id) = var_decl {
            let ty = self.vars.get(id).ty.clone();
            expr.could_be_null = ty.is_ref();
            expr.ty = Some(ty);
            expr.resolved = true;
            expr.kind = ExprKind::Identifier {
                name,
                var_decl: Some(id),
                capture_num,
            };
            return expr;
        }

        if let Some(n) = capture_num {
            // $1..$n are backed by the capture array
            let arr = self.capture_arr_var(&token);
            expr.ty = Some(Type::String);
            expr.could_be_null = true;
            expr.resolved = true;
            expr.kind = ExprKind::Identifier {
                name,
                var_decl: Some(arr),
                capture_num: Some(n),
            };
            return expr;
        }

        if name == "this" || name == "super" {
            return self.resolve_this_super(expr, &name);
        }

        let for_callee = expr.is_callee;
        let symbol = self.lookup(&name, &token, for_callee);
        let (var_decl, ty, could_be_null) = match symbol {
            Some(Symbol::Var(id)) => {
                let decl = self.vars.get(id);
                let ty = decl.ty.clone();
                let nullable = ty.is_ref();
                (id, ty, nullable)
            }
            Some(Symbol::Field(_, id)) => {
                let ty = self.vars.get(id).ty.clone();
                let nullable = ty.is_ref();
                (id, ty, nullable)
            }
            Some(Symbol::Method(_, fun) | Symbol::BuiltinFn(fun)) => {
                let id = self.function_value_var(&name, fun, &token);
                (id, Type::Function, false)
            }
            Some(Symbol::Class(id)) => {
                let var = self.synthetic_var(&name, Type::Class(id), &token);
                (var, Type::Class(id), false)
            }
            Some(Symbol::Global(id)) => (id, Type::Any, true),
            None => {
                if name == "_" {
                    // Wildcard in a pattern position
                    let var = self.synthetic_var(&name, Type::Any, &token);
                    (var, Type::Any, true)
                } else {
                    self.error(CompileError::structural(
                        format!("unknown variable '{name}'"),
                        &token,
                    ));
                    let var = self.synthetic_var(&name, Type::Any, &token);
                    (var, Type::Any, true)
                }
            }
        };
        expr.ty = Some(ty);
        expr.could_be_null = could_be_null;
        expr.resolved = true;
        expr.kind = ExprKind::Identifier {
            name,
            var_decl: Some(var_decl),
            capture_num: None,
        };
        expr
    }

    fn resolve_this_super(&mut self, mut expr: Expr, name: &str) -> Expr {
        let token = expr.token.clone();
        let Some(class_state) = self.class_states.last() else {
            self.error(CompileError::context(
                format!("'{name}' is only allowed inside a class"),
                &token,
            ));
            let var = self.synthetic_var(name, Type::Any, &token);
            expr.ty = Some(Type::Any);
            expr.resolved = true;
            expr.kind = ExprKind::Identifier {
                name: name.to_string(),
                var_decl: Some(var),
                capture_num: None,
            };
            return expr;
        };
        let class = class_state.class;
        if self.in_static_context() {
            self.error(CompileError::context(
                format!("'{name}' is not allowed in a static context"),
                &token,
            ));
        }
        let ty = if name == "super" {
            match self.classes.get(class).base {
                Some(base) => Type::Instance(base),
                None => {
                    self.error(CompileError::context("class has no base class", &token));
                    Type::Instance(class)
                }
            }
        } else {
            Type::Instance(class)
        };
        let state = self.fun_state_ref();
        let cached = if name == "this" { state.this_var } else { state.super_var };
        let var = cached.unwrap_or_else(|| {
            let mut decl = VarDecl::new(name, token.clone(), ty.clone());
            decl.is_param = true;
            decl.slot = 0;
            decl.owner = Some(self.current_fun());
            let id = self.vars.add(decl);
            let state = self.fun_state();
            if name == "this" {
                state.this_var = Some(id);
            } else {
                state.super_var = Some(id);
            }
            id
        });
        expr.ty = Some(ty);
        expr.could_be_null = false;
        expr.resolved = true;
        expr.kind = ExprKind::Identifier {
            name: name.to_string(),
            var_decl: Some(var),
            capture_num: None,
        };
        expr
    }

    /// A synthesized declaration binding a name to a function value.
    fn function_value_var(&mut self, name: &str, fun: FunId, token: &Token) -> VarDeclId {
        let mut decl = VarDecl::new(name, token.clone(), Type::Function);
        decl.is_final = true;
        decl.fun_decl = Some(fun);
        self.vars.add(decl)
    }

    fn synthetic_var(&mut self, name: &str, ty: Type, token: &Token) -> VarDeclId {
        self.vars.add(VarDecl::new(name, token.clone(), ty))
    }

    /// Lvalue checks shared by the assignment forms: regex captures, function
    /// bindings and final variables are not assignable.
    fn check_lvalue_identifier(&mut self, target: &Expr) {
        let ExprKind::Identifier {
            name,
            var_decl,
            capture_num,
        } = &target.kind
        else {
            return;
        };
        if capture_num.is_some() {
            self.error(CompileError::context(
                "cannot modify a regex capture variable",
                &target.token,
            ));
            return;
        }
        if name == "super" || name == "this" {
            self.error(CompileError::context(
                format!("cannot assign to '{name}'"),
                &target.token,
            ));
            return;
        }
        if let Some(id) = var_decl {
            let decl = self.vars.get(*id);
            if decl.fun_decl.is_some() {
                self.error(CompileError::context(
                    format!("cannot assign to function '{name}'"),
                    &target.token,
                ));
            } else if decl.is_final && !decl.is_field {
                self.error(CompileError::context(
                    format!("cannot modify final variable '{name}'"),
                    &target.token,
                ));
            }
        }
    }

    /// Resolves the rhs of an op-assign: a binary whose left operand is a
    /// Noop placeholder standing for the target's old value.
    fn resolve_op_assign_value(&mut self, value: Expr, target_ty: &Type) -> Expr {
        let ExprKind::Binary {
            left,
            op,
            right,
            create_if_missing,
        } = value.kind
        else {
            panic!("op-assign value must be a binary expression");
        };
        let mut noop = *left;
        debug_assert!(matches!(noop.kind, ExprKind::Noop), "op-assign left must be a noop");
        noop.ty = Some(target_ty.clone());
        noop.resolved = true;
        let right = self.resolve_expr(*right);
        let right_ty = right.ty.clone().unwrap_or(Type::Any);
        let result = Type::result_type(target_ty, op.kind, &right_ty);
        let ty = match result {
            Some(ty) => ty,
            None => {
                self.error(CompileError::type_error(
                    format!(
                        "invalid operand types {} and {} for '{}'",
                        target_ty.describe(&self.classes),
                        right_ty.describe(&self.classes),
                        op.lexeme
                    ),
                    &op,
                ));
                Type::Any
            }
        };
        let mut bin = Expr::new(op.clone(), ExprKind::Binary {
            left: Box::new(noop),
            op,
            right: Box::new(right),
            create_if_missing,
        });
        bin.ty = Some(ty);
        bin.resolved = true;
        bin
    }

    fn resolve_binary(
        &mut self,
        mut expr: Expr,
        left: Expr,
        op: Token,
        right: Expr,
        create_if_missing: bool,
    ) -> Expr {
        // Field and index access
        if matches!(
            op.kind,
            TokenKind::Dot | TokenKind::QuestionDot | TokenKind::LeftSquare | TokenKind::QuestionSquare
        ) {
            let left = self.resolve_expr(left);
            let right = self.resolve_expr(right);
            let ty = self.field_access_type(&left, op.kind, &right, &op);
            // Autovivification of an instance-typed link only works when
            // every field is optional (the initialiser needs no arguments)
            if create_if_missing {
                if let Type::Instance(class_id) = &ty {
                    if !self.classes.mandatory_fields(*class_id).is_empty() {
                        self.error(CompileError::type_error(
                            format!(
                                "cannot auto-create instance of class {} with mandatory fields",
                                self.classes.get(*class_id).packaged_name
                            ),
                            &op,
                        ));
                    }
                }
            }
            expr.could_be_null = ty.is_ref()
                || matches!(op.kind, TokenKind::QuestionDot | TokenKind::QuestionSquare)
                || left.could_be_null;
            expr.ty = Some(ty);
            expr.resolved = true;
            expr.kind = ExprKind::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
                create_if_missing,
            };
            return expr;
        }

        let left = self.resolve_expr(left);
        let right = self.resolve_expr(right);
        let left_ty = left.ty.clone().unwrap_or(Type::Any);
        let right_ty = right.ty.clone().unwrap_or(Type::Any);

        let ty = match op.kind {
            TokenKind::AmpersandAmpersand | TokenKind::PipePipe => Type::Bool,
            TokenKind::EqualEqual
            | TokenKind::BangEqual
            | TokenKind::TripleEqual
            | TokenKind::BangEqualEqual
            | TokenKind::Less
            | TokenKind::LessEqual
            | TokenKind::Greater
            | TokenKind::GreaterEqual
            | TokenKind::In
            | TokenKind::BangIn
            | TokenKind::Instanceof
            | TokenKind::BangInstanceof => Type::Bool,
            TokenKind::Spaceship => Type::Int,
            TokenKind::QuestionColon => common_type(&left_ty, &right_ty),
            _ => match Type::result_type(&left_ty, op.kind, &right_ty) {
                Some(ty) => ty,
                None => {
                    self.error(CompileError::type_error(
                        format!(
                            "invalid operand types {} and {} for '{}'",
                            left_ty.describe(&self.classes),
                            right_ty.describe(&self.classes),
                            op.lexeme
                        ),
                        &op,
                    ));
                    Type::Any
                }
            },
        };

        // Constant folding
        if self.context.const_folding && left.is_const && right.is_const {
            if let (Some(l), Some(r)) = (&left.const_value, &right.const_value) {
                let folded = match op.kind {
                    TokenKind::AmpersandAmpersand => Some(Ok(Value::Bool(l.truthy() && r.truthy()))),
                    TokenKind::PipePipe => Some(Ok(Value::Bool(l.truthy() || r.truthy()))),
                    TokenKind::QuestionColon => Some(Ok(if l.truthy() { l.clone() } else { r.clone() })),
                    TokenKind::EqualEqual
                    | TokenKind::BangEqual
                    | TokenKind::TripleEqual
                    | TokenKind::BangEqualEqual
                    | TokenKind::Less
                    | TokenKind::LessEqual
                    | TokenKind::Greater
                    | TokenKind::GreaterEqual
                    | TokenKind::Spaceship => Some(value::fold_compare(op.kind, l, r)),
                    TokenKind::Plus
                    | TokenKind::Minus
                    | TokenKind::Star
                    | TokenKind::Slash
                    | TokenKind::Percent
                    | TokenKind::PercentPercent
                    | TokenKind::Ampersand
                    | TokenKind::Pipe
                    | TokenKind::Caret
                    | TokenKind::ShiftLeft
                    | TokenKind::ShiftRight
                    | TokenKind::ShiftRightUnsigned => {
                        Some(value::fold_binary(op.kind, l, r, self.context.min_scale))
                    }
                    _ => None,
                };
                match folded {
                    Some(Ok(v)) => {
                        expr.const_value = Some(v);
                        expr.is_const = true;
                    }
                    Some(Err(msg)) => self.error(CompileError::special(msg, &op)),
                    None => {}
                }
            }
        }

        expr.could_be_null = matches!(op.kind, TokenKind::QuestionColon) && right.could_be_null;
        expr.ty = Some(ty);
        expr.resolved = true;
        expr.kind = ExprKind::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
            create_if_missing,
        };
        expr
    }

    /// The static type of a field/index access given the parent's type.
    fn field_access_type(&mut self, parent: &Expr, access_op: TokenKind, field: &Expr, at: &Token) -> Type {
        let parent_ty = parent.ty.clone().unwrap_or(Type::Any);
        match (&parent_ty, access_op) {
            (Type::Instance(class_id), TokenKind::Dot | TokenKind::QuestionDot) => {
                let Some(Value::String(name)) = field.token.value.clone().or_else(|| field.const_value.clone())
                else {
                    return Type::Any;
                };
                if let Some((_, info)) = self.classes.field_lookup(*class_id, &name) {
                    info.ty
                } else if self.classes.method_lookup(*class_id, &name).is_some() {
                    Type::Function
                } else if self.builtins.method_lookup(&parent_ty, &name).is_some() {
                    Type::Function
                } else {
                    self.error(CompileError::type_error(
                        format!(
                            "no field or method '{name}' on class {}",
                            self.classes.get(*class_id).packaged_name
                        ),
                        at,
                    ));
                    Type::Any
                }
            }
            (Type::Array(elem), TokenKind::LeftSquare | TokenKind::QuestionSquare) => {
                self.check_index_numeric(field, at);
                (**elem).clone()
            }
            (Type::String, TokenKind::LeftSquare | TokenKind::QuestionSquare) => {
                self.check_index_numeric(field, at);
                Type::String
            }
            (Type::List, TokenKind::LeftSquare | TokenKind::QuestionSquare) => {
                self.check_index_numeric(field, at);
                Type::Any
            }
            (Type::Bool | Type::Byte | Type::Int | Type::Long | Type::Double | Type::Decimal, _) => {
                self.error(CompileError::type_error(
                    format!("cannot access fields of primitive type {parent_ty}"),
                    at,
                ));
                Type::Any
            }
            _ => Type::Any,
        }
    }

    fn check_index_numeric(&mut self, index: &Expr, at: &Token) {
        if let Some(ty) = &index.ty {
            if !ty.is_numeric() && *ty != Type::Any {
                self.error(CompileError::type_error(
                    format!("array index must be numeric, not {ty}"),
                    at,
                ));
            }
        }
        let _ = at;
    }

    fn check_regex_modifiers(&mut self, modifiers: &str, is_subst: bool, token: &Token) {
        if modifiers.contains('r') && !is_subst {
            self.error(CompileError::special(
                "regex modifier 'r' only applies to substitutions",
                token,
            ));
        }
        if modifiers.contains('g') {
            let state = self.fun_state();
            if !state.in_loop_condition {
                self.error(CompileError::special(
                    "regex 'g' modifier only allowed in a loop condition",
                    token,
                ));
            } else {
                state.condition_global_matches += 1;
                if state.condition_global_matches > 1 {
                    self.error(CompileError::special(
                        "only one global regex match allowed per loop condition",
                        token,
                    ));
                }
            }
        }
    }

    fn check_loop_target(&mut self, label: Option<&str>, token: &Token, what: &str) {
        let state = self.fun_state_ref();
        if state.loops.is_empty() {
            self.error(CompileError::context(
                format!("'{what}' is only allowed inside a loop"),
                token,
            ));
            return;
        }
        if let Some(label) = label {
            if !state.loops.iter().any(|l| l.as_deref() == Some(label)) {
                self.error(CompileError::context(
                    format!("no enclosing loop with label '{label}'"),
                    token,
                ));
            }
        }
    }

    // ── Calls ────────────────────────────────────────────────────────────

    fn resolve_call(&mut self, mut expr: Expr, callee: Expr, args: Vec<Expr>) -> Expr {
        // Method call: callee is a field access on some parent
        if callee.kind.is_field_access() {
            let ExprKind::Binary { left, op, right, .. } = callee.kind else {
                unreachable!()
            };
            let parent = self.resolve_expr(*left);
            let method_token = right.token.clone();
            let method_name = match &right.token.value {
                Some(Value::String(s)) => s.clone(),
                _ => right.token.lexeme.clone(),
            };
            let args: Vec<Expr> = args.into_iter().map(|a| self.resolve_expr(a)).collect();
            let (fun, ty) = self.link_method(&parent, &method_name, &args, &method_token);
            expr.ty = Some(ty);
            expr.resolved = true;
            expr.kind = ExprKind::MethodCall {
                parent: Box::new(parent),
                access_op: op.kind,
                method_name,
                method_token,
                args,
                fun,
            };
            return expr;
        }

        let mut callee = callee;
        callee.is_callee = true;
        let callee = self.resolve_expr(callee);
        let args: Vec<Expr> = args.into_iter().map(|a| self.resolve_expr(a)).collect();

        let fun = match &callee.kind {
            ExprKind::Identifier { var_decl: Some(id), .. } => self.vars.get(*id).fun_decl,
            ExprKind::Closure { fun_decl } => match &fun_decl.kind {
                ExprKind::FunDecl(f) => Some(f.fun),
                _ => None,
            },
            _ => None,
        };

        let ty = match fun {
            Some(fun_id) => {
                self.record_call(fun_id);
                self.check_call_args(fun_id, &args, &expr.token);
                self.funs.get(fun_id).return_type.clone()
            }
            None => {
                // Calling an arbitrary function value goes through its
                // wrapper, which may suspend
                let callee_ty = callee.ty.clone().unwrap_or(Type::Any);
                if !matches!(callee_ty, Type::Function | Type::Any) {
                    self.error(CompileError::type_error(
                        format!("cannot call value of type {}", callee_ty.describe(&self.classes)),
                        &callee.token,
                    ));
                }
                self.mark_current_async();
                Type::Any
            }
        };
        expr.could_be_null = ty.is_ref();
        expr.ty = Some(ty);
        expr.resolved = true;
        expr.kind = ExprKind::Call {
            callee: Box::new(callee),
            args,
            fun,
        };
        expr
    }

    /// Links a method call to a class method or built-in and returns the
    /// result type. Unknown receivers (dynamic calls) are conservatively
    /// async.
    fn link_method(&mut self, parent: &Expr, name: &str, args: &[Expr], token: &Token) -> (Option<FunId>, Type) {
        let parent_ty = parent.ty.clone().unwrap_or(Type::Any);
        if let Type::Instance(class_id) = &parent_ty {
            if let Some(fun) = self.classes.method_lookup(*class_id, name) {
                self.record_call(fun);
                self.check_call_args(fun, args, token);
                return (Some(fun), self.funs.get(fun).return_type.clone());
            }
            if let Some((_, info)) = self.classes.field_lookup(*class_id, name) {
                // Calling a function-typed field
                if matches!(info.ty, Type::Function | Type::Any) {
                    self.mark_current_async();
                    return (None, Type::Any);
                }
            }
        }
        if let Some(fun) = self.builtins.method_lookup(&parent_ty, name) {
            self.record_call(fun);
            self.check_call_args(fun, args, token);
            return (Some(fun), self.funs.get(fun).return_type.clone());
        }
        match parent_ty {
            Type::Any | Type::Map | Type::Function => {
                // Dynamic dispatch: assume the target may suspend
                self.mark_current_async();
                (None, Type::Any)
            }
            Type::Instance(class_id) => {
                self.error(CompileError::type_error(
                    format!(
                        "no method '{name}' on class {}",
                        self.classes.get(class_id).packaged_name
                    ),
                    token,
                ));
                (None, Type::Any)
            }
            other => {
                self.error(CompileError::type_error(
                    format!("no method '{name}' for type {other}"),
                    token,
                ));
                (None, Type::Any)
            }
        }
    }

    /// Validates a call's arguments against a known function descriptor.
    fn check_call_args(&mut self, fun: FunId, args: &[Expr], token: &Token) {
        let desc = self.funs.get(fun);
        let param_count = desc.param_count();
        let mandatory = desc.mandatory_count;
        let param_names = desc.param_names.clone();
        let param_types = desc.param_types.clone();
        let mandatory_params = desc.mandatory_params.clone();
        let name = desc.name.clone();

        // Named arguments: a single named-args map literal
        if let [arg] = args {
            if let ExprKind::MapLiteral {
                entries,
                named_args: true,
            } = &arg.kind
            {
                for (key, _) in entries {
                    if !param_names.iter().any(|p| *p == key.lexeme) {
                        self.error(CompileError::type_error(
                            format!("no such parameter '{}' for function '{name}'", key.lexeme),
                            key,
                        ));
                    }
                }
                for mand in &mandatory_params {
                    if !entries.iter().any(|(k, _)| k.lexeme == *mand) {
                        self.error(CompileError::type_error(
                            format!("missing value for mandatory parameter '{mand}'"),
                            token,
                        ));
                    }
                }
                return;
            }
        }

        // A single list/dynamic argument may expand to the positional
        // parameters at runtime
        if args.len() == 1
            && param_count > 1
            && matches!(
                args[0].ty.as_ref().unwrap_or(&Type::Any),
                Type::List | Type::Any | Type::Array(_)
            )
        {
            return;
        }
        if args.len() > param_count {
            self.error(CompileError::type_error(
                format!(
                    "too many arguments for '{name}' (expected at most {param_count}, got {})",
                    args.len()
                ),
                token,
            ));
            return;
        }
        if args.len() < mandatory {
            self.error(CompileError::type_error(
                format!(
                    "missing mandatory arguments for '{name}' (expected at least {mandatory}, got {})",
                    args.len()
                ),
                token,
            ));
            return;
        }
        for (arg, param_ty) in args.iter().zip(param_types.iter()) {
            // Signatures of not-yet-resolved sibling functions may still
            // carry unlinked class names; those convert at runtime
            if matches!(param_ty, Type::Named(_) | Type::Unknown) {
                continue;
            }
            let arg_ty = arg.ty.clone().unwrap_or(Type::Any);
            if !arg_ty.is_castable_to(param_ty, &self.classes) {
                self.error(CompileError::type_error(
                    format!(
                        "argument of type {} cannot convert to parameter type {}",
                        arg_ty.describe(&self.classes),
                        param_ty.describe(&self.classes)
                    ),
                    &arg.token,
                ));
            }
        }
    }

    fn resolve_switch(
        &mut self,
        mut expr: Expr,
        subject: Expr,
        cases: Vec<SwitchCase>,
        default_case: Option<Box<Expr>>,
    ) -> Expr {
        let subject = self.resolve_expr(subject);
        let mut seen: Vec<Value> = Vec::new();
        let mut result_ty: Option<Type> = None;
        let cases: Vec<SwitchCase> = cases
            .into_iter()
            .map(|case| {
                let patterns: Vec<Expr> = case
                    .patterns
                    .into_iter()
                    .map(|p| {
                        let p = self.resolve_expr(p);
                        if let Some(v) = &p.const_value {
                            if seen.contains(v) {
                                self.error(CompileError::structural(
                                    format!("duplicate case value {}", value::display(v)),
                                    &p.token,
                                ));
                            } else {
                                seen.push(v.clone());
                            }
                        }
                        p
                    })
                    .collect();
                let result = self.resolve_expr(case.result);
                let ty = result.ty.clone().unwrap_or(Type::Any);
                result_ty = Some(match &result_ty {
                    None => ty,
                    Some(prev) => common_type(prev, &ty),
                });
                SwitchCase { patterns, result }
            })
            .collect();
        let default_case = default_case.map(|d| {
            let d = self.resolve_expr(*d);
            let ty = d.ty.clone().unwrap_or(Type::Any);
            result_ty = Some(match &result_ty {
                None => ty,
                Some(prev) => common_type(prev, &ty),
            });
            Box::new(d)
        });
        expr.could_be_null = default_case.is_none();
        expr.ty = Some(result_ty.unwrap_or(Type::Any));
        expr.resolved = true;
        expr.kind = ExprKind::Switch {
            subject: Box::new(subject),
            cases,
            default_case,
        };
        expr
    }

    // ── Functions and wrappers ───────────────────────────────────────────

    fn resolve_fun_decl(&mut self, mut f: FunDeclExpr, token: &Token) -> FunDeclExpr {
        let fun = f.fun;

        // Bind the function name in the enclosing scope (pre-declared by the
        // block pre-pass)
        if !f.is_wrapper && !self.fun_states.is_empty() {
            if let Some(name_tok) = &f.name_token {
                let idx = self.fun_states.len() - 1;
                if let Some(binding) = self.find_in_function(idx, &name_tok.lexeme) {
                    f.var_decl = Some(binding.var);
                }
            }
        }

        let return_type = self.funs.get(fun).return_type.clone();
        let return_type = self.resolve_type(return_type, token);
        self.funs.get_mut(fun).return_type = return_type.clone();
        if self.context.test_async && !self.funs.get(fun).is_builtin {
            self.funs.get_mut(fun).mark_async();
        }

        self.fun_states.push(FunState::new(fun));
        self.fun_state().blocks.push(BlockState::default());

        // Parameters resolve under the resolving-params flag so captures in
        // later default initialisers force pre-body promotion
        self.fun_state().resolving_params = true;
        f.params = f.params.into_iter().map(|p| self.resolve_stmt(p)).collect();
        self.fun_state().resolving_params = false;

        // Sync the descriptor's parameter types with the resolved arena types
        let param_ids: Vec<VarDeclId> = f
            .params
            .iter()
            .filter_map(|p| match &p.kind {
                StmtKind::VarDecl(d) => Some(d.var),
                _ => None,
            })
            .collect();
        let param_types: Vec<Type> = param_ids.iter().map(|id| self.vars.get(*id).ty.clone()).collect();
        self.funs.get_mut(fun).param_types = param_types;

        let mut body = *f.body;
        self.insert_implicit_return(&mut body, &return_type);
        let body = self.resolve_stmt(body);
        f.body = Box::new(body);

        self.fun_state().blocks.pop();
        self.fun_states.pop();
        self.resolved_funs.insert(fun);

        if !f.is_wrapper && !self.funs.get(fun).is_builtin {
            let wrapper = self.create_wrapper(&f, token);
            let wrapper = self.resolve_expr(wrapper);
            f.wrapper = Some(Box::new(wrapper));
        }
        f
    }

    /// Rewrites the last statement of a function body into an explicit
    /// return, filling missing branches with `return null` for reference
    /// return types and reporting an error for primitive ones.
    fn insert_implicit_return(&mut self, body: &mut Stmt, return_type: &Type) {
        let token = body.token.clone();
        match &mut body.kind {
            StmtKind::Block(block) => {
                if block.stmts.is_empty() {
                    if return_type.is_primitive() {
                        self.error(CompileError::context(
                            format!("missing return statement for function returning {return_type}"),
                            &token,
                        ));
                    } else {
                        block.stmts.push(return_stmt(&token, Some(null_literal(&token))));
                    }
                    return;
                }
                let last = block.stmts.last_mut().expect("non-empty block");
                self.stmt_to_return(last, return_type);
            }
            _ => self.stmt_to_return(body, return_type),
        }
    }

    fn stmt_to_return(&mut self, stmt: &mut Stmt, return_type: &Type) {
        let token = stmt.token.clone();
        let kind = std::mem::replace(&mut stmt.kind, StmtKind::Stmts(Vec::new()));
        stmt.kind = match kind {
            done @ (StmtKind::Return(_) | StmtKind::ThrowError(_)) => done,
            StmtKind::ExprStmt(expr) => match expr.kind {
                // A bare `return` already terminates; `die` never returns
                ExprKind::Return { .. } => StmtKind::Return(expr),
                ExprKind::Die { .. } => StmtKind::ExprStmt(expr),
                _ => {
                    let mut value = *expr;
                    value.is_result_used = true;
                    StmtKind::Return(Box::new(Expr::new(
                        token,
                        ExprKind::Return {
                            expr: Some(Box::new(value)),
                            return_type: None,
                            fun: None,
                        },
                    )))
                }
            },
            StmtKind::Block(mut block) => {
                match block.stmts.last_mut() {
                    Some(last) => self.stmt_to_return(last, return_type),
                    None => {
                        if return_type.is_primitive() {
                            self.error(CompileError::context(
                                format!("missing return statement for function returning {return_type}"),
                                &token,
                            ));
                        } else {
                            block.stmts.push(return_stmt(&token, Some(null_literal(&token))));
                        }
                    }
                }
                StmtKind::Block(block)
            }
            StmtKind::Stmts(mut stmts) => {
                match stmts.last_mut() {
                    Some(last) => self.stmt_to_return(last, return_type),
                    None => {
                        if return_type.is_primitive() {
                            self.error(CompileError::context(
                                format!("missing return statement for function returning {return_type}"),
                                &token,
                            ));
                        } else {
                            stmts.push(return_stmt(&token, Some(null_literal(&token))));
                        }
                    }
                }
                StmtKind::Stmts(stmts)
            }
            StmtKind::If(mut if_stmt) => {
                self.stmt_to_return(&mut if_stmt.then_stmt, return_type);
                match &mut if_stmt.else_stmt {
                    Some(else_stmt) => self.stmt_to_return(else_stmt, return_type),
                    None => {
                        if return_type.is_primitive() {
                            self.error(CompileError::context(
                                format!("missing return in else branch for function returning {return_type}"),
                                &token,
                            ));
                        } else {
                            if_stmt.else_stmt = Some(Box::new(return_stmt(&token, Some(null_literal(&token)))));
                        }
                    }
                }
                StmtKind::If(if_stmt)
            }
            StmtKind::VarDecl(decl) => {
                // The declared variable's value becomes the return value
                let name = self.vars.get(decl.var).name.clone();
                let old = Stmt::new(token.clone(), StmtKind::VarDecl(decl));
                let ret = return_stmt(&token, Some(ident_expr(&name, &token)));
                StmtKind::Stmts(vec![old, ret])
            }
            StmtKind::FunDecl(fun_expr) => {
                let name = match &fun_expr.kind {
                    ExprKind::FunDecl(f) => f.name_token.as_ref().map(|t| t.lexeme.clone()).unwrap_or_default(),
                    _ => String::new(),
                };
                let old = Stmt::new(token.clone(), StmtKind::FunDecl(fun_expr));
                let ret = return_stmt(&token, Some(ident_expr(&name, &token)));
                StmtKind::Stmts(vec![old, ret])
            }
            other @ (StmtKind::While(_) | StmtKind::ClassDecl(_) | StmtKind::Import(_)) => {
                let old = Stmt::new(token.clone(), other);
                if return_type.is_primitive() {
                    self.error(CompileError::context(
                        format!("missing return statement for function returning {return_type}"),
                        &token,
                    ));
                    old.kind
                } else {
                    let ret = return_stmt(&token, Some(null_literal(&token)));
                    StmtKind::Stmts(vec![old, ret])
                }
            }
        };
    }

    /// Synthesizes the argument-dispatch wrapper for a resolved function.
    ///
    /// The wrapper takes `($source, $offset, $args)` and:
    /// detects a single named-args map (copying it before consuming keys),
    /// expands a single list argument over multiple parameters, checks
    /// mandatory argument counts, binds each formal parameter from the
    /// positional slot, the named-args map, or the parameter's declared
    /// default, converts values to the parameter types, rejects leftover
    /// named arguments, and tail-invokes the real function (or the class
    /// initialiser for init methods).
    fn create_wrapper(&mut self, inner: &FunDeclExpr, token: &Token) -> Expr {
        let inner_fun = inner.fun;
        let inner_desc = self.funs.get(inner_fun);
        let wrapper_method = inner_desc.wrapper_method.clone();
        let param_names = inner_desc.param_names.clone();
        let param_types = inner_desc.param_types.clone();
        let mandatory = inner_desc.mandatory_count;
        let inner_name = inner_desc.name.clone();
        let is_init = inner_desc.is_init_method;
        let implementing_class = inner_desc.implementing_class.clone();
        let is_static = inner_desc.is_static;
        let init_class = if is_init {
            implementing_class
                .as_deref()
                .and_then(|c| self.classes.lookup(c))
        } else {
            None
        };

        let mut desc = FunctionDescriptor::new(wrapper_method.clone(), Type::Any);
        desc.is_wrapper = true;
        desc.is_final = true;
        desc.is_static = is_static;
        desc.implementing_class = implementing_class;
        desc.implementing_method = wrapper_method.clone();
        desc.wrapper_method = wrapper_method;
        desc.needs_location = true;
        desc.param_names = vec![
            SOURCE_PARAM.to_string(),
            OFFSET_PARAM.to_string(),
            ARGS_PARAM.to_string(),
        ];
        desc.param_types = vec![Type::Long, Type::Long, Type::Array(Box::new(Type::Any))];
        desc.mandatory_count = 3;
        desc.mandatory_params = desc.param_names.iter().cloned().collect();
        let wrapper_id = self.funs.add(desc);
        self.funs.get_mut(inner_fun).wrapper = Some(wrapper_id);

        // Inner parameter metadata: (name, type, default var id or None)
        let param_info: Vec<(String, Type, Option<VarDeclId>)> = inner
            .params
            .iter()
            .enumerate()
            .filter_map(|(i, p)| match &p.kind {
                StmtKind::VarDecl(d) => {
                    let has_default = d.init.is_some();
                    Some((
                        param_names.get(i).cloned().unwrap_or_default(),
                        param_types.get(i).cloned().unwrap_or(Type::Any),
                        has_default.then_some(d.var),
                    ))
                }
                _ => None,
            })
            .collect();

        let mut params = Vec::new();
        for (slot, (name, ty)) in [
            (SOURCE_PARAM, Type::Long),
            (OFFSET_PARAM, Type::Long),
            (ARGS_PARAM, Type::Array(Box::new(Type::Any))),
        ]
        .into_iter()
        .enumerate()
        {
            let ptok = Token::new(TokenKind::Identifier, token.source, token.offset, name);
            let mut decl = VarDecl::new(name, ptok.clone(), ty);
            decl.is_param = true;
            decl.slot = i32::try_from(slot).unwrap_or(-1);
            decl.owner = Some(wrapper_id);
            let var = self.vars.add(decl);
            params.push(Stmt::new(
                ptok,
                StmtKind::VarDecl(Box::new(VarDeclStmt { var, init: None })),
            ));
        }

        let mut stmts = Vec::new();

        // Declare one local per formal parameter up front; the named and
        // positional paths assign them and the tail call reads them
        for (name, ty, _) in &param_info {
            stmts.push(self.wrapper_local(name, ty.clone(), None, token));
        }

        // Single-list expansion: one list argument for a multi-parameter
        // function spreads as positional arguments
        if param_info.len() > 1 {
            let cond = and_expr(
                eq_int(utility(UtilityFn::ArgCount, vec![ident_expr(ARGS_PARAM, token)], token), 1, token),
                utility(
                    UtilityFn::IsList,
                    vec![utility(
                        UtilityFn::ArgAt,
                        vec![ident_expr(ARGS_PARAM, token), int_literal(0, token)],
                        token,
                    )],
                    token,
                ),
                token,
            );
            let expand = assign_stmt(
                ARGS_PARAM,
                utility(
                    UtilityFn::ArgAt,
                    vec![ident_expr(ARGS_PARAM, token), int_literal(0, token)],
                    token,
                ),
                token,
            );
            stmts.push(if_stmt(cond, expand, None, token));
        }

        // Named-args path vs positional path
        let named_block = self.wrapper_named_block(&param_info, mandatory, token);
        let positional_block = self.wrapper_positional_block(&param_info, mandatory, token);
        let is_named = utility(UtilityFn::IsNamedArgs, vec![ident_expr(ARGS_PARAM, token)], token);
        stmts.push(if_stmt(is_named, named_block, Some(positional_block), token));

        // Tail-invoke the real function with the fully-typed arguments
        let tail_args: Vec<Expr> = param_info.iter().map(|(n, _, _)| ident_expr(n, token)).collect();
        let tail = match init_class {
            Some(class_id) => Expr::new(token.clone(), ExprKind::InvokeInit { class_id, args: tail_args }),
            None => {
                let callee_var = self.function_value_var(&inner_name, inner_fun, token);
                let mut callee = Expr::new(
                    token.clone(),
                    ExprKind::Identifier {
                        name: inner_name,
                        var_decl: Some(callee_var),
                        capture_num: None,
                    },
                );
                callee.is_callee = true;
                Expr::new(
                    token.clone(),
                    ExprKind::Call {
                        callee: Box::new(callee),
                        args: tail_args,
                        fun: Some(inner_fun),
                    },
                )
            }
        };
        stmts.push(return_stmt(token, Some(tail)));

        let body = Stmt::new(
            token.clone(),
            StmtKind::Block(Box::new(BlockStmt { stmts })),
        );
        let fun_decl = FunDeclExpr {
            fun: wrapper_id,
            name_token: None,
            params,
            body: Box::new(body),
            wrapper: None,
            var_decl: None,
            is_closure: false,
            is_script_main: false,
            is_wrapper: true,
            implicit_it: false,
        };
        Expr::new(token.clone(), ExprKind::FunDecl(Box::new(fun_decl)))
    }

    /// Wrapper body for the named-arguments case: copy the marker map, bind
    /// each parameter by removing its key (or falling back to its default),
    /// then reject any keys that remain.
    fn wrapper_named_block(
        &mut self,
        param_info: &[(String, Type, Option<VarDeclId>)],
        _mandatory: usize,
        token: &Token,
    ) -> Stmt {
        let map_name = "$argMap";
        let mut stmts = Vec::new();
        stmts.push(self.wrapper_local(
            map_name,
            Type::Map,
            Some(utility(
                UtilityFn::CopyNamedArgs,
                vec![utility(
                    UtilityFn::ArgAt,
                    vec![ident_expr(ARGS_PARAM, token), int_literal(0, token)],
                    token,
                )],
                token,
            )),
            token,
        ));
        for (index, (name, ty, default)) in param_info.iter().enumerate() {
            let present = utility(
                UtilityFn::ContainsKey,
                vec![ident_expr(map_name, token), string_literal(name, token)],
                token,
            );
            let bound = convert_to(
                ty.clone(),
                utility(
                    UtilityFn::RemoveNamedArg,
                    vec![ident_expr(map_name, token), string_literal(name, token)],
                    token,
                ),
                token,
            );
            let fallback = self.wrapper_default(name, index, *default, token);
            let value = ternary(present, bound, fallback, token);
            stmts.push(assign_stmt(name, value, token));
        }
        let leftovers = Expr::new(
            Token::new(TokenKind::Greater, token.source, token.offset, ">"),
            ExprKind::Binary {
                left: Box::new(utility(
                    UtilityFn::NamedArgsSize,
                    vec![ident_expr(map_name, token)],
                    token,
                )),
                op: Token::new(TokenKind::Greater, token.source, token.offset, ">"),
                right: Box::new(int_literal(0, token)),
                create_if_missing: false,
            },
        );
        stmts.push(if_stmt(
            leftovers,
            throw_error("invalid named argument(s) in call", token),
            None,
            token,
        ));
        Stmt::new(token.clone(), StmtKind::Block(Box::new(BlockStmt { stmts })))
    }

    /// Wrapper body for the positional case: mandatory-count checks, then
    /// bind each parameter from its slot or its default.
    fn wrapper_positional_block(
        &mut self,
        param_info: &[(String, Type, Option<VarDeclId>)],
        mandatory: usize,
        token: &Token,
    ) -> Stmt {
        let count_name = "$argCount";
        let mut stmts = Vec::new();
        stmts.push(self.wrapper_local(
            count_name,
            Type::Int,
            Some(utility(UtilityFn::ArgCount, vec![ident_expr(ARGS_PARAM, token)], token)),
            token,
        ));
        if mandatory > 0 {
            let too_few = int_compare(
                ident_expr(count_name, token),
                TokenKind::Less,
                i64::try_from(mandatory).unwrap_or(0),
                token,
            );
            stmts.push(if_stmt(
                too_few,
                throw_error("missing mandatory arguments", token),
                None,
                token,
            ));
        }
        let too_many = int_compare(
            ident_expr(count_name, token),
            TokenKind::Greater,
            i64::try_from(param_info.len()).unwrap_or(0),
            token,
        );
        stmts.push(if_stmt(too_many, throw_error("too many arguments", token), None, token));
        for (index, (name, ty, default)) in param_info.iter().enumerate() {
            let have_arg = int_compare(
                ident_expr(count_name, token),
                TokenKind::Greater,
                i64::try_from(index).unwrap_or(0),
                token,
            );
            let positional = convert_to(
                ty.clone(),
                Expr::new(
                    token.clone(),
                    ExprKind::LoadParamValue {
                        name: name.clone(),
                        index,
                        param: None,
                    },
                ),
                token,
            );
            let fallback = self.wrapper_default(name, index, *default, token);
            let value = ternary(have_arg, positional, fallback, token);
            stmts.push(assign_stmt(name, value, token));
        }
        Stmt::new(token.clone(), StmtKind::Block(Box::new(BlockStmt { stmts })))
    }

    /// The fallback for an unsupplied parameter: evaluate the declared
    /// default initialiser (referenced via the inner parameter's
    /// declaration), or fail for a mandatory parameter.
    fn wrapper_default(&mut self, name: &str, index: usize, default: Option<VarDeclId>, token: &Token) -> Expr {
        match default {
            Some(param) => Expr::new(
                token.clone(),
                ExprKind::LoadParamValue {
                    name: name.to_string(),
                    index,
                    param: Some(param),
                },
            ),
            None => Expr::new(
                token.clone(),
                ExprKind::Die {
                    expr: Some(Box::new(string_literal(
                        &format!("missing value for mandatory parameter '{name}'"),
                        token,
                    ))),
                },
            ),
        }
    }

    /// A local declaration inside a synthesized wrapper body.
    fn wrapper_local(&mut self, name: &str, ty: Type, init: Option<Expr>, token: &Token) -> Stmt {
        let tok = Token::new(TokenKind::Identifier, token.source, token.offset, name);
        let decl = VarDecl::new(name, tok.clone(), ty);
        let var = self.vars.add(decl);
        Stmt::new(tok, StmtKind::VarDecl(Box::new(VarDeclStmt { var, init })))
    }

    // ── Classes ──────────────────────────────────────────────────────────

    /// First pass over the unit: links base classes, registers fields and
    /// methods on descriptors, validates collisions and overrides, and
    /// synthesizes init-method descriptors, so that bodies (in any order)
    /// can reference any class declared anywhere in the unit.
    fn prepare_classes(&mut self, stmt: &Stmt) {
        let mut class_stmts = Vec::new();
        collect_class_decls(stmt, &mut class_stmts);

        // Imports first, so base-class names can use them
        self.register_imports(stmt);

        // Pass 1: base links
        for class_decl in &class_stmts {
            self.prepare_base_link(class_decl);
        }
        // In REPL mode, classes declared inside a script attach at the top
        // level: make them reachable by simple name
        if self.context.repl_mode {
            for class_decl in &class_stmts {
                let desc = self.classes.get(class_decl.class);
                if !desc.is_script_class {
                    let simple = desc.name.clone();
                    self.classes.add_alias(simple, class_decl.class);
                }
            }
        }
        // Pass 2: circular-extends check
        for class_decl in &class_stmts {
            if self.classes.has_circular_extends(class_decl.class) {
                self.error(CompileError::structural(
                    format!(
                        "circular inheritance for class '{}'",
                        self.classes.get(class_decl.class).packaged_name
                    ),
                    &class_decl.name_token,
                ));
                // Break the cycle so later passes terminate
                self.classes.get_mut(class_decl.class).base = None;
            }
        }
        // Pass 3: fields and methods
        for class_decl in &class_stmts {
            self.prepare_members(class_decl);
        }
        // Pass 4: init-method descriptors (needs complete field tables)
        for class_decl in &class_stmts {
            self.prepare_init_descriptor(class_decl);
        }
    }

    fn register_imports(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Stmts(stmts) => {
                for s in stmts {
                    self.register_imports(s);
                }
            }
            StmtKind::Import(import) => {
                if let Some(id) = self.classes.lookup(&import.path) {
                    let name = import
                        .alias
                        .clone()
                        .unwrap_or_else(|| import.path.rsplit('.').next().unwrap_or(&import.path).to_string());
                    self.imports.insert(name, id);
                }
            }
            _ => {}
        }
    }

    fn prepare_base_link(&mut self, class_decl: &ClassDeclStmt) {
        let Some(base_name) = &class_decl.base_name else { return };
        let token = class_decl.base_token.clone().unwrap_or_else(|| class_decl.name_token.clone());
        let base = self
            .classes
            .lookup(base_name)
            .or_else(|| {
                let pkg = &self.classes.get(class_decl.class).package_name;
                if pkg.is_empty() {
                    None
                } else {
                    self.classes.lookup(&format!("{pkg}.{base_name}"))
                }
            })
            .or_else(|| self.imports.get(base_name.as_str()).copied());
        match base {
            Some(base_id) => {
                if self.classes.get(base_id).is_interface {
                    self.error(CompileError::structural(
                        format!("cannot extend interface '{base_name}'"),
                        &token,
                    ));
                } else {
                    self.classes.get_mut(class_decl.class).base = Some(base_id);
                }
            }
            None => self.error(CompileError::type_error(
                format!("unknown base class '{base_name}'"),
                &token,
            )),
        }
    }

    fn prepare_members(&mut self, class_decl: &ClassDeclStmt) {
        let class = class_decl.class;

        // Fields
        let mut field_stmts = Vec::new();
        collect_var_decls(&class_decl.fields, &mut field_stmts);
        for (var, has_init, token) in field_stmts {
            let name = self.vars.get(var).name.clone();
            let declared = self.vars.get(var).ty.clone();
            let ty = self.resolve_type(declared, &token);
            self.vars.get_mut(var).ty = ty.clone();
            let is_final = self.vars.get(var).is_final;
            if self.builtins.is_any_method(&name) {
                self.error(CompileError::structural(
                    format!("field name '{name}' collides with a built-in method"),
                    &token,
                ));
            }
            if let Some(base) = self.classes.get(class).base {
                if self.classes.field_lookup(base, &name).is_some() {
                    self.error(CompileError::structural(
                        format!("field '{name}' is already declared in a base class"),
                        &token,
                    ));
                }
            }
            if self
                .classes
                .get_mut(class)
                .fields
                .insert(
                    name.clone(),
                    FieldInfo {
                        ty,
                        mandatory: !has_init,
                        is_final,
                    },
                )
                .is_some()
            {
                self.error(CompileError::structural(
                    format!("field '{name}' is already declared"),
                    &token,
                ));
            }
        }

        // Methods
        for method in &class_decl.methods {
            let StmtKind::FunDecl(expr) = &method.kind else { continue };
            let ExprKind::FunDecl(f) = &expr.kind else { continue };
            let fun = f.fun;
            let name = self.funs.get(fun).name.clone();
            let token = f.name_token.clone().unwrap_or_else(|| method.token.clone());

            // Resolve signature types up front so call sites in other
            // bodies can type-check against them
            let return_type = self.funs.get(fun).return_type.clone();
            let return_type = self.resolve_type(return_type, &token);
            let param_types: Vec<Type> = self
                .funs
                .get(fun)
                .param_types
                .clone()
                .into_iter()
                .map(|t| self.resolve_type(t, &token))
                .collect();
            {
                let desc = self.funs.get_mut(fun);
                desc.return_type = return_type.clone();
                desc.param_types = param_types.clone();
            }

            if self.classes.get(class).fields.contains_key(&name) {
                self.error(CompileError::structural(
                    format!("method name '{name}' collides with field '{name}'"),
                    &token,
                ));
            }
            if self.classes.get(class).is_script_class || f.is_script_main {
                self.funs.get_mut(fun).is_final = true;
            } else if !self.funs.get(fun).is_static && !self.funs.get(fun).is_final {
                // A subclass override may suspend, so the calling convention
                // must carry a continuation slot uniformly
                self.funs.get_mut(fun).mark_async();
            }

            // Override validation: signatures must match exactly
            if let Some(base) = self.classes.get(class).base {
                if let Some(base_fun) = self.classes.method_lookup(base, &name) {
                    let base_desc = self.funs.get(base_fun);
                    if base_desc.is_final {
                        self.error(CompileError::structural(
                            format!("method '{name}' overrides a final method"),
                            &token,
                        ));
                    } else if base_desc.param_types != param_types || base_desc.return_type != return_type {
                        self.error(CompileError::structural(
                            format!("method '{name}' overrides a method with a different signature"),
                            &token,
                        ));
                    }
                }
            }
            if self.classes.get_mut(class).methods.insert(name.clone(), fun).is_some() {
                self.error(CompileError::structural(
                    format!("method '{name}' is already declared"),
                    &token,
                ));
            }
        }
    }

    /// Synthesizes the init-method descriptor: one mandatory parameter per
    /// mandatory field (base first), then optional parameters for the
    /// class's own optional fields.
    fn prepare_init_descriptor(&mut self, class_decl: &ClassDeclStmt) {
        let class = class_decl.class;
        if class_decl.is_interface {
            return;
        }
        let mandatory_fields = self.classes.mandatory_fields(class);
        let own_optional: Vec<(String, Type)> = self
            .classes
            .get(class)
            .fields
            .iter()
            .filter(|(_, info)| !info.mandatory)
            .map(|(n, info)| (n.clone(), info.ty.clone()))
            .collect();

        let mut desc = FunctionDescriptor::new(INIT_METHOD, Type::Instance(class));
        desc.is_init_method = true;
        desc.is_final = true;
        desc.implementing_class = Some(self.classes.get(class).packaged_name.clone());
        for (name, ty) in &mandatory_fields {
            desc.param_names.push(name.clone());
            desc.param_types.push(ty.clone());
            desc.mandatory_params.insert(name.clone());
        }
        desc.mandatory_count = mandatory_fields.len();
        for (name, ty) in &own_optional {
            desc.param_names.push(name.clone());
            desc.param_types.push(ty.clone());
        }
        let init = self.funs.add(desc);
        self.classes.get_mut(class).init_method = Some(init);
    }

    fn resolve_class_decl(&mut self, class_decl: ClassDeclStmt) -> ClassDeclStmt {
        let ClassDeclStmt {
            class,
            name_token,
            base_name,
            base_token,
            interface_names,
            fields,
            methods,
            inner_classes,
            is_interface,
        } = class_decl;

        // Field declarations double as the field symbol table
        let mut field_vars = AHashMap::new();
        let mut field_stmts = Vec::new();
        collect_var_decls(&fields, &mut field_stmts);
        for (var, _, _) in &field_stmts {
            let name = self.vars.get(*var).name.clone();
            field_vars.insert(name, *var);
        }

        self.class_states.push(ClassState {
            class,
            field_vars,
            in_static: false,
        });
        // Class bodies never capture locals of the surrounding script or
        // function; isolate them from the enclosing function stack
        let saved_fun_states = std::mem::take(&mut self.fun_states);

        // Take field initialisers: they run inside the synthesized init
        // method, not at field-declaration position
        let mut field_inits: Vec<(String, Option<Expr>, Token)> = Vec::new();
        let fields: Vec<Stmt> = fields
            .into_iter()
            .map(|f| take_field_inits(f, &mut field_inits, &self.vars))
            .collect();

        let mut methods: Vec<Stmt> = methods;
        if !is_interface {
            let init_stmt = self.synthesize_init(class, &name_token, field_inits);
            methods.push(init_stmt);
        }
        let methods: Vec<Stmt> = methods
            .into_iter()
            .map(|m| {
                if let StmtKind::FunDecl(expr) = &m.kind {
                    if let ExprKind::FunDecl(f) = &expr.kind {
                        let is_static = self.funs.get(f.fun).is_static;
                        self.class_states.last_mut().expect("class scope").in_static = is_static;
                    }
                }
                let resolved = self.resolve_stmt(m);
                self.class_states.last_mut().expect("class scope").in_static = false;
                resolved
            })
            .collect();

        let inner_classes: Vec<Stmt> = inner_classes.into_iter().map(|c| self.resolve_stmt(c)).collect();

        self.fun_states = saved_fun_states;
        self.class_states.pop();

        ClassDeclStmt {
            class,
            name_token,
            base_name,
            base_token,
            interface_names,
            fields,
            methods,
            inner_classes,
            is_interface,
        }
    }

    /// Builds the init method: parameters per field, a `super.init` call for
    /// the base class's mandatory fields, one assignment per own field, and
    /// `return this`.
    fn synthesize_init(&mut self, class: ClassId, at: &Token, field_inits: Vec<(String, Option<Expr>, Token)>) -> Stmt {
        let init = self.classes.get(class).init_method.expect("init descriptor prepared");
        let param_names = self.funs.get(init).param_names.clone();
        let param_types = self.funs.get(init).param_types.clone();
        let base = self.classes.get(class).base;
        let own_fields: Vec<String> = self.classes.get(class).fields.keys().cloned().collect();
        let defaults: AHashMap<String, Option<Expr>> = field_inits
            .into_iter()
            .map(|(name, init, _)| (name, init))
            .collect();

        // Parameter declarations
        let mut params = Vec::new();
        for (slot, (name, ty)) in param_names.iter().zip(param_types.iter()).enumerate() {
            let tok = Token::new(TokenKind::Identifier, at.source, at.offset, name);
            let mut decl = VarDecl::new(name, tok.clone(), ty.clone());
            decl.is_param = true;
            decl.is_explicit_param = false;
            decl.slot = i32::try_from(slot).unwrap_or(-1);
            decl.owner = Some(init);
            let var = self.vars.add(decl);
            // Optional fields default to their declared initialiser (or null)
            let default = defaults
                .get(name)
                .cloned()
                .flatten()
                .or_else(|| {
                    let is_mandatory = self.funs.get(init).mandatory_params.contains(name);
                    (!is_mandatory).then(|| null_literal(at))
                });
            params.push(Stmt::new(
                tok,
                StmtKind::VarDecl(Box::new(VarDeclStmt { var, init: default })),
            ));
        }

        let mut stmts = Vec::new();
        if let Some(base_id) = base {
            let base_mandatory = self.classes.mandatory_fields(base_id);
            let args = base_mandatory
                .iter()
                .map(|(name, _)| ident_expr(name, at))
                .collect();
            let super_init = Expr::new(
                at.clone(),
                ExprKind::InvokeInit {
                    class_id: base_id,
                    args,
                },
            );
            let mut call = super_init;
            call.is_result_used = false;
            stmts.push(Stmt::new(at.clone(), StmtKind::ExprStmt(Box::new(call))));
        }
        for name in &own_fields {
            let assign = Expr::new(
                at.clone(),
                ExprKind::FieldAssign {
                    parent: Box::new(ident_expr("this", at)),
                    access_op: TokenKind::Dot,
                    field: Box::new(string_literal(name, at)),
                    value: Box::new(ident_expr(name, at)),
                    conditional: false,
                },
            );
            let mut assign = assign;
            assign.is_result_used = false;
            stmts.push(Stmt::new(at.clone(), StmtKind::ExprStmt(Box::new(assign))));
        }
        stmts.push(return_stmt(at, Some(ident_expr("this", at))));

        let body = Stmt::new(at.clone(), StmtKind::Block(Box::new(BlockStmt { stmts })));
        let name_token = Token::new(TokenKind::Identifier, at.source, at.offset, INIT_METHOD);
        let fun_decl = FunDeclExpr {
            fun: init,
            name_token: Some(name_token.clone()),
            params,
            body: Box::new(body),
            wrapper: None,
            var_decl: None,
            is_closure: false,
            is_script_main: false,
            is_wrapper: false,
            implicit_it: false,
        };
        let expr = Expr::new(name_token.clone(), ExprKind::FunDecl(Box::new(fun_decl)));
        Stmt::new(name_token, StmtKind::FunDecl(Box::new(expr)))
    }

    // ── Async propagation & invariants ───────────────────────────────────

    /// Runs the async fixed point over the recorded call graph. Once marked
    /// async a function never flips back, so this terminates.
    fn propagate_async(&mut self) {
        loop {
            let mut changed = false;
            for &(caller, callee) in &self.call_edges {
                if self.funs.get(callee).is_async() && !self.funs.get(caller).is_async() {
                    self.funs.get_mut(caller).mark_async();
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        for id in self.funs.iter_ids().collect::<Vec<_>>() {
            self.funs.get_mut(id).finalize_async();
        }
    }

    /// Internal-invariant pass, run only on successful compilations: every
    /// node must be resolved and no placeholder types may survive. A failure
    /// here is a resolver bug, not a user error, so it panics.
    fn check_invariants(&self, tree: &Stmt) {
        check_stmt_invariants(tree);
    }

}

// ── Synthetic-AST helpers ────────────────────────────────────────────────

fn synth_token(kind: TokenKind, at: &Token, lexeme: &str) -> Token {
    Token::new(kind, at.source, at.offset, lexeme)
}

fn ident_expr(name: &str, at: &Token) -> Expr {
    Expr::new(
        synth_token(TokenKind::Identifier, at, name),
        ExprKind::Identifier {
            name: name.to_string(),
            var_decl: None,
            capture_num: None,
        },
    )
}

fn null_literal(at: &Token) -> Expr {
    let tok = synth_token(TokenKind::Null, at, "null").with_value(Value::Null);
    Expr::new(tok, ExprKind::Literal)
}

fn int_literal(v: i32, at: &Token) -> Expr {
    let tok = synth_token(TokenKind::IntLiteral, at, &v.to_string()).with_value(Value::Int(v));
    Expr::new(tok, ExprKind::Literal)
}

fn string_literal(s: &str, at: &Token) -> Expr {
    let tok = synth_token(TokenKind::StringLiteral, at, s).with_value(Value::String(s.to_string()));
    Expr::new(tok, ExprKind::Literal)
}

fn utility(utility: UtilityFn, args: Vec<Expr>, at: &Token) -> Expr {
    Expr::new(
        synth_token(TokenKind::Identifier, at, "$util"),
        ExprKind::InvokeUtility { utility, args },
    )
}

/// A conversion carrying the wrapper's call-site location for error
/// reporting.
fn convert_to(target: Type, expr: Expr, at: &Token) -> Expr {
    let source = Expr::new(
        synth_token(TokenKind::Identifier, at, SOURCE_PARAM),
        ExprKind::SpecialVar {
            kind: SpecialVarKind::Source,
        },
    );
    let offset = Expr::new(
        synth_token(TokenKind::Identifier, at, OFFSET_PARAM),
        ExprKind::SpecialVar {
            kind: SpecialVarKind::Offset,
        },
    );
    Expr::new(
        at.clone(),
        ExprKind::ConvertTo {
            target,
            expr: Box::new(expr),
            source: Some(Box::new(source)),
            offset: Some(Box::new(offset)),
        },
    )
}

fn ternary(condition: Expr, true_expr: Expr, false_expr: Expr, at: &Token) -> Expr {
    Expr::new(
        synth_token(TokenKind::Question, at, "?"),
        ExprKind::Ternary {
            condition: Box::new(condition),
            true_expr: Box::new(true_expr),
            false_expr: Box::new(false_expr),
        },
    )
}

fn and_expr(left: Expr, right: Expr, at: &Token) -> Expr {
    let op = synth_token(TokenKind::AmpersandAmpersand, at, "&&");
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

fn int_compare(left: Expr, op_kind: TokenKind, value: i64, at: &Token) -> Expr {
    let op = synth_token(op_kind, at, op_kind.symbol());
    let rhs = int_literal(i32::try_from(value).unwrap_or(i32::MAX), at);
    Expr::new(
        op.clone(),
        ExprKind::Binary {
            left: Box::new(left),
            op,
            right: Box::new(rhs),
            create_if_missing: false,
        },
    )
}

fn eq_int(left: Expr, value: i64, at: &Token) -> Expr {
    int_compare(left, TokenKind::EqualEqual, value, at)
}

fn if_stmt(condition: Expr, then_stmt: Stmt, else_stmt: Option<Stmt>, at: &Token) -> Stmt {
    Stmt::new(
        synth_token(TokenKind::If, at, "if"),
        StmtKind::If(Box::new(IfStmt {
            condition,
            then_stmt: Box::new(then_stmt),
            else_stmt: else_stmt.map(Box::new),
        })),
    )
}

fn return_stmt(at: &Token, value: Option<Expr>) -> Stmt {
    let ret = Expr::new(
        synth_token(TokenKind::Return, at, "return"),
        ExprKind::Return {
            expr: value.map(Box::new),
            return_type: None,
            fun: None,
        },
    );
    Stmt::new(synth_token(TokenKind::Return, at, "return"), StmtKind::Return(Box::new(ret)))
}

fn assign_stmt(name: &str, value: Expr, at: &Token) -> Stmt {
    let mut assign = Expr::new(
        synth_token(TokenKind::Equal, at, "="),
        ExprKind::VarAssign {
            target: Box::new(ident_expr(name, at)),
            value: Box::new(value),
            conditional: false,
        },
    );
    assign.is_result_used = false;
    Stmt::new(assign.token.clone(), StmtKind::ExprStmt(Box::new(assign)))
}

fn throw_error(message: &str, at: &Token) -> Stmt {
    Stmt::new(
        at.clone(),
        StmtKind::ThrowError(Box::new(ThrowErrorStmt {
            message: message.to_string(),
        })),
    )
}

fn common_type(a: &Type, b: &Type) -> Type {
    if a == b {
        return a.clone();
    }
    fn rank(t: &Type) -> Option<u8> {
        match t {
            Type::Byte => Some(0),
            Type::Int => Some(1),
            Type::Long => Some(2),
            Type::Double => Some(3),
            Type::Decimal => Some(4),
            _ => None,
        }
    }
    match (rank(a), rank(b)) {
        (Some(x), Some(y)) => {
            if x >= y {
                a.clone()
            } else {
                b.clone()
            }
        }
        _ => Type::Any,
    }
}

fn utility_return_type(utility: UtilityFn) -> Type {
    match utility {
        UtilityFn::IsNamedArgs | UtilityFn::ContainsKey | UtilityFn::IsList => Type::Bool,
        UtilityFn::CopyNamedArgs => Type::Map,
        UtilityFn::RemoveNamedArg | UtilityFn::ArgAt | UtilityFn::ListAt => Type::Any,
        UtilityFn::NamedArgsSize | UtilityFn::ArgCount | UtilityFn::ListSize => Type::Int,
    }
}

/// Marks the last expression statement of a block as result-used and returns
/// its type (for block expressions).
fn mark_last_result_used(stmt: &mut Stmt) -> Option<Type> {
    match &mut stmt.kind {
        StmtKind::Block(block) => block.stmts.last_mut().and_then(mark_last_result_used),
        StmtKind::Stmts(stmts) => stmts.last_mut().and_then(mark_last_result_used),
        StmtKind::ExprStmt(expr) => {
            expr.is_result_used = true;
            expr.ty.clone()
        }
        StmtKind::Return(expr) => expr.ty.clone(),
        _ => None,
    }
}

/// Collects every class declaration in the unit, including classes nested in
/// the script-main body and inner classes.
fn collect_class_decls<'a>(stmt: &'a Stmt, out: &mut Vec<&'a ClassDeclStmt>) {
    match &stmt.kind {
        StmtKind::Stmts(stmts) => {
            for s in stmts {
                collect_class_decls(s, out);
            }
        }
        StmtKind::Block(block) => {
            for s in &block.stmts {
                collect_class_decls(s, out);
            }
        }
        StmtKind::ClassDecl(class_decl) => {
            out.push(class_decl);
            for s in &class_decl.inner_classes {
                collect_class_decls(s, out);
            }
            for m in &class_decl.methods {
                collect_class_decls(m, out);
            }
        }
        StmtKind::FunDecl(expr) => {
            if let ExprKind::FunDecl(f) = &expr.kind {
                collect_class_decls(&f.body, out);
            }
        }
        StmtKind::If(if_stmt) => {
            collect_class_decls(&if_stmt.then_stmt, out);
            if let Some(e) = &if_stmt.else_stmt {
                collect_class_decls(e, out);
            }
        }
        StmtKind::While(while_stmt) => collect_class_decls(&while_stmt.body, out),
        _ => {}
    }
}

/// Collects `(var, has_initialiser, token)` for every declaration in a field
/// statement (single declarations and comma groups).
fn collect_var_decls(stmts: &[Stmt], out: &mut Vec<(VarDeclId, bool, Token)>) {
    for stmt in stmts {
        match &stmt.kind {
            StmtKind::VarDecl(decl) => out.push((decl.var, decl.init.is_some(), stmt.token.clone())),
            StmtKind::Stmts(inner) => collect_var_decls(inner, out),
            _ => {}
        }
    }
}

/// Takes the initialiser out of a field declaration (it moves into the init
/// method) and marks the declaration resolved.
fn take_field_inits(mut stmt: Stmt, out: &mut Vec<(String, Option<Expr>, Token)>, vars: &VarMap) -> Stmt {
    match &mut stmt.kind {
        StmtKind::VarDecl(decl) => {
            let name = vars.get(decl.var).name.clone();
            out.push((name, decl.init.take(), stmt.token.clone()));
            stmt.resolved = true;
            stmt
        }
        StmtKind::Stmts(_) => {
            let StmtKind::Stmts(inner) = std::mem::replace(&mut stmt.kind, StmtKind::Stmts(Vec::new())) else {
                unreachable!()
            };
            stmt.kind = StmtKind::Stmts(inner.into_iter().map(|s| take_field_inits(s, out, vars)).collect());
            stmt.resolved = true;
            stmt
        }
        _ => {
            stmt.resolved = true;
            stmt
        }
    }
}

// ── Invariant checks (resolver bugs, not user errors) ────────────────────

fn check_stmt_invariants(stmt: &Stmt) {
    assert!(stmt.resolved, "unresolved statement at offset {}", stmt.token.offset);
    match &stmt.kind {
        StmtKind::Stmts(stmts) => stmts.iter().for_each(check_stmt_invariants),
        StmtKind::Block(block) => block.stmts.iter().for_each(check_stmt_invariants),
        StmtKind::VarDecl(decl) => {
            if let Some(init) = &decl.init {
                check_expr_invariants(init);
            }
        }
        StmtKind::ExprStmt(expr) | StmtKind::Return(expr) | StmtKind::FunDecl(expr) => check_expr_invariants(expr),
        StmtKind::If(if_stmt) => {
            check_expr_invariants(&if_stmt.condition);
            check_stmt_invariants(&if_stmt.then_stmt);
            if let Some(e) = &if_stmt.else_stmt {
                check_stmt_invariants(e);
            }
        }
        StmtKind::While(while_stmt) => {
            check_expr_invariants(&while_stmt.condition);
            check_stmt_invariants(&while_stmt.body);
            while_stmt.update.iter().for_each(check_expr_invariants);
        }
        StmtKind::ClassDecl(class_decl) => {
            class_decl.fields.iter().for_each(check_stmt_invariants);
            class_decl.methods.iter().for_each(check_stmt_invariants);
            class_decl.inner_classes.iter().for_each(check_stmt_invariants);
        }
        StmtKind::Import(_) | StmtKind::ThrowError(_) => {}
    }
}

fn check_expr_invariants(expr: &Expr) {
    assert!(expr.resolved, "unresolved expression at offset {}", expr.token.offset);
    let ty = expr.ty.as_ref().unwrap_or_else(|| {
        panic!("expression without a type at offset {}", expr.token.offset);
    });
    assert!(
        !matches!(ty, Type::Unknown | Type::Named(_)),
        "placeholder type survived resolution at offset {}",
        expr.token.offset
    );
    match &expr.kind {
        ExprKind::Identifier { var_decl, .. } => {
            assert!(var_decl.is_some(), "unlinked identifier at offset {}", expr.token.offset);
        }
        ExprKind::ListLiteral { items } => items.iter().for_each(check_expr_invariants),
        ExprKind::MapLiteral { entries, .. } => entries.iter().for_each(|(_, v)| check_expr_invariants(v)),
        ExprKind::VarAssign { target, value, .. } => {
            check_expr_invariants(target);
            check_expr_invariants(value);
        }
        ExprKind::VarOpAssign { target, value, .. } => {
            check_expr_invariants(target);
            check_expr_invariants(value);
        }
        ExprKind::FieldAssign {
            parent, field, value, ..
        } => {
            check_expr_invariants(parent);
            check_expr_invariants(field);
            check_expr_invariants(value);
        }
        ExprKind::FieldOpAssign {
            parent, field, value, ..
        } => {
            check_expr_invariants(parent);
            check_expr_invariants(field);
            check_expr_invariants(value);
        }
        ExprKind::Binary { left, right, .. } => {
            check_expr_invariants(left);
            check_expr_invariants(right);
        }
        ExprKind::Ternary {
            condition,
            true_expr,
            false_expr,
        } => {
            check_expr_invariants(condition);
            check_expr_invariants(true_expr);
            check_expr_invariants(false_expr);
        }
        ExprKind::PrefixUnary { expr: e, .. } | ExprKind::PostfixUnary { expr: e, .. } => check_expr_invariants(e),
        ExprKind::Cast { expr: e, .. } | ExprKind::CheckCast { expr: e, .. } => check_expr_invariants(e),
        ExprKind::ConvertTo { expr: e, source, offset, .. } => {
            check_expr_invariants(e);
            if let Some(s) = source {
                check_expr_invariants(s);
            }
            if let Some(o) = offset {
                check_expr_invariants(o);
            }
        }
        ExprKind::RegexMatch {
            target,
            pattern,
            capture_arr_var,
            ..
        } => {
            check_expr_invariants(target);
            check_expr_invariants(pattern);
            assert!(capture_arr_var.is_some(), "regex without capture array");
        }
        ExprKind::RegexSubst {
            target,
            pattern,
            replacement,
            capture_arr_var,
            ..
        } => {
            check_expr_invariants(target);
            check_expr_invariants(pattern);
            check_expr_invariants(replacement);
            assert!(capture_arr_var.is_some(), "substitution without capture array");
        }
        ExprKind::Call { callee, args, .. } => {
            check_expr_invariants(callee);
            args.iter().for_each(check_expr_invariants);
        }
        ExprKind::MethodCall { parent, args, .. } => {
            check_expr_invariants(parent);
            args.iter().for_each(check_expr_invariants);
        }
        ExprKind::Closure { fun_decl } => check_expr_invariants(fun_decl),
        ExprKind::FunDecl(f) => {
            f.params.iter().for_each(check_stmt_invariants);
            check_stmt_invariants(&f.body);
            if let Some(w) = &f.wrapper {
                check_expr_invariants(w);
            } else {
                assert!(f.is_wrapper, "function without a paired wrapper");
            }
        }
        ExprKind::NewInstance { args, class_id, .. } => {
            args.iter().for_each(check_expr_invariants);
            assert!(class_id.is_some(), "unlinked instance creation");
        }
        ExprKind::BlockExpr { block } => check_stmt_invariants(block),
        ExprKind::Return { expr: e, return_type, .. } => {
            if let Some(e) = e {
                check_expr_invariants(e);
            }
            assert!(return_type.is_some(), "return without resolved type");
        }
        ExprKind::Print { expr: e, .. } | ExprKind::Die { expr: e } => {
            if let Some(e) = e {
                check_expr_invariants(e);
            }
        }
        ExprKind::Eval { script, globals } => {
            check_expr_invariants(script);
            if let Some(g) = globals {
                check_expr_invariants(g);
            }
        }
        ExprKind::Switch {
            subject,
            cases,
            default_case,
        } => {
            check_expr_invariants(subject);
            for case in cases {
                case.patterns.iter().for_each(check_expr_invariants);
                check_expr_invariants(&case.result);
            }
            if let Some(d) = default_case {
                check_expr_invariants(d);
            }
        }
        ExprKind::ConstructorPattern { args, .. } => args.iter().for_each(check_expr_invariants),
        ExprKind::MultiAssign { targets, value } => {
            targets.iter().for_each(check_expr_invariants);
            check_expr_invariants(value);
        }
        ExprKind::InvokeUtility { args, .. } | ExprKind::InvokeInit { args, .. } => {
            args.iter().for_each(check_expr_invariants);
        }
        ExprKind::Literal
        | ExprKind::TypeExpr { .. }
        | ExprKind::Break { .. }
        | ExprKind::Continue { .. }
        | ExprKind::SpecialVar { .. }
        | ExprKind::LoadParamValue { .. }
        | ExprKind::Noop => {}
    }
}
