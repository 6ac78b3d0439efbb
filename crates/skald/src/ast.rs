//! AST statement and expression nodes.
//!
//! Every node carries the token it started at (for diagnostics) and a
//! `resolved` flag; expressions additionally carry the annotation fields the
//! resolver fills in (type, const value, nullability, result usage). Nodes
//! are plain owned data: the parser builds them, the resolver consumes and
//! returns them with annotations set.
//!
//! Symbols are NOT owned by the tree. Variable declarations live in a
//! [`VarMap`] arena and are referred to by [`VarDeclId`]; the statement node
//! for a declaration owns only the initialiser expression. The same goes for
//! function descriptors ([`crate::function::FunMap`]) and class descriptors
//! ([`crate::classes::ClassMap`]). Heap-local chains are arena indices, so
//! closure capture never creates ownership cycles.

use crate::{
    classes::ClassId,
    function::FunId,
    token::{Token, TokenKind},
    types::Type,
    value::Value,
};

/// Index of a variable declaration in the [`VarMap`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct VarDeclId(u32);

impl VarDeclId {
    pub fn new(index: usize) -> Self {
        Self(u32::try_from(index).expect("invalid var decl id"))
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A variable symbol: source-declared local, parameter, field, global, or one
/// of the synthesized declarations the resolver creates (heap-local copies,
/// wrapper parameters, capture arrays).
///
/// Created during parsing or resolving, mutated only by the resolver, never
/// destroyed: lifetime ends with the enclosing arena.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct VarDecl {
    pub name: String,
    pub token: Token,
    /// Declared or inferred type. `Type::Unknown` while a `var`/`def`
    /// declaration's initialiser is being resolved; `Type::Named` until a
    /// class-typed declaration is linked to its descriptor. Neither survives
    /// resolution of the declaring statement.
    pub ty: Type,
    /// The function this variable belongs to. `None` for globals.
    pub owner: Option<FunId>,
    /// Slot index for parameters (assigned so wrappers can address them);
    /// -1 for everything else, the code generator allocates those.
    pub slot: i32,
    pub is_param: bool,
    /// Parameter that appears in the source, as opposed to the implicit
    /// heap-local parameters added by closure capture.
    pub is_explicit_param: bool,
    pub is_field: bool,
    pub is_global: bool,
    /// Promoted to a heap cell because a nested function refers to it.
    pub is_heap_local: bool,
    /// Parameter that must be promoted to a heap cell before the function
    /// body runs, because another parameter's default initialiser captures it.
    pub is_passed_as_heap_local: bool,
    pub is_final: bool,
    /// Function nesting depth of the owning function.
    pub nesting_level: u32,
    /// For heap-local copies: the declaration in the next enclosing function
    /// this one forwards to.
    pub parent_var_decl: Option<VarDeclId>,
    /// For heap-local copies: the source declaration at the top of the chain.
    pub original_var_decl: Option<VarDeclId>,
    /// The function bound to this name, for function declarations.
    pub fun_decl: Option<FunId>,
    /// Monotone definition order within the resolve pass; used to reject
    /// forward references that close over not-yet-declared variables.
    pub declare_seq: u32,
}

impl VarDecl {
    pub fn new(name: impl Into<String>, token: Token, ty: Type) -> Self {
        Self {
            name: name.into(),
            token,
            ty,
            owner: None,
            slot: -1,
            is_param: false,
            is_explicit_param: false,
            is_field: false,
            is_global: false,
            is_heap_local: false,
            is_passed_as_heap_local: false,
            is_final: false,
            nesting_level: 0,
            parent_var_decl: None,
            original_var_decl: None,
            fun_decl: None,
            declare_seq: 0,
        }
    }
}

/// Arena of variable declarations for one compilation.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct VarMap(Vec<VarDecl>);

impl VarMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, decl: VarDecl) -> VarDeclId {
        let id = VarDeclId::new(self.0.len());
        self.0.push(decl);
        id
    }

    pub fn get(&self, id: VarDeclId) -> &VarDecl {
        &self.0[id.index()]
    }

    pub fn get_mut(&mut self, id: VarDeclId) -> &mut VarDecl {
        &mut self.0[id.index()]
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (VarDeclId, &VarDecl)> {
        self.0.iter().enumerate().map(|(i, d)| (VarDeclId::new(i), d))
    }

    pub fn truncate(&mut self, len: usize) {
        self.0.truncate(len);
    }
}

// ── Statements ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Stmt {
    pub token: Token,
    pub resolved: bool,
    pub kind: StmtKind,
}

impl Stmt {
    pub fn new(token: Token, kind: StmtKind) -> Self {
        Self {
            token,
            resolved: false,
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum StmtKind {
    ClassDecl(Box<ClassDeclStmt>),
    Import(Box<ImportStmt>),
    /// A function declaration statement; the payload is an
    /// [`ExprKind::FunDecl`] expression.
    FunDecl(Box<Expr>),
    /// A sequence of statements that does not introduce a scope (used for
    /// multi-variable declarations and synthesized statement groups).
    Stmts(Vec<Stmt>),
    /// A lexical scope.
    Block(Box<BlockStmt>),
    VarDecl(Box<VarDeclStmt>),
    ExprStmt(Box<Expr>),
    /// An explicit or resolver-injected return; payload is an
    /// [`ExprKind::Return`] expression.
    Return(Box<Expr>),
    If(Box<IfStmt>),
    /// Hosts `while`, `for` (via `update`), and `do/until` loops.
    While(Box<WhileStmt>),
    /// Synthesized runtime error (wrapper argument validation).
    ThrowError(Box<ThrowErrorStmt>),
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BlockStmt {
    pub stmts: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ClassDeclStmt {
    pub class: ClassId,
    pub name_token: Token,
    /// Unresolved base class path, e.g. `a.b.Base`.
    pub base_name: Option<String>,
    pub base_token: Option<Token>,
    pub interface_names: Vec<String>,
    /// Field declarations ([`StmtKind::VarDecl`]).
    pub fields: Vec<Stmt>,
    /// Method declarations ([`StmtKind::FunDecl`]), including the synthesized
    /// initialiser after resolution.
    pub methods: Vec<Stmt>,
    pub inner_classes: Vec<Stmt>,
    pub is_interface: bool,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ImportStmt {
    /// Dotted path including the class name, e.g. `x.y.Z`.
    pub path: String,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct VarDeclStmt {
    pub var: VarDeclId,
    pub init: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct IfStmt {
    pub condition: Expr,
    pub then_stmt: Box<Stmt>,
    pub else_stmt: Option<Box<Stmt>>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct WhileStmt {
    pub condition: Expr,
    pub body: Box<Stmt>,
    /// `for` loop update expressions, run after each iteration.
    pub update: Vec<Expr>,
    pub label: Option<String>,
    /// `do { .. } until (cond)`: body runs before the first condition check
    /// and the loop exits when the condition is true.
    pub is_do_until: bool,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ThrowErrorStmt {
    pub message: String,
}

// ── Expressions ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Expr {
    pub token: Token,
    pub resolved: bool,
    /// Set by the resolver; never `Type::Unknown` once `resolved` is true.
    pub ty: Option<Type>,
    pub const_value: Option<Value>,
    pub is_const: bool,
    pub could_be_null: bool,
    /// False when the expression's value is discarded (statement position).
    pub is_result_used: bool,
    /// True when the expression is being invoked (the target of a call).
    pub is_callee: bool,
    pub kind: ExprKind,
}

impl Expr {
    pub fn new(token: Token, kind: ExprKind) -> Self {
        Self {
            token,
            resolved: false,
            ty: None,
            const_value: None,
            is_const: false,
            could_be_null: true,
            is_result_used: true,
            is_callee: false,
            kind,
        }
    }

    /// The resolved type, panicking on resolver bugs rather than user errors.
    pub fn expect_type(&self) -> &Type {
        self.ty.as_ref().expect("expression type not resolved")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SpecialVarKind {
    /// The source id of the call site, passed into wrappers.
    Source,
    /// The source offset of the call site, passed into wrappers.
    Offset,
}

/// Runtime helper routines invoked from synthesized wrapper bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, serde::Serialize, serde::Deserialize)]
pub enum UtilityFn {
    /// `is_named_args(args) -> bool`: the single argument is a map tagged by
    /// the named-args marker class.
    IsNamedArgs,
    /// `copy_named_args(map) -> map`: take ownership of the named-args map
    /// before keys are consumed.
    CopyNamedArgs,
    /// `remove_named_arg(map, name) -> any`: pop one named argument.
    RemoveNamedArg,
    /// `contains_key(map, name) -> bool`.
    ContainsKey,
    /// `named_args_size(map) -> int`: keys remaining after binding.
    NamedArgsSize,
    /// `arg_count(args) -> int`.
    ArgCount,
    /// `arg_at(args, index) -> any`.
    ArgAt,
    /// `list_size(list) -> int`, for single-list argument expansion.
    ListSize,
    /// `list_at(list, index) -> any`.
    ListAt,
    /// `is_list(value) -> bool`.
    IsList,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FunDeclExpr {
    pub fun: FunId,
    /// Absent for closures.
    pub name_token: Option<Token>,
    /// Parameter declarations, each a [`StmtKind::VarDecl`].
    pub params: Vec<Stmt>,
    /// The function body block.
    pub body: Box<Stmt>,
    /// The paired wrapper, synthesized by the resolver
    /// (an [`ExprKind::FunDecl`] expression). `None` on wrappers themselves.
    pub wrapper: Option<Box<Expr>>,
    /// Binding of the function name in the enclosing scope.
    pub var_decl: Option<VarDeclId>,
    pub is_closure: bool,
    pub is_script_main: bool,
    pub is_wrapper: bool,
    /// Closure with an implicit `it` parameter that may be stripped if the
    /// block turns out never to be invoked as a closure.
    pub implicit_it: bool,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SwitchCase {
    /// Literal or constructor patterns; any match selects this case.
    pub patterns: Vec<Expr>,
    pub result: Expr,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ExprKind {
    /// Literal constant; the value lives on the token.
    Literal,
    ListLiteral {
        items: Vec<Expr>,
    },
    MapLiteral {
        entries: Vec<(Token, Expr)>,
        /// True when this map is the named-arguments form of a call.
        named_args: bool,
    },
    Identifier {
        name: String,
        /// Linked declaration, filled by the resolver.
        var_decl: Option<VarDeclId>,
        /// For `$1`..`$n`: the capture group number. These all resolve to the
        /// capture-array variable `$@`.
        capture_num: Option<u32>,
    },
    VarAssign {
        target: Box<Expr>,
        value: Box<Expr>,
        /// `?=`: assign only when the value is non-null.
        conditional: bool,
    },
    VarOpAssign {
        target: Box<Expr>,
        op: TokenKind,
        /// A [`ExprKind::Binary`] whose left operand is [`ExprKind::Noop`];
        /// the old value of the target appears there at runtime.
        value: Box<Expr>,
        /// Postfix `++`/`--`: the expression's result is the value before the
        /// operation.
        return_old_value: bool,
    },
    FieldAssign {
        parent: Box<Expr>,
        access_op: TokenKind,
        field: Box<Expr>,
        value: Box<Expr>,
        conditional: bool,
    },
    FieldOpAssign {
        parent: Box<Expr>,
        access_op: TokenKind,
        field: Box<Expr>,
        op: TokenKind,
        /// A [`ExprKind::Binary`] with a [`ExprKind::Noop`] left operand, as
        /// for [`ExprKind::VarOpAssign`].
        value: Box<Expr>,
        return_old_value: bool,
    },
    Binary {
        left: Box<Expr>,
        op: Token,
        right: Box<Expr>,
        /// On field-access operators only: auto-create missing intermediate
        /// maps/lists when this access is inside an lvalue path (every link
        /// except the last).
        create_if_missing: bool,
    },
    Ternary {
        condition: Box<Expr>,
        true_expr: Box<Expr>,
        false_expr: Box<Expr>,
    },
    PrefixUnary {
        op: Token,
        expr: Box<Expr>,
    },
    PostfixUnary {
        op: Token,
        expr: Box<Expr>,
    },
    /// Checked cast `(Type)expr`.
    Cast {
        target: Type,
        expr: Box<Expr>,
    },
    RegexMatch {
        target: Box<Expr>,
        /// String expression for the pattern.
        pattern: Box<Expr>,
        modifiers: String,
        /// True when the target is the implicit `it`.
        implicit_it: bool,
        negated: bool,
        /// The `$@` capture-array declaration for the enclosing function.
        capture_arr_var: Option<VarDeclId>,
    },
    RegexSubst {
        target: Box<Expr>,
        pattern: Box<Expr>,
        replacement: Box<Expr>,
        modifiers: String,
        implicit_it: bool,
        capture_arr_var: Option<VarDeclId>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        /// Direct target when the callee statically resolves to a function.
        fun: Option<FunId>,
    },
    /// Created by the resolver from `Call` when the callee is a field access
    /// on a known type.
    MethodCall {
        parent: Box<Expr>,
        access_op: TokenKind,
        method_name: String,
        method_token: Token,
        args: Vec<Expr>,
        fun: Option<FunId>,
    },
    Closure {
        fun_decl: Box<Expr>,
    },
    FunDecl(Box<FunDeclExpr>),
    NewInstance {
        class_name: String,
        args: Vec<Expr>,
        class_id: Option<ClassId>,
    },
    /// A class name or type used as a value (e.g. the right side of
    /// `instanceof`).
    TypeExpr {
        ty: Type,
    },
    /// A block in value position; evaluates to its last statement's value.
    BlockExpr {
        block: Box<Stmt>,
    },
    Break {
        label: Option<String>,
    },
    Continue {
        label: Option<String>,
    },
    Return {
        expr: Option<Box<Expr>>,
        /// The enclosing function's declared return type, filled at resolve.
        return_type: Option<Type>,
        fun: Option<FunId>,
    },
    Print {
        expr: Option<Box<Expr>>,
        newline: bool,
    },
    Die {
        expr: Option<Box<Expr>>,
    },
    Eval {
        script: Box<Expr>,
        globals: Option<Box<Expr>>,
    },
    Switch {
        subject: Box<Expr>,
        cases: Vec<SwitchCase>,
        default_case: Option<Box<Expr>>,
    },
    /// Destructuring pattern `Type(p1, p2, ...)` inside a switch case.
    ConstructorPattern {
        ty: Type,
        args: Vec<Expr>,
    },
    /// Multi-assignment `(a, b) = rhs`, destructuring by index.
    MultiAssign {
        targets: Vec<Expr>,
        value: Box<Expr>,
    },
    SpecialVar {
        kind: SpecialVarKind,
    },
    /// Conversion with call-site location for error reporting.
    ConvertTo {
        target: Type,
        expr: Box<Expr>,
        source: Option<Box<Expr>>,
        offset: Option<Box<Expr>>,
    },
    /// Wrapper body: load the value for one formal parameter (positional
    /// slot, named-arg removal, or default initialiser).
    LoadParamValue {
        name: String,
        index: usize,
        param: Option<VarDeclId>,
    },
    /// Wrapper body: call a runtime helper.
    InvokeUtility {
        utility: UtilityFn,
        args: Vec<Expr>,
    },
    /// Invoke a class's synthesized initialiser.
    InvokeInit {
        class_id: ClassId,
        args: Vec<Expr>,
    },
    CheckCast {
        target: Type,
        expr: Box<Expr>,
    },
    /// Placeholder carrying no behavior; stands for the old value inside
    /// op-assign rewrites.
    Noop,
}

impl ExprKind {
    /// Whether this is a field/index access binary usable as an lvalue path
    /// link.
    pub fn is_field_access(&self) -> bool {
        matches!(
            self,
            Self::Binary { op, .. } if matches!(
                op.kind,
                TokenKind::Dot | TokenKind::QuestionDot | TokenKind::LeftSquare | TokenKind::QuestionSquare
            )
        )
    }
}
