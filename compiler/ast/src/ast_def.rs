/// Defines AST datatypes for the BX source language

use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Int64,
    Bool,
    /// Pointer to the given type
    Pointer(Box<Type>),
    /// Fixed-length list of the given element type
    List(Box<Type>, u64),
    /// Not yet determined; replaced by the type checker
    Unknown,
}

impl Type {
    pub fn pointer(to: Type) -> Type {
        Type::Pointer(Box::new(to))
    }

    pub fn list(elem: Type, len: u64) -> Type {
        Type::List(Box::new(elem), len)
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, Type::Pointer(_))
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, Type::Int64 | Type::Bool | Type::Pointer(_))
    }
}

impl Display for Type {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::Int64 => write!(f, "int64"),
            Type::Bool => write!(f, "bool"),
            Type::Pointer(to) => write!(f, "{}*", to),
            Type::List(elem, len) => write!(f, "{}[{}]", elem, len),
            Type::Unknown => write!(f, "<unknown>"),
        }
    }
}

/// Storage size of a type in bytes. Booleans are stored widened to 64 bits.
pub fn size_of(ty: &Type) -> i64 {
    match ty {
        Type::Int64 | Type::Bool | Type::Pointer(_) => 8,
        Type::List(elem, len) => size_of(elem) * (*len as i64),
        Type::Unknown => unreachable!("size_of called before type checking"),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub ty: Type,
}

impl Expr {
    pub fn new(kind: ExprKind) -> Self {
        Self {
            kind,
            ty: Type::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    IntConstant(i64),
    BoolConstant(bool),
    Null,
    Var(String),
    Unary {
        op: UnaryOp,
        arg: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        func: String,
        args: Vec<Expr>,
    },
    /// `alloc T[n]`: heap storage for n elements of T
    Alloc {
        elem_ty: Type,
        len: Box<Expr>,
    },
    AddressOf(Box<Expr>),
    Deref(Box<Expr>),
    ListElem {
        list: Box<Expr>,
        index: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    BitNot,
    LogNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,

    // Bitwise
    BitAnd,
    BitOr,
    BitXor,
    Lshift,
    Rshift,

    // Relational
    Less,
    LessEq,
    Greater,
    GreaterEq,
    Eq,
    NotEq,

    // Logical (short-circuit)
    LogAnd,
    LogOr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Declare {
        name: String,
        ty: Type,
        init: Expr,
    },
    Assign {
        target: Expr,
        value: Expr,
    },
    Eval(Expr),
    Print(Expr),
    Block(Block),
    IfElse {
        condition: Expr,
        true_branch: Box<Stmt>,
        false_branch: Option<Box<Stmt>>,
    },
    While {
        condition: Expr,
        body: Box<Stmt>,
    },
    Return(Option<Expr>),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    pub stmts: Vec<Stmt>,
}

/// A procedure (`return_ty` is `None`) or function definition
#[derive(Debug, Clone, PartialEq)]
pub struct Callable {
    pub name: String,
    pub params: Vec<(String, Type)>,
    pub return_ty: Option<Type>,
    pub body: Block,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalVar {
    pub name: String,
    pub ty: Type,
    pub init: Expr,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub globals: Vec<GlobalVar>,
    pub callables: Vec<Callable>,
}
